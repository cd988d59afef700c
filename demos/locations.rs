use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stocksync_realtime::stores::{BackendError, Location, LocationBackend, NewLocation};
use stocksync_realtime::{RealtimeConfig, Runtime};

/// Keeps rows in memory; a real client would call the REST API here.
#[derive(Default)]
struct LocalBackend {
    rows: Mutex<Vec<Location>>,
}

impl LocationBackend for LocalBackend {
    fn load_active(&self) -> BoxFuture<'_, Result<Vec<Location>, BackendError>> {
        async move { Ok(self.rows.lock().clone()) }.boxed()
    }

    fn create(&self, location: NewLocation) -> BoxFuture<'_, Result<Location, BackendError>> {
        async move {
            let stored = Location {
                id: format!("local-{}", self.rows.lock().len() + 1),
                name: location.name,
                address: location.address,
                phone: location.phone,
                email: location.email,
            };
            self.rows.lock().push(stored.clone());
            Ok(stored)
        }
        .boxed()
    }

    fn update(&self, location: Location) -> BoxFuture<'_, Result<(), BackendError>> {
        async move {
            let mut rows = self.rows.lock();
            match rows.iter_mut().find(|row| row.id == location.id) {
                Some(row) => {
                    *row = location;
                    Ok(())
                }
                None => Err(format!("no location {}", location.id).into()),
            }
        }
        .boxed()
    }

    fn delete(&self, id: String) -> BoxFuture<'_, Result<(), BackendError>> {
        async move {
            self.rows.lock().retain(|row| row.id != id);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load .env file
    dotenvy::dotenv().ok();

    let config = RealtimeConfig::from_env()?;
    stocksync_realtime::logging::set_debug(config.debug);
    stocksync_realtime::logging::init();

    let runtime = Runtime::connect(&config)?;
    let store = runtime.location_store(Arc::new(LocalBackend::default()));
    store.load().await?;

    let supervisor = runtime.supervise_locations(&store);
    println!("Watching negocios. Press Ctrl+C to stop.");

    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let locations = store.locations();
                println!(
                    "[{}] {} active location(s), supervisor {:?}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    locations.len(),
                    supervisor.phase()
                );
                for location in locations {
                    println!("  {} {}", location.id, location.name);
                }
            }
        }
    }

    supervisor.stop();
    runtime.transport().disconnect().await?;
    Ok(())
}
