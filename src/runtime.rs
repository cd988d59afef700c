//! Composition root: builds the transport, the subscription manager and the
//! stores in dependency order.

use crate::config::{RealtimeConfig, ReconnectConfig};
use crate::logging;
use crate::stores::{DashboardStats, LocationBackend, LocationStore, StatsSource};
use crate::subscription::{SubscriptionConfig, SubscriptionManager};
use crate::supervisor::{supervise, Supervisor, SupervisorPhase};
use crate::transport::{ChangefeedTransport, PhoenixTransport};
use crate::types::Result;
use std::sync::Arc;

/// Options collected before the runtime is assembled.
pub struct RuntimeBuilder<T: ChangefeedTransport + Clone> {
    transport: T,
    reconnect: ReconnectConfig,
    debug: Option<bool>,
}

impl RuntimeBuilder<PhoenixTransport> {
    /// Builder for a Supabase Realtime connection described by `config`.
    pub fn from_config(config: &RealtimeConfig) -> Result<Self> {
        Ok(Self {
            transport: PhoenixTransport::new(config)?,
            reconnect: config.reconnect,
            debug: Some(config.debug),
        })
    }
}

impl<T: ChangefeedTransport + Clone> RuntimeBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            reconnect: ReconnectConfig::default(),
            debug: None,
        }
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the process-wide traffic logging flag when the runtime is built.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = Some(enabled);
        self
    }

    pub fn build(self) -> Runtime<T> {
        if let Some(enabled) = self.debug {
            logging::set_debug(enabled);
        }
        tracing::debug!(
            "Realtime runtime ready (max_retries={}, retry_delay={}ms)",
            self.reconnect.max_retries,
            self.reconnect.retry_delay.as_millis()
        );
        Runtime {
            manager: SubscriptionManager::new(self.transport),
            reconnect: self.reconnect,
        }
    }
}

/// The assembled realtime layer.
///
/// ```
/// use stocksync_realtime::{
///     ChangeHandlers, EventFilter, MemoryTransport, Runtime, SubscriptionConfig, TableName,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let runtime = Runtime::builder(MemoryTransport::new()).debug(true).build();
/// let supervisor = runtime.supervise(SubscriptionConfig::new(
///     TableName::Movimientos,
///     EventFilter::Insert,
///     ChangeHandlers::new().on_insert(|_| Ok(())),
/// ));
/// supervisor.stop();
/// # }
/// ```
pub struct Runtime<T: ChangefeedTransport + Clone> {
    manager: SubscriptionManager<T>,
    reconnect: ReconnectConfig,
}

impl Runtime<PhoenixTransport> {
    /// Runtime talking to the server described by `config`.
    pub fn connect(config: &RealtimeConfig) -> Result<Self> {
        Ok(RuntimeBuilder::from_config(config)?.build())
    }
}

impl<T: ChangefeedTransport + Clone> Runtime<T> {
    pub fn builder(transport: T) -> RuntimeBuilder<T> {
        RuntimeBuilder::new(transport)
    }

    pub fn manager(&self) -> &SubscriptionManager<T> {
        &self.manager
    }

    pub fn transport(&self) -> &T {
        self.manager.transport()
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        self.reconnect
    }

    /// Keeps a subscription described by `config` alive with the runtime's
    /// retry policy.
    pub fn supervise(&self, config: SubscriptionConfig) -> Supervisor<T> {
        let manager = self.manager.clone();
        supervise(move || manager.subscribe_config(config.clone()), self.reconnect)
    }

    pub fn location_store<B: LocationBackend>(&self, backend: Arc<B>) -> LocationStore<B> {
        LocationStore::new(backend)
    }

    /// Keeps `store` patched from `negocios` changes, reconnecting on failure.
    /// The store is reloaded after every reconnection, since changes made
    /// while the channel was down are never delivered.
    pub fn supervise_locations<B: LocationBackend>(&self, store: &LocationStore<B>) -> Supervisor<T> {
        let manager = self.manager.clone();
        let supervisor = {
            let store = store.clone();
            supervise(move || store.subscribe(&manager), self.reconnect)
        };

        let mut phases = supervisor.watch_phase();
        let store = store.clone();
        tokio::spawn(async move {
            let mut recovering = false;
            while phases.changed().await.is_ok() {
                let phase = *phases.borrow_and_update();
                match phase {
                    SupervisorPhase::Backoff { .. } => recovering = true,
                    SupervisorPhase::Active if recovering => {
                        recovering = false;
                        tracing::info!("Reloading locations after reconnection");
                        // load() logs and empties the list on failure
                        let _ = store.load().await;
                    }
                    SupervisorPhase::Active => {}
                    SupervisorPhase::Exhausted | SupervisorPhase::Stopped => break,
                }
            }
        });

        supervisor
    }

    pub fn dashboard<S: StatsSource>(&self, source: Arc<S>) -> DashboardStats<S> {
        DashboardStats::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, Record, TableName};
    use crate::stores::{BackendError, Location, NewLocation};
    use crate::transport::{ChannelStatus, MemoryTransport};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct StaticBackend {
        loads: AtomicUsize,
    }

    impl LocationBackend for StaticBackend {
        fn load_active(&self) -> BoxFuture<'_, std::result::Result<Vec<Location>, BackendError>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(vec![Location {
                    id: "seed".to_string(),
                    name: "Bodega".to_string(),
                    address: None,
                    phone: None,
                    email: None,
                }])
            }
            .boxed()
        }

        fn create(&self, _location: NewLocation) -> BoxFuture<'_, std::result::Result<Location, BackendError>> {
            async { Err("read only".into()) }.boxed()
        }

        fn update(&self, _location: Location) -> BoxFuture<'_, std::result::Result<(), BackendError>> {
            async { Ok(()) }.boxed()
        }

        fn delete(&self, _id: String) -> BoxFuture<'_, std::result::Result<(), BackendError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn runtime(transport: &MemoryTransport) -> Runtime<MemoryTransport> {
        Runtime::builder(transport.clone())
            .reconnect(ReconnectConfig {
                retry_delay: Duration::from_millis(100),
                ..ReconnectConfig::default()
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervised_store_survives_channel_failure() {
        let transport = MemoryTransport::new();
        let runtime = runtime(&transport);
        let store = runtime.location_store(Arc::new(StaticBackend::default()));
        let supervisor = runtime.supervise_locations(&store);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = supervisor.current_channel().unwrap();
        transport.set_status(&first, ChannelStatus::ChannelError);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.phase(), SupervisorPhase::Active);

        transport.emit_change(&ChangeEvent::insert(
            TableName::Negocios,
            Record::new()
                .with("id", "a")
                .with("nombre", "Centro")
                .with("activo", true),
        ));
        assert!(store.get("a").is_some());

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_reloads_after_reconnection_only() {
        let transport = MemoryTransport::new();
        let runtime = runtime(&transport);
        let backend = Arc::new(StaticBackend::default());
        let store = runtime.location_store(Arc::clone(&backend));
        let supervisor = runtime.supervise_locations(&store);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);

        let first = supervisor.current_channel().unwrap();
        transport.set_status(&first, ChannelStatus::TimedOut);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(supervisor.phase(), SupervisorPhase::Active);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert!(store.get("seed").is_some());

        supervisor.stop();
    }

    #[test]
    fn test_builder_defaults() {
        let runtime = Runtime::builder(MemoryTransport::new()).build();
        assert_eq!(runtime.reconnect_config(), ReconnectConfig::default());
        assert!(runtime.transport().channels().is_empty());
    }

    #[test]
    fn test_from_config_requires_api_key() {
        assert!(RuntimeBuilder::from_config(&RealtimeConfig::new("https://example.supabase.co", "")).is_err());
    }
}
