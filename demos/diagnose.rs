use std::time::Duration;
use stocksync_realtime::diagnostics::diagnose;
use stocksync_realtime::{PhoenixTransport, RealtimeConfig, TableName};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load .env file
    dotenvy::dotenv().ok();

    let config = RealtimeConfig::from_env()?;
    stocksync_realtime::logging::set_debug(config.debug);
    stocksync_realtime::logging::init();

    let transport = PhoenixTransport::new(&config)?;
    transport.connect().await?;

    let table = std::env::args()
        .nth(1)
        .map(|name| name.parse::<TableName>())
        .transpose()?
        .unwrap_or(TableName::InventarioDetallado);

    let probe = diagnose(&transport, table)?;
    println!("Probe {} open. Change a row of {} to see an event.", probe.name(), table);
    println!("Press Ctrl+C to stop (or wait 60 seconds).");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
    }

    println!(
        "Received {} event(s); statuses: {:?}",
        probe.events_received(),
        probe.statuses()
    );
    println!("Checklist:");
    println!("  - realtime enabled for the project (Database > Replication)");
    println!("  - realtime enabled for table {}", table);
    println!("  - row level security allows SELECT on the table");

    probe.cleanup();
    transport.disconnect().await?;
    Ok(())
}
