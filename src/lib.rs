//! # StockSync Realtime
//!
//! Realtime change propagation for the StockSync inventory client: Postgres
//! changefeed subscriptions over Supabase Realtime (Phoenix channels), debounce
//! and throttle wrappers, optimistic updates with rollback, and a reconnection
//! supervisor with exponential backoff.
//!
//! ## Example
//!
//! ```no_run
//! use stocksync_realtime::{
//!     ChangeHandlers, EventFilter, RealtimeConfig, Runtime, SubscriptionConfig, TableName,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     stocksync_realtime::logging::init();
//!     let runtime = Runtime::connect(&RealtimeConfig::from_env()?)?;
//!
//!     let supervisor = runtime.supervise(SubscriptionConfig::new(
//!         TableName::Movimientos,
//!         EventFilter::Insert,
//!         ChangeHandlers::new()
//!             .on_insert(|change| {
//!                 println!("new movement: {:?}", change.new.id());
//!                 Ok(())
//!             })
//!             .on_error(|e| eprintln!("realtime error: {}", e)),
//!     ));
//!
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod event;
pub mod logging;
pub mod optimistic;
pub mod rate_limit;
pub mod runtime;
pub mod stores;
pub mod subscription;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use cache::TtlCache;
pub use config::{RealtimeConfig, ReconnectConfig};
pub use event::{
    ChangeEvent, ChangeKind, ChangeMeta, DeleteChange, EventFilter, InsertChange,
    PostgresChangesFilter, Record, TableName, UpdateChange,
};
pub use optimistic::{perform_optimistic, OptimisticOperation};
pub use rate_limit::{Debounce, Throttle, ThrottleOptions, TimerPhase};
pub use runtime::{Runtime, RuntimeBuilder};
pub use subscription::{
    ChangeHandlers, HandlerResult, MissingHandler, Subscription, SubscriptionConfig,
    SubscriptionGroup, SubscriptionManager,
};
pub use supervisor::{supervise, Supervisor, SupervisorPhase};
pub use transport::{
    ChangefeedChannel, ChangefeedTransport, ChannelInfo, ChannelStatus, MemoryTransport,
    PhoenixTransport,
};
pub use types::{RealtimeError, Result};
