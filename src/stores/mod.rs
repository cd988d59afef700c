//! State kept in sync with the changefeed.
//!
//! - [`LocationStore`]: the active business locations, patched from
//!   `negocios` changes and mutated optimistically.
//! - [`DashboardStats`]: aggregate figures reloaded, debounced, whenever the
//!   inventory tables change.

mod dashboard;
mod location;

pub use dashboard::{DashboardStats, StatsSource, DASHBOARD_TABLES};
pub use location::{Location, LocationBackend, LocationStore, NewLocation};

/// Error reported by a backend service.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;
