use super::BackendError;
use crate::event::{EventFilter, TableName};
use crate::rate_limit::Debounce;
use crate::subscription::{ChangeHandlers, SubscriptionConfig, SubscriptionGroup, SubscriptionManager};
use crate::transport::ChangefeedTransport;
use crate::types::{Result, DASHBOARD_REFRESH_DEBOUNCE};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tables whose changes invalidate the dashboard figures.
pub const DASHBOARD_TABLES: [TableName; 3] = [
    TableName::InventarioGeneral,
    TableName::InventarioDetallado,
    TableName::Movimientos,
];

/// Computes the dashboard figures.
pub trait StatsSource: Send + Sync + 'static {
    type Stats: Clone + Send + Sync + 'static;

    fn load(&self) -> BoxFuture<'_, std::result::Result<Self::Stats, BackendError>>;
}

/// Latest dashboard figures. A burst of inventory changes causes one reload,
/// one debounce delay after the last change.
pub struct DashboardStats<S: StatsSource> {
    source: Arc<S>,
    latest: Arc<watch::Sender<Option<S::Stats>>>,
    refresh: Debounce<()>,
}

impl<S: StatsSource> Clone for DashboardStats<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            latest: Arc::clone(&self.latest),
            refresh: self.refresh.clone(),
        }
    }
}

impl<S: StatsSource> DashboardStats<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::with_delay(source, Duration::from_millis(DASHBOARD_REFRESH_DEBOUNCE))
    }

    pub fn with_delay(source: Arc<S>, delay: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        let latest = Arc::new(latest);

        let refresh = {
            let source = Arc::clone(&source);
            let latest = Arc::clone(&latest);
            Debounce::new(
                move |()| {
                    let source = Arc::clone(&source);
                    let latest = Arc::clone(&latest);
                    tokio::spawn(async move {
                        if let Err(e) = reload(source.as_ref(), &latest).await {
                            tracing::error!("Dashboard refresh failed: {}", e);
                        }
                    });
                },
                delay,
            )
        };

        Self {
            source,
            latest,
            refresh,
        }
    }

    /// Schedules a reload; calls closer together than the delay coalesce.
    pub fn request_refresh(&self) {
        tracing::trace!("Dashboard refresh requested");
        self.refresh.call(());
    }

    /// Reloads immediately and drops any scheduled reload.
    pub async fn refresh_now(&self) -> std::result::Result<S::Stats, BackendError> {
        self.refresh.cancel();
        reload(self.source.as_ref(), &self.latest).await
    }

    pub fn cancel_pending(&self) {
        self.refresh.cancel();
    }

    pub fn latest(&self) -> Option<S::Stats> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<S::Stats>> {
        self.latest.subscribe()
    }

    /// Handlers that turn every change into a refresh request.
    pub fn handlers(&self, table: TableName) -> ChangeHandlers {
        let on_insert = self.clone();
        let on_update = self.clone();
        let on_delete = self.clone();
        ChangeHandlers::new()
            .on_insert(move |_| {
                on_insert.request_refresh();
                Ok(())
            })
            .on_update(move |_| {
                on_update.request_refresh();
                Ok(())
            })
            .on_delete(move |_| {
                on_delete.request_refresh();
                Ok(())
            })
            .on_error(move |e| tracing::error!("Error in {} subscription: {}", table, e))
    }

    /// Opens one subscription per inventory table.
    pub fn subscribe<T>(&self, manager: &SubscriptionManager<T>) -> Result<SubscriptionGroup<T>>
    where
        T: ChangefeedTransport + Clone,
    {
        manager.subscribe_all(
            DASHBOARD_TABLES
                .into_iter()
                .map(|table| SubscriptionConfig::new(table, EventFilter::Any, self.handlers(table))),
        )
    }
}

async fn reload<S: StatsSource>(
    source: &S,
    latest: &watch::Sender<Option<S::Stats>>,
) -> std::result::Result<S::Stats, BackendError> {
    let stats = source.load().await?;
    latest.send_replace(Some(stats.clone()));
    tracing::debug!("Dashboard stats reloaded");
    Ok(stats)
}
