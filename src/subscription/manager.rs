use super::group::SubscriptionGroup;
use super::handlers::ChangeHandlers;
use crate::event::{ChangeEvent, EventFilter, PostgresChangesFilter, TableName};
use crate::logging::traffic;
use crate::transport::{ChangefeedChannel, ChangefeedTransport, ChannelStatus};
use crate::types::{RealtimeError, Result, DEFAULT_SCHEMA};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Channel names are `{table}-changes-{unix_millis}-{seq}`.
fn channel_name(table: TableName) -> String {
    format!(
        "{}-changes-{}-{}",
        table,
        chrono::Utc::now().timestamp_millis(),
        CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Everything needed to open one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub table: TableName,
    pub event: EventFilter,
    pub schema: String,
    /// Row filter understood by the server, e.g. `id=eq.7`.
    pub filter: Option<String>,
    pub handlers: ChangeHandlers,
}

impl SubscriptionConfig {
    pub fn new(table: TableName, event: EventFilter, handlers: ChangeHandlers) -> Self {
        Self {
            table,
            event,
            schema: DEFAULT_SCHEMA.to_string(),
            filter: None,
            handlers,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn postgres_filter(&self) -> PostgresChangesFilter {
        let filter = PostgresChangesFilter::new(self.table, self.event).schema(self.schema.clone());
        match &self.filter {
            Some(row_filter) => filter.filter(row_filter.clone()),
            None => filter,
        }
    }
}

/// Opens changefeed subscriptions on a transport.
///
/// # Example
///
/// ```
/// use stocksync_realtime::{
///     ChangeHandlers, EventFilter, MemoryTransport, SubscriptionManager, TableName,
/// };
///
/// let manager = SubscriptionManager::new(MemoryTransport::new());
/// let subscription = manager
///     .subscribe(
///         TableName::Negocios,
///         EventFilter::Any,
///         ChangeHandlers::new().on_insert(|change| {
///             println!("location added: {:?}", change.new.id());
///             Ok(())
///         }),
///     )
///     .unwrap();
///
/// subscription.unsubscribe();
/// ```
#[derive(Clone)]
pub struct SubscriptionManager<T: ChangefeedTransport + Clone> {
    transport: T,
}

impl<T: ChangefeedTransport + Clone> SubscriptionManager<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe(
        &self,
        table: TableName,
        event: EventFilter,
        handlers: ChangeHandlers,
    ) -> Result<Subscription<T>> {
        self.subscribe_config(SubscriptionConfig::new(table, event, handlers))
    }

    pub fn subscribe_config(&self, config: SubscriptionConfig) -> Result<Subscription<T>> {
        let table = config.table;
        let event = config.event;
        let name = channel_name(table);

        if !config.handlers.has_data_handler() {
            tracing::warn!("Subscription {} has no data handler and will ignore every change", name);
        }

        let channel = self.transport.channel(&name)?;
        let live = Arc::new(AtomicBool::new(true));
        let handlers = Arc::new(config.handlers.clone());
        let (status_tx, status_rx) = watch::channel(None);

        {
            let live = Arc::clone(&live);
            let handlers = Arc::clone(&handlers);
            channel.on_postgres_changes(
                config.postgres_filter(),
                Arc::new(move |payload| dispatch(table, event, &handlers, &live, payload)),
            );
        }

        let on_status = {
            let live = Arc::clone(&live);
            let handlers = Arc::clone(&handlers);
            Arc::new(move |status: ChannelStatus| {
                status_tx.send_replace(Some(status));
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                if status.is_failure() {
                    let error = RealtimeError::Channel { table, status };
                    tracing::error!("{}", error);
                    handlers.report(&error);
                } else {
                    tracing::info!("Subscription to {} is {}", table, status);
                }
            })
        };

        if let Err(e) = channel.subscribe(on_status) {
            live.store(false, Ordering::SeqCst);
            self.transport.remove_channel(&channel);
            return Err(e);
        }

        tracing::info!("Opened subscription {} ({} on {})", name, event.as_str(), table);
        Ok(Subscription {
            table,
            event,
            channel,
            transport: self.transport.clone(),
            live,
            status: status_rx,
        })
    }

    /// Opens every subscription or none: on failure the ones already opened
    /// are closed and the error is returned.
    pub fn subscribe_all<I>(&self, configs: I) -> Result<SubscriptionGroup<T>>
    where
        I: IntoIterator<Item = SubscriptionConfig>,
    {
        let mut opened = Vec::new();
        for config in configs {
            match self.subscribe_config(config) {
                Ok(subscription) => opened.push(subscription),
                Err(e) => {
                    tracing::error!(
                        "Opening subscription group failed, closing {} subscription(s): {}",
                        opened.len(),
                        e
                    );
                    for subscription in &opened {
                        subscription.unsubscribe();
                    }
                    return Err(e);
                }
            }
        }
        Ok(SubscriptionGroup::new(opened))
    }
}

fn dispatch(
    table: TableName,
    filter: EventFilter,
    handlers: &ChangeHandlers,
    live: &AtomicBool,
    payload: Value,
) {
    if !live.load(Ordering::SeqCst) {
        return;
    }
    traffic!("Change received on {}: {}", table, payload);

    let event = match ChangeEvent::from_payload(&payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("Rejected change on {}: {}", table, e);
            handlers.report(&e);
            return;
        }
    };

    if !filter.matches(event.kind()) {
        traffic!("Skipping {} on {}", event.kind().as_str(), table);
        return;
    }

    if let Err(e) = handlers.dispatch(table, &event) {
        tracing::error!("{}", e);
        handlers.report(&e);
    }
}

/// A live changefeed subscription. It owns its channel exclusively.
pub struct Subscription<T: ChangefeedTransport> {
    table: TableName,
    event: EventFilter,
    channel: T::Channel,
    transport: T,
    live: Arc<AtomicBool>,
    status: watch::Receiver<Option<ChannelStatus>>,
}

impl<T: ChangefeedTransport> Subscription<T> {
    /// The underlying channel handle.
    pub fn handle(&self) -> &T::Channel {
        &self.channel
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn table(&self) -> TableName {
        self.table
    }

    pub fn event_filter(&self) -> EventFilter {
        self.event
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Last status reported by the channel, `None` before the first one.
    pub fn status(&self) -> Option<ChannelStatus> {
        *self.status.borrow()
    }

    /// Receiver that observes every status transition.
    pub fn watch_status(&self) -> watch::Receiver<Option<ChannelStatus>> {
        self.status.clone()
    }

    /// Closes the channel. Calling it again does nothing, and no handler
    /// runs once the first call has returned.
    pub fn unsubscribe(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("Subscription {} already closed", self.name());
            return;
        }
        tracing::info!("Closing subscription {}", self.name());
        self.transport.remove_channel(&self.channel);
    }
}

impl<T: ChangefeedTransport> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name())
            .field("table", &self.table)
            .field("event", &self.event)
            .field("active", &self.is_active())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Record;
    use crate::subscription::MissingHandler;
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> (SubscriptionManager<MemoryTransport>, MemoryTransport) {
        let transport = MemoryTransport::new();
        (SubscriptionManager::new(transport.clone()), transport)
    }

    fn error_log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&RealtimeError) + Send + Sync + 'static) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        (errors, move |e: &RealtimeError| sink.lock().push(e.to_string()))
    }

    #[test]
    fn test_channel_names_are_unique() {
        let first = channel_name(TableName::Negocios);
        let second = channel_name(TableName::Negocios);
        assert!(first.starts_with("negocios-changes-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_insert_reaches_handler_for_each_delivery() {
        let (manager, transport) = manager();
        let inserted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inserted);

        let subscription = manager
            .subscribe(
                TableName::Negocios,
                EventFilter::Any,
                ChangeHandlers::new().on_insert(move |change| {
                    sink.lock().push(change.new.id());
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(subscription.status(), Some(ChannelStatus::Subscribed));

        let event = ChangeEvent::insert(
            TableName::Negocios,
            Record::new().with("id", "a").with("activo", true),
        );
        transport.emit_change(&event);
        assert_eq!(*inserted.lock(), vec![Some("a".to_string())]);

        // duplicates are not filtered here
        transport.emit_change(&event);
        assert_eq!(inserted.lock().len(), 2);
    }

    #[test]
    fn test_double_unsubscribe_is_noop() {
        let (manager, transport) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let subscription = manager
            .subscribe(
                TableName::Movimientos,
                EventFilter::Any,
                ChangeHandlers::new().on_insert(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(transport.removed(), vec![subscription.name().to_string()]);

        let event = ChangeEvent::insert(TableName::Movimientos, Record::new().with("id", 1));
        assert_eq!(transport.emit_change(&event), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_operation_goes_to_error_handler() {
        let (manager, transport) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let (errors, on_error) = error_log();

        let handlers = {
            let insert_calls = Arc::clone(&calls);
            let update_calls = Arc::clone(&calls);
            let delete_calls = Arc::clone(&calls);
            ChangeHandlers::new()
                .on_insert(move |_| {
                    insert_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_update(move |_| {
                    update_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_delete(move |_| {
                    delete_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_error(on_error)
        };
        manager
            .subscribe(TableName::InventarioGeneral, EventFilter::Any, handlers)
            .unwrap();

        transport.emit(
            "inventario_general",
            json!({
                "type": "TRUNCATE",
                "schema": "public",
                "table": "inventario_general",
                "commit_timestamp": "2024-01-01T00:00:00Z",
                "record": {},
            }),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("TRUNCATE"));
    }

    #[test]
    fn test_failing_handler_does_not_stop_subscription() {
        let (manager, transport) = manager();
        let (errors, on_error) = error_log();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        manager
            .subscribe(
                TableName::InventarioDetallado,
                EventFilter::Any,
                ChangeHandlers::new()
                    .on_update(move |_| {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("first update explodes");
                        }
                        Err("second update fails".into())
                    })
                    .on_error(on_error),
            )
            .unwrap();

        let event = ChangeEvent::update(
            TableName::InventarioDetallado,
            Record::new().with("id", 3).with("cantidad", 5),
            Record::new().with("id", 3).with("cantidad", 4),
        );
        transport.emit_change(&event);
        transport.emit_change(&event);

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("first update explodes"));
        assert!(errors[1].contains("second update fails"));
    }

    #[test]
    fn test_missing_handler_report_policy() {
        let (manager, transport) = manager();
        let (errors, on_error) = error_log();

        manager
            .subscribe(
                TableName::Negocios,
                EventFilter::Any,
                ChangeHandlers::new()
                    .on_insert(|_| Ok(()))
                    .on_error(on_error)
                    .missing_handler(MissingHandler::Report),
            )
            .unwrap();

        transport.emit_change(&ChangeEvent::delete(
            TableName::Negocios,
            Record::new().with("id", "a"),
        ));
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_channel_failure_reaches_error_handler_and_watch() {
        let (manager, transport) = manager();
        let (errors, on_error) = error_log();

        let subscription = manager
            .subscribe(
                TableName::ExchangeRateConfig,
                EventFilter::Update,
                ChangeHandlers::new().on_update(|_| Ok(())).on_error(on_error),
            )
            .unwrap();
        let watcher = subscription.watch_status();

        transport.set_status(subscription.name(), ChannelStatus::TimedOut);

        assert_eq!(*watcher.borrow(), Some(ChannelStatus::TimedOut));
        assert_eq!(errors.lock().len(), 1);

        // closing on request is not an error
        subscription.unsubscribe();
        assert_eq!(subscription.status(), Some(ChannelStatus::Closed));
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_open_failure_is_returned() {
        let (manager, transport) = manager();
        transport.fail_next_channels(1);

        let result = manager.subscribe(
            TableName::Negocios,
            EventFilter::Any,
            ChangeHandlers::new().on_insert(|_| Ok(())),
        );
        assert!(matches!(result, Err(RealtimeError::Connection(_))));
        assert!(transport.live_channel_names().is_empty());
    }

    #[test]
    fn test_subscribe_all_and_unsubscribe_all() {
        let (manager, transport) = manager();
        let configs = [
            TableName::InventarioGeneral,
            TableName::InventarioDetallado,
            TableName::Movimientos,
        ]
        .into_iter()
        .map(|table| {
            SubscriptionConfig::new(table, EventFilter::Any, ChangeHandlers::new().on_insert(|_| Ok(())))
        });

        let group = manager.subscribe_all(configs).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(transport.live_channel_names().len(), 3);

        group.unsubscribe_all();
        assert!(transport.live_channel_names().is_empty());
        assert_eq!(transport.removed().len(), 3);
    }

    #[test]
    fn test_row_filter_is_sent_with_binding() {
        let config = SubscriptionConfig::new(
            TableName::InventarioDetallado,
            EventFilter::Update,
            ChangeHandlers::new(),
        )
        .filter("negocio_id=eq.7");

        let filter = config.postgres_filter();
        assert_eq!(filter.schema, "public");
        assert_eq!(filter.filter.as_deref(), Some("negocio_id=eq.7"));
    }
}
