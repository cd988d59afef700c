//! In-process changefeed.
//!
//! [`MemoryTransport`] behaves like the server side of a changefeed: channels
//! join instantly with a configurable outcome, events are pushed with
//! [`emit`](MemoryTransport::emit) and failures can be injected per channel.

use super::{
    ChangefeedChannel, ChangefeedTransport, ChannelInfo, ChannelStatus, PayloadCallback,
    StatusCallback,
};
use crate::event::{ChangeEvent, EventFilter, PostgresChangesFilter, TableName};
use crate::types::{RealtimeError, Result, TOPIC_PREFIX};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};

struct ChannelSlot {
    bindings: Vec<(PostgresChangesFilter, PayloadCallback)>,
    on_status: Option<StatusCallback>,
    status: Option<ChannelStatus>,
    removed: bool,
}

/// Channel handed out by [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryChannel {
    name: Arc<str>,
    slot: Arc<Mutex<ChannelSlot>>,
    transport: Weak<Mutex<MemoryState>>,
}

impl MemoryChannel {
    fn set_status(&self, status: ChannelStatus) {
        let callback = {
            let mut slot = self.slot.lock();
            slot.status = Some(status);
            slot.on_status.clone()
        };
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn listeners_for(&self, table: &str, kind: Option<&str>) -> Vec<PayloadCallback> {
        let slot = self.slot.lock();
        if slot.removed || slot.status != Some(ChannelStatus::Subscribed) {
            return Vec::new();
        }
        slot.bindings
            .iter()
            .filter(|(filter, _)| filter.table.as_str() == table)
            .filter(|(filter, _)| match (filter.event, kind) {
                (EventFilter::Any, _) | (_, None) => true,
                (event, Some(kind)) => event.as_str() == kind,
            })
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

impl ChangefeedChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_postgres_changes(&self, filter: PostgresChangesFilter, callback: PayloadCallback) {
        self.slot.lock().bindings.push((filter, callback));
    }

    fn subscribe(&self, on_status: StatusCallback) -> Result<()> {
        {
            let mut slot = self.slot.lock();
            if slot.removed {
                return Err(RealtimeError::Connection(format!(
                    "channel {} has been removed",
                    self.name
                )));
            }
            if slot.on_status.is_some() {
                return Ok(());
            }
            slot.on_status = Some(on_status);
        }

        let outcome = self
            .transport
            .upgrade()
            .map(|state| state.lock().subscribe_outcome)
            .unwrap_or(ChannelStatus::Closed);
        tracing::debug!("Memory channel {} joined with status {}", self.name, outcome);
        self.set_status(outcome);
        Ok(())
    }

    fn status(&self) -> Option<ChannelStatus> {
        self.slot.lock().status
    }
}

struct MemoryState {
    channels: Vec<MemoryChannel>,
    removed: Vec<String>,
    fail_next: usize,
    subscribe_outcome: ChannelStatus,
    opened: usize,
}

/// In-process [`ChangefeedTransport`].
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                channels: Vec::new(),
                removed: Vec::new(),
                fail_next: 0,
                subscribe_outcome: ChannelStatus::Subscribed,
                opened: 0,
            })),
        }
    }

    /// Delivers a raw payload to every joined channel listening on `table`.
    /// Returns the number of listeners reached.
    pub fn emit(&self, table: &str, payload: Value) -> usize {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let channels = self.state.lock().channels.clone();

        let listeners: Vec<PayloadCallback> = channels
            .iter()
            .flat_map(|channel| channel.listeners_for(table, kind.as_deref()))
            .collect();

        tracing::debug!(
            "Memory transport emitting {} on {} to {} listener(s)",
            kind.as_deref().unwrap_or("<untyped>"),
            table,
            listeners.len()
        );
        for listener in listeners.iter() {
            listener(payload.clone());
        }
        listeners.len()
    }

    pub fn emit_change(&self, event: &ChangeEvent) -> usize {
        self.emit(event.table().as_str(), event.to_payload())
    }

    /// Reports `status` on the named channel, as the server would.
    pub fn set_status(&self, name: &str, status: ChannelStatus) -> bool {
        let channel = self
            .state
            .lock()
            .channels
            .iter()
            .find(|channel| &*channel.name == name)
            .cloned();
        match channel {
            Some(channel) => {
                channel.set_status(status);
                true
            }
            None => false,
        }
    }

    /// Reports `status` on every live channel listening on `table`.
    pub fn fail_table(&self, table: TableName, status: ChannelStatus) {
        let channels: Vec<MemoryChannel> = self
            .state
            .lock()
            .channels
            .iter()
            .filter(|channel| {
                channel
                    .slot
                    .lock()
                    .bindings
                    .iter()
                    .any(|(filter, _)| filter.table == table)
            })
            .cloned()
            .collect();
        for channel in channels {
            channel.set_status(status);
        }
    }

    /// The next `count` calls to `channel()` fail with a connection error.
    pub fn fail_next_channels(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Status reported to channels when they subscribe.
    pub fn set_subscribe_outcome(&self, status: ChannelStatus) {
        self.state.lock().subscribe_outcome = status;
    }

    /// Names of removed channels, in removal order.
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    /// Number of channels successfully opened so far.
    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn live_channel_names(&self) -> Vec<String> {
        self.state
            .lock()
            .channels
            .iter()
            .map(|channel| channel.name.to_string())
            .collect()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangefeedTransport for MemoryTransport {
    type Channel = MemoryChannel;

    fn channel(&self, name: &str) -> Result<MemoryChannel> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RealtimeError::Connection(format!(
                "memory transport refused channel {}",
                name
            )));
        }

        let channel = MemoryChannel {
            name: Arc::from(name),
            slot: Arc::new(Mutex::new(ChannelSlot {
                bindings: Vec::new(),
                on_status: None,
                status: None,
                removed: false,
            })),
            transport: Arc::downgrade(&self.state),
        };
        state.channels.push(channel.clone());
        state.opened += 1;
        Ok(channel)
    }

    fn remove_channel(&self, channel: &MemoryChannel) {
        {
            let mut slot = channel.slot.lock();
            if slot.removed {
                return;
            }
            slot.removed = true;
        }
        {
            let mut state = self.state.lock();
            state
                .channels
                .retain(|existing| !Arc::ptr_eq(&existing.slot, &channel.slot));
            state.removed.push(channel.name.to_string());
        }
        tracing::debug!("Memory channel {} removed", channel.name);
        channel.set_status(ChannelStatus::Closed);
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.state
            .lock()
            .channels
            .iter()
            .map(|channel| ChannelInfo {
                name: channel.name.to_string(),
                topic: format!("{}{}", TOPIC_PREFIX, channel.name),
                status: channel.status(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Record;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> PayloadCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_only_joined_channels() {
        let transport = MemoryTransport::new();
        let received = Arc::new(AtomicUsize::new(0));

        let joined = transport.channel("joined").unwrap();
        joined.on_postgres_changes(
            PostgresChangesFilter::new(TableName::Negocios, EventFilter::Any),
            counting_callback(&received),
        );
        joined.subscribe(Arc::new(|_| {})).unwrap();

        let idle = transport.channel("idle").unwrap();
        idle.on_postgres_changes(
            PostgresChangesFilter::new(TableName::Negocios, EventFilter::Any),
            counting_callback(&received),
        );

        let event = ChangeEvent::insert(TableName::Negocios, Record::new().with("id", "a"));
        assert_eq!(transport.emit_change(&event), 1);
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_filter_is_applied_server_side() {
        let transport = MemoryTransport::new();
        let received = Arc::new(AtomicUsize::new(0));

        let channel = transport.channel("deletes").unwrap();
        channel.on_postgres_changes(
            PostgresChangesFilter::new(TableName::Movimientos, EventFilter::Delete),
            counting_callback(&received),
        );
        channel.subscribe(Arc::new(|_| {})).unwrap();

        let insert = ChangeEvent::insert(TableName::Movimientos, Record::new().with("id", 1));
        let delete = ChangeEvent::delete(TableName::Movimientos, Record::new().with("id", 1));
        transport.emit_change(&insert);
        transport.emit_change(&delete);

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_channel_twice_is_noop() {
        let transport = MemoryTransport::new();
        let channel = transport.channel("x").unwrap();
        transport.remove_channel(&channel);
        transport.remove_channel(&channel);

        assert_eq!(transport.removed(), vec!["x".to_string()]);
        assert!(transport.channels().is_empty());
        assert!(channel.subscribe(Arc::new(|_| {})).is_err());
    }

    #[test]
    fn test_fail_next_channels() {
        let transport = MemoryTransport::new();
        transport.fail_next_channels(2);
        assert!(transport.channel("a").is_err());
        assert!(transport.channel("b").is_err());
        assert!(transport.channel("c").is_ok());
        assert_eq!(transport.opened(), 1);
    }

    #[test]
    fn test_subscribe_reports_configured_outcome() {
        let transport = MemoryTransport::new();
        transport.set_subscribe_outcome(ChannelStatus::TimedOut);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let channel = transport.channel("slow").unwrap();
        channel
            .subscribe(Arc::new(move |status| seen_clone.lock().push(status)))
            .unwrap();

        assert_eq!(*seen.lock(), vec![ChannelStatus::TimedOut]);
        assert_eq!(channel.status(), Some(ChannelStatus::TimedOut));
    }
}
