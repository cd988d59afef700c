//! Realtime troubleshooting: lists live channels and opens a probe channel
//! that logs whatever it receives.

use crate::event::{ChangeEvent, EventFilter, PostgresChangesFilter, TableName};
use crate::transport::{ChangefeedChannel, ChangefeedTransport, ChannelInfo, ChannelStatus};
use crate::types::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What to check when a probe reports `status`.
pub fn status_hint(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Subscribed => "subscribed; change a row of the table and watch for an event",
        ChannelStatus::ChannelError => {
            "channel error; check that realtime is enabled for the project and the table, \
             that row level security allows SELECT, and that the network is reachable"
        }
        ChannelStatus::TimedOut => "join timed out; check the connection to the server",
        ChannelStatus::Closed => "channel closed",
    }
}

/// A diagnostic subscription opened by [`diagnose`].
pub struct Probe<T: ChangefeedTransport> {
    transport: T,
    channel: T::Channel,
    snapshot: Vec<ChannelInfo>,
    events: Arc<AtomicUsize>,
    statuses: Arc<Mutex<Vec<ChannelStatus>>>,
}

impl<T: ChangefeedTransport> Probe<T> {
    /// Channels that were live before the probe was opened.
    pub fn snapshot(&self) -> &[ChannelInfo] {
        &self.snapshot
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn events_received(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    /// Every status the probe channel went through, oldest first.
    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.statuses.lock().clone()
    }

    /// Removes the probe channel. Safe to call more than once.
    pub fn cleanup(&self) {
        tracing::info!("Removing diagnostic channel {}", self.name());
        self.transport.remove_channel(&self.channel);
    }
}

/// Logs the live channels, then subscribes a probe to every change on
/// `table`.
pub fn diagnose<T>(transport: &T, table: TableName) -> Result<Probe<T>>
where
    T: ChangefeedTransport + Clone,
{
    tracing::info!("Realtime diagnosis started");

    let snapshot = transport.channels();
    if snapshot.is_empty() {
        tracing::warn!("No live realtime channels; subscriptions may not be set up");
    } else {
        tracing::info!("{} live realtime channel(s)", snapshot.len());
        for (index, info) in snapshot.iter().enumerate() {
            tracing::info!(
                "  channel {}: topic={} status={}",
                index + 1,
                info.topic,
                info.status.map_or("not subscribed", |status| status.as_str())
            );
        }
    }

    let name = format!("test-diagnostic-{}", table.as_str().replace('_', "-"));
    let channel = transport.channel(&name)?;
    let events = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    {
        let events = Arc::clone(&events);
        channel.on_postgres_changes(
            PostgresChangesFilter::new(table, EventFilter::Any),
            Arc::new(move |payload| {
                events.fetch_add(1, Ordering::SeqCst);
                match ChangeEvent::from_payload(&payload) {
                    Ok(event) => tracing::info!(
                        "Event received: type={} table={} new={:?} old={:?}",
                        event.kind().as_str(),
                        event.table(),
                        event.new_record(),
                        event.old_record()
                    ),
                    Err(e) => tracing::warn!("Undecodable event received ({}): {}", e, payload),
                }
            }),
        );
    }

    let on_status = {
        let statuses = Arc::clone(&statuses);
        Arc::new(move |status: ChannelStatus| {
            statuses.lock().push(status);
            if status.is_failure() {
                tracing::error!("Probe status {}: {}", status, status_hint(status));
            } else {
                tracing::info!("Probe status {}: {}", status, status_hint(status));
            }
        })
    };
    if let Err(e) = channel.subscribe(on_status) {
        transport.remove_channel(&channel);
        return Err(e);
    }

    Ok(Probe {
        transport: transport.clone(),
        channel,
        snapshot,
        events,
        statuses,
    })
}
