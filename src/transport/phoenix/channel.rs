use super::protocol::{JoinPayload, PhoenixEvent, PhoenixMessage};
use super::socket::Socket;
use crate::event::{EventFilter, PostgresChangesFilter};
use crate::logging::traffic;
use crate::transport::{ChangefeedChannel, ChannelStatus, PayloadCallback, StatusCallback};
use crate::types::{RealtimeError, Result, TOPIC_PREFIX};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::time;

struct Binding {
    filter: PostgresChangesFilter,
    callback: PayloadCallback,
}

struct ChannelState {
    bindings: Vec<Binding>,
    on_status: Option<StatusCallback>,
    status: Option<ChannelStatus>,
    join_ref: Option<String>,
    removed: bool,
}

struct ChannelInner {
    name: String,
    topic: String,
    socket: Weak<Socket>,
    state: Mutex<ChannelState>,
}

/// A Phoenix channel carrying `postgres_changes` for one subscription.
#[derive(Clone)]
pub struct PhoenixChannel {
    inner: Arc<ChannelInner>,
}

impl PhoenixChannel {
    pub(crate) fn new(name: &str, socket: Weak<Socket>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                topic: format!("{}{}", TOPIC_PREFIX, name),
                socket,
                state: Mutex::new(ChannelState {
                    bindings: Vec::new(),
                    on_status: None,
                    status: None,
                    join_ref: None,
                    removed: false,
                }),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub(crate) fn same_channel(&self, other: &PhoenixChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the channel removed. Returns the join ref if the channel had
    /// joined, and `None` when it was already removed or never joined.
    pub(crate) fn mark_removed(&self) -> Option<Option<String>> {
        let mut state = self.inner.state.lock();
        if state.removed {
            return None;
        }
        state.removed = true;
        Some(state.join_ref.take())
    }

    fn set_status(&self, status: ChannelStatus) {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.status == Some(status) {
                return;
            }
            state.status = Some(status);
            state.on_status.clone()
        };
        tracing::debug!("Channel {} is now {}", self.inner.topic, status);
        if let Some(callback) = callback {
            callback(status);
        }
    }

    pub(crate) fn close(&self) {
        self.set_status(ChannelStatus::Closed);
    }

    /// Socket went away. Only channels that had joined are notified.
    pub(crate) fn connection_closed(&self, status: ChannelStatus) {
        let joined = {
            let mut state = self.inner.state.lock();
            state.join_ref.take().is_some() && !state.removed
        };
        if joined {
            self.set_status(status);
        }
    }

    pub(crate) fn handle(&self, message: PhoenixMessage) {
        match message.event {
            PhoenixEvent::PostgresChanges => self.dispatch(message.payload),
            PhoenixEvent::Error => {
                tracing::error!("Server reported an error on {}", self.inner.topic);
                self.set_status(ChannelStatus::ChannelError);
            }
            PhoenixEvent::Close => self.set_status(ChannelStatus::Closed),
            PhoenixEvent::System => {
                if PhoenixMessage::reply_status(&message.payload) == Some("error") {
                    let detail = message
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("no message");
                    tracing::error!("System error on {}: {}", self.inner.topic, detail);
                    self.set_status(ChannelStatus::ChannelError);
                } else {
                    traffic!("System notice on {}: {}", self.inner.topic, message.payload);
                }
            }
            other => traffic!("Ignoring {} on {}", other.as_str(), self.inner.topic),
        }
    }

    fn dispatch(&self, payload: Value) {
        let data = payload.get("data").unwrap_or(&payload);
        let table = data.get("table").and_then(Value::as_str);
        let kind = data.get("type").and_then(Value::as_str);

        let callbacks: Vec<PayloadCallback> = {
            let state = self.inner.state.lock();
            if state.removed {
                return;
            }
            state
                .bindings
                .iter()
                .filter(|binding| matches_binding(&binding.filter, table, kind))
                .map(|binding| Arc::clone(&binding.callback))
                .collect()
        };

        for callback in callbacks {
            callback(payload.clone());
        }
    }

    fn join_payload(&self, access_token: Option<String>) -> JoinPayload {
        let filters = self
            .inner
            .state
            .lock()
            .bindings
            .iter()
            .map(|binding| binding.filter.clone())
            .collect();
        JoinPayload::new(filters, access_token)
    }

    async fn join(&self) -> ChannelStatus {
        let Some(socket) = self.inner.socket.upgrade() else {
            return ChannelStatus::Closed;
        };

        if let Err(e) = socket.connect().await {
            tracing::error!("Cannot join {}: {}", self.inner.topic, e);
            return ChannelStatus::ChannelError;
        }

        let payload = match serde_json::to_value(self.join_payload(socket.access_token())) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Cannot encode join payload for {}: {}", self.inner.topic, e);
                return ChannelStatus::ChannelError;
            }
        };

        let join_ref = socket.make_ref();
        let reply = socket.expect_reply(&join_ref);
        let message = PhoenixMessage::new(self.inner.topic.clone(), PhoenixEvent::Join, payload)
            .with_ref(join_ref.clone())
            .with_join_ref(join_ref.clone());

        tracing::info!("Joining channel {}", self.inner.topic);
        if let Err(e) = socket.send(message).await {
            socket.forget_reply(&join_ref);
            tracing::error!("Failed to send join for {}: {}", self.inner.topic, e);
            return ChannelStatus::ChannelError;
        }

        match time::timeout(socket.timeout(), reply).await {
            Ok(Ok(reply)) => {
                let status = join_reply_status(&self.inner.topic, &reply);
                if status == ChannelStatus::Subscribed {
                    self.inner.state.lock().join_ref = Some(join_ref);
                }
                status
            }
            Ok(Err(_)) => {
                tracing::warn!("Connection dropped while joining {}", self.inner.topic);
                ChannelStatus::ChannelError
            }
            Err(_) => {
                socket.forget_reply(&join_ref);
                tracing::warn!("Join of {} timed out", self.inner.topic);
                ChannelStatus::TimedOut
            }
        }
    }
}

/// Maps the server's reply to a join request.
fn join_reply_status(topic: &str, reply: &Value) -> ChannelStatus {
    if PhoenixMessage::reply_status(reply) == Some("ok") {
        return ChannelStatus::Subscribed;
    }
    let response = reply.get("response").cloned().unwrap_or(Value::Null);
    tracing::error!("Join of {} rejected: {}", topic, response);
    ChannelStatus::ChannelError
}

fn matches_binding(filter: &PostgresChangesFilter, table: Option<&str>, kind: Option<&str>) -> bool {
    let table_matches = table.map_or(true, |table| filter.table.as_str() == table);
    let kind_matches = match (filter.event, kind) {
        (EventFilter::Any, _) | (_, None) => true,
        (event, Some(kind)) => event.as_str() == kind,
    };
    table_matches && kind_matches
}

impl ChangefeedChannel for PhoenixChannel {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn on_postgres_changes(&self, filter: PostgresChangesFilter, callback: PayloadCallback) {
        self.inner
            .state
            .lock()
            .bindings
            .push(Binding { filter, callback });
    }

    /// Spawns the join on the current tokio runtime.
    fn subscribe(&self, on_status: StatusCallback) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::Connection("subscribing requires a tokio runtime".to_string())
        })?;

        {
            let mut state = self.inner.state.lock();
            if state.removed {
                return Err(RealtimeError::Connection(format!(
                    "channel {} has been removed",
                    self.inner.topic
                )));
            }
            if state.on_status.is_some() {
                return Ok(());
            }
            state.on_status = Some(on_status);
        }

        let channel = self.clone();
        runtime.spawn(async move {
            let status = channel.join().await;
            let removed = channel.inner.state.lock().removed;
            if !removed {
                channel.set_status(status);
            }
        });
        Ok(())
    }

    fn status(&self) -> Option<ChannelStatus> {
        self.inner.state.lock().status
    }
}
