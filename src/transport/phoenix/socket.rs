use super::channel::PhoenixChannel;
use super::protocol::{PhoenixEvent, PhoenixMessage};
use super::tasks::ConnectionTasks;
use crate::config::RealtimeConfig;
use crate::logging::traffic;
use crate::transport::ChannelStatus;
use crate::types::{RealtimeError, Result, PHOENIX_TOPIC};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// One WebSocket connection shared by every channel of a transport.
pub(crate) struct Socket {
    url: Url,
    access_token: Option<String>,
    timeout: Duration,
    heartbeat_interval: Duration,

    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    connect_lock: tokio::sync::Mutex<()>,
    ref_counter: AtomicU64,
    pending_heartbeat: Mutex<Option<String>>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    channels: Mutex<Vec<PhoenixChannel>>,
    tasks: Mutex<ConnectionTasks>,
}

impl Socket {
    pub fn new(config: &RealtimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            url: config.websocket_url()?,
            access_token: config.access_token.clone(),
            timeout: config.timeout,
            heartbeat_interval: config.heartbeat_interval,
            state: Mutex::new(ConnectionState::Closed),
            writer: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            ref_counter: AtomicU64::new(0),
            pending_heartbeat: Mutex::new(None),
            pending_replies: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            tasks: Mutex::new(ConnectionTasks::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.clone()
    }

    pub fn make_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Opens the WebSocket unless it is already open. Concurrent callers share
    /// one handshake.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", self.url.host_str().unwrap_or("realtime server"));

        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                return Err(e.into());
            }
        };
        let (write_half, read_half) = stream.split();

        *self.writer.lock().await = Some(write_half);
        *self.pending_heartbeat.lock() = None;

        {
            let mut tasks = self.tasks.lock();
            tasks.abort_all();
            tasks.spawn(read_loop(Arc::downgrade(self), read_half));
            tasks.spawn(heartbeat_loop(Arc::downgrade(self), self.heartbeat_interval));
        }

        self.set_state(ConnectionState::Open);
        tracing::info!("Connected to realtime server");
        Ok(())
    }

    /// Closes the connection on request. Channels are reported `Closed`.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.set_state(ConnectionState::Closing);
        tracing::info!("Disconnecting from realtime server");

        self.tasks.lock().abort_all();
        *self.pending_heartbeat.lock() = None;
        self.pending_replies.lock().clear();

        let writer = self.writer.lock().await.take();
        self.set_state(ConnectionState::Closed);

        for channel in self.channels() {
            channel.connection_closed(ChannelStatus::Closed);
        }

        if let Some(mut writer) = writer {
            writer.close().await?;
        }
        Ok(())
    }

    /// Unexpected loss of the connection. Pending joins fail and joined
    /// channels are reported `ChannelError`.
    async fn connection_lost(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closed | ConnectionState::Closing) {
                return;
            }
            *state = ConnectionState::Closed;
        }
        tracing::warn!("Connection to realtime server lost");

        *self.pending_heartbeat.lock() = None;
        self.pending_replies.lock().clear();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!("Closing dead writer failed: {}", e);
            }
        }

        for channel in self.channels() {
            channel.connection_closed(ChannelStatus::ChannelError);
        }
        self.tasks.lock().abort_all();
    }

    pub async fn send(&self, message: PhoenixMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let json = serde_json::to_string(&message)?;

        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(json.into())).await?;
                Ok(())
            }
            None => Err(RealtimeError::NotConnected),
        }
    }

    /// Registers interest in the `phx_reply` carrying `r#ref`.
    pub fn expect_reply(&self, r#ref: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().insert(r#ref.to_string(), tx);
        rx
    }

    pub fn forget_reply(&self, r#ref: &str) {
        self.pending_replies.lock().remove(r#ref);
    }

    pub fn channels(&self) -> Vec<PhoenixChannel> {
        self.channels.lock().clone()
    }

    pub fn find_channel(&self, topic: &str) -> Option<PhoenixChannel> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.topic() == topic)
            .cloned()
    }

    pub fn add_channel(&self, channel: PhoenixChannel) {
        self.channels.lock().push(channel);
    }

    pub fn forget_channel(&self, channel: &PhoenixChannel) {
        self.channels
            .lock()
            .retain(|existing| !existing.same_channel(channel));
    }

    fn route(&self, message: PhoenixMessage) {
        traffic!(
            "Received frame: topic={}, event={}, ref={:?}",
            message.topic,
            message.event.as_str(),
            message.r#ref
        );

        if message.event == PhoenixEvent::Reply {
            if let Some(r#ref) = message.r#ref.as_deref() {
                if message.topic == PHOENIX_TOPIC {
                    let mut pending = self.pending_heartbeat.lock();
                    if pending.as_deref() == Some(r#ref) {
                        *pending = None;
                        tracing::trace!("Heartbeat ack for ref {}", r#ref);
                    }
                    return;
                }

                let waiter = self.pending_replies.lock().remove(r#ref);
                if let Some(waiter) = waiter {
                    if waiter.send(message.payload).is_err() {
                        tracing::debug!("Reply for ref {} arrived after its waiter left", r#ref);
                    }
                    return;
                }
            }
        }

        match self.find_channel(&message.topic) {
            Some(channel) => channel.handle(message),
            None => tracing::debug!(
                "Dropping {} for unknown topic {}",
                message.event.as_str(),
                message.topic
            ),
        }
    }
}

async fn read_loop(socket: Weak<Socket>, mut read_half: SplitStream<WsStream>) {
    tracing::debug!("Starting read task");
    while let Some(frame) = read_half.next().await {
        let Some(strong) = socket.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixMessage>(text.as_str()) {
                Ok(message) => strong.route(message),
                Err(e) => tracing::error!("Failed to parse frame: {} - Raw: {}", e, text.as_str()),
            },
            Ok(Message::Close(frame)) => {
                match frame {
                    Some(close_frame) => tracing::warn!(
                        "Server closed connection: code={:?}, reason='{}'",
                        close_frame.code,
                        close_frame.reason.as_str()
                    ),
                    None => tracing::warn!("Server closed connection without close frame"),
                }
                break;
            }
            Ok(Message::Ping(data)) | Ok(Message::Pong(data)) => {
                tracing::trace!("Received ping/pong ({} bytes)", data.len());
            }
            Ok(Message::Binary(data)) => {
                tracing::warn!("Received unexpected binary frame ({} bytes)", data.len());
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!("WebSocket read error: {}", e);
                break;
            }
        }
    }

    if let Some(socket) = socket.upgrade() {
        socket.connection_lost().await;
    }
    tracing::debug!("Read task finished");
}

async fn heartbeat_loop(socket: Weak<Socket>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(strong) = socket.upgrade() else {
            break;
        };
        if !strong.is_connected() {
            continue;
        }

        let missed = strong.pending_heartbeat.lock().take();
        if let Some(missed) = missed {
            tracing::warn!("Heartbeat {} was never acknowledged, dropping connection", missed);
            strong.connection_lost().await;
            break;
        }

        let r#ref = strong.make_ref();
        let heartbeat =
            PhoenixMessage::new(PHOENIX_TOPIC, PhoenixEvent::Heartbeat, serde_json::json!({}))
                .with_ref(r#ref.clone());

        match strong.send(heartbeat).await {
            Ok(()) => {
                *strong.pending_heartbeat.lock() = Some(r#ref.clone());
                tracing::trace!("Sent heartbeat with ref {}", r#ref);
            }
            Err(e) => tracing::error!("Failed to send heartbeat: {}", e),
        }
    }
}
