//! Phoenix channel protocol over WebSocket (Supabase Realtime).
//!
//! One [`PhoenixTransport`] owns one socket. Channels join lazily: the first
//! `subscribe` opens the connection, and a channel created after the
//! connection dropped reconnects it. Retrying failed channels is left to the
//! reconnection supervisor.

mod channel;
mod protocol;
mod socket;
mod tasks;

pub use channel::PhoenixChannel;
pub use protocol::{JoinPayload, PhoenixEvent, PhoenixMessage};
pub use socket::ConnectionState;

use super::{ChangefeedChannel, ChangefeedTransport, ChannelInfo};
use crate::config::RealtimeConfig;
use crate::types::Result;
use socket::Socket;
use std::sync::Arc;

/// [`ChangefeedTransport`] backed by a Supabase Realtime server.
///
/// # Example
///
/// ```no_run
/// use stocksync_realtime::{ChangefeedTransport, PhoenixTransport, RealtimeConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = PhoenixTransport::new(&RealtimeConfig::new(
///     "https://your-project.supabase.co",
///     "your-anon-key",
/// ))?;
/// transport.connect().await?;
/// println!("{} channels", transport.channels().len());
/// transport.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PhoenixTransport {
    socket: Arc<Socket>,
}

impl PhoenixTransport {
    pub fn new(config: &RealtimeConfig) -> Result<Self> {
        Ok(Self {
            socket: Arc::new(Socket::new(config)?),
        })
    }

    /// Opens the connection eagerly. Joining a channel does this on demand.
    pub async fn connect(&self) -> Result<()> {
        self.socket.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.socket.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.socket.state()
    }
}

impl ChangefeedTransport for PhoenixTransport {
    type Channel = PhoenixChannel;

    /// Returns the live channel with this name, or creates it.
    fn channel(&self, name: &str) -> Result<PhoenixChannel> {
        if let Some(existing) = self
            .socket
            .channels()
            .into_iter()
            .find(|channel| channel.name() == name)
        {
            return Ok(existing);
        }

        let channel = PhoenixChannel::new(name, Arc::downgrade(&self.socket));
        self.socket.add_channel(channel.clone());
        Ok(channel)
    }

    fn remove_channel(&self, channel: &PhoenixChannel) {
        let Some(join_ref) = channel.mark_removed() else {
            return;
        };
        self.socket.forget_channel(channel);
        channel.close();

        let (Some(join_ref), Ok(runtime)) = (join_ref, tokio::runtime::Handle::try_current())
        else {
            return;
        };
        if !self.socket.is_connected() {
            return;
        }

        let socket = Arc::clone(&self.socket);
        let leave = PhoenixMessage::new(
            channel.topic().to_string(),
            PhoenixEvent::Leave,
            serde_json::json!({}),
        )
        .with_ref(socket.make_ref())
        .with_join_ref(join_ref);

        tracing::info!("Leaving channel {}", channel.topic());
        runtime.spawn(async move {
            if let Err(e) = socket.send(leave).await {
                tracing::warn!("Failed to send leave: {}", e);
            }
        });
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.socket
            .channels()
            .iter()
            .map(|channel| ChannelInfo {
                name: channel.name().to_string(),
                topic: channel.topic().to_string(),
                status: channel.status(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> PhoenixTransport {
        PhoenixTransport::new(&RealtimeConfig::new("ws://localhost:4000/realtime/v1", "key"))
            .unwrap()
    }

    #[test]
    fn test_new_rejects_missing_api_key() {
        assert!(PhoenixTransport::new(&RealtimeConfig::new("ws://localhost:4000", "")).is_err());
    }

    #[test]
    fn test_channel_is_reused_by_name() {
        let transport = transport();
        let first = transport.channel("negocios-changes-1").unwrap();
        let second = transport.channel("negocios-changes-1").unwrap();
        assert_eq!(first.topic(), second.topic());
        assert_eq!(transport.channels().len(), 1);
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_remove_channel_is_idempotent() {
        let transport = transport();
        let channel = transport.channel("movimientos-changes-1").unwrap();
        transport.remove_channel(&channel);
        transport.remove_channel(&channel);

        assert!(transport.channels().is_empty());
        assert_eq!(channel.status(), Some(crate::transport::ChannelStatus::Closed));
    }
}
