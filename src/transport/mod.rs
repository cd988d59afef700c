//! Changefeed transports.
//!
//! The realtime layer talks to the server through two small traits:
//! [`ChangefeedTransport`] hands out named channels and removes them, and
//! [`ChangefeedChannel`] registers `postgres_changes` listeners and joins.
//!
//! Two implementations ship with the crate:
//! - [`phoenix::PhoenixTransport`] speaks the Phoenix channel protocol over a
//!   WebSocket, as used by Supabase Realtime.
//! - [`memory::MemoryTransport`] keeps everything in process, for tests and demos.

pub mod memory;
pub mod phoenix;

use crate::event::PostgresChangesFilter;
use crate::types::{channel_status, Result};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryTransport;
pub use phoenix::PhoenixTransport;

/// Callback receiving raw `postgres_changes` payloads.
pub type PayloadCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Callback receiving channel status transitions.
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync + 'static>;

/// Status values a channel reports after `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => channel_status::SUBSCRIBED,
            Self::ChannelError => channel_status::CHANNEL_ERROR,
            Self::TimedOut => channel_status::TIMED_OUT,
            Self::Closed => channel_status::CLOSED,
        }
    }

    /// `true` for statuses the reconnection supervisor reacts to.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ChannelError | Self::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a live channel, used by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub topic: String,
    /// `None` until the channel has been subscribed.
    pub status: Option<ChannelStatus>,
}

/// A named channel on the changefeed.
pub trait ChangefeedChannel: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Registers a listener. Must be called before [`subscribe`](Self::subscribe).
    fn on_postgres_changes(&self, filter: PostgresChangesFilter, callback: PayloadCallback);

    /// Joins the channel. Status transitions are reported through `on_status`.
    fn subscribe(&self, on_status: StatusCallback) -> Result<()>;

    fn status(&self) -> Option<ChannelStatus>;
}

/// The changefeed collaborator: hands out channels and removes them.
pub trait ChangefeedTransport: Send + Sync + 'static {
    type Channel: ChangefeedChannel;

    fn channel(&self, name: &str) -> Result<Self::Channel>;

    /// Closes and forgets the channel. Removing a channel twice is a no-op.
    fn remove_channel(&self, channel: &Self::Channel);

    fn channels(&self) -> Vec<ChannelInfo>;
}

impl<T: ChangefeedTransport> ChangefeedTransport for Arc<T> {
    type Channel = T::Channel;

    fn channel(&self, name: &str) -> Result<Self::Channel> {
        (**self).channel(name)
    }

    fn remove_channel(&self, channel: &Self::Channel) {
        (**self).remove_channel(channel)
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        (**self).channels()
    }
}
