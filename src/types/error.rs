use crate::event::TableName;
use crate::transport::ChannelStatus;
use thiserror::Error;

/// Errors produced by the realtime layer.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// WebSocket protocol error (connection failed, invalid frame, etc.)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// General connection error with descriptive message
    #[error("Connection error: {0}")]
    Connection(String),

    /// A channel reported a failure status for the given table
    #[error("Channel error for table {table}: {status}")]
    Channel {
        table: TableName,
        status: ChannelStatus,
    },

    /// Table name outside the known schema
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Change event whose operation tag is not INSERT, UPDATE or DELETE
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Change payload that could not be decoded
    #[error("Invalid change payload: {0}")]
    InvalidPayload(String),

    /// A data handler returned an error or panicked
    #[error("Error handling {event} event for {table}: {message}")]
    Handler {
        table: TableName,
        event: &'static str,
        message: String,
    },

    /// An event arrived for which no handler is registered
    #[error("No {event} handler registered for table {table}")]
    MissingHandler {
        table: TableName,
        event: &'static str,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing error (malformed endpoint URL)
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Operation timed out
    #[error("Timeout error")]
    Timeout,

    /// Attempted operation while not connected to the server
    #[error("Not connected")]
    NotConnected,

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for `Result<T, RealtimeError>`.
pub type Result<T> = std::result::Result<T, RealtimeError>;
