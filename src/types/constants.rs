/// Phoenix protocol event strings
pub mod phoenix_events {
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const JOIN: &str = "phx_join";
    pub const REPLY: &str = "phx_reply";
    pub const LEAVE: &str = "phx_leave";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Phoenix protocol topic used for heartbeats
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the server expects on every channel topic
pub const TOPIC_PREFIX: &str = "realtime:";

/// Channel-level event strings
pub mod channel_events {
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
}

/// Channel status strings reported to subscribers
pub mod channel_status {
    pub const SUBSCRIBED: &str = "SUBSCRIBED";
    pub const CHANNEL_ERROR: &str = "CHANNEL_ERROR";
    pub const TIMED_OUT: &str = "TIMED_OUT";
    pub const CLOSED: &str = "CLOSED";
}

/// Protocol version
pub const VSN: &str = "1.0.0";

/// Schema used when a subscription does not name one
pub const DEFAULT_SCHEMA: &str = "public";

/// Default push/join timeout (milliseconds)
pub const DEFAULT_TIMEOUT: u64 = 10_000;

/// Default heartbeat interval (milliseconds)
pub const HEARTBEAT_INTERVAL: u64 = 25_000;

/// Reconnection supervisor defaults
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: u64 = 1000;
pub const DEFAULT_MAX_RETRY_DELAY: u64 = 60_000;

/// Quiet period before the dashboard reloads its stats (milliseconds)
pub const DASHBOARD_REFRESH_DEBOUNCE: u64 = 1000;

/// Lifetime of externally fetched values such as exchange rates (milliseconds)
pub const FETCH_CACHE_TTL: u64 = 30 * 60 * 1000;
