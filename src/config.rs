//! Configuration for the realtime layer.
//!
//! [`RealtimeConfig`] holds the connection settings of the Phoenix transport
//! and the defaults of the reconnection supervisor. It can be built in code,
//! deserialized, or read from the environment with [`RealtimeConfig::from_env`].

use crate::types::{
    RealtimeError, Result, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY, DEFAULT_RETRY_DELAY,
    DEFAULT_TIMEOUT, HEARTBEAT_INTERVAL, VSN,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Retry policy of the reconnection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts allowed before the supervisor gives up.
    pub max_retries: u32,
    /// Base delay between attempts.
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Double the delay after every failed attempt.
    pub exponential_backoff: bool,
    /// Upper bound for a single delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY),
            exponential_backoff: true,
            max_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the attempt that follows `retry` failures:
    /// `retry_delay * 2^retry` when exponential, `retry_delay` otherwise,
    /// never above `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return self.retry_delay.min(self.max_delay);
        }
        2u32.checked_pow(retry)
            .and_then(|factor| self.retry_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Connection settings for the realtime server.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project URL (`https://xyz.supabase.co`) or realtime endpoint
    /// (`wss://xyz.supabase.co/realtime/v1`).
    pub endpoint: String,
    pub api_key: String,
    pub access_token: Option<String>,
    /// How long a join waits for the server reply.
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Raises inbound-event logging from `trace` to `debug`.
    pub debug: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            access_token: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL),
            debug: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_API_KEY` and the optional
    /// `SUPABASE_ACCESS_TOKEN`, `REALTIME_DEBUG`, `REALTIME_MAX_RETRIES`,
    /// `REALTIME_RETRY_DELAY_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| RealtimeError::Config(format!("{} must be set", key)))
        };
        let parse_number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.parse::<u64>().map_err(|e| {
                        RealtimeError::Config(format!("{} is not a number: {}", key, e))
                    })
                })
                .transpose()
        };

        let mut config = Self::new(required("SUPABASE_URL")?, required("SUPABASE_API_KEY")?);
        config.access_token = lookup("SUPABASE_ACCESS_TOKEN").filter(|token| !token.is_empty());
        config.debug = lookup("REALTIME_DEBUG")
            .map(|flag| matches!(flag.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if let Some(retries) = parse_number("REALTIME_MAX_RETRIES")? {
            config.reconnect.max_retries = u32::try_from(retries).map_err(|_| {
                RealtimeError::Config("REALTIME_MAX_RETRIES is out of range".to_string())
            })?;
        }
        if let Some(delay) = parse_number("REALTIME_RETRY_DELAY_MS")? {
            config.reconnect.retry_delay = Duration::from_millis(delay);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(RealtimeError::Config("API key is required".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RealtimeError::Config(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        self.websocket_url().map(|_| ())
    }

    /// WebSocket URL with the query parameters the server expects.
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(RealtimeError::Config(format!(
                    "unsupported endpoint scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::Config(format!("cannot switch to {}", scheme)))?;

        let path = url.path().trim_end_matches('/').to_string();
        let path = if path.ends_with("/websocket") {
            path
        } else if path.is_empty() {
            "/realtime/v1/websocket".to_string()
        } else {
            format!("{}/websocket", path)
        };
        url.set_path(&path);

        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", VSN);

        Ok(url)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_exponential_delays() {
        let config = ReconnectConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            ..Default::default()
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_constant_delay_without_backoff() {
        let config = ReconnectConfig {
            exponential_backoff: false,
            retry_delay: Duration::from_millis(250),
            ..Default::default()
        };
        for retry in 0..8 {
            assert_eq!(config.delay_for(retry), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for(40), config.max_delay);
        assert_eq!(config.delay_for(10), config.max_delay);
    }

    #[test]
    fn test_reconnect_config_deserializes_with_defaults() {
        let config: ReconnectConfig =
            serde_json::from_str(r#"{"max_retries": 3, "retry_delay_ms": 500}"#).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert!(config.exponential_backoff);
        assert_eq!(config.max_delay, Duration::from_millis(DEFAULT_MAX_RETRY_DELAY));
    }

    #[test]
    fn test_websocket_url_from_project_url() {
        let config = RealtimeConfig::new("https://demo.supabase.co", "anon");
        let url = config.websocket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_websocket_url_from_realtime_endpoint() {
        let config = RealtimeConfig::new("ws://localhost:4000/realtime/v1/", "key");
        let url = config.websocket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:4000/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = RealtimeConfig::new("https://demo.supabase.co", "");
        assert!(matches!(config.validate(), Err(RealtimeError::Config(_))));
    }

    #[test]
    fn test_from_lookup_reads_optional_values() {
        let config = RealtimeConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_API_KEY", "anon"),
            ("REALTIME_DEBUG", "true"),
            ("REALTIME_MAX_RETRIES", "3"),
            ("REALTIME_RETRY_DELAY_MS", "200"),
        ]))
        .unwrap();

        assert!(config.debug);
        assert_eq!(config.access_token, None);
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.retry_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_from_lookup_missing_url() {
        let err = RealtimeConfig::from_lookup(lookup(&[("SUPABASE_API_KEY", "anon")])).unwrap_err();
        assert!(err.to_string().contains("SUPABASE_URL"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let err = RealtimeConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_API_KEY", "anon"),
            ("REALTIME_RETRY_DELAY_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RealtimeError::Config(_)));
    }
}
