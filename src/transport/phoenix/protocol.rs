use crate::event::PostgresChangesFilter;
use crate::types::constants::{channel_events, phoenix_events};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event field of a Phoenix frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhoenixEvent {
    Join,
    Leave,
    Reply,
    Close,
    Error,
    Heartbeat,
    PostgresChanges,
    /// Server notices about the channel (e.g. postgres_changes setup errors)
    System,
    Other(String),
}

impl PhoenixEvent {
    pub fn parse(s: &str) -> Self {
        match s {
            phoenix_events::JOIN => Self::Join,
            phoenix_events::LEAVE => Self::Leave,
            phoenix_events::REPLY => Self::Reply,
            phoenix_events::CLOSE => Self::Close,
            phoenix_events::ERROR => Self::Error,
            phoenix_events::HEARTBEAT => Self::Heartbeat,
            channel_events::POSTGRES_CHANGES => Self::PostgresChanges,
            channel_events::SYSTEM => Self::System,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => phoenix_events::JOIN,
            Self::Leave => phoenix_events::LEAVE,
            Self::Reply => phoenix_events::REPLY,
            Self::Close => phoenix_events::CLOSE,
            Self::Error => phoenix_events::ERROR,
            Self::Heartbeat => phoenix_events::HEARTBEAT,
            Self::PostgresChanges => channel_events::POSTGRES_CHANGES,
            Self::System => channel_events::SYSTEM,
            Self::Other(s) => s,
        }
    }
}

impl From<String> for PhoenixEvent {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<PhoenixEvent> for String {
    fn from(event: PhoenixEvent) -> Self {
        event.as_str().to_string()
    }
}

/// One frame of the Phoenix channel protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: PhoenixEvent,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: PhoenixEvent, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event,
            payload,
            r#ref: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, r#ref: String) -> Self {
        self.r#ref = Some(r#ref);
        self
    }

    pub fn with_join_ref(mut self, join_ref: String) -> Self {
        self.join_ref = Some(join_ref);
        self
    }

    /// `status` field of a `phx_reply` payload.
    pub fn reply_status(payload: &Value) -> Option<&str> {
        payload.get("status").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BroadcastConfig {
    #[serde(rename = "self")]
    pub self_: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresenceConfig {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelJoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    pub postgres_changes: Vec<PostgresChangesFilter>,
    #[serde(rename = "private")]
    pub is_private: bool,
}

/// Payload of a `phx_join` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: ChannelJoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl JoinPayload {
    pub fn new(postgres_changes: Vec<PostgresChangesFilter>, access_token: Option<String>) -> Self {
        Self {
            config: ChannelJoinConfig {
                postgres_changes,
                ..Default::default()
            },
            access_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFilter, TableName};

    #[test]
    fn test_parse_server_frame() {
        let text = r#"{
            "topic": "realtime:negocios-changes-1",
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {"postgres_changes": []}},
            "ref": "3",
            "join_ref": "3"
        }"#;
        let message: PhoenixMessage = serde_json::from_str(text).unwrap();

        assert_eq!(message.event, PhoenixEvent::Reply);
        assert_eq!(message.r#ref.as_deref(), Some("3"));
        assert_eq!(PhoenixMessage::reply_status(&message.payload), Some("ok"));
    }

    #[test]
    fn test_frame_without_refs_omits_them() {
        let message = PhoenixMessage::new(
            "phoenix",
            PhoenixEvent::Heartbeat,
            serde_json::json!({}),
        );
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""event":"heartbeat""#));
        assert!(!json.contains(r#""ref""#));
        assert!(!json.contains("join_ref"));
    }

    #[test]
    fn test_unknown_event_is_kept_verbatim() {
        assert_eq!(
            PhoenixEvent::parse("presence_state"),
            PhoenixEvent::Other("presence_state".to_string())
        );
        assert_eq!(PhoenixEvent::parse("system"), PhoenixEvent::System);
    }

    #[test]
    fn test_join_payload_matches_protocol() {
        let payload = JoinPayload::new(
            vec![PostgresChangesFilter::new(TableName::Negocios, EventFilter::Any)],
            Some("jwt".to_string()),
        );
        let json = serde_json::to_value(&payload).unwrap();

        let config = &json["config"];
        assert_eq!(config["broadcast"]["self"], false);
        assert_eq!(config["presence"]["key"], "");
        assert_eq!(config["private"], false);
        assert_eq!(config["postgres_changes"][0]["table"], "negocios");
        assert_eq!(config["postgres_changes"][0]["event"], "*");
        assert_eq!(json["access_token"], "jwt");
    }
}
