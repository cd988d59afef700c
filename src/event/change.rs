use super::TableName;
use crate::types::{RealtimeError, Result, DEFAULT_SCHEMA};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Deref;

/// A row as delivered by the changefeed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a record from a JSON object; any other JSON value is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(RealtimeError::InvalidPayload(format!(
                "expected a JSON object for a record, got {}",
                other
            ))),
        }
    }

    /// Primary key rendered as a string. Numeric ids are accepted as well.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// `true` only when the column exists and holds boolean `true`.
    pub fn flag(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for Record {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Operation tag of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(RealtimeError::UnknownEventType(other.to_string())),
        }
    }
}

/// Fields shared by every change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMeta {
    pub schema: String,
    pub table: TableName,
    pub commit_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertChange {
    pub meta: ChangeMeta,
    pub new: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateChange {
    pub meta: ChangeMeta,
    pub new: Record,
    pub old: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteChange {
    pub meta: ChangeMeta,
    pub old: Record,
}

/// A row-level mutation. Inserts never carry an old record and deletes never
/// carry a new one.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(InsertChange),
    Update(UpdateChange),
    Delete(DeleteChange),
}

// Server format, before the operation tag has been checked
#[derive(Deserialize, Debug)]
struct RawChange {
    #[serde(rename = "type", alias = "eventType")]
    kind: Option<String>,
    #[serde(default = "default_schema")]
    schema: String,
    table: String,
    #[serde(default = "Utc::now")]
    commit_timestamp: DateTime<Utc>,
    #[serde(default)]
    record: Option<Record>,
    #[serde(default)]
    old_record: Option<Record>,
    #[serde(default)]
    errors: Option<Vec<String>>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl ChangeEvent {
    /// Decodes a `postgres_changes` payload, with or without the
    /// `{"data": ..., "ids": [...]}` envelope.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let data = match payload.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => payload,
        };

        let raw = RawChange::deserialize(data)
            .map_err(|e| RealtimeError::InvalidPayload(e.to_string()))?;

        let tag = raw
            .kind
            .as_deref()
            .ok_or_else(|| RealtimeError::InvalidPayload("missing event type".to_string()))?;
        let kind = ChangeKind::parse(tag)?;

        if let Some(errors) = raw.errors.as_ref().filter(|errors| !errors.is_empty()) {
            return Err(RealtimeError::InvalidPayload(errors.join("; ")));
        }

        let meta = ChangeMeta {
            schema: raw.schema,
            table: raw.table.parse()?,
            commit_timestamp: raw.commit_timestamp,
        };

        let missing = |field: &str| {
            RealtimeError::InvalidPayload(format!("{} event without {}", kind.as_str(), field))
        };

        Ok(match kind {
            ChangeKind::Insert => Self::Insert(InsertChange {
                meta,
                new: raw.record.ok_or_else(|| missing("record"))?,
            }),
            ChangeKind::Update => Self::Update(UpdateChange {
                meta,
                new: raw.record.ok_or_else(|| missing("record"))?,
                old: raw.old_record.unwrap_or_default(),
            }),
            ChangeKind::Delete => Self::Delete(DeleteChange {
                meta,
                old: raw.old_record.ok_or_else(|| missing("old_record"))?,
            }),
        })
    }

    /// Encodes the event the way the server sends it.
    pub fn to_payload(&self) -> Value {
        let meta = self.meta();
        let mut payload = serde_json::json!({
            "type": self.kind().as_str(),
            "schema": meta.schema,
            "table": meta.table.as_str(),
            "commit_timestamp": meta.commit_timestamp.to_rfc3339(),
            "errors": Value::Null,
        });
        if let Some(new) = self.new_record() {
            payload["record"] = Value::Object(new.0.clone());
        }
        if let Some(old) = self.old_record() {
            payload["old_record"] = Value::Object(old.0.clone());
        }
        payload
    }

    pub fn insert(table: TableName, new: Record) -> Self {
        Self::Insert(InsertChange {
            meta: ChangeMeta::now(table),
            new,
        })
    }

    pub fn update(table: TableName, new: Record, old: Record) -> Self {
        Self::Update(UpdateChange {
            meta: ChangeMeta::now(table),
            new,
            old,
        })
    }

    pub fn delete(table: TableName, old: Record) -> Self {
        Self::Delete(DeleteChange {
            meta: ChangeMeta::now(table),
            old,
        })
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn meta(&self) -> &ChangeMeta {
        match self {
            Self::Insert(change) => &change.meta,
            Self::Update(change) => &change.meta,
            Self::Delete(change) => &change.meta,
        }
    }

    pub fn table(&self) -> TableName {
        self.meta().table
    }

    pub fn new_record(&self) -> Option<&Record> {
        match self {
            Self::Insert(change) => Some(&change.new),
            Self::Update(change) => Some(&change.new),
            Self::Delete(_) => None,
        }
    }

    pub fn old_record(&self) -> Option<&Record> {
        match self {
            Self::Insert(_) => None,
            Self::Update(change) => Some(&change.old),
            Self::Delete(change) => Some(&change.old),
        }
    }
}

impl ChangeMeta {
    fn now(table: TableName) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table,
            commit_timestamp: Utc::now(),
        }
    }
}
