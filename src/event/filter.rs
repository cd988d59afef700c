use super::{ChangeKind, TableName};
use crate::types::DEFAULT_SCHEMA;
use serde::{Deserialize, Serialize};

/// Which operations a subscription is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Any => "*",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            Self::Any => true,
            Self::Insert => kind == ChangeKind::Insert,
            Self::Update => kind == ChangeKind::Update,
            Self::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// Server-side filter sent with a channel join for `postgres_changes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
    pub event: EventFilter,
    pub schema: String,
    pub table: TableName,

    /// Row filter in PostgREST syntax, e.g. `id=eq.7`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangesFilter {
    pub fn new(table: TableName, event: EventFilter) -> Self {
        Self {
            event,
            schema: DEFAULT_SCHEMA.to_string(),
            table,
            filter: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}
