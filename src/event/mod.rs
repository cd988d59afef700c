// Change events, table identifiers and filters
mod change;
mod filter;
mod table;

pub use change::{
    ChangeEvent, ChangeKind, ChangeMeta, DeleteChange, InsertChange, Record, UpdateChange,
};
pub use filter::{EventFilter, PostgresChangesFilter};
pub use table::TableName;
