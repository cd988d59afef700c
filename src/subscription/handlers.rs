use crate::event::{ChangeEvent, ChangeKind, DeleteChange, InsertChange, TableName, UpdateChange};
use crate::types::RealtimeError;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Error a data handler may return; it is routed to the error handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

type InsertHandler = Arc<dyn Fn(&InsertChange) -> HandlerResult + Send + Sync + 'static>;
type UpdateHandler = Arc<dyn Fn(&UpdateChange) -> HandlerResult + Send + Sync + 'static>;
type DeleteHandler = Arc<dyn Fn(&DeleteChange) -> HandlerResult + Send + Sync + 'static>;
type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync + 'static>;

/// What happens when an event arrives for an operation without a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingHandler {
    /// Drop the event silently.
    #[default]
    Ignore,
    /// Report [`RealtimeError::MissingHandler`] to the error handler.
    Report,
}

/// The set of callbacks a subscription dispatches to: at most one per
/// operation plus one error handler.
///
/// ```
/// use stocksync_realtime::ChangeHandlers;
///
/// let handlers = ChangeHandlers::new()
///     .on_insert(|change| {
///         println!("new row {:?}", change.new.id());
///         Ok(())
///     })
///     .on_error(|e| eprintln!("realtime failure: {}", e));
/// assert!(handlers.has_data_handler());
/// ```
#[derive(Clone, Default)]
pub struct ChangeHandlers {
    on_insert: Option<InsertHandler>,
    on_update: Option<UpdateHandler>,
    on_delete: Option<DeleteHandler>,
    on_error: Option<ErrorHandler>,
    missing: MissingHandler,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InsertChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_insert = Some(Arc::new(handler));
        self
    }

    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UpdateChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(handler));
        self
    }

    pub fn on_delete<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DeleteChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn missing_handler(mut self, policy: MissingHandler) -> Self {
        self.missing = policy;
        self
    }

    pub fn handles(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.on_insert.is_some(),
            ChangeKind::Update => self.on_update.is_some(),
            ChangeKind::Delete => self.on_delete.is_some(),
        }
    }

    pub fn has_data_handler(&self) -> bool {
        [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
            .into_iter()
            .any(|kind| self.handles(kind))
    }

    /// Runs the handler matching the event. Handler errors and panics are
    /// caught here and returned as [`RealtimeError::Handler`].
    pub(crate) fn dispatch(&self, table: TableName, event: &ChangeEvent) -> Result<(), RealtimeError> {
        let kind = event.kind();
        let outcome = match event {
            ChangeEvent::Insert(change) => self.on_insert.as_ref().map(|handler| {
                guarded(|| handler(change))
            }),
            ChangeEvent::Update(change) => self.on_update.as_ref().map(|handler| {
                guarded(|| handler(change))
            }),
            ChangeEvent::Delete(change) => self.on_delete.as_ref().map(|handler| {
                guarded(|| handler(change))
            }),
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(RealtimeError::Handler {
                table,
                event: kind.as_str(),
                message,
            }),
            None if self.missing == MissingHandler::Report => Err(RealtimeError::MissingHandler {
                table,
                event: kind.as_str(),
            }),
            None => Ok(()),
        }
    }

    /// Hands `error` to the error handler, if any. A panicking error handler
    /// is logged and otherwise ignored.
    pub(crate) fn report(&self, error: &RealtimeError) {
        let Some(handler) = self.on_error.as_ref() else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(error))) {
            tracing::error!("Error handler panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

impl fmt::Debug for ChangeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHandlers")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("missing", &self.missing)
            .finish()
    }
}

fn guarded(run: impl FnOnce() -> HandlerResult) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
