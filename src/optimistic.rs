//! Optimistic updates: change local state first, confirm remotely, undo on
//! failure.
//!
//! Operations on overlapping state are not ordered against each other. If two
//! run concurrently, callers have to serialize them.

use std::fmt::Display;
use std::future::Future;

/// Applies `apply_local`, then awaits `remote_action`. If the remote action
/// fails, `rollback` runs exactly once and the original error is returned.
///
/// ```
/// use stocksync_realtime::perform_optimistic;
/// use parking_lot::Mutex;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let items = Arc::new(Mutex::new(vec!["a"]));
/// let local = Arc::clone(&items);
/// let undo = Arc::clone(&items);
///
/// let result: Result<(), String> = perform_optimistic(
///     move || local.lock().push("b"),
///     || async { Err("server rejected".to_string()) },
///     move || {
///         undo.lock().pop();
///     },
/// )
/// .await;
///
/// assert!(result.is_err());
/// assert_eq!(*items.lock(), vec!["a"]);
/// # }
/// ```
pub async fn perform_optimistic<T, E, L, R, Fut, B>(
    apply_local: L,
    remote_action: R,
    rollback: B,
) -> Result<T, E>
where
    L: FnOnce(),
    R: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: FnOnce(),
    E: Display,
{
    OptimisticOperation::new(apply_local, remote_action, rollback)
        .run()
        .await
}

/// A local mutation, the remote action confirming it and the rollback
/// undoing it.
pub struct OptimisticOperation<L, R, B> {
    label: &'static str,
    apply_local: L,
    remote_action: R,
    rollback: B,
}

impl<L, R, B> OptimisticOperation<L, R, B> {
    pub fn new(apply_local: L, remote_action: R, rollback: B) -> Self {
        Self {
            label: "optimistic update",
            apply_local,
            remote_action,
            rollback,
        }
    }

    /// Name used in log lines.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub async fn run<T, E, Fut>(self) -> Result<T, E>
    where
        L: FnOnce(),
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        B: FnOnce(),
        E: Display,
    {
        (self.apply_local)();
        match (self.remote_action)().await {
            Ok(value) => {
                tracing::debug!("{} confirmed", self.label);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("{} failed, rolling back: {}", self.label, e);
                (self.rollback)();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl Journal {
        fn push(&self, step: &'static str) {
            self.0.lock().push(step);
        }

        fn steps(&self) -> Vec<&'static str> {
            self.0.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_success_keeps_local_state() {
        let journal = Arc::new(Journal::default());
        let (local, remote, undo) = (journal.clone(), journal.clone(), journal.clone());

        let result: Result<u32, String> = perform_optimistic(
            move || local.push("local"),
            move || async move {
                remote.push("remote");
                Ok(42)
            },
            move || undo.push("rollback"),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(journal.steps(), vec!["local", "remote"]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_once_before_returning() {
        let journal = Arc::new(Journal::default());
        let (local, remote, undo) = (journal.clone(), journal.clone(), journal.clone());

        let result: Result<(), String> = OptimisticOperation::new(
            move || local.push("local"),
            move || async move {
                remote.push("remote");
                Err("duplicate key".to_string())
            },
            move || undo.push("rollback"),
        )
        .label("add location")
        .run()
        .await;

        assert_eq!(result, Err("duplicate key".to_string()));
        assert_eq!(journal.steps(), vec!["local", "remote", "rollback"]);
    }

    #[tokio::test]
    async fn test_local_applies_before_remote_is_built() {
        let journal = Arc::new(Journal::default());
        let (local, remote) = (journal.clone(), journal.clone());

        let _: Result<(), String> = perform_optimistic(
            move || local.push("local"),
            move || {
                remote.push("remote built");
                async { Ok(()) }
            },
            || {},
        )
        .await;

        assert_eq!(journal.steps(), vec!["local", "remote built"]);
    }
}
