use super::TimerPhase;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type Callback<A> = Arc<dyn Fn(A) + Send + Sync + 'static>;

struct DebounceState<A> {
    phase: TimerPhase,
    pending: Option<A>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<A> DebounceState<A> {
    /// Invalidates the scheduled call, if any, and returns its arguments.
    fn supersede(&mut self) -> Option<A> {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.pending.take()
    }
}

struct DebounceInner<A> {
    callback: Callback<A>,
    delay: Duration,
    state: Mutex<DebounceState<A>>,
}

impl<A> Drop for DebounceInner<A> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Runs the callback once, `delay` after the last of a burst of calls,
/// with the arguments of that last call.
///
/// ```
/// use stocksync_realtime::Debounce;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let refresh = Debounce::new(|reason: &'static str| println!("refresh: {}", reason), Duration::from_millis(10));
/// refresh.call("insert");
/// refresh.call("update");
/// tokio::time::sleep(Duration::from_millis(20)).await; // prints "refresh: update" once
/// # }
/// ```
pub struct Debounce<A: Send + 'static> {
    inner: Arc<DebounceInner<A>>,
}

impl<A: Send + 'static> Clone for Debounce<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Debounce<A> {
    pub fn new<F>(callback: F, delay: Duration) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DebounceInner {
                callback: Arc::new(callback),
                delay,
                state: Mutex::new(DebounceState {
                    phase: TimerPhase::Idle,
                    pending: None,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Replaces any pending call with `args` and restarts the timer.
    pub fn call(&self, args: A) {
        let mut state = self.inner.state.lock();
        state.supersede();
        state.pending = Some(args);
        state.phase = TimerPhase::Scheduled;

        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.delay;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(weak, generation);
        }));
    }

    /// Drops the pending call, if any.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if state.supersede().is_some() {
            tracing::trace!("Debounced call cancelled");
        }
        if state.phase == TimerPhase::Scheduled {
            state.phase = TimerPhase::Idle;
        }
    }

    /// Runs the pending call right away. Returns `false` if nothing was pending.
    pub fn flush(&self) -> bool {
        let args = {
            let mut state = self.inner.state.lock();
            let args = state.supersede();
            if args.is_some() {
                state.phase = TimerPhase::Fired;
            }
            args
        };
        match args {
            Some(args) => {
                (self.inner.callback)(args);
                true
            }
            None => false,
        }
    }

    pub fn phase(&self) -> TimerPhase {
        self.inner.state.lock().phase
    }

    pub fn is_pending(&self) -> bool {
        self.phase() == TimerPhase::Scheduled
    }
}

fn fire<A>(inner: Weak<DebounceInner<A>>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let args = {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.timer = None;
        state.phase = TimerPhase::Fired;
        state.pending.take()
    };
    if let Some(args) = args {
        (inner.callback)(args);
    }
}
