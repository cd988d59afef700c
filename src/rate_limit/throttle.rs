use super::TimerPhase;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback<A> = Arc<dyn Fn(A) + Send + Sync + 'static>;

/// Which edges of a throttle window execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Run immediately when a window opens.
    pub leading: bool,
    /// Run once more at the end of a window that saw further calls.
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

struct ThrottleState<A> {
    phase: TimerPhase,
    last_run: Option<Instant>,
    pending: Option<A>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct ThrottleInner<A> {
    callback: Callback<A>,
    delay: Duration,
    options: ThrottleOptions,
    state: Mutex<ThrottleState<A>>,
}

impl<A> Drop for ThrottleInner<A> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Runs the callback at most once per `delay` window.
pub struct Throttle<A: Send + 'static> {
    inner: Arc<ThrottleInner<A>>,
}

impl<A: Send + 'static> Clone for Throttle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Throttle<A> {
    pub fn new<F>(callback: F, delay: Duration, options: ThrottleOptions) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                callback: Arc::new(callback),
                delay,
                options,
                state: Mutex::new(ThrottleState {
                    phase: TimerPhase::Idle,
                    last_run: None,
                    pending: None,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    pub fn options(&self) -> ThrottleOptions {
        self.inner.options
    }

    pub fn call(&self, args: A) {
        let now = Instant::now();
        let delay = self.inner.delay;
        let options = self.inner.options;

        let mut state = self.inner.state.lock();
        let elapsed = state.last_run.map(|last| now.saturating_duration_since(last));
        let window_open = elapsed.map_or(true, |elapsed| elapsed >= delay);

        if window_open && options.leading && state.timer.is_none() {
            state.last_run = Some(now);
            state.phase = TimerPhase::Fired;
            drop(state);
            (self.inner.callback)(args);
            return;
        }

        if !options.trailing {
            tracing::trace!("Throttled call dropped");
            return;
        }

        state.pending = Some(args);
        if state.timer.is_some() {
            return;
        }

        let wait = match elapsed {
            Some(elapsed) if elapsed < delay => delay - elapsed,
            _ => delay,
        };
        state.generation = state.generation.wrapping_add(1);
        state.phase = TimerPhase::Scheduled;

        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            fire_trailing(weak, generation);
        }));
    }

    /// Drops the trailing call, if one is scheduled.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = None;
        if state.phase == TimerPhase::Scheduled {
            state.phase = TimerPhase::Idle;
        }
    }

    pub fn phase(&self) -> TimerPhase {
        self.inner.state.lock().phase
    }
}

fn fire_trailing<A>(inner: Weak<ThrottleInner<A>>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let args = {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.timer = None;
        let args = state.pending.take();
        if args.is_some() {
            state.last_run = Some(Instant::now());
            state.phase = TimerPhase::Fired;
        } else {
            state.phase = TimerPhase::Idle;
        }
        args
    };
    if let Some(args) = args {
        (inner.callback)(args);
    }
}
