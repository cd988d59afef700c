//! Debounce and throttle wrappers.
//!
//! Both wrap a callback `Fn(A)` and decide when it runs; neither knows what
//! the callback does. Timers are tokio tasks, so `call` must happen inside a
//! tokio runtime. A generation counter makes sure a timer that already woke
//! up cannot run a call that was cancelled or superseded.

mod debounce;
mod throttle;

pub use debounce::Debounce;
pub use throttle::{Throttle, ThrottleOptions};

/// Where a rate limiter's timer currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Nothing pending.
    Idle,
    /// A call is waiting for its timer.
    Scheduled,
    /// The last pending call has run.
    Fired,
}
