//! Reconnection supervisor.
//!
//! [`supervise`] keeps one subscription alive: when its channel reports
//! `CHANNEL_ERROR` or `TIMED_OUT`, the subscription is closed, the supervisor
//! waits out a backoff delay and opens a replacement. An attempt succeeds
//! once its channel reports `SUBSCRIBED`; after `max_retries` failed attempts
//! in a row it gives up for that subscription.

use crate::config::ReconnectConfig;
use crate::subscription::Subscription;
use crate::transport::{ChangefeedTransport, ChannelStatus};
use crate::types::{RealtimeError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

/// State of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// A subscription is open.
    Active,
    /// Waiting `delay` before attempt number `retry + 1`.
    Backoff { retry: u32, delay: Duration },
    /// Gave up after `max_retries` attempts.
    Exhausted,
    /// Stopped on request.
    Stopped,
}

struct Shared<T: ChangefeedTransport> {
    current: Mutex<Option<Subscription<T>>>,
    retry_count: AtomicU32,
    phase: watch::Sender<SupervisorPhase>,
    token: CancellationToken,
}

impl<T: ChangefeedTransport> Shared<T> {
    fn set_phase(&self, phase: SupervisorPhase) {
        self.phase.send_if_modified(|current| {
            // stop() is final
            if *current == SupervisorPhase::Stopped || *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    fn close_current(&self) {
        if let Some(subscription) = self.current.lock().take() {
            subscription.unsubscribe();
        }
    }
}

/// Handle to a supervised subscription. Dropping it stops supervision.
pub struct Supervisor<T: ChangefeedTransport> {
    shared: Arc<Shared<T>>,
}

/// Opens a subscription with `create` and keeps re-creating it after channel
/// failures, following `config`. A failing first attempt goes straight to
/// backoff. Must be called inside a tokio runtime.
///
/// ```no_run
/// use stocksync_realtime::{
///     supervise, ChangeHandlers, EventFilter, PhoenixTransport, RealtimeConfig,
///     ReconnectConfig, SubscriptionManager, TableName,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RealtimeConfig::from_env()?;
/// let manager = SubscriptionManager::new(PhoenixTransport::new(&config)?);
///
/// let supervisor = supervise(
///     move || {
///         manager.subscribe(
///             TableName::Movimientos,
///             EventFilter::Insert,
///             ChangeHandlers::new().on_insert(|change| {
///                 println!("movement {:?}", change.new.id());
///                 Ok(())
///             }),
///         )
///     },
///     ReconnectConfig::default(),
/// );
///
/// // ...
/// supervisor.stop();
/// # Ok(())
/// # }
/// ```
pub fn supervise<T, F>(create: F, config: ReconnectConfig) -> Supervisor<T>
where
    T: ChangefeedTransport,
    F: FnMut() -> Result<Subscription<T>> + Send + 'static,
{
    let (phase, _) = watch::channel(SupervisorPhase::Active);
    let shared = Arc::new(Shared {
        current: Mutex::new(None),
        retry_count: AtomicU32::new(0),
        phase,
        token: CancellationToken::new(),
    });

    tokio::spawn(run(Arc::clone(&shared), create, config));
    Supervisor { shared }
}

impl<T: ChangefeedTransport> Supervisor<T> {
    /// Cancels a pending backoff and closes the current subscription.
    /// Safe to call in any phase, and more than once.
    pub fn stop(&self) {
        if self.shared.token.is_cancelled() {
            return;
        }
        self.shared.token.cancel();
        self.shared.close_current();
        self.shared.phase.send_replace(SupervisorPhase::Stopped);
        tracing::info!("Reconnection supervisor stopped");
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SupervisorPhase> {
        self.shared.phase.subscribe()
    }

    /// Failed attempts since a channel last reached `SUBSCRIBED`.
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    /// Name of the channel currently supervised.
    pub fn current_channel(&self) -> Option<String> {
        self.shared
            .current
            .lock()
            .as_ref()
            .map(|subscription| subscription.name().to_string())
    }
}

impl<T: ChangefeedTransport> Drop for Supervisor<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<T, F>(shared: Arc<Shared<T>>, mut create: F, config: ReconnectConfig)
where
    T: ChangefeedTransport,
    F: FnMut() -> Result<Subscription<T>>,
{
    let mut retry: u32 = 0;

    loop {
        if shared.token.is_cancelled() {
            return;
        }

        match create() {
            Ok(subscription) => {
                let mut status = subscription.watch_status();
                {
                    let mut current = shared.current.lock();
                    if shared.token.is_cancelled() {
                        subscription.unsubscribe();
                        return;
                    }
                    *current = Some(subscription);
                }

                let joined = select! {
                    joined = wait_for_join(&mut status) => joined,
                    _ = shared.token.cancelled() => return,
                };

                if joined == ChannelStatus::Subscribed {
                    if retry > 0 {
                        tracing::info!("Reconnection successful after {} retries", retry);
                    }
                    retry = 0;
                    shared.retry_count.store(0, Ordering::SeqCst);
                    shared.set_phase(SupervisorPhase::Active);

                    let failure = select! {
                        failure = wait_for_failure(&mut status) => failure,
                        _ = shared.token.cancelled() => return,
                    };
                    tracing::warn!("Subscription failed ({}), reconnecting", failure);
                } else {
                    tracing::warn!("Subscription did not join ({})", joined);
                }
                shared.close_current();
            }
            Err(e) => {
                tracing::error!("Subscription attempt failed: {}", e);
            }
        }

        if retry >= config.max_retries {
            shared.set_phase(SupervisorPhase::Exhausted);
            tracing::error!("{}", RealtimeError::RetriesExhausted(retry));
            return;
        }

        let delay = config.delay_for(retry);
        shared.set_phase(SupervisorPhase::Backoff { retry, delay });
        tracing::info!(
            "Attempting reconnection in {}ms (retry {}/{})",
            delay.as_millis(),
            retry + 1,
            config.max_retries
        );

        select! {
            _ = time::sleep(delay) => {}
            _ = shared.token.cancelled() => return,
        }
        retry += 1;
        shared.retry_count.store(retry, Ordering::SeqCst);
    }
}

/// Resolves with the first status the channel reports. A dropped status
/// sender counts as the channel closing.
async fn wait_for_join(status: &mut watch::Receiver<Option<ChannelStatus>>) -> ChannelStatus {
    loop {
        let current = *status.borrow_and_update();
        if let Some(joined) = current {
            return joined;
        }
        if status.changed().await.is_err() {
            return ChannelStatus::Closed;
        }
    }
}

/// Resolves with the first failure status. A dropped status sender counts as
/// the channel closing.
async fn wait_for_failure(status: &mut watch::Receiver<Option<ChannelStatus>>) -> ChannelStatus {
    loop {
        let current = *status.borrow_and_update();
        if let Some(failure) = current.filter(ChannelStatus::is_failure) {
            return failure;
        }
        if status.changed().await.is_err() {
            return ChannelStatus::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFilter, TableName};
    use crate::subscription::{ChangeHandlers, SubscriptionManager};
    use crate::transport::MemoryTransport;
    use tokio::time::{sleep, Instant};

    fn config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            ..ReconnectConfig::default()
        }
    }

    fn creator(
        manager: SubscriptionManager<MemoryTransport>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    ) -> impl FnMut() -> Result<Subscription<MemoryTransport>> + Send + 'static {
        move || {
            attempts.lock().push(Instant::now());
            manager.subscribe(
                TableName::Movimientos,
                EventFilter::Any,
                ChangeHandlers::new().on_insert(|_| Ok(())),
            )
        }
    }

    fn gaps(attempts: &[Instant]) -> Vec<u64> {
        attempts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis() as u64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_until_success() {
        let transport = MemoryTransport::new();
        transport.fail_next_channels(3);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(3),
        );

        sleep(Duration::from_millis(500)).await;
        assert_eq!(
            supervisor.phase(),
            SupervisorPhase::Backoff {
                retry: 0,
                delay: Duration::from_millis(1000)
            }
        );

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(gaps(&attempts.lock()), vec![1000, 2000, 4000]);
        assert_eq!(supervisor.phase(), SupervisorPhase::Active);
        assert_eq!(supervisor.retry_count(), 0);
        assert_eq!(transport.live_channel_names().len(), 1);

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let transport = MemoryTransport::new();
        transport.fail_next_channels(10);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(2),
        );

        sleep(Duration::from_millis(60_000)).await;
        assert_eq!(attempts.lock().len(), 3);
        assert_eq!(supervisor.phase(), SupervisorPhase::Exhausted);
        assert_eq!(supervisor.retry_count(), 2);

        supervisor.stop();
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_joins_back_off_until_exhausted() {
        let transport = MemoryTransport::new();
        transport.set_subscribe_outcome(ChannelStatus::ChannelError);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(3),
        );

        let mut phases = supervisor.watch_phase();
        let seen = Arc::new(Mutex::new(vec![*phases.borrow_and_update()]));
        {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while phases.changed().await.is_ok() {
                    seen.lock().push(*phases.borrow_and_update());
                }
            });
        }

        sleep(Duration::from_millis(20_000)).await;
        assert_eq!(gaps(&attempts.lock()), vec![1000, 2000, 4000]);
        assert_eq!(
            *seen.lock(),
            vec![
                SupervisorPhase::Active,
                SupervisorPhase::Backoff {
                    retry: 0,
                    delay: Duration::from_millis(1000)
                },
                SupervisorPhase::Backoff {
                    retry: 1,
                    delay: Duration::from_millis(2000)
                },
                SupervisorPhase::Backoff {
                    retry: 2,
                    delay: Duration::from_millis(4000)
                },
                SupervisorPhase::Exhausted,
            ]
        );
        assert_eq!(supervisor.retry_count(), 3);
        assert!(transport.live_channel_names().is_empty());
        assert_eq!(transport.removed().len(), 4);

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeouts_count_as_failed_attempts() {
        let transport = MemoryTransport::new();
        transport.set_subscribe_outcome(ChannelStatus::TimedOut);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(1),
        );

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(attempts.lock().len(), 2);
        assert_eq!(supervisor.phase(), SupervisorPhase::Exhausted);
        assert_eq!(supervisor.retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_resets_once_a_join_succeeds() {
        let transport = MemoryTransport::new();
        transport.set_subscribe_outcome(ChannelStatus::ChannelError);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(5),
        );

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(supervisor.retry_count(), 1);
        assert_eq!(
            supervisor.phase(),
            SupervisorPhase::Backoff {
                retry: 1,
                delay: Duration::from_millis(2000)
            }
        );

        transport.set_subscribe_outcome(ChannelStatus::Subscribed);
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(gaps(&attempts.lock()), vec![1000, 2000]);
        assert_eq!(supervisor.phase(), SupervisorPhase::Active);
        assert_eq!(supervisor.retry_count(), 0);
        assert_eq!(transport.live_channel_names().len(), 1);

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_failure_closes_before_replacing() {
        let transport = MemoryTransport::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(5),
        );
        sleep(Duration::from_millis(10)).await;
        let first = supervisor.current_channel().unwrap();

        transport.set_status(&first, ChannelStatus::ChannelError);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.removed(), vec![first.clone()]);
        assert!(matches!(supervisor.phase(), SupervisorPhase::Backoff { retry: 0, .. }));
        assert!(transport.live_channel_names().is_empty());

        sleep(Duration::from_millis(1000)).await;
        let second = supervisor.current_channel().unwrap();
        assert_ne!(first, second);
        assert_eq!(transport.live_channel_names(), vec![second]);
        assert_eq!(supervisor.phase(), SupervisorPhase::Active);

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_backoff_and_is_idempotent() {
        let transport = MemoryTransport::new();
        transport.fail_next_channels(1);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(5),
        );
        sleep(Duration::from_millis(100)).await;

        supervisor.stop();
        supervisor.stop();
        sleep(Duration::from_millis(10_000)).await;

        assert_eq!(attempts.lock().len(), 1);
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
        assert!(transport.live_channel_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_active_subscription() {
        let transport = MemoryTransport::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let supervisor = supervise(
            creator(SubscriptionManager::new(transport.clone()), Arc::clone(&attempts)),
            config(5),
        );
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.live_channel_names().len(), 1);

        drop(supervisor);
        assert!(transport.live_channel_names().is_empty());
        assert_eq!(transport.removed().len(), 1);
    }
}
