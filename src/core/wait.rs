//! Cancellable polling for a condition that another process will satisfy.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::logging::LogThrottle;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition held on the `checks`-th check.
    Signaled { checks: u64 },
    Cancelled { checks: u64 },
}

/// Check `condition` every `interval` until it holds or `cancel` fires.
///
/// There is no timeout: the other side is operated by a person.
pub async fn poll_until<F>(
    mut condition: F,
    interval: Duration,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
) -> WaitOutcome
where
    F: FnMut() -> bool + Send,
{
    let heartbeat = LogThrottle::new(Duration::from_secs(60));
    let mut checks: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled { checks };
        }

        checks += 1;
        if condition() {
            debug!(checks, "Condition met");
            return WaitOutcome::Signaled { checks };
        }

        if heartbeat.should_log() {
            info!(checks, "Still waiting");
        }

        tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled { checks },
            _ = sleeper.sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Returns immediately and counts how often it was asked to sleep.
    #[derive(Default)]
    struct CountingSleeper {
        sleeps: AtomicU64,
    }

    #[async_trait]
    impl Sleeper for CountingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn marker_after_n_cycles_takes_n_plus_one_checks() {
        for n in [0u64, 1, 7] {
            let sleeper = CountingSleeper::default();
            let calls = Arc::new(AtomicU64::new(0));
            let counter = calls.clone();

            let outcome = poll_until(
                move || counter.fetch_add(1, Ordering::SeqCst) >= n,
                Duration::from_secs(5),
                &sleeper,
                &CancellationToken::new(),
            )
            .await;

            assert_eq!(outcome, WaitOutcome::Signaled { checks: n + 1 });
            assert_eq!(calls.load(Ordering::SeqCst), n + 1);
            assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), n);
        }
    }

    #[tokio::test]
    async fn cancellation_ends_an_unbounded_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            poll_until(|| false, Duration::from_secs(3600), &TokioSleeper, &cancel).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, WaitOutcome::Cancelled { checks: 1 }));
    }

    #[tokio::test]
    async fn already_cancelled_never_checks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = poll_until(|| true, Duration::ZERO, &TokioSleeper, &cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled { checks: 0 });
    }
}
