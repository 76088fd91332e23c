use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cancellation flag shared across planner, orchestrator, workers and
/// engines. Cloning is cheap; all clones observe the same flag.
///
/// Tasks check `is_aborted()` at I/O boundaries and may `cancelled().await`
/// to race a long operation against abortion.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been aborted.
    pub async fn cancelled(&self) {
        while !self.is_aborted() {
            let notified = self.inner.notify.notified();
            // Flag may have flipped between the check and registration.
            if self.is_aborted() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_wakes_waiters() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        signal.abort();
        assert!(signal.is_aborted());
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_aborted() {
        let signal = AbortSignal::new();
        signal.abort();
        signal.cancelled().await;
    }
}
