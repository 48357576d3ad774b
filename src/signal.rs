//! One-shot "data ready" signal
//!
//! Raised by the poller at the end of its first complete sweep and observed by
//! the power coordinator. The flag is monotonic: once set it stays set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

/// Owning side of the signal, held by the poller
#[derive(Debug, Default)]
pub struct DataReadySignal {
    shared: Arc<Shared>,
}

impl DataReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter
    ///
    /// Returns `true` only for the call that actually set it.
    pub fn raise(&self) -> bool {
        let first = !self.shared.raised.swap(true, Ordering::AcqRel);
        if first {
            self.shared.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool {
        self.shared.raised.load(Ordering::Acquire)
    }

    /// Read-only view for observers
    pub fn handle(&self) -> DataReadyHandle {
        DataReadyHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Observer side of a [`DataReadySignal`]
#[derive(Debug, Clone)]
pub struct DataReadyHandle {
    shared: Arc<Shared>,
}

impl DataReadyHandle {
    pub fn is_set(&self) -> bool {
        self.shared.raised.load(Ordering::Acquire)
    }

    /// Wait until the signal is raised or `timeout` elapses
    ///
    /// Returns whether the signal was observed set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                // register before checking the flag so a raise in between is not lost
                notified.as_mut().enable();
                if self.is_set() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_is_one_shot() {
        let signal = DataReadySignal::new();
        let handle = signal.handle();
        assert!(!signal.is_set());
        assert!(!handle.is_set());

        assert!(signal.raise());
        assert!(!signal.raise());
        assert!(signal.is_set());
        assert!(handle.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let signal = DataReadySignal::new();
        let handle = signal.handle();
        let start = tokio::time::Instant::now();

        assert!(!handle.wait(Duration::from_secs(30)).await);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_when_raised() {
        let signal = DataReadySignal::new();
        let handle = signal.handle();

        let raiser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            signal.raise();
        });

        let start = tokio::time::Instant::now();
        assert!(handle.wait(Duration::from_secs(60)).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
        raiser.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_raise_is_immediate() {
        let signal = DataReadySignal::new();
        signal.raise();
        assert!(signal.handle().wait(Duration::ZERO).await);
    }
}
