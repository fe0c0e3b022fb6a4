//! Cooperative cancellation for worker threads
//!
//! A shutdown flag plus a wake channel: `cancel()` sets the flag and drops
//! the only sender, so every thread blocked in [`CancelToken::sleep`]
//! returns at once instead of waiting out its tick.

use flume::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Inner {
    cancelled: AtomicBool,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

/// Shared cancellation signal (cheap to clone)
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(tx)),
                wake_rx: rx,
            }),
        }
    }

    /// Signal every holder of this token to stop
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let mut tx = self
            .inner
            .wake_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tx.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `duration` or until cancelled
    ///
    /// Returns `true` if the full duration elapsed, `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.inner.wake_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            Err(RecvTimeoutError::Disconnected) | Ok(()) => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleep_elapses() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();

        let start = Instant::now();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_after_cancel_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(10)));
    }
}
