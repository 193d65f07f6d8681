//! Cooperative cancellation
//!
//! A cancellation token is a shared flag plus a condition variable. Every
//! blocking wait in the guiding loop and the task executors is written as
//! "wait with timeout, then re-check the token".

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter
    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        self.state.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` unless cancelled first
    ///
    /// Returns true if the token was cancelled. A timeout too long to
    /// represent as a deadline waits for cancellation only.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while !*cancelled {
            cancelled = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.state
                        .cond
                        .wait_timeout(cancelled, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self
                    .state
                    .cond
                    .wait(cancelled)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
        *cancelled
    }

    /// Sleep for a number of seconds; negative or NaN values do not sleep
    pub fn wait_secs(&self, secs: f64) -> bool {
        if secs.is_finite() && secs > 0.0 {
            self.wait_timeout(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        } else {
            self.is_cancelled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(30));
            (cancelled, start.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_secs_ignores_negative() {
        let token = CancellationToken::new();
        assert!(!token.wait_secs(-1.0));
        assert!(!token.wait_secs(f64::NAN));
        token.cancel();
        assert!(token.wait_secs(10.0));
    }

    #[test]
    fn test_huge_waits_end_on_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            (
                waiter.wait_secs(1e20),
                waiter.wait_timeout(Duration::MAX),
            )
        });
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert_eq!(handle.join().unwrap(), (true, true));
    }
}
