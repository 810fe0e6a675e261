//! Cooperative cancellation token
//!
//! Every relay and injector task holds a [`StopToken`] and polls it at each
//! blocking boundary. Requesting a stop is idempotent and non-blocking; the
//! task observes it within one poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag for one task
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// A fresh token in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the owning task to exit at its next check. Idempotent.
    pub fn please_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_token_is_shared_and_idempotent() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());

        token.please_stop();
        token.please_stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_stop_token_across_threads() {
        let token = StopToken::new();
        let observer = token.clone();
        let handle = std::thread::spawn(move || {
            while !observer.is_stopped() {
                std::thread::yield_now();
            }
            true
        });
        token.please_stop();
        assert!(handle.join().unwrap());
    }
}
