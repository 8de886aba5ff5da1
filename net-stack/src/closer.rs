//! Idempotent close, backed by a single atomic flag rather than a mutex.
//!
//! Mirrors the `sync.Once`-guarded `tcpOnceCloser`/`udpOnceCloser` wrappers
//! the forwarders use to make sure the stack's teardown path and a handler
//! racing to close its own connection converge on exactly one underlying
//! close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs `close` at most once no matter how many handles call [`OnceCloser::close`].
#[derive(Clone)]
pub struct OnceCloser {
    closed: Arc<AtomicBool>,
}

impl OnceCloser {
    pub fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `true` exactly once: the first caller across all clones of
    /// this closer. Every other caller, concurrent or not, gets `false`.
    pub fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for OnceCloser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_close_wins() {
        let closer = OnceCloser::new();

        assert!(closer.close());
        assert!(!closer.close());
        assert!(!closer.close());
        assert!(closer.is_closed());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let closer = OnceCloser::new();
        let clone = closer.clone();

        assert!(closer.close());
        assert!(!clone.close());
    }
}
