//! Operation context (`Cx`) threaded through every blocking call.
//!
//! `Cx` carries the cancellation flag and optional deadline for a body of
//! work. Every VFS, pager, and WAL method that performs I/O or may block
//! accepts `&Cx` and polls [`Cx::is_cancelled`] at loop boundaries, so a
//! host application can interrupt journal playback, WAL scans, and
//! checkpoint transfers.
//!
//! The context also provides the current wall-clock time, with a
//! deterministic override for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel meaning "no deadline" / "no test clock installed".
const UNSET: u64 = u64::MAX;

#[derive(Debug, Default)]
struct CxInner {
    interrupted: AtomicBool,
    /// Absolute deadline in Unix milliseconds, or `UNSET`.
    deadline_millis: AtomicU64,
    /// Deterministic clock override in Unix milliseconds, or `UNSET`.
    test_millis: AtomicU64,
}

/// Cancellation and deadline context.
///
/// Cheap to clone; clones share the same flag, so interrupting any clone
/// interrupts them all.
#[derive(Debug, Clone)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    /// Create a fresh context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CxInner {
                interrupted: AtomicBool::new(false),
                deadline_millis: AtomicU64::new(UNSET),
                test_millis: AtomicU64::new(UNSET),
            }),
        }
    }

    /// Request cancellation of all work using this context.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }

    /// Clear a previously requested interrupt.
    pub fn clear_interrupt(&self) {
        self.inner.interrupted.store(false, Ordering::Release);
    }

    /// Whether an interrupt has been requested.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Install a deadline `timeout` from now.
    pub fn set_deadline(&self, timeout: Duration) {
        let millis = self
            .now_millis()
            .saturating_add(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX - 1));
        self.inner.deadline_millis.store(millis, Ordering::Release);
    }

    /// Remove any installed deadline.
    pub fn clear_deadline(&self) {
        self.inner.deadline_millis.store(UNSET, Ordering::Release);
    }

    /// Whether the installed deadline (if any) has passed.
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        let deadline = self.inner.deadline_millis.load(Ordering::Acquire);
        deadline != UNSET && self.now_millis() > deadline
    }

    /// Whether work should stop: interrupted or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.is_interrupted() || self.deadline_exceeded()
    }

    /// Current wall-clock time in Unix milliseconds.
    ///
    /// Honours the deterministic test clock when one is installed.
    #[must_use]
    pub fn now_millis(&self) -> u64 {
        let test = self.inner.test_millis.load(Ordering::Acquire);
        if test != UNSET {
            return test;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(UNSET - 1))
            .unwrap_or(0)
    }

    /// Pin the clock to a fixed value for deterministic tests.
    pub fn set_unix_millis_for_testing(&self, millis: u64) {
        self.inner.test_millis.store(millis, Ordering::Release);
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_live() {
        let cx = Cx::new();
        assert!(!cx.is_interrupted());
        assert!(!cx.deadline_exceeded());
        assert!(!cx.is_cancelled());
    }

    #[test]
    fn interrupt_is_shared_across_clones() {
        let cx = Cx::new();
        let clone = cx.clone();
        clone.interrupt();
        assert!(cx.is_cancelled());
        cx.clear_interrupt();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn deadline_uses_test_clock() {
        let cx = Cx::new();
        cx.set_unix_millis_for_testing(1_000_000);
        cx.set_deadline(Duration::from_millis(500));
        assert!(!cx.deadline_exceeded());

        cx.set_unix_millis_for_testing(1_000_501);
        assert!(cx.deadline_exceeded());
        assert!(cx.is_cancelled());

        cx.clear_deadline();
        assert!(!cx.is_cancelled());
    }
}
