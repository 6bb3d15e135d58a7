//! Shared advisory-lock accounting for the in-memory VFS implementations.
//!
//! Models the five-level protocol over a single shared state per file:
//! any number of SHARED holders, at most one RESERVED, PENDING blocks new
//! SHARED acquisitions, and EXCLUSIVE requires being the only holder.
//!
//! An EXCLUSIVE request blocked only by readers parks the requester at
//! PENDING (so the readers drain instead of being joined by new ones);
//! the caller reports BUSY and retries from there. Ownership of the
//! writer-side flags is encoded by the holder's own level: a handle at
//! RESERVED or better owns the RESERVED flag, a handle at PENDING or
//! better owns the PENDING flag.

use quarry_error::{QuarryError, Result};
use quarry_types::LockLevel;

/// Per-file lock state shared by every handle on the file.
#[derive(Debug, Default, Clone)]
pub(crate) struct LockState {
    pub(crate) n_shared: u32,
    pub(crate) reserved: bool,
    pub(crate) pending: bool,
    pub(crate) exclusive: bool,
}

impl LockState {
    /// Whether any handle holds RESERVED or higher.
    pub(crate) fn reserved_or_higher(&self) -> bool {
        self.reserved || self.pending || self.exclusive
    }

    /// Escalate `held` (this handle's current level) towards `target`.
    ///
    /// Returns the new level for the handle, which may stop short of
    /// `target` (EXCLUSIVE blocked by readers parks at PENDING); callers
    /// report BUSY when the returned level is below the target. A
    /// conflicting writer yields `Err(Busy)` with no state change.
    pub(crate) fn escalate(&mut self, held: LockLevel, target: LockLevel) -> Result<LockLevel> {
        if target <= held {
            return Ok(held);
        }

        match target {
            LockLevel::None => unreachable!("target > held rules out None"),
            LockLevel::Shared => {
                // New readers are refused while a writer is draining
                // readers or holds the file exclusively.
                if self.pending || self.exclusive {
                    return Err(QuarryError::Busy);
                }
                self.n_shared += 1;
                Ok(LockLevel::Shared)
            }
            LockLevel::Reserved => {
                if held < LockLevel::Shared {
                    return Err(QuarryError::internal(
                        "RESERVED requested without SHARED held",
                    ));
                }
                if self.reserved_or_higher() {
                    return Err(QuarryError::Busy);
                }
                self.reserved = true;
                Ok(LockLevel::Reserved)
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if held < LockLevel::Shared {
                    return Err(QuarryError::internal(
                        "EXCLUSIVE requested without SHARED held",
                    ));
                }
                // Writer-side flags held by someone else block us; flags
                // covered by our own level are ours.
                let foreign_writer = self.exclusive
                    || (self.pending && held < LockLevel::Pending)
                    || (self.reserved && held < LockLevel::Reserved);
                if foreign_writer {
                    return Err(QuarryError::Busy);
                }
                self.pending = true;
                if target == LockLevel::Pending {
                    return Ok(LockLevel::Pending);
                }
                if self.n_shared > 1 {
                    // Readers still present: hold PENDING so they drain.
                    return Ok(LockLevel::Pending);
                }
                self.exclusive = true;
                Ok(LockLevel::Exclusive)
            }
        }
    }

    /// Release from `held` down to `target` (`Shared` or `None`).
    ///
    /// Returns the new level for the handle.
    pub(crate) fn release(&mut self, held: LockLevel, target: LockLevel) -> LockLevel {
        if target >= held {
            return held;
        }

        if held == LockLevel::Exclusive {
            self.exclusive = false;
        }
        if held >= LockLevel::Pending {
            self.pending = false;
        }
        if held >= LockLevel::Reserved {
            self.reserved = false;
        }
        if target == LockLevel::None && held >= LockLevel::Shared {
            self.n_shared = self.n_shared.saturating_sub(1);
        }
        target
    }

    /// Drop everything a crashed handle held.
    pub(crate) fn release_all(&mut self, held: LockLevel) {
        self.release(held, LockLevel::None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let mut st = LockState::default();
        assert_eq!(
            st.escalate(LockLevel::None, LockLevel::Shared).unwrap(),
            LockLevel::Shared
        );
        assert_eq!(
            st.escalate(LockLevel::None, LockLevel::Shared).unwrap(),
            LockLevel::Shared
        );
        assert_eq!(st.n_shared, 2);
    }

    #[test]
    fn single_reserved_holder() {
        let mut st = LockState::default();
        let a = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let _b = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let a = st.escalate(a, LockLevel::Reserved).unwrap();
        assert_eq!(a, LockLevel::Reserved);

        // The second handle cannot also reserve.
        assert!(matches!(
            st.escalate(LockLevel::Shared, LockLevel::Reserved),
            Err(QuarryError::Busy)
        ));
    }

    #[test]
    fn exclusive_parks_at_pending_while_readers_drain() {
        let mut st = LockState::default();
        let a = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let b = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let a = st.escalate(a, LockLevel::Reserved).unwrap();

        // Reader still present: the writer parks at PENDING.
        let a = st.escalate(a, LockLevel::Exclusive).unwrap();
        assert_eq!(a, LockLevel::Pending);
        assert!(st.pending);

        // New readers are refused while the writer is pending.
        assert!(matches!(
            st.escalate(LockLevel::None, LockLevel::Shared),
            Err(QuarryError::Busy)
        ));

        // The reader drains; the retry (from PENDING) completes.
        st.release(b, LockLevel::None);
        let a = st.escalate(a, LockLevel::Exclusive).unwrap();
        assert_eq!(a, LockLevel::Exclusive);
        assert!(st.exclusive);

        st.release(a, LockLevel::None);
        assert!(!st.reserved_or_higher());
        assert_eq!(st.n_shared, 0);
    }

    #[test]
    fn foreign_writer_blocks_escalation() {
        let mut st = LockState::default();
        let a = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let _a = st.escalate(a, LockLevel::Reserved).unwrap();

        // A second shared holder cannot go exclusive past the writer.
        let b = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        assert!(matches!(
            st.escalate(b, LockLevel::Exclusive),
            Err(QuarryError::Busy)
        ));
    }

    #[test]
    fn release_to_shared_keeps_read_lock() {
        let mut st = LockState::default();
        let a = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let a = st.escalate(a, LockLevel::Reserved).unwrap();
        let a = st.release(a, LockLevel::Shared);
        assert_eq!(a, LockLevel::Shared);
        assert_eq!(st.n_shared, 1);
        assert!(!st.reserved_or_higher());
    }

    #[test]
    fn solo_shared_holder_goes_straight_to_exclusive() {
        // The hot-journal path: SHARED then EXCLUSIVE with no RESERVED.
        let mut st = LockState::default();
        let a = st.escalate(LockLevel::None, LockLevel::Shared).unwrap();
        let a = st.escalate(a, LockLevel::Exclusive).unwrap();
        assert_eq!(a, LockLevel::Exclusive);
    }
}
