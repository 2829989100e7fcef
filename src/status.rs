//! The status of a [`SharedState`][crate::shared_state::SharedState] (§3).
//!
//! Progression is monotonic: a non-[`Pending`][Status::Pending] status never
//! reverts, and a [`is_terminal`][Status::is_terminal] status is final.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle status of a shared state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Not yet started.
    Pending = 0,
    /// Started but not yet settled. Optional: some states never report this.
    Running = 1,
    /// Terminal: settled with one or more results.
    Succeeded = 2,
    /// Terminal: cooperatively cancelled.
    Cancelled = 3,
    /// Terminal: settled with a carried exception.
    Failed = 4,
}

impl Status {
    /// `true` for any of the three terminal statuses.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Cancelled | Status::Failed)
    }

    /// `true` for `Cancelled` or `Failed` — the statuses that invoke a
    /// registered cancel observer (§7: Failed is "Cancelled with cause").
    pub fn is_cancel_like(self) -> bool {
        matches!(self, Status::Cancelled | Status::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Pending,
            1 => Status::Running,
            2 => Status::Succeeded,
            3 => Status::Cancelled,
            4 => Status::Failed,
            _ => unreachable!("invalid status byte {v}"),
        }
    }
}

/// An atomic cell holding a [`Status`], used for the fast-path terminal
/// check that doesn't require taking the shared state's mutex.
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Pending -> Running, else no-op. Returns whether it moved.
    pub(crate) fn move_pending_to_running(&self) -> bool {
        self.0
            .compare_exchange(
                Status::Pending as u8,
                Status::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn cancel_like() {
        assert!(!Status::Succeeded.is_cancel_like());
        assert!(Status::Cancelled.is_cancel_like());
        assert!(Status::Failed.is_cancel_like());
    }

    #[test]
    fn atomic_round_trip() {
        let s = AtomicStatus::new(Status::Pending);
        assert_eq!(s.load(), Status::Pending);
        s.store(Status::Running);
        assert_eq!(s.load(), Status::Running);
        s.store(Status::Succeeded);
        assert_eq!(s.load(), Status::Succeeded);
    }
}
