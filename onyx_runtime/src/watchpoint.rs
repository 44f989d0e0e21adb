//! Structural watchpoints.
//!
//! A watchpoint set is the runtime's broadcast channel for "this
//! structural assumption was invalidated". Prototype-chain stubs register
//! interest on every shape between the receiver and the property holder;
//! a transition on any of them fires the set. Generated stubs still
//! re-check every chain link inline, so firing only steers future
//! specialization decisions, never correctness.

use std::sync::atomic::{AtomicU8, Ordering};

/// Watchpoint set state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchpointState {
    /// Nothing is watching yet.
    Clear = 0,
    /// At least one stub depends on the assumption.
    Watched = 1,
    /// The assumption was invalidated. Terminal.
    Invalidated = 2,
}

/// A monotonic watchpoint set: Clear → Watched → Invalidated.
///
/// All operations are lock-free and idempotent; racing `fire` calls are
/// harmless because the state only moves forward.
#[derive(Debug)]
pub struct WatchpointSet {
    state: AtomicU8,
}

impl WatchpointSet {
    /// Create a clear set.
    #[inline]
    pub const fn new() -> Self {
        WatchpointSet {
            state: AtomicU8::new(WatchpointState::Clear as u8),
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> WatchpointState {
        match self.state.load(Ordering::Acquire) {
            0 => WatchpointState::Clear,
            1 => WatchpointState::Watched,
            _ => WatchpointState::Invalidated,
        }
    }

    /// Register interest. No-op once invalidated.
    #[inline]
    pub fn watch(&self) {
        let _ = self.state.compare_exchange(
            WatchpointState::Clear as u8,
            WatchpointState::Watched as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Invalidate the assumption. Idempotent.
    #[inline]
    pub fn fire(&self) {
        self.state
            .store(WatchpointState::Invalidated as u8, Ordering::Release);
    }

    /// Whether the assumption still holds.
    #[inline]
    pub fn is_still_valid(&self) -> bool {
        self.state() != WatchpointState::Invalidated
    }

    /// Whether anything has registered interest.
    #[inline]
    pub fn is_being_watched(&self) -> bool {
        self.state() == WatchpointState::Watched
    }
}

impl Default for WatchpointSet {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_progression() {
        let wp = WatchpointSet::new();
        assert_eq!(wp.state(), WatchpointState::Clear);
        assert!(wp.is_still_valid());

        wp.watch();
        assert_eq!(wp.state(), WatchpointState::Watched);
        assert!(wp.is_being_watched());

        wp.fire();
        assert_eq!(wp.state(), WatchpointState::Invalidated);
        assert!(!wp.is_still_valid());
    }

    #[test]
    fn test_fire_idempotent() {
        let wp = WatchpointSet::new();
        wp.fire();
        wp.fire();
        assert_eq!(wp.state(), WatchpointState::Invalidated);
        // Watching after invalidation stays invalidated.
        wp.watch();
        assert_eq!(wp.state(), WatchpointState::Invalidated);
    }
}
