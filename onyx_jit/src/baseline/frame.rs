//! Baseline stack frame layout.
//!
//! Every baseline function uses the same frame shape, which is also the
//! shape OSR exit thunks reconstruct into:
//!
//! ```text
//! ┌────────────────────────────┐ high addresses
//! │  return address            │
//! ├────────────────────────────┤
//! │  saved rbp                 │ ← rbp
//! ├────────────────────────────┤
//! │  saved r14 (context reg)   │ rbp-8
//! ├────────────────────────────┤
//! │  vreg N-1                  │ rbp-16
//! │  ...                       │
//! │  vreg 0                    │ rbp-8-8N   (ascending index, ascending
//! ├────────────────────────────┤             address)
//! │  outgoing scratch (4 slots)│
//! ├────────────────────────────┤
//! │  shadow space / padding    │ ← rsp (16-byte aligned)
//! └────────────────────────────┘
//! ```
//!
//! Virtual registers sit at ascending addresses so a contiguous
//! `[callee, args...]` region is just a slice of the frame.

use crate::backend::x64::{Gpr, MemOperand};

/// Slots reserved for staging out-of-line helper arguments.
pub const SCRATCH_SLOTS: u16 = 4;

/// Bytes the Windows ABI requires callers to reserve for callees.
#[cfg(windows)]
const SHADOW_SPACE: i32 = 32;
#[cfg(not(windows))]
const SHADOW_SPACE: i32 = 0;

/// Frame layout for one compiled program.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    register_count: u16,
    /// Bytes subtracted from rsp after the two pushes.
    interior_size: i32,
}

impl FrameLayout {
    /// Bytes per value slot.
    pub const SLOT_SIZE: i32 = 8;

    /// Compute the layout for a register file.
    pub fn new(register_count: u16) -> Self {
        let content =
            Self::SLOT_SIZE * (register_count as i32 + SCRATCH_SLOTS as i32) + SHADOW_SPACE;
        // After `push rbp; push r14`, rsp is 8 off 16-byte alignment;
        // the interior restores it.
        let interior_size = if (content + 8) % 16 == 0 {
            content
        } else {
            content + 8
        };
        FrameLayout {
            register_count,
            interior_size,
        }
    }

    /// Number of virtual registers.
    #[inline]
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// rsp adjustment after the prologue pushes.
    #[inline]
    pub fn interior_size(&self) -> i32 {
        self.interior_size
    }

    /// rbp-relative displacement of a virtual register slot.
    #[inline]
    pub fn slot_disp(&self, index: u16) -> i32 {
        debug_assert!(index < self.register_count, "vreg out of frame");
        -8 - Self::SLOT_SIZE * (self.register_count as i32 - index as i32)
    }

    /// Memory operand for a virtual register slot.
    #[inline]
    pub fn slot(&self, index: u16) -> MemOperand {
        MemOperand::base_disp(Gpr::Rbp, self.slot_disp(index))
    }

    /// rbp-relative displacement of an outgoing scratch slot.
    #[inline]
    pub fn scratch_disp(&self, index: u16) -> i32 {
        debug_assert!(index < SCRATCH_SLOTS, "scratch slot out of frame");
        self.slot_disp(0) - Self::SLOT_SIZE * (SCRATCH_SLOTS as i32 - index as i32)
    }

    /// Memory operand for an outgoing scratch slot.
    #[inline]
    pub fn scratch(&self, index: u16) -> MemOperand {
        MemOperand::base_disp(Gpr::Rbp, self.scratch_disp(index))
    }
}

// =============================================================================
// Tests
// =============================================================================
