//! Exit descriptors and value recovery.
//!
//! The optimizing tier hands the baseline tier one `ExitDescriptor` per
//! speculative exit point: the bytecode origin to resume at and, for
//! every live virtual register, where its value currently lives: a
//! register, a stack slot of the optimized frame, a known constant, or a
//! cheap recomputation. The descriptor caches its compiled thunk, so a
//! second exit through the same point reuses it.
//!
//! `reconstruct_frame` is the software statement of the recovery
//! semantics; the thunk compiler emits exactly this, and the tests hold
//! the two against each other.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use onyx_core::bytecode::VirtualReg;
use onyx_core::Value;

use crate::backend::x64::NearJumpPatch;
use crate::ic::stub::StubRoutine;
use crate::patch::CodeRegion;

/// Byte offset of the saved GPR array in `ExitContext`.
pub const EXIT_GPRS_OFFSET: i32 = 0;
/// Byte offset of the optimized-frame pointer.
pub const EXIT_OPT_FRAME_OFFSET: i32 = 128;
/// Byte offset of the baseline-frame pointer.
pub const EXIT_BASELINE_FRAME_OFFSET: i32 = 136;
/// Byte offset of the resume address.
pub const EXIT_RESUME_OFFSET: i32 = 144;

// =============================================================================
// Recovery description
// =============================================================================

/// An operand of a recomputation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoverSource {
    /// A saved general-purpose register (hardware encoding 0-15).
    Register(u8),
    /// A slot of the optimized frame.
    StackSlot(u32),
    /// A known constant.
    Constant(Value),
}

/// Operations cheap enough that the optimizer rebuilds the value instead
/// of spilling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOp {
    AddInt32,
    SubInt32,
}

/// Where one live virtual register's value resides at the exit point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRecovery {
    /// Directly in a saved register.
    InRegister(u8),
    /// In a slot of the optimized frame.
    OnStack(u32),
    /// A constant the thunk materializes.
    Constant(Value),
    /// Recomputed from two sources; operands are boxed int32.
    Recompute {
        op: RecomputeOp,
        lhs: RecoverSource,
        rhs: RecoverSource,
    },
}

// =============================================================================
// Exit context (the thunk's input)
// =============================================================================

/// The machine-state snapshot an exit thunk consumes: saved registers,
/// the optimized frame, the baseline frame to fill, and where to resume.
#[repr(C)]
pub struct ExitContext {
    pub gprs: [u64; 16],
    pub opt_frame: *const u64,
    pub baseline_frame: *mut u64,
    pub resume: usize,
}

// =============================================================================
// Optimized compilation handle
// =============================================================================

/// The validity flag of one optimized compilation. Exit descriptors
/// share it; crossing the failure threshold on any of them invalidates
/// the whole compilation, not just the one exit.
pub struct OptimizedCompilation {
    valid: AtomicBool,
}

impl OptimizedCompilation {
    pub fn new() -> Arc<Self> {
        Arc::new(OptimizedCompilation {
            valid: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

// =============================================================================
// Exit descriptor
// =============================================================================

/// One speculative exit point, produced by the optimizing tier and
/// consumed here.
pub struct ExitDescriptor {
    /// Bytecode offset to resume at in baseline code.
    pub bytecode_offset: u32,
    /// Per-vreg recovery list.
    pub recoveries: Vec<(VirtualReg, ValueRecovery)>,
    /// Applied after the list, for exits taken before a value is fully
    /// computed; takes precedence.
    pub override_recovery: Option<(VirtualReg, ValueRecovery)>,
    /// The optimized-tier exit branch to repatch, if materialized.
    pub exit_branch: Option<(CodeRegion, NearJumpPatch)>,
    /// The owning optimized compilation.
    pub compilation: Arc<OptimizedCompilation>,

    thunk: OnceLock<Arc<StubRoutine>>,
    failure_count: AtomicU32,
}

impl ExitDescriptor {
    pub fn new(
        bytecode_offset: u32,
        recoveries: Vec<(VirtualReg, ValueRecovery)>,
        compilation: Arc<OptimizedCompilation>,
    ) -> Self {
        ExitDescriptor {
            bytecode_offset,
            recoveries,
            override_recovery: None,
            exit_branch: None,
            compilation,
            thunk: OnceLock::new(),
            failure_count: AtomicU32::new(0),
        }
    }

    /// The cached thunk, if one was compiled.
    #[inline]
    pub fn cached_thunk(&self) -> Option<&Arc<StubRoutine>> {
        self.thunk.get()
    }

    /// Install the compiled thunk; the first install wins (idempotent
    /// under races).
    pub(crate) fn install_thunk(&self, thunk: Arc<StubRoutine>) -> Arc<StubRoutine> {
        self.thunk.get_or_init(|| thunk).clone()
    }

    /// Count one exit through this descriptor.
    pub(crate) fn record_failure(&self) -> u32 {
        self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Exits taken through this descriptor so far.
    #[inline]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Software recovery (reference semantics)
// =============================================================================

/// A software view of the exit snapshot, for the reference evaluator.
pub struct ExitState {
    pub gprs: [u64; 16],
    pub opt_frame: Vec<u64>,
}

fn resolve_source(source: &RecoverSource, state: &ExitState) -> Value {
    match source {
        RecoverSource::Register(reg) => Value::from_bits(state.gprs[*reg as usize]),
        RecoverSource::StackSlot(slot) => Value::from_bits(state.opt_frame[*slot as usize]),
        RecoverSource::Constant(value) => *value,
    }
}

/// Evaluate one recovery against a snapshot.
pub fn evaluate_recovery(recovery: &ValueRecovery, state: &ExitState) -> Value {
    match recovery {
        ValueRecovery::InRegister(reg) => Value::from_bits(state.gprs[*reg as usize]),
        ValueRecovery::OnStack(slot) => Value::from_bits(state.opt_frame[*slot as usize]),
        ValueRecovery::Constant(value) => *value,
        ValueRecovery::Recompute { op, lhs, rhs } => {
            let lhs = resolve_source(lhs, state);
            let rhs = resolve_source(rhs, state);
            debug_assert!(lhs.is_int32() && rhs.is_int32(), "recompute on non-int32");
            let result = match op {
                RecomputeOp::AddInt32 => lhs.as_int32().wrapping_add(rhs.as_int32()),
                RecomputeOp::SubInt32 => lhs.as_int32().wrapping_sub(rhs.as_int32()),
            };
            Value::int32(result)
        }
    }
}

/// Apply a descriptor's full recovery list (override last) into a
/// baseline frame image.
pub fn reconstruct_frame(descriptor: &ExitDescriptor, state: &ExitState, frame: &mut [Value]) {
    for (vreg, recovery) in &descriptor.recoveries {
        frame[*vreg as usize] = evaluate_recovery(recovery, state);
    }
    if let Some((vreg, recovery)) = &descriptor.override_recovery {
        frame[*vreg as usize] = evaluate_recovery(recovery, state);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    fn state() -> ExitState {
        let mut gprs = [0u64; 16];
        gprs[3] = Value::int32(30).to_bits();
        gprs[7] = Value::double(1.25).to_bits();
        ExitState {
            gprs,
            opt_frame: vec![
                Value::int32(100).to_bits(),
                Value::boolean(true).to_bits(),
            ],
        }
    }

    #[test]
    fn test_exit_context_offsets_frozen() {
        assert_eq!(offset_of!(ExitContext, gprs), EXIT_GPRS_OFFSET as usize);
        assert_eq!(
            offset_of!(ExitContext, opt_frame),
            EXIT_OPT_FRAME_OFFSET as usize
        );
        assert_eq!(
            offset_of!(ExitContext, baseline_frame),
            EXIT_BASELINE_FRAME_OFFSET as usize
        );
        assert_eq!(offset_of!(ExitContext, resume), EXIT_RESUME_OFFSET as usize);
    }

    #[test]
    fn test_each_recovery_kind() {
        let state = state();
        assert_eq!(
            evaluate_recovery(&ValueRecovery::InRegister(3), &state).as_int32(),
            30
        );
        assert!(
            evaluate_recovery(&ValueRecovery::OnStack(1), &state).as_boolean()
        );
        assert_eq!(
            evaluate_recovery(&ValueRecovery::Constant(Value::int32(-5)), &state).as_int32(),
            -5
        );
        let recompute = ValueRecovery::Recompute {
            op: RecomputeOp::AddInt32,
            lhs: RecoverSource::Register(3),
            rhs: RecoverSource::Constant(Value::int32(12)),
        };
        assert_eq!(evaluate_recovery(&recompute, &state).as_int32(), 42);
    }

    #[test]
    fn test_override_applies_last() {
        let compilation = OptimizedCompilation::new();
        let mut descriptor = ExitDescriptor::new(
            0,
            vec![(0, ValueRecovery::Constant(Value::int32(1)))],
            compilation,
        );
        descriptor.override_recovery = Some((0, ValueRecovery::Constant(Value::int32(9))));

        let mut frame = vec![Value::undefined(); 1];
        reconstruct_frame(&descriptor, &state(), &mut frame);
        assert_eq!(frame[0].as_int32(), 9);
    }

    #[test]
    fn test_failure_counting() {
        let descriptor =
            ExitDescriptor::new(0, Vec::new(), OptimizedCompilation::new());
        assert_eq!(descriptor.failure_count(), 0);
        assert_eq!(descriptor.record_failure(), 1);
        assert_eq!(descriptor.record_failure(), 2);
        assert_eq!(descriptor.failure_count(), 2);
    }

    #[test]
    fn test_compilation_invalidation() {
        let compilation = OptimizedCompilation::new();
        assert!(compilation.is_valid());
        compilation.invalidate();
        compilation.invalidate();
        assert!(!compilation.is_valid());
    }
}
