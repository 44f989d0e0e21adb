//! The shared trampoline pool.
//!
//! One virtual-call trampoline and one thunk per generic operation kind,
//! compiled lazily and shared by every program compiled in the same
//! context. The pool lives in `JitContext`; behavior matches a
//! process-wide pool (one trampoline per operation kind) without the
//! process-wide mutable state.

use std::sync::OnceLock;
use std::sync::Arc;

use onyx_runtime::function::{CALLEE_EXECUTABLE_OFFSET, EXECUTABLE_ENTRY_OFFSET};
use onyx_runtime::object::{CELL_KIND_CALLEE, CELL_KIND_OFFSET};
use smallvec::SmallVec;

use crate::backend::x64::{Assembler, CallingConvention, Condition, MemOperand, ScratchRoles};
use crate::ic::stub::StubRoutine;
use crate::runtime::helpers::{helper_address, HelperKind};

/// Lazily compiled shared stubs.
pub struct TrampolinePool {
    virtual_call: OnceLock<Option<Arc<StubRoutine>>>,
    generic: [OnceLock<Option<Arc<StubRoutine>>>; HelperKind::COUNT],
}

impl TrampolinePool {
    /// Create an empty pool; nothing is compiled until first use.
    pub fn new() -> Self {
        TrampolinePool {
            virtual_call: OnceLock::new(),
            generic: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Entry address of the virtual-call trampoline: a runtime dispatch
    /// through the callee's executable with no patching at all. Falls
    /// back to the generic call helper's address if executable memory
    /// is exhausted (slower, still correct).
    pub fn virtual_call_entry(&self) -> usize {
        let stub = self
            .virtual_call
            .get_or_init(|| compile_virtual_call_trampoline().ok());
        match stub {
            Some(stub) => stub.entry(),
            None => helper_address(HelperKind::CallGeneric),
        }
    }

    /// Entry address of the shared thunk for one generic operation kind.
    /// The thunk only forwards to the helper; sharing it keeps every
    /// slow path in every program calling through the same address.
    pub fn generic_entry(&self, kind: HelperKind) -> usize {
        let stub = self.generic[kind as usize]
            .get_or_init(|| compile_generic_thunk(kind).ok());
        match stub {
            Some(stub) => stub.entry(),
            None => helper_address(kind),
        }
    }
}

impl Default for TrampolinePool {
    fn default() -> Self {
        Self::new()
    }
}

/// The virtual-call dispatch: callee is the first slot of the call
/// frame; a compiled callee is tail-jumped, anything else tail-jumps to
/// the generic call helper with the argument registers untouched.
fn compile_virtual_call_trampoline() -> Result<Arc<StubRoutine>, crate::baseline::compiler::CompileError>
{
    let cc = CallingConvention::host();
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();
    let fallback = asm.create_label();

    // Boxed callee from the call frame; strip the tag.
    asm.mov_rm(roles.scratch1, &MemOperand::base_disp(cc.arg(1), 0));
    asm.shl_ri(roles.scratch1, 16);
    asm.shr_ri(roles.scratch1, 16);

    asm.cmp_m32_i32(
        &MemOperand::base_disp(roles.scratch1, CELL_KIND_OFFSET),
        CELL_KIND_CALLEE as i32,
    );
    asm.jcc(Condition::NotEqual, fallback);

    asm.mov_rm(
        roles.scratch2,
        &MemOperand::base_disp(roles.scratch1, CALLEE_EXECUTABLE_OFFSET),
    );
    asm.mov_rm(
        roles.scratch2,
        &MemOperand::base_disp(roles.scratch2, EXECUTABLE_ENTRY_OFFSET),
    );
    asm.test_rr(roles.scratch2, roles.scratch2);
    asm.jcc(Condition::Equal, fallback);
    asm.jmp_r(roles.scratch2);

    asm.bind(fallback);
    asm.jmp_abs(roles.scratch2, helper_address(HelperKind::CallGeneric));

    StubRoutine::install(asm, SmallVec::new())
}

/// A one-jump forwarding thunk to a generic helper.
fn compile_generic_thunk(
    kind: HelperKind,
) -> Result<Arc<StubRoutine>, crate::baseline::compiler::CompileError> {
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();
    asm.jmp_abs(roles.scratch2, helper_address(kind));
    StubRoutine::install(asm, SmallVec::new())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_compiles_lazily_and_shares() {
        let pool = TrampolinePool::new();
        let a = pool.virtual_call_entry();
        let b = pool.virtual_call_entry();
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_one_thunk_per_operation_kind() {
        let pool = TrampolinePool::new();
        let add_a = pool.generic_entry(HelperKind::AddGeneric);
        let add_b = pool.generic_entry(HelperKind::AddGeneric);
        let sub = pool.generic_entry(HelperKind::SubGeneric);
        assert_eq!(add_a, add_b);
        assert_ne!(add_a, sub);
    }

    #[test]
    fn test_pools_in_different_contexts_are_distinct() {
        let a = TrampolinePool::new();
        let b = TrampolinePool::new();
        // Lazy compilation means distinct pools produce distinct stubs.
        assert_ne!(a.virtual_call_entry(), b.virtual_call_entry());
    }
}
