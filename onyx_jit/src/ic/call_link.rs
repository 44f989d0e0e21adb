//! Call-site linking.
//!
//! A call bytecode compiles to a patchable identity compare plus a near
//! call. The site starts unlinked (placeholder identity, call aimed at
//! the cold path). The first real callee links the site directly to
//! that callee's compiled entry point. A different callee later falls
//! back to a closure-aware stub when only the captured scope differs,
//! or to the fully generic virtual-call trampoline, after which the
//! site is megamorphic and never patched again.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use onyx_runtime::function::{Callee, CALLEE_EXECUTABLE_OFFSET, EXECUTABLE_ENTRY_OFFSET};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::x64::{
    Assembler, Condition, Gpr, Imm64Patch, MemOperand, NearCallPatch, NearJumpPatch, ScratchRoles,
};
use crate::baseline::compiler::CompileError;
use crate::ic::stub::StubRoutine;
use crate::patch::{CodePatchBuffer, CodeRegion};
use crate::runtime::context::VmContext;

/// Link state of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLinkKind {
    /// Placeholder identity; every call goes through the cold path.
    Unlinked,
    /// Direct link to one callee's entry point.
    Monomorphic,
    /// Same executable, varying closures, via a closure-check stub.
    ClosureCall,
    /// Virtual dispatch; terminal, no further patching.
    Megamorphic,
}

/// Mutable link state, guarded by the site lock.
struct CallState {
    kind: CallLinkKind,
    /// Identity of the linked callee (monomorphic only).
    callee_identity: usize,
    /// The shared executable the site is specialized on.
    executable: usize,
    stub: Option<Arc<StubRoutine>>,
    retired: Vec<Arc<StubRoutine>>,
}

/// One call-site link descriptor.
pub struct CallSite {
    pub bytecode_offset: u32,
    /// The callee-identity immediate.
    pub identity: Imm64Patch,
    /// The identity-mismatch branch; escalation retargets it at stubs.
    pub link_branch: NearJumpPatch,
    /// The patchable near call.
    pub call: NearCallPatch,
    /// Native offset just past the call (result handling).
    pub rejoin_offset: u32,

    slow_entry_offset: AtomicU32,
    region_base: AtomicUsize,
    region_len: AtomicUsize,

    state: Mutex<CallState>,
}

impl CallSite {
    /// Create an unlinked descriptor.
    pub fn new(
        bytecode_offset: u32,
        identity: Imm64Patch,
        link_branch: NearJumpPatch,
        call: NearCallPatch,
        rejoin_offset: u32,
    ) -> Box<Self> {
        Box::new(CallSite {
            bytecode_offset,
            identity,
            link_branch,
            call,
            rejoin_offset,
            slow_entry_offset: AtomicU32::new(u32::MAX),
            region_base: AtomicUsize::new(0),
            region_len: AtomicUsize::new(0),
            state: Mutex::new(CallState {
                kind: CallLinkKind::Unlinked,
                callee_identity: 0,
                executable: 0,
                stub: None,
                retired: Vec::new(),
            }),
        })
    }

    /// Record the cold-path entry (slow-case pass).
    pub fn set_slow_entry(&self, offset: u32) {
        self.slow_entry_offset.store(offset, Ordering::Release);
    }

    /// Native offset of the cold path (diagnostics and tests).
    pub fn slow_entry_offset(&self) -> u32 {
        self.slow_entry_offset.load(Ordering::Acquire)
    }

    /// Pin the installed code region.
    pub fn install(&self, region: CodeRegion) {
        self.region_base.store(region.base(), Ordering::Release);
        self.region_len.store(region.len(), Ordering::Release);
    }

    fn region(&self) -> CodeRegion {
        let base = self.region_base.load(Ordering::Acquire);
        assert!(base != 0, "call site used before installation");
        CodeRegion::new(base, self.region_len.load(Ordering::Acquire))
    }

    fn rejoin_addr(&self) -> usize {
        self.region().base() + self.rejoin_offset as usize
    }

    /// Current link state (tests and tracing).
    pub fn link_kind(&self) -> CallLinkKind {
        self.state.lock().kind
    }
}

// SAFETY: raw addresses inside are stable installed-code addresses; all
// mutation is behind the site lock and the patch lock.
unsafe impl Send for CallSite {}
unsafe impl Sync for CallSite {}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("bc", &self.bytecode_offset)
            .field("kind", &self.state.lock().kind)
            .finish()
    }
}

// =============================================================================
// Linking
// =============================================================================

/// Link a call site for an observed callee, compiling the callee's
/// baseline code first if needed. Returns the callee's entry point.
pub fn link_on_call(
    vm: &VmContext,
    site: &CallSite,
    callee: &Callee,
) -> Result<usize, CompileError> {
    let ctx = vm.jit();
    let code = crate::baseline::compiler::compile_program(ctx, callee.executable())?;
    let entry = code.entry_addr();

    let _patches = ctx.lock_patches();
    let mut state = site.state.lock();

    let identity = callee.identity();
    let executable = Arc::as_ptr(callee.executable()) as usize;

    match state.kind {
        CallLinkKind::Unlinked => {
            // A near call can only reach rel32 targets; an entry outside
            // that range dispatches through the (absolute) trampoline
            // stub instead.
            let field = site.region().base() + site.call.0 as usize;
            let reachable =
                i32::try_from(entry as i64 - (field as i64 + 4)).is_ok();
            if reachable {
                // SAFETY: installed region; patch lock held.
                let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
                patcher.repatch_ptr(site.identity, identity);
                patcher.retarget_call(site.call, entry);
                drop(patcher);

                state.kind = CallLinkKind::Monomorphic;
                state.callee_identity = identity;
                state.executable = executable;
                ctx.stats.record_patch();
                tracing::debug!(bc = site.bytecode_offset, "call site linked monomorphic");
            } else if let Ok(stub) = compile_megamorphic_stub(vm, site.rejoin_addr()) {
                // SAFETY: installed region; patch lock held.
                let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
                patcher.retarget_jump(site.link_branch, stub.entry());
                drop(patcher);
                state.stub = Some(stub);
                state.kind = CallLinkKind::Megamorphic;
                ctx.stats.record_stub();
                ctx.stats.record_patch();
            }
        }
        CallLinkKind::Monomorphic if state.callee_identity == identity => {
            // Same callee raced us here; nothing to do.
        }
        CallLinkKind::Monomorphic if state.executable == executable => {
            if let Ok(stub) = compile_closure_stub(executable, site.rejoin_addr(), vm) {
                // SAFETY: installed region; patch lock held.
                let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
                patcher.retarget_jump(site.link_branch, stub.entry());
                drop(patcher);

                if let Some(old) = state.stub.take() {
                    state.retired.push(old);
                }
                state.stub = Some(stub);
                state.kind = CallLinkKind::ClosureCall;
                ctx.stats.record_stub();
                ctx.stats.record_patch();
                tracing::debug!(bc = site.bytecode_offset, "call site linked closure stub");
            }
        }
        CallLinkKind::Monomorphic | CallLinkKind::ClosureCall => {
            if state.kind == CallLinkKind::ClosureCall && state.executable == executable {
                // The closure stub already covers this; spurious miss.
                return Ok(entry);
            }
            if let Ok(stub) = compile_megamorphic_stub(vm, site.rejoin_addr()) {
                // SAFETY: installed region; patch lock held.
                let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
                patcher.retarget_jump(site.link_branch, stub.entry());
                drop(patcher);

                if let Some(old) = state.stub.take() {
                    state.retired.push(old);
                }
                state.stub = Some(stub);
                state.kind = CallLinkKind::Megamorphic;
                ctx.stats.record_stub();
                ctx.stats.record_patch();
                tracing::debug!(bc = site.bytecode_offset, "call site went megamorphic");
            }
        }
        CallLinkKind::Megamorphic => {
            // Terminal; the trampoline dispatches without patching.
        }
    }

    Ok(entry)
}

/// Closure-call stub: accept any callee sharing the expected executable,
/// dispatching through its (possibly newer) entry point; everything else
/// goes to the virtual trampoline.
fn compile_closure_stub(
    expected_executable: usize,
    rejoin: usize,
    vm: &VmContext,
) -> Result<Arc<StubRoutine>, CompileError> {
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();
    let fallback = asm.create_label();

    // rax holds the raw callee pointer; argument registers are live.
    asm.mov_rm(
        roles.scratch2,
        &MemOperand::base_disp(Gpr::Rax, CALLEE_EXECUTABLE_OFFSET),
    );
    asm.mov_ri64(roles.scratch1, expected_executable as i64);
    asm.cmp_rr(roles.scratch2, roles.scratch1);
    asm.jcc(Condition::NotEqual, fallback);

    asm.mov_rm(
        roles.scratch2,
        &MemOperand::base_disp(roles.scratch2, EXECUTABLE_ENTRY_OFFSET),
    );
    asm.test_rr(roles.scratch2, roles.scratch2);
    asm.jcc(Condition::Equal, fallback);
    asm.call_r(roles.scratch2);
    asm.jmp_abs(roles.scratch1, rejoin);

    asm.bind(fallback);
    asm.call_abs(roles.scratch1, vm.jit().trampolines.virtual_call_entry());
    asm.jmp_abs(roles.scratch1, rejoin);

    StubRoutine::install(asm, SmallVec::new())
}

/// Megamorphic stub: always dispatch through the shared virtual-call
/// trampoline, then rejoin.
fn compile_megamorphic_stub(
    vm: &VmContext,
    rejoin: usize,
) -> Result<Arc<StubRoutine>, CompileError> {
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();
    asm.call_abs(roles.scratch1, vm.jit().trampolines.virtual_call_entry());
    asm.jmp_abs(roles.scratch1, rejoin);
    StubRoutine::install(asm, SmallVec::new())
}
