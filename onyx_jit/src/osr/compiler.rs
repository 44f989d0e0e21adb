//! The OSR exit compiler.
//!
//! Taking an exit means: make sure every program logically inlined into
//! the exiting frame has real baseline code to land in (forcing
//! compilation if not), synthesize once a thunk that rebuilds the
//! baseline frame from the exit snapshot and jumps to the resume point,
//! patch the optimizing tier's exit branch at the thunk, and account the
//! failure. Crossing the failure threshold throws away the entire
//! optimized compilation and backs off the program's execution counter
//! so the same flawed speculation is not immediately re-optimized.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use onyx_runtime::function::Executable;
use smallvec::SmallVec;

use onyx_core::value::INT_PATTERN;

use crate::backend::x64::{Assembler, CallingConvention, Gpr, MemOperand, ScratchRoles};
use crate::baseline::compiler::{compile_program, BaselineCode, CompileError};
use crate::ic::stub::StubRoutine;
use crate::osr::exit::{
    ExitDescriptor, RecoverSource, RecomputeOp, ValueRecovery, EXIT_BASELINE_FRAME_OFFSET,
    EXIT_GPRS_OFFSET, EXIT_OPT_FRAME_OFFSET, EXIT_RESUME_OFFSET,
};
use crate::patch::CodePatchBuffer;
use crate::runtime::context::JitContext;

/// What taking one exit produced.
pub struct OsrExitOutcome {
    /// Entry address of the (possibly cached) exit thunk.
    pub thunk_entry: usize,
    /// Native baseline address of the resume bytecode offset.
    pub resume_addr: usize,
    /// Whether this exit tipped the whole compilation into
    /// deoptimization.
    pub deopt_scheduled: bool,
}

/// Take an OSR exit through `descriptor`.
///
/// `inlined` lists every executable whose code is logically inlined into
/// the exiting frame; each is baseline-compiled first if needed, because
/// inlining that was never materialized as real baseline code cannot be
/// exited into. `target` is the frame actually resumed.
pub fn take_osr_exit(
    ctx: &Arc<JitContext>,
    descriptor: &ExitDescriptor,
    inlined: &[Arc<Executable>],
    target: &Arc<Executable>,
) -> Result<OsrExitOutcome, CompileError> {
    // Force baseline code into existence for the whole inline stack
    // first; there is nothing to exit into otherwise.
    for executable in inlined {
        compile_program(ctx, executable)?;
    }
    let baseline: Arc<BaselineCode> = compile_program(ctx, target)?;
    let resume_addr = baseline.native_addr(descriptor.bytecode_offset);

    // Synthesize the reconstruction thunk, once.
    let thunk = match descriptor.cached_thunk() {
        Some(thunk) => thunk.clone(),
        None => {
            let compiled = compile_exit_thunk(descriptor)?;
            ctx.stats
                .exit_thunks_compiled
                .fetch_add(1, Ordering::Relaxed);
            descriptor.install_thunk(compiled)
        }
    };

    // Retarget the speculative tier's exit branch at the thunk.
    if let Some((region, branch)) = descriptor.exit_branch {
        let _patches = ctx.lock_patches();
        // SAFETY: the optimized region is installed code owned by the
        // descriptor's compilation; the patch lock is held.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.retarget_jump(branch, thunk.entry());
        drop(patcher);
        ctx.stats.record_patch();
    }

    // Failure accounting: enough exits through one location schedule
    // deoptimization of the entire optimized compilation.
    let failures = descriptor.record_failure();
    let mut deopt_scheduled = false;
    if failures == ctx.options.osr_failure_threshold && descriptor.compilation.is_valid() {
        descriptor.compilation.invalidate();
        target.program().execution_counter().deopt_backoff();
        ctx.stats.deopts_scheduled.fetch_add(1, Ordering::Relaxed);
        deopt_scheduled = true;
        tracing::debug!(
            bc = descriptor.bytecode_offset,
            failures,
            "optimized compilation invalidated after repeated exits"
        );
    }

    tracing::trace!(
        bc = descriptor.bytecode_offset,
        thunk = format_args!("{:#x}", thunk.entry()),
        "osr exit taken"
    );

    Ok(OsrExitOutcome {
        thunk_entry: thunk.entry(),
        resume_addr,
        deopt_scheduled,
    })
}

// =============================================================================
// Thunk compilation
// =============================================================================

/// Load the boxed value a source describes into `rax`. `ctx_reg` holds
/// the `ExitContext`; `scratch` is free.
fn emit_source_load(asm: &mut Assembler, ctx_reg: Gpr, scratch: Gpr, source: &RecoverSource) {
    match source {
        RecoverSource::Register(reg) => {
            asm.mov_rm(
                Gpr::Rax,
                &MemOperand::base_disp(ctx_reg, EXIT_GPRS_OFFSET + 8 * *reg as i32),
            );
        }
        RecoverSource::StackSlot(slot) => {
            asm.mov_rm(scratch, &MemOperand::base_disp(ctx_reg, EXIT_OPT_FRAME_OFFSET));
            asm.mov_rm(Gpr::Rax, &MemOperand::base_disp(scratch, 8 * *slot as i32));
        }
        RecoverSource::Constant(value) => {
            asm.mov_ri64(Gpr::Rax, value.to_bits() as i64);
        }
    }
}

/// Emit one recovery into `rax`.
fn emit_recovery(asm: &mut Assembler, ctx_reg: Gpr, scratch: Gpr, recovery: &ValueRecovery) {
    match recovery {
        ValueRecovery::InRegister(reg) => {
            emit_source_load(asm, ctx_reg, scratch, &RecoverSource::Register(*reg));
        }
        ValueRecovery::OnStack(slot) => {
            emit_source_load(asm, ctx_reg, scratch, &RecoverSource::StackSlot(*slot));
        }
        ValueRecovery::Constant(value) => {
            emit_source_load(asm, ctx_reg, scratch, &RecoverSource::Constant(*value));
        }
        ValueRecovery::Recompute { op, lhs, rhs } => {
            // Both operands are boxed int32; rebuild and re-box.
            emit_source_load(asm, ctx_reg, scratch, rhs);
            asm.mov_rr(Gpr::Rdx, Gpr::Rax);
            emit_source_load(asm, ctx_reg, scratch, lhs);
            asm.mov_rr32(Gpr::Rax, Gpr::Rax);
            asm.mov_rr32(Gpr::Rdx, Gpr::Rdx);
            match op {
                RecomputeOp::AddInt32 => asm.add_rr32(Gpr::Rax, Gpr::Rdx),
                RecomputeOp::SubInt32 => asm.sub_rr32(Gpr::Rax, Gpr::Rdx),
            }
            asm.mov_ri64(scratch, INT_PATTERN as i64);
            asm.or_rr(Gpr::Rax, scratch);
        }
    }
}

/// Compile the one-shot reconstruction thunk for a descriptor:
/// `extern "C" fn(*mut ExitContext)`-shaped, ending in a jump to the
/// resume address the context carries.
pub(crate) fn compile_exit_thunk(
    descriptor: &ExitDescriptor,
) -> Result<Arc<StubRoutine>, CompileError> {
    let cc = CallingConvention::host();
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();

    // Keep the context in a register the recovery loads never touch.
    let ctx_reg = roles.scratch1;
    asm.mov_rr(ctx_reg, cc.arg(0));

    let emit_store = |asm: &mut Assembler, vreg: u16, recovery: &ValueRecovery| {
        emit_recovery(asm, ctx_reg, roles.scratch2, recovery);
        asm.mov_rm(
            roles.scratch2,
            &MemOperand::base_disp(ctx_reg, EXIT_BASELINE_FRAME_OFFSET),
        );
        asm.mov_mr(
            &MemOperand::base_disp(roles.scratch2, 8 * vreg as i32),
            Gpr::Rax,
        );
    };

    for (vreg, recovery) in &descriptor.recoveries {
        emit_store(&mut asm, *vreg, recovery);
    }
    // The override is applied last so it takes precedence.
    if let Some((vreg, recovery)) = &descriptor.override_recovery {
        emit_store(&mut asm, *vreg, recovery);
    }

    // Hand control back to baseline code.
    asm.mov_rm(
        roles.scratch2,
        &MemOperand::base_disp(ctx_reg, EXIT_RESUME_OFFSET),
    );
    asm.jmp_r(roles.scratch2);

    StubRoutine::install(asm, SmallVec::new())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osr::exit::OptimizedCompilation;
    use onyx_core::Value;

    fn descriptor(recoveries: Vec<(u16, ValueRecovery)>) -> ExitDescriptor {
        ExitDescriptor::new(0, recoveries, OptimizedCompilation::new())
    }

    #[test]
    fn test_thunk_compiles_for_every_recovery_kind() {
        let descriptor = descriptor(vec![
            (0, ValueRecovery::InRegister(5)),
            (1, ValueRecovery::OnStack(2)),
            (2, ValueRecovery::Constant(Value::double(6.5))),
            (
                3,
                ValueRecovery::Recompute {
                    op: RecomputeOp::SubInt32,
                    lhs: RecoverSource::StackSlot(0),
                    rhs: RecoverSource::Constant(Value::int32(1)),
                },
            ),
        ]);
        let thunk = compile_exit_thunk(&descriptor).expect("thunk");
        assert!(thunk.code_size() > 0);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", any(unix, windows)))]
    fn test_thunk_reconstructs_exact_frame() {
        use crate::osr::exit::{evaluate_recovery, ExitContext, ExitState};

        let mut descriptor = descriptor(vec![
            (0, ValueRecovery::InRegister(3)),
            (1, ValueRecovery::Constant(Value::int32(77))),
            (
                2,
                ValueRecovery::Recompute {
                    op: RecomputeOp::AddInt32,
                    lhs: RecoverSource::Register(3),
                    rhs: RecoverSource::StackSlot(0),
                },
            ),
        ]);
        descriptor.override_recovery =
            Some((1, ValueRecovery::Constant(Value::boolean(true))));

        let thunk = compile_exit_thunk(&descriptor).expect("thunk");

        // A resume target that simply returns.
        let mut ret_asm = Assembler::new();
        ret_asm.ret();
        let mut ret_stub =
            crate::backend::x64::ExecutableBuffer::from_code(&ret_asm.finalize()).expect("stub");
        assert!(ret_stub.make_executable());

        let mut gprs = [0u64; 16];
        gprs[3] = Value::int32(40).to_bits();
        let opt_frame = vec![Value::int32(2).to_bits()];
        let mut baseline_frame = vec![Value::undefined().to_bits(); 3];

        let mut exit_ctx = ExitContext {
            gprs,
            opt_frame: opt_frame.as_ptr(),
            baseline_frame: baseline_frame.as_mut_ptr(),
            resume: ret_stub.base_addr(),
        };

        type Thunk = unsafe extern "C" fn(*mut ExitContext);
        // SAFETY: the thunk has exactly this shape and the context
        // pointers are live for the call.
        let thunk_fn: Thunk = unsafe { std::mem::transmute(thunk.entry()) };
        unsafe { thunk_fn(&mut exit_ctx) };

        // The hardware reconstruction must match the reference
        // semantics exactly.
        let state = ExitState {
            gprs,
            opt_frame: opt_frame.clone(),
        };
        assert_eq!(
            baseline_frame[0],
            evaluate_recovery(&ValueRecovery::InRegister(3), &state).to_bits()
        );
        assert_eq!(baseline_frame[1], Value::boolean(true).to_bits());
        assert_eq!(
            Value::from_bits(baseline_frame[2]).as_int32(),
            42 // 40 + 2, recomputed
        );
    }

    #[test]
    fn test_thunk_cached_on_descriptor() {
        let descriptor = descriptor(vec![(0, ValueRecovery::Constant(Value::int32(1)))]);
        assert!(descriptor.cached_thunk().is_none());

        let first = compile_exit_thunk(&descriptor).expect("thunk");
        let installed = descriptor.install_thunk(first.clone());
        assert_eq!(installed.entry(), first.entry());

        // A racing second install keeps the first thunk.
        let second = compile_exit_thunk(&descriptor).expect("thunk");
        let kept = descriptor.install_thunk(second);
        assert_eq!(kept.entry(), first.entry());
    }
}
