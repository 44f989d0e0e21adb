//! OSR exit tests: thunk caching, exit-branch patching, and the
//! failure-threshold deoptimization policy.

use std::sync::Arc;

use onyx_core::bytecode::{Opcode, ProgramBuilder};
use onyx_core::Value;
use onyx_jit::backend::x64::{Assembler, ExecutableBuffer};
use onyx_jit::osr::{
    take_osr_exit, ExitDescriptor, ExitState, OptimizedCompilation, RecomputeOp, RecoverSource,
    ValueRecovery,
};
use onyx_jit::patch::CodeRegion;
use onyx_jit::{JitContext, JitOptions};
use onyx_runtime::{Executable, ShapeRegistry};

fn jit() -> Arc<JitContext> {
    JitContext::new(Arc::new(ShapeRegistry::new()))
}

fn target_program() -> Arc<Executable> {
    let mut b = ProgramBuilder::new(4);
    b.set_param_count(0);
    let k = b.add_constant(Value::int32(0));
    b.emit(Opcode::LoadConst, [0, k as i32, 0, 0]);
    b.emit(Opcode::Return, [0, 0, 0, 0]);
    Executable::new(b.finish())
}

/// A stand-in optimized region ending in a patchable exit jump.
fn fake_optimized_region() -> (ExecutableBuffer, onyx_jit::backend::x64::NearJumpPatch) {
    let mut asm = Assembler::new();
    let cold = asm.create_label();
    let jump = asm.jmp_patchable(cold);
    asm.bind(cold);
    asm.ret();
    let mut buffer = ExecutableBuffer::from_code(&asm.finalize()).expect("alloc");
    assert!(buffer.make_executable());
    (buffer, jump)
}

#[test]
fn test_exit_forces_baseline_compilation() {
    let ctx = jit();
    let target = target_program();
    let inlined = target_program();
    assert!(!target.is_compiled());
    assert!(!inlined.is_compiled());

    let descriptor = ExitDescriptor::new(
        1,
        vec![(0, ValueRecovery::Constant(Value::int32(5)))],
        OptimizedCompilation::new(),
    );
    let outcome =
        take_osr_exit(&ctx, &descriptor, &[inlined.clone()], &target).expect("exit");

    // Both the inline stack and the resume target got baseline code.
    assert!(target.is_compiled());
    assert!(inlined.is_compiled());
    assert_ne!(outcome.thunk_entry, 0);
    // The resume address points into the target's code at the origin.
    let code = ctx
        .compiled_code(Arc::as_ptr(target.program()) as usize)
        .unwrap();
    assert_eq!(outcome.resume_addr, code.native_addr(1));
}

#[test]
fn test_thunk_cached_across_exits() {
    let ctx = jit();
    let target = target_program();
    let descriptor = ExitDescriptor::new(
        0,
        vec![(0, ValueRecovery::InRegister(3))],
        OptimizedCompilation::new(),
    );

    let first = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    let second = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    assert_eq!(first.thunk_entry, second.thunk_entry);
    assert_eq!(descriptor.failure_count(), 2);
    assert_eq!(
        ctx.stats
            .exit_thunks_compiled
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn test_exit_branch_is_patched_to_thunk() {
    let ctx = jit();
    let target = target_program();
    let (buffer, jump) = fake_optimized_region();

    let mut descriptor = ExitDescriptor::new(
        0,
        vec![(0, ValueRecovery::Constant(Value::int32(1)))],
        OptimizedCompilation::new(),
    );
    descriptor.exit_branch = Some((CodeRegion::new(buffer.base_addr(), buffer.len()), jump));

    let outcome = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");

    // The rel32 now lands exactly on the thunk.
    let field = jump.0 as usize;
    let rel = i32::from_le_bytes(buffer.as_slice()[field..field + 4].try_into().unwrap());
    let resolved = buffer.base_addr() as i64 + field as i64 + 4 + rel as i64;
    assert_eq!(resolved as usize, outcome.thunk_entry);
}

#[test]
fn test_failure_threshold_schedules_whole_deopt() {
    let shapes = Arc::new(ShapeRegistry::new());
    let ctx = JitContext::with_options(
        shapes,
        JitOptions {
            profiling_enabled: true,
            osr_failure_threshold: 3,
        },
    );
    let target = target_program();
    let compilation = OptimizedCompilation::new();
    let descriptor = ExitDescriptor::new(
        0,
        vec![(0, ValueRecovery::Constant(Value::int32(1)))],
        compilation.clone(),
    );

    let counter = target.program().execution_counter();
    let threshold_before = counter.threshold();

    let first = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    assert!(!first.deopt_scheduled);
    assert!(compilation.is_valid());

    let second = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    assert!(!second.deopt_scheduled);

    // Third exit crosses the threshold: the whole compilation goes, and
    // the execution counter backs off so re-optimization is deferred.
    let third = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    assert!(third.deopt_scheduled);
    assert!(!compilation.is_valid());
    assert_eq!(counter.threshold(), threshold_before * 2);
    assert_eq!(counter.count(), 0);

    // Further exits reuse the thunk and never re-schedule.
    let fourth = take_osr_exit(&ctx, &descriptor, &[], &target).expect("exit");
    assert!(!fourth.deopt_scheduled);
}

#[test]
fn test_software_reconstruction_matches_descriptor() {
    // Scenario: three live values (one in a register, one a known
    // constant, one recomputed) restored to exact frame slots.
    let mut gprs = [0u64; 16];
    gprs[5] = Value::int32(11).to_bits();
    let state = ExitState {
        gprs,
        opt_frame: vec![Value::int32(31).to_bits()],
    };

    let descriptor = ExitDescriptor::new(
        0,
        vec![
            (0, ValueRecovery::InRegister(5)),
            (1, ValueRecovery::Constant(Value::double(2.5))),
            (
                2,
                ValueRecovery::Recompute {
                    op: RecomputeOp::AddInt32,
                    lhs: RecoverSource::StackSlot(0),
                    rhs: RecoverSource::Register(5),
                },
            ),
        ],
        OptimizedCompilation::new(),
    );

    let mut frame = vec![Value::undefined(); 3];
    onyx_jit::osr::exit::reconstruct_frame(&descriptor, &state, &mut frame);
    assert_eq!(frame[0].as_int32(), 11);
    assert_eq!(frame[1].as_double(), 2.5);
    assert_eq!(frame[2].as_int32(), 42);
}
