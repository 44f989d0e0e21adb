//! The three-pass lowering driver.
//!
//! Pass 1 (main) walks the instruction stream once, binding a native
//! label per bytecode offset, emitting fast paths, and deferring every
//! bail-out as a `SlowCase`. Pass 2 (link) resolves the jump tables the
//! main pass could only size against the now-complete label table.
//! Pass 3 (slow cases) emits the cold paths in exactly the recorded
//! order: the hot path's branch targets encode positional order, so a
//! mismatch is asserted, not tolerated.
//!
//! Compilation fails only for executable-memory exhaustion; the caller
//! handles that by staying in the interpreter. Everything else that can
//! go wrong is a compiler bug and asserts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use onyx_core::bytecode::{Opcode, Program};
use onyx_core::Value;
use onyx_runtime::function::Executable;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::backend::x64::{
    Assembler, CallingConvention, ExecutableBuffer, Gpr, Imm64Patch, Label, MemOperand,
    ScratchRoles,
};
use crate::baseline::frame::FrameLayout;
use crate::baseline::{arith, calls, control, elements, property};
use crate::ic::access_site::AccessSite;
use crate::ic::call_link::CallSite;
use crate::patch::CodeRegion;
use crate::runtime::context::{JitContext, VM_EXCEPTION_OFFSET, VM_UNWIND_BC_OFFSET};
use crate::runtime::helpers::{EntryFn, HelperKind};

// =============================================================================
// Errors
// =============================================================================

/// The one recoverable compilation failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompileError {
    /// No executable pages; the unit stays interpreted.
    #[error("out of executable memory")]
    OutOfExecutableMemory,
}

// =============================================================================
// Slow cases
// =============================================================================

/// One deferred bail-out recorded by the main pass.
pub(crate) struct SlowCase {
    pub label: Label,
    pub bytecode_offset: u32,
}

// =============================================================================
// Switch sites
// =============================================================================

/// Runtime dispatch data for one switch bytecode: case keys to native
/// addresses, filled in at install time.
pub struct SwitchSite {
    bytecode_offset: u32,
    cases: FxHashMap<i64, AtomicUsize>,
    default: AtomicUsize,
    /// (key, target bc) pairs plus default bc, for the install fill.
    pending: Vec<(i64, u32)>,
    default_bc: u32,
}

impl SwitchSite {
    pub(crate) fn new_with_offset(
        bytecode_offset: u32,
        pending: Vec<(i64, u32)>,
        default_bc: u32,
    ) -> Box<Self> {
        let cases = pending
            .iter()
            .map(|&(key, _)| (key, AtomicUsize::new(0)))
            .collect();
        Box::new(SwitchSite {
            bytecode_offset,
            cases,
            default: AtomicUsize::new(0),
            pending,
            default_bc,
        })
    }

    /// The switch bytecode this site belongs to.
    pub fn bytecode_offset(&self) -> u32 {
        self.bytecode_offset
    }

    fn fill(&self, base: usize, labels: &[u32]) {
        for &(key, bc) in &self.pending {
            self.cases[&key].store(base + labels[bc as usize] as usize, Ordering::Release);
        }
        self.default.store(
            base + labels[self.default_bc as usize] as usize,
            Ordering::Release,
        );
    }

    /// Native address for a case key.
    pub fn native_target(&self, key: i64) -> usize {
        match self.cases.get(&key) {
            Some(addr) => addr.load(Ordering::Acquire),
            None => self.default.load(Ordering::Acquire),
        }
    }

    /// Native address of the default case.
    pub fn default_native_target(&self) -> usize {
        self.default.load(Ordering::Acquire)
    }
}

/// A dense jump table: native addresses indexed by (key - min), embedded
/// by address in the fast path and filled at install time.
pub(crate) struct DenseJumpTable {
    pub data: Box<[AtomicUsize]>,
    pub targets: Vec<u32>,
}

impl DenseJumpTable {
    fn fill(&self, base: usize, labels: &[u32]) {
        for (slot, &bc) in self.data.iter().zip(&self.targets) {
            slot.store(base + labels[bc as usize] as usize, Ordering::Release);
        }
    }
}

// =============================================================================
// Lowering context
// =============================================================================

/// Everything the opcode emitters share.
pub(crate) struct LoweringContext<'a> {
    pub asm: Assembler,
    pub program: &'a Arc<Program>,
    pub ctx: &'a Arc<JitContext>,
    pub frame: FrameLayout,
    pub roles: ScratchRoles,
    pub cc: CallingConvention,
    /// One label per bytecode offset, bound by the main pass.
    pub labels: Vec<Label>,
    pub epilogue: Label,
    pub slow_cases: Vec<SlowCase>,
    pub access_sites: Vec<Box<AccessSite>>,
    pub call_sites: Vec<Box<CallSite>>,
    pub switch_sites: Vec<Box<SwitchSite>>,
    pub jump_tables: Vec<DenseJumpTable>,
    /// Pending exception-check cold stubs: (label, bytecode offset).
    pub exception_stubs: Vec<(Label, u32)>,
    /// Descriptor addresses to write over emitted imm64 placeholders
    /// before installation.
    pub site_fixups: Vec<(Imm64Patch, usize)>,
}

impl<'a> LoweringContext<'a> {
    /// Record a deferred bail-out for the current instruction and return
    /// the label its guard should branch to.
    pub fn slow_case(&mut self, bytecode_offset: u32) -> Label {
        let label = self.asm.create_label();
        self.slow_cases.push(SlowCase {
            label,
            bytecode_offset,
        });
        label
    }

    /// The label of the instruction after `bytecode_offset` (the rejoin
    /// point for linear slow paths).
    pub fn next_label(&self, bytecode_offset: u32) -> Label {
        self.labels[bytecode_offset as usize + 1]
    }

    /// Emit a pending-exception check that unwinds with `bytecode_offset`
    /// recorded.
    pub fn emit_exception_check(&mut self, bytecode_offset: u32) {
        let stub = self.asm.create_label();
        self.asm.cmp_m64_i8(
            &MemOperand::base_disp(self.roles.context, VM_EXCEPTION_OFFSET),
            0,
        );
        self.asm
            .jcc(crate::backend::x64::Condition::NotEqual, stub);
        self.exception_stubs.push((stub, bytecode_offset));
    }

    /// Emit the fast-path profiling record store: the raw result value
    /// in `value_reg` goes into the site's profile bucket.
    pub fn emit_profile_store(&mut self, bytecode_offset: u32, value_reg: Gpr) {
        if !self.ctx.options.profiling_enabled {
            return;
        }
        if let Some(profile) = self.program.value_profile(bytecode_offset) {
            let scratch = self.roles.scratch1;
            debug_assert!(scratch != value_reg);
            self.asm.mov_ri64(scratch, profile.bucket_addr() as i64);
            self.asm
                .mov_mr(&MemOperand::base_disp(scratch, 0), value_reg);
        }
    }

    /// Address of the shared thunk for a generic helper.
    pub fn helper_entry(&self, kind: HelperKind) -> usize {
        self.ctx.trampolines.generic_entry(kind)
    }
}

// =============================================================================
// BaselineCode
// =============================================================================

/// A finalized baseline compilation: the installed code plus everything
/// that owns or describes it. Dropping this releases the stub routines
/// its sites hold.
pub struct BaselineCode {
    buffer: ExecutableBuffer,
    program: Arc<Program>,
    frame: FrameLayout,
    /// Native offset per bytecode offset.
    labels: Vec<u32>,
    access_sites: Vec<Box<AccessSite>>,
    call_sites: Vec<Box<CallSite>>,
    #[allow(dead_code)]
    switch_sites: Vec<Box<SwitchSite>>,
    #[allow(dead_code)]
    jump_tables: Vec<DenseJumpTable>,
}

impl BaselineCode {
    /// Entry address.
    #[inline]
    pub fn entry_addr(&self) -> usize {
        self.buffer.base_addr()
    }

    /// The installed region, for patching.
    #[inline]
    pub fn region(&self) -> CodeRegion {
        CodeRegion::new(self.buffer.base_addr(), self.buffer.len())
    }

    /// The program this code was lowered from.
    #[inline]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// The frame layout baseline frames use.
    #[inline]
    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    /// Native offset of a bytecode offset.
    #[inline]
    pub fn native_offset(&self, bytecode_offset: u32) -> u32 {
        self.labels[bytecode_offset as usize]
    }

    /// Native address of a bytecode offset (OSR resume points).
    #[inline]
    pub fn native_addr(&self, bytecode_offset: u32) -> usize {
        self.entry_addr() + self.native_offset(bytecode_offset) as usize
    }

    /// The installed code bytes (tests and diagnostics).
    #[inline]
    pub fn code(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Access sites in bytecode order.
    #[inline]
    pub fn access_sites(&self) -> &[Box<AccessSite>] {
        &self.access_sites
    }

    /// Call sites in bytecode order.
    #[inline]
    pub fn call_sites(&self) -> &[Box<CallSite>] {
        &self.call_sites
    }

    /// The entry point as a callable function.
    ///
    /// # Safety
    /// Callers must uphold the baseline calling convention and keep the
    /// frame region valid.
    #[inline]
    pub unsafe fn entry_fn(&self) -> EntryFn {
        // SAFETY: the buffer holds a complete baseline function.
        unsafe { self.buffer.as_fn() }
    }
}

// =============================================================================
// Compilation driver
// =============================================================================

/// Compile a program (once) and install its entry point on the
/// executable. Subsequent calls return the cached code.
pub fn compile_program(
    ctx: &Arc<JitContext>,
    executable: &Arc<Executable>,
) -> Result<Arc<BaselineCode>, CompileError> {
    let program = executable.program();
    let key = Arc::as_ptr(program) as usize;
    if let Some(code) = ctx.compiled_code(key) {
        return Ok(code);
    }

    let fresh = Arc::new(lower(ctx, program)?);
    // A racing compilation of the same program may have published first;
    // never replace an installed entry another context could be running.
    let code = match ctx.code_map.entry(key) {
        dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(fresh.clone());
            ctx.stats
                .programs_compiled
                .fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .code_bytes
                .fetch_add(fresh.code().len() as u64, Ordering::Relaxed);
            tracing::debug!(
                instructions = program.instructions().len(),
                bytes = fresh.code().len(),
                "baseline compilation installed"
            );
            fresh
        }
    };
    executable.set_entry_point(code.entry_addr());
    Ok(code)
}

/// Lower one program through the three passes and install the result.
fn lower(ctx: &Arc<JitContext>, program: &Arc<Program>) -> Result<BaselineCode, CompileError> {
    let mut asm = Assembler::new();
    let instruction_count = program.instructions().len();
    let labels: Vec<Label> = (0..instruction_count).map(|_| asm.create_label()).collect();
    let epilogue = asm.create_label();

    let mut lowering = LoweringContext {
        asm,
        program,
        ctx,
        frame: FrameLayout::new(program.register_count()),
        roles: ScratchRoles::host(),
        cc: CallingConvention::host(),
        labels,
        epilogue,
        slow_cases: Vec::new(),
        access_sites: Vec::new(),
        call_sites: Vec::new(),
        switch_sites: Vec::new(),
        jump_tables: Vec::new(),
        exception_stubs: Vec::new(),
        site_fixups: Vec::new(),
    };

    emit_prologue(&mut lowering);
    main_pass(&mut lowering);
    emit_epilogue(&mut lowering);
    link_pass(&mut lowering);
    slow_case_pass(&mut lowering);
    emit_exception_stubs(&mut lowering);

    // Freeze native label offsets before the assembler is consumed.
    let label_offsets: Vec<u32> = lowering
        .labels
        .iter()
        .map(|&label| {
            lowering
                .asm
                .label_offset(label)
                .expect("bytecode label unbound after main pass")
        })
        .collect();

    let LoweringContext {
        asm,
        frame,
        access_sites,
        call_sites,
        switch_sites,
        jump_tables,
        site_fixups,
        ..
    } = lowering;

    let mut code = asm.finalize();
    for (patch, value) in site_fixups {
        let at = patch.0 as usize;
        code[at..at + 8].copy_from_slice(&(value as u64).to_le_bytes());
    }
    let mut buffer =
        ExecutableBuffer::from_code(&code).ok_or(CompileError::OutOfExecutableMemory)?;
    let base = buffer.base_addr();
    let region = CodeRegion::new(base, code.len());

    // Install-time fixups: absolute addresses only exist now.
    for table in &jump_tables {
        table.fill(base, &label_offsets);
    }
    for site in &switch_sites {
        site.fill(base, &label_offsets);
    }
    for site in &access_sites {
        site.install(region);
    }
    for site in &call_sites {
        site.install(region);
    }

    assert!(buffer.make_executable(), "failed to finalize code pages");

    Ok(BaselineCode {
        buffer,
        program: program.clone(),
        frame,
        labels: label_offsets,
        access_sites,
        call_sites,
        switch_sites,
        jump_tables,
    })
}

/// Prologue: frame setup, context register, argument copy, undefined
/// fill.
fn emit_prologue(lowering: &mut LoweringContext<'_>) {
    let frame = lowering.frame;
    let roles = lowering.roles;
    let cc = lowering.cc;
    let asm = &mut lowering.asm;

    asm.push(Gpr::Rbp);
    asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
    asm.push(roles.context);
    asm.sub_ri(Gpr::Rsp, frame.interior_size());
    asm.mov_rr(roles.context, cc.arg(0));

    // Arguments arrive as call_frame[1..]; the callee itself is slot 0.
    let param_count = lowering.program.param_count().min(frame.register_count());
    for index in 0..param_count {
        asm.mov_rm(
            Gpr::Rax,
            &MemOperand::base_disp(cc.arg(1), 8 * (index as i32 + 1)),
        );
        asm.mov_mr(&frame.slot(index), Gpr::Rax);
    }

    // Remaining registers start undefined.
    if param_count < frame.register_count() {
        asm.mov_ri64(roles.scratch1, Value::undefined().to_bits() as i64);
        for index in param_count..frame.register_count() {
            asm.mov_mr(&frame.slot(index), roles.scratch1);
        }
    }
}

/// Pass 1: per-instruction fast paths.
fn main_pass(lowering: &mut LoweringContext<'_>) {
    for offset in 0..lowering.program.instructions().len() {
        let bc = offset as u32;
        let instr = lowering.program.instructions()[offset];
        let label = lowering.labels[offset];
        lowering.asm.bind(label);

        match instr.opcode {
            Opcode::Mov => {
                let (dst, src) = (instr.reg(0), instr.reg(1));
                let (dst, src) = (lowering.frame.slot(dst), lowering.frame.slot(src));
                lowering.asm.mov_rm(Gpr::Rax, &src);
                lowering.asm.mov_mr(&dst, Gpr::Rax);
            }
            Opcode::LoadConst => {
                let dst = lowering.frame.slot(instr.reg(0));
                let constant = lowering.program.constant(instr.op(1) as u32);
                lowering.asm.mov_ri64(Gpr::Rax, constant.to_bits() as i64);
                lowering.asm.mov_mr(&dst, Gpr::Rax);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                arith::emit_int_binary(lowering, bc, &instr);
            }
            Opcode::Div => arith::emit_div(lowering, bc, &instr),
            Opcode::Mod => arith::emit_mod(lowering, bc, &instr),
            Opcode::Neg => arith::emit_neg(lowering, bc, &instr),
            Opcode::Eq | Opcode::Less | Opcode::LessEq => {
                arith::emit_compare(lowering, bc, &instr);
            }
            Opcode::Not => control::emit_not(lowering, bc, &instr),
            Opcode::Jump => {
                let target = lowering.labels[instr.op(0) as usize];
                lowering.asm.jmp(target);
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                control::emit_conditional_jump(lowering, bc, &instr);
            }
            Opcode::Return => {
                let src = lowering.frame.slot(instr.reg(0));
                lowering.asm.mov_rm(Gpr::Rax, &src);
                let epilogue = lowering.epilogue;
                lowering.asm.jmp(epilogue);
            }
            Opcode::GetProp => property::emit_get_prop(lowering, bc, &instr),
            Opcode::SetProp => property::emit_set_prop(lowering, bc, &instr),
            Opcode::GetElem => elements::emit_get_elem(lowering, bc, &instr),
            Opcode::SetElem => elements::emit_set_elem(lowering, bc, &instr),
            Opcode::Call => calls::emit_call(lowering, bc, &instr),
            Opcode::SwitchImm | Opcode::SwitchChar => {
                control::emit_dense_switch(lowering, bc, &instr);
            }
            Opcode::SwitchString => control::emit_string_switch(lowering, bc, &instr),
        }
    }
}

fn emit_epilogue(lowering: &mut LoweringContext<'_>) {
    let roles = lowering.roles;
    let epilogue = lowering.epilogue;
    let asm = &mut lowering.asm;
    asm.bind(epilogue);
    asm.lea(Gpr::Rsp, &MemOperand::base_disp(Gpr::Rbp, -8));
    asm.pop(roles.context);
    asm.pop(Gpr::Rbp);
    asm.ret();
}

/// Pass 2: resolve bytecode-relative jump tables against the label
/// table, and assert every bytecode label was bound.
fn link_pass(lowering: &mut LoweringContext<'_>) {
    for (offset, &label) in lowering.labels.iter().enumerate() {
        assert!(
            lowering.asm.label_offset(label).is_some(),
            "main pass left bytecode offset {offset} unbound"
        );
    }
    // Dense jump tables only validate here; the native fill needs the
    // installed base address and happens at install time.
    for table in &lowering.jump_tables {
        for &bc in &table.targets {
            assert!(
                (bc as usize) < lowering.labels.len(),
                "jump table target {bc} out of range"
            );
        }
    }
}

/// Pass 3: cold paths, consumed strictly in recorded order.
fn slow_case_pass(lowering: &mut LoweringContext<'_>) {
    let cases = std::mem::take(&mut lowering.slow_cases);
    let mut previous_bc: Option<u32> = None;

    let mut index = 0;
    while index < cases.len() {
        let bc = cases[index].bytecode_offset;
        if let Some(previous) = previous_bc {
            assert!(
                bc >= previous,
                "slow cases recorded out of order: {bc} after {previous}"
            );
        }
        previous_bc = Some(bc);

        // All guards of one instruction share its cold path; bind them
        // at its entry, preserving their recorded order.
        let group_start = index;
        while index < cases.len() && cases[index].bytecode_offset == bc {
            index += 1;
        }
        for case in &cases[group_start..index] {
            let label = case.label;
            lowering.asm.bind(label);
        }

        let instr = lowering.program.instructions()[bc as usize];
        match instr.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                arith::emit_int_binary_slow(lowering, bc, &instr);
            }
            Opcode::Div => arith::emit_div_slow(lowering, bc, &instr),
            Opcode::Mod => arith::emit_mod_slow(lowering, bc, &instr),
            Opcode::Neg => arith::emit_neg_slow(lowering, bc, &instr),
            Opcode::Eq | Opcode::Less | Opcode::LessEq => {
                arith::emit_compare_slow(lowering, bc, &instr);
            }
            Opcode::Not => control::emit_not_slow(lowering, bc, &instr),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                control::emit_conditional_jump_slow(lowering, bc, &instr);
            }
            Opcode::GetProp => property::emit_get_prop_slow(lowering, bc, &instr),
            Opcode::SetProp => property::emit_set_prop_slow(lowering, bc, &instr),
            Opcode::GetElem => elements::emit_get_elem_slow(lowering, bc, &instr),
            Opcode::SetElem => elements::emit_set_elem_slow(lowering, bc, &instr),
            Opcode::Call => calls::emit_call_slow(lowering, bc, &instr),
            Opcode::SwitchImm | Opcode::SwitchChar => {
                control::emit_dense_switch_slow(lowering, bc, &instr);
            }
            other => unreachable!("opcode {other:?} recorded a slow case"),
        }
    }
}

/// Per-check unwind stubs: record the bytecode offset, return undefined
/// through the epilogue with the exception left in the context.
fn emit_exception_stubs(lowering: &mut LoweringContext<'_>) {
    let stubs = std::mem::take(&mut lowering.exception_stubs);
    let roles = lowering.roles;
    let epilogue = lowering.epilogue;
    for (label, bc) in stubs {
        lowering.asm.bind(label);
        lowering.asm.mov_m32_i32(
            &MemOperand::base_disp(roles.context, VM_UNWIND_BC_OFFSET),
            bc as i32,
        );
        lowering
            .asm
            .mov_ri64(Gpr::Rax, Value::undefined().to_bits() as i64);
        lowering.asm.jmp(epilogue);
    }
}
