//! The x64 assembler.
//!
//! A thin, append-only code buffer with label/fixup machinery and one
//! extra responsibility the inline caches depend on: any instruction
//! whose immediate, displacement, or branch target will be rewritten at
//! runtime is emitted through a `*_patchable` method that returns the
//! stable byte offset of the rewritable field. Those offsets, never raw
//! pointers, are what the patch subsystem consumes later.
//!
//! All branches are emitted in rel32 form. The baseline tier trades a few
//! bytes for fixed-size, patchable encodings everywhere.

use super::encoder::{self, EncodedInst};
use super::registers::{Condition, Gpr, MemOperand, Xmm};

// =============================================================================
// Labels and patch handles
// =============================================================================

/// A code label; created unbound, bound once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Offset of a patchable 32-bit immediate (the last 4 bytes of its
/// instruction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imm32Patch(pub u32);

/// Offset of a patchable 64-bit immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imm64Patch(pub u32);

/// Offset of a patchable 32-bit displacement inside a pinned-form load
/// or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disp32Patch(pub u32);

/// Offset of the rel32 field of a jump or conditional jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearJumpPatch(pub u32);

/// Offset of the rel32 field of a near call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearCallPatch(pub u32);

/// A patchable pinned-form load: the whole instruction can be flipped to
/// an address computation (`lea`) of identical length, and its
/// displacement can be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPatch {
    /// Offset of the instruction's REX byte.
    pub instr: u32,
}

impl LoadPatch {
    /// The opcode byte the load↔lea replacement flips.
    #[inline]
    pub fn opcode_offset(self) -> u32 {
        self.instr + 1
    }

    /// The displacement field.
    #[inline]
    pub fn disp(self) -> Disp32Patch {
        // REX + opcode + ModR/M, then 4 displacement bytes.
        Disp32Patch(self.instr + 3)
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Code buffer plus label bookkeeping.
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    /// (rel32 field offset, target label) pairs resolved at finalize.
    fixups: Vec<(u32, Label)>,
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Assembler {
            code: Vec::with_capacity(1024),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Current emission offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Create an unbound label.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind a label to the current offset.
    ///
    /// # Panics
    /// Rebinding is a compiler bug.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.code.len() as u32);
    }

    /// Offset a label was bound to, if bound.
    #[inline]
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels[label.0 as usize]
    }

    #[inline]
    fn emit(&mut self, inst: EncodedInst) {
        self.code.extend_from_slice(inst.as_slice());
    }

    /// Emit an instruction and return the offset of its trailing 4 bytes.
    #[inline]
    fn emit_tail32(&mut self, inst: EncodedInst) -> u32 {
        self.emit(inst);
        self.code.len() as u32 - 4
    }

    // =========================================================================
    // Moves
    // =========================================================================

    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_mov_rr(dst, src));
    }

    pub fn mov_ri64(&mut self, dst: Gpr, imm: i64) {
        self.emit(encoder::encode_mov_ri64(dst, imm));
    }

    /// `mov r64, imm64` with the immediate recorded for repatching.
    pub fn mov_ri64_patchable(&mut self, dst: Gpr, imm: i64) -> Imm64Patch {
        self.emit(encoder::encode_mov_ri64(dst, imm));
        Imm64Patch(self.code.len() as u32 - 8)
    }

    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        self.emit(encoder::encode_mov_ri32(dst, imm));
    }

    pub fn mov_rm(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_mov_rm(dst, mem));
    }

    pub fn mov_mr(&mut self, mem: &MemOperand, src: Gpr) {
        self.emit(encoder::encode_mov_mr(mem, src));
    }

    pub fn mov_rm32(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_mov_rm32(dst, mem));
    }

    pub fn mov_mr32(&mut self, mem: &MemOperand, src: Gpr) {
        self.emit(encoder::encode_mov_mr32(mem, src));
    }

    pub fn movsxd_rm(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_movsxd_rm(dst, mem));
    }

    pub fn movsxd_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_movsxd_rr(dst, src));
    }

    pub fn movzx_rm8(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_movzx_rm8(dst, mem));
    }

    pub fn movzx_rm16(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_movzx_rm16(dst, mem));
    }

    pub fn movsx_rm8(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_movsx_rm8(dst, mem));
    }

    pub fn movsx_rm16(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_movsx_rm16(dst, mem));
    }

    pub fn lea(&mut self, dst: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_lea(dst, mem));
    }

    pub fn mov_m32_i32(&mut self, mem: &MemOperand, imm: i32) {
        self.emit(encoder::encode_mov_m32_i32(mem, imm));
    }

    /// Pinned-form 64-bit load whose displacement (and load↔lea form) can
    /// be rewritten at runtime.
    pub fn load_disp32_patchable(&mut self, dst: Gpr, base: Gpr, disp: i32) -> LoadPatch {
        // The fixed 3-byte head (REX+opcode+ModR/M) the patcher assumes
        // rules out SIB bases.
        assert!(!base.needs_sib_as_base(), "patchable load base needs SIB");
        let instr = self.code.len() as u32;
        self.emit(encoder::encode_mov_rm_disp32(
            dst,
            &MemOperand::base_disp(base, disp),
        ));
        LoadPatch { instr }
    }

    /// Pinned-form 64-bit store with a patchable displacement.
    pub fn store_disp32_patchable(&mut self, base: Gpr, disp: i32, src: Gpr) -> Disp32Patch {
        assert!(!base.needs_sib_as_base(), "patchable store base needs SIB");
        Disp32Patch(self.emit_tail32(encoder::encode_mov_mr_disp32(
            &MemOperand::base_disp(base, disp),
            src,
        )))
    }

    // =========================================================================
    // ALU
    // =========================================================================

    pub fn add_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_add_rr(dst, src));
    }

    pub fn add_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(encoder::encode_add_ri(dst, imm));
    }

    pub fn sub_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_sub_rr(dst, src));
    }

    pub fn sub_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(encoder::encode_sub_ri(dst, imm));
    }

    pub fn and_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_and_rr(dst, src));
    }

    pub fn and_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(encoder::encode_and_ri(dst, imm));
    }

    pub fn or_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_or_rr(dst, src));
    }

    pub fn xor_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_xor_rr(dst, src));
    }

    pub fn imul_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_imul_rr(dst, src));
    }

    pub fn add_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_add_rr32(dst, src));
    }

    pub fn sub_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_sub_rr32(dst, src));
    }

    pub fn imul_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_imul_rr32(dst, src));
    }

    pub fn cmp_rr32(&mut self, lhs: Gpr, rhs: Gpr) {
        self.emit(encoder::encode_cmp_rr32(lhs, rhs));
    }

    pub fn or_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_alu_rr32(0x09, dst, src));
    }

    pub fn mov_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_mov_rr32(dst, src));
    }

    pub fn neg32(&mut self, dst: Gpr) {
        self.emit(encoder::encode_neg32(dst));
    }

    pub fn xor_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(encoder::encode_alu_ri(6, dst, imm));
    }

    pub fn or_m32_i32(&mut self, mem: &MemOperand, imm: i32) {
        self.emit(encoder::encode_or_m32_i32(mem, imm));
    }

    pub fn neg(&mut self, dst: Gpr) {
        self.emit(encoder::encode_neg(dst));
    }

    pub fn idiv(&mut self, src: Gpr) {
        self.emit(encoder::encode_idiv(src));
    }

    pub fn cqo(&mut self) {
        self.emit(encoder::encode_cqo());
    }

    pub fn shl_ri(&mut self, dst: Gpr, amount: u8) {
        self.emit(encoder::encode_shl_ri(dst, amount));
    }

    pub fn shr_ri(&mut self, dst: Gpr, amount: u8) {
        self.emit(encoder::encode_shr_ri(dst, amount));
    }

    pub fn sar_ri(&mut self, dst: Gpr, amount: u8) {
        self.emit(encoder::encode_sar_ri(dst, amount));
    }

    pub fn cmp_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.emit(encoder::encode_cmp_rr(lhs, rhs));
    }

    pub fn cmp_ri(&mut self, lhs: Gpr, imm: i32) {
        self.emit(encoder::encode_cmp_ri(lhs, imm));
    }

    pub fn cmp_r32_i32(&mut self, lhs: Gpr, imm: i32) {
        self.emit(encoder::encode_cmp_r32_i32(lhs, imm));
    }

    pub fn cmp_m32_i32(&mut self, mem: &MemOperand, imm: i32) {
        self.emit(encoder::encode_cmp_m32_i32(mem, imm));
    }

    pub fn cmp_r32_m32(&mut self, reg: Gpr, mem: &MemOperand) {
        self.emit(encoder::encode_cmp_r32_m32(reg, mem));
    }

    pub fn cmp_m64_i8(&mut self, mem: &MemOperand, imm: i8) {
        self.emit(encoder::encode_cmp_m64_i8(mem, imm));
    }

    /// Shape-guard compare with the immediate recorded for repatching.
    pub fn cmp_m32_i32_patchable(&mut self, mem: &MemOperand, imm: i32) -> Imm32Patch {
        let offset = self.emit_tail32(encoder::encode_cmp_m32_i32(mem, imm));
        Imm32Patch(offset)
    }

    pub fn test_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.emit(encoder::encode_test_rr(lhs, rhs));
    }

    pub fn setcc(&mut self, cond: Condition, dst: Gpr) {
        self.emit(encoder::encode_setcc(cond, dst));
    }

    pub fn movzx_rb(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_movzx_rb(dst, src));
    }

    // =========================================================================
    // Stack
    // =========================================================================

    pub fn push(&mut self, src: Gpr) {
        self.emit(encoder::encode_push(src));
    }

    pub fn pop(&mut self, dst: Gpr) {
        self.emit(encoder::encode_pop(dst));
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn emit_rel32_to(&mut self, inst: EncodedInst, label: Label) -> u32 {
        let field = self.emit_tail32(inst);
        if let Some(target) = self.labels[label.0 as usize] {
            let rel = target as i64 - (field as i64 + 4);
            self.patch_rel32(field, i32::try_from(rel).expect("branch out of range"));
        } else {
            self.fixups.push((field, label));
        }
        field
    }

    /// Unconditional jump to a label.
    pub fn jmp(&mut self, label: Label) {
        self.emit_rel32_to(encoder::encode_jmp_rel32(0), label);
    }

    /// Jump with the rel32 field recorded so the target can be retargeted
    /// after installation.
    pub fn jmp_patchable(&mut self, label: Label) -> NearJumpPatch {
        NearJumpPatch(self.emit_rel32_to(encoder::encode_jmp_rel32(0), label))
    }

    /// Conditional jump to a label.
    pub fn jcc(&mut self, cond: Condition, label: Label) {
        self.emit_rel32_to(encoder::encode_jcc_rel32(cond, 0), label);
    }

    /// Conditional jump with a retargetable rel32 field.
    pub fn jcc_patchable(&mut self, cond: Condition, label: Label) -> NearJumpPatch {
        NearJumpPatch(self.emit_rel32_to(encoder::encode_jcc_rel32(cond, 0), label))
    }

    /// Near call to a label, with the rel32 field recorded for relinking.
    pub fn call_label_patchable(&mut self, label: Label) -> NearCallPatch {
        NearCallPatch(self.emit_rel32_to(encoder::encode_call_rel32(0), label))
    }

    pub fn jmp_r(&mut self, target: Gpr) {
        self.emit(encoder::encode_jmp_r(target));
    }

    pub fn jmp_m(&mut self, mem: &MemOperand) {
        self.emit(encoder::encode_jmp_m(mem));
    }

    /// Jump to an absolute address through a scratch register.
    pub fn jmp_abs(&mut self, scratch: Gpr, target: usize) {
        self.mov_ri64(scratch, target as i64);
        self.jmp_r(scratch);
    }

    pub fn call_r(&mut self, target: Gpr) {
        self.emit(encoder::encode_call_r(target));
    }

    /// Call an absolute address through a scratch register. Helper calls
    /// use this so the distance to the helper never matters.
    pub fn call_abs(&mut self, scratch: Gpr, target: usize) {
        self.mov_ri64(scratch, target as i64);
        self.call_r(scratch);
    }

    pub fn ret(&mut self) {
        self.emit(encoder::encode_ret());
    }

    pub fn nop(&mut self) {
        self.emit(encoder::encode_nop());
    }

    // =========================================================================
    // SSE2
    // =========================================================================

    pub fn movq_xr(&mut self, dst: Xmm, src: Gpr) {
        self.emit(encoder::encode_movq_xr(dst, src));
    }

    pub fn movq_rx(&mut self, dst: Gpr, src: Xmm) {
        self.emit(encoder::encode_movq_rx(dst, src));
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_addsd(dst, src));
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_subsd(dst, src));
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_mulsd(dst, src));
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_divsd(dst, src));
    }

    pub fn movsd_xm(&mut self, dst: Xmm, mem: &MemOperand) {
        self.emit(encoder::encode_movsd_xm(dst, mem));
    }

    pub fn movsd_mx(&mut self, mem: &MemOperand, src: Xmm) {
        self.emit(encoder::encode_movsd_mx(mem, src));
    }

    pub fn ucomisd(&mut self, lhs: Xmm, rhs: Xmm) {
        self.emit(encoder::encode_ucomisd(lhs, rhs));
    }

    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Gpr) {
        self.emit(encoder::encode_cvtsi2sd(dst, src));
    }

    pub fn cvttsd2si(&mut self, dst: Gpr, src: Xmm) {
        self.emit(encoder::encode_cvttsd2si(dst, src));
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    #[inline]
    fn patch_rel32(&mut self, field: u32, value: i32) {
        let field = field as usize;
        self.code[field..field + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Resolve all pending fixups and hand back the finished code bytes.
    ///
    /// # Panics
    /// An unbound label at finalize time is a compiler bug.
    pub fn finalize(mut self) -> Vec<u8> {
        let fixups = std::mem::take(&mut self.fixups);
        for (field, label) in fixups {
            let target = self.labels[label.0 as usize].expect("unbound label at finalize");
            let rel = target as i64 - (field as i64 + 4);
            self.patch_rel32(field, i32::try_from(rel).expect("branch out of range"));
        }
        self.code
    }

    /// Code emitted so far (for size heuristics and tests).
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

impl Default for Assembler {
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
    fn test_backward_jump_resolution() {
        let mut asm = Assembler::new();
        let top = asm.create_label();
        asm.bind(top);
        asm.nop();
        asm.jmp(top);
        let code = asm.finalize();
        // jmp field starts at 2 (after nop + E9); rel = 0 - (2 + 4) = -6.
        assert_eq!(code, vec![0x90, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_forward_jump_fixup() {
        let mut asm = Assembler::new();
        let out = asm.create_label();
        asm.jmp(out);
        asm.nop();
        asm.nop();
        asm.bind(out);
        asm.ret();
        let code = asm.finalize();
        // rel32 field at 1; target at 7; rel = 7 - 5 = 2.
        assert_eq!(code[..5], [0xE9, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(code[7], 0xC3);
    }

    #[test]
    fn test_conditional_forward_jump() {
        let mut asm = Assembler::new();
        let skip = asm.create_label();
        asm.jcc(Condition::Equal, skip);
        asm.nop();
        asm.bind(skip);
        asm.ret();
        let code = asm.finalize();
        // 0F 84 rel32; field at 2; target 7; rel = 7 - 6 = 1.
        assert_eq!(code[..6], [0x0F, 0x84, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn test_unbound_label_is_fatal() {
        let mut asm = Assembler::new();
        let label = asm.create_label();
        asm.jmp(label);
        let _ = asm.finalize();
    }

    #[test]
    #[should_panic(expected = "label bound twice")]
    fn test_rebinding_is_fatal() {
        let mut asm = Assembler::new();
        let label = asm.create_label();
        asm.bind(label);
        asm.bind(label);
    }

    #[test]
    fn test_patch_handles_point_at_fields() {
        let mut asm = Assembler::new();
        let imm64 = asm.mov_ri64_patchable(Gpr::R10, 0x11223344AABBCCDD);
        let guard = asm.cmp_m32_i32_patchable(&MemOperand::base_disp(Gpr::Rax, 0), 0x55667788);
        let load = asm.load_disp32_patchable(Gpr::Rax, Gpr::Rax, 0x20);
        let code = asm.finalize();

        assert_eq!(
            &code[imm64.0 as usize..imm64.0 as usize + 8],
            &0x11223344AABBCCDDu64.to_le_bytes()
        );
        assert_eq!(
            &code[guard.0 as usize..guard.0 as usize + 4],
            &0x55667788u32.to_le_bytes()
        );
        // Load is REX 8B ModR/M disp32.
        assert_eq!(code[load.instr as usize], 0x48);
        assert_eq!(code[load.opcode_offset() as usize], 0x8B);
        assert_eq!(
            &code[load.disp().0 as usize..load.disp().0 as usize + 4],
            &0x20u32.to_le_bytes()
        );
    }

    #[test]
    fn test_call_abs_sequence() {
        let mut asm = Assembler::new();
        asm.call_abs(Gpr::R10, 0x1234);
        let code = asm.finalize();
        // mov r10, imm64; call r10
        assert_eq!(code[..2], [0x49, 0xBA]);
        assert_eq!(code[10..], [0x41, 0xFF, 0xD2]);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", any(unix, windows)))]
    fn test_assembled_function_runs() {
        use super::super::memory::ExecutableBuffer;

        // fn(a, b) -> a + b over the C ABI.
        let cc = super::super::registers::CallingConvention::host();
        let mut asm = Assembler::new();
        asm.mov_rr(Gpr::Rax, cc.arg(0));
        asm.add_rr(Gpr::Rax, cc.arg(1));
        asm.ret();

        let mut buffer = ExecutableBuffer::from_code(&asm.finalize()).expect("alloc");
        assert!(buffer.make_executable());
        type F = unsafe extern "C" fn(u64, u64) -> u64;
        // SAFETY: the buffer holds a complete two-argument function.
        let f: F = unsafe { buffer.as_fn() };
        assert_eq!(unsafe { f(40, 2) }, 42);
    }
}
