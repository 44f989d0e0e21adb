//! Runtime mutation of installed code.
//!
//! `CodePatchBuffer` is the only way executable memory changes after
//! installation. Acquiring one flips the target region writable; dropping
//! it restores execute-only and issues a full fence, so no page is ever
//! left writable-and-fetchable.
//!
//! Every edit is a bounded rewrite of a field whose location was recorded
//! at assembly time (`Imm32Patch`, `NearJumpPatch`, ...); the surrounding
//! instruction bytes are verified before the write, and any mismatch is
//! fatal; continuing would execute corrupted code. The buffer performs
//! no synchronization of its own: callers hold the context's patch lock,
//! and the single-threaded-per-activation model plus instruction-sized
//! writes keep concurrent executors safe.

use std::sync::atomic::{fence, Ordering};

use crate::backend::x64::assembler::{
    Disp32Patch, Imm32Patch, Imm64Patch, LoadPatch, NearCallPatch, NearJumpPatch,
};
use crate::backend::x64::memory;

/// Opcode byte of `mov r64, [r + disp32]` (the patchable load form).
const LOAD_OPCODE: u8 = 0x8B;
/// Opcode byte of `lea r64, [r + disp32]`, same length as the load.
const LEA_OPCODE: u8 = 0x8D;
/// Opcode byte of `jmp rel32`.
const JMP_OPCODE: u8 = 0xE9;
/// Opcode byte of `call rel32`.
const CALL_OPCODE: u8 = 0xE8;

/// An installed code region patches are applied against.
#[derive(Debug, Clone, Copy)]
pub struct CodeRegion {
    base: usize,
    len: usize,
}

impl CodeRegion {
    /// Describe an installed region by base address and length.
    #[inline]
    pub fn new(base: usize, len: usize) -> Self {
        CodeRegion { base, len }
    }

    /// Base address.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute address of a field offset inside the region.
    #[inline]
    fn addr(&self, offset: u32, field_len: usize) -> usize {
        assert!(
            (offset as usize) + field_len <= self.len,
            "patch location outside code region"
        );
        self.base + offset as usize
    }
}

/// Scoped writable window over installed code.
pub struct CodePatchBuffer {
    region: CodeRegion,
}

impl CodePatchBuffer {
    /// Make the region writable for the lifetime of the returned buffer.
    ///
    /// # Safety
    /// The region must be installed executable memory that stays alive
    /// for the buffer's lifetime, and the caller must hold the context's
    /// patch lock.
    pub unsafe fn acquire(region: CodeRegion) -> Self {
        // SAFETY: caller guarantees the region is a live mapping.
        let ok = unsafe { memory::protect_region_writable(region.base, region.len) };
        assert!(ok, "failed to make code region writable");
        CodePatchBuffer { region }
    }

    #[inline]
    unsafe fn write<const N: usize>(&self, addr: usize, bytes: [u8; N]) {
        // SAFETY: addr was bounds-checked against the region, which is
        // writable while self lives.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, N);
        }
    }

    #[inline]
    fn read_byte(&self, addr: usize) -> u8 {
        // SAFETY: addr is inside the region.
        unsafe { *(addr as *const u8) }
    }

    /// Rewrite a 32-bit immediate.
    pub fn repatch_i32(&self, patch: Imm32Patch, value: i32) {
        let addr = self.region.addr(patch.0, 4);
        // SAFETY: bounds checked.
        unsafe { self.write(addr, value.to_le_bytes()) };
    }

    /// Rewrite a pointer-sized immediate.
    pub fn repatch_ptr(&self, patch: Imm64Patch, value: usize) {
        let addr = self.region.addr(patch.0, 8);
        // SAFETY: bounds checked.
        unsafe { self.write(addr, (value as u64).to_le_bytes()) };
    }

    /// Rewrite the displacement of a pinned-form load or store.
    pub fn repatch_disp32(&self, patch: Disp32Patch, value: i32) {
        let addr = self.region.addr(patch.0, 4);
        // SAFETY: bounds checked.
        unsafe { self.write(addr, value.to_le_bytes()) };
    }

    /// Retarget a jump (unconditional or conditional) at a new absolute
    /// address.
    pub fn retarget_jump(&self, patch: NearJumpPatch, target: usize) {
        let field = self.region.addr(patch.0, 4);
        // The field must belong to `jmp rel32` or `jcc rel32`.
        let prev = self.read_byte(field - 1);
        let is_jmp = prev == JMP_OPCODE;
        let is_jcc = (0x80..=0x8F).contains(&prev) && self.read_byte(field - 2) == 0x0F;
        assert!(is_jmp || is_jcc, "retarget_jump on a non-jump location");

        let rel = target as i64 - (field as i64 + 4);
        let rel = i32::try_from(rel).expect("jump target out of rel32 range");
        // SAFETY: bounds checked.
        unsafe { self.write(field, rel.to_le_bytes()) };
    }

    /// Rewrite a near call's target to an absolute address.
    pub fn retarget_call(&self, patch: NearCallPatch, target: usize) {
        let field = self.region.addr(patch.0, 4);
        assert_eq!(
            self.read_byte(field - 1),
            CALL_OPCODE,
            "retarget_call on a non-call location"
        );
        let rel = target as i64 - (field as i64 + 4);
        let rel = i32::try_from(rel).expect("call target out of rel32 range");
        // SAFETY: bounds checked.
        unsafe { self.write(field, rel.to_le_bytes()) };
    }

    /// Replace a pinned-form load with the address computation of the
    /// same operands. Encoding length is identical, so nothing shifts.
    pub fn replace_load_with_lea(&self, patch: LoadPatch) {
        let addr = self.region.addr(patch.opcode_offset(), 1);
        assert_eq!(self.read_byte(addr), LOAD_OPCODE, "expected a load opcode");
        // SAFETY: bounds checked.
        unsafe { self.write(addr, [LEA_OPCODE]) };
    }

    /// Inverse of `replace_load_with_lea`.
    pub fn replace_lea_with_load(&self, patch: LoadPatch) {
        let addr = self.region.addr(patch.opcode_offset(), 1);
        assert_eq!(self.read_byte(addr), LEA_OPCODE, "expected a lea opcode");
        // SAFETY: bounds checked.
        unsafe { self.write(addr, [LOAD_OPCODE]) };
    }
}

impl Drop for CodePatchBuffer {
    fn drop(&mut self) {
        // SAFETY: same mapping acquire() flipped writable.
        let ok = unsafe { memory::protect_region_executable(self.region.base, self.region.len) };
        assert!(ok, "failed to restore code region executable");
        fence(Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::{Assembler, ExecutableBuffer, Gpr, MemOperand};

    fn installed(asm: Assembler) -> ExecutableBuffer {
        let mut buffer = ExecutableBuffer::from_code(&asm.finalize()).expect("alloc");
        assert!(buffer.make_executable());
        buffer
    }

    #[test]
    fn test_repatch_imm32() {
        let mut asm = Assembler::new();
        let guard = asm.cmp_m32_i32_patchable(&MemOperand::base_disp(Gpr::Rax, 0), 0);
        asm.ret();
        let buffer = installed(asm);

        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.repatch_i32(guard, 0x1234_5678);
        drop(patcher);

        let field = guard.0 as usize;
        assert_eq!(
            &buffer.as_slice()[field..field + 4],
            &0x1234_5678u32.to_le_bytes()
        );
    }

    #[test]
    fn test_repatch_ptr() {
        let mut asm = Assembler::new();
        let imm = asm.mov_ri64_patchable(Gpr::R10, 0);
        asm.ret();
        let buffer = installed(asm);

        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.repatch_ptr(imm, 0xAABB_CCDD);
        drop(patcher);

        let field = imm.0 as usize;
        assert_eq!(
            &buffer.as_slice()[field..field + 8],
            &0xAABB_CCDDu64.to_le_bytes()
        );
    }

    #[test]
    fn test_retarget_jump() {
        let mut asm = Assembler::new();
        let cold = asm.create_label();
        let jump = asm.jmp_patchable(cold);
        asm.nop();
        asm.bind(cold);
        asm.ret();
        let buffer = installed(asm);

        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        let new_target = buffer.base_addr(); // retarget to entry
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.retarget_jump(jump, new_target);
        drop(patcher);

        let field = jump.0 as usize;
        let rel = i32::from_le_bytes(buffer.as_slice()[field..field + 4].try_into().unwrap());
        assert_eq!(
            buffer.base_addr() as i64 + field as i64 + 4 + rel as i64,
            new_target as i64
        );
    }

    #[test]
    fn test_load_lea_roundtrip() {
        let mut asm = Assembler::new();
        let load = asm.load_disp32_patchable(Gpr::Rax, Gpr::Rax, 0x10);
        asm.ret();
        let buffer = installed(asm);

        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        let opcode_at = load.opcode_offset() as usize;
        assert_eq!(buffer.as_slice()[opcode_at], 0x8B);

        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.replace_load_with_lea(load);
        patcher.repatch_disp32(load.disp(), 0x40);
        drop(patcher);
        assert_eq!(buffer.as_slice()[opcode_at], 0x8D);
        assert_eq!(
            &buffer.as_slice()[load.disp().0 as usize..load.disp().0 as usize + 4],
            &0x40u32.to_le_bytes()
        );

        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.replace_lea_with_load(load);
        drop(patcher);
        assert_eq!(buffer.as_slice()[opcode_at], 0x8B);
    }

    #[test]
    #[should_panic(expected = "patch location outside code region")]
    fn test_out_of_region_patch_is_fatal() {
        let mut asm = Assembler::new();
        asm.ret();
        let buffer = installed(asm);
        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.repatch_i32(Imm32Patch(9999), 0);
    }

    #[test]
    #[should_panic(expected = "non-jump location")]
    fn test_retarget_non_jump_is_fatal() {
        let mut asm = Assembler::new();
        asm.nop();
        asm.nop();
        asm.nop();
        asm.nop();
        asm.nop();
        asm.ret();
        let buffer = installed(asm);
        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.retarget_jump(NearJumpPatch(1), buffer.base_addr());
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", any(unix, windows)))]
    fn test_patched_code_executes() {
        // Build: mov eax, <imm32 patchable via cmp trick? use mov_ri32>
        // Simpler: mov rax, imm64 (patchable); ret. Patch the constant
        // and observe the new return value.
        let mut asm = Assembler::new();
        let imm = asm.mov_ri64_patchable(Gpr::Rax, 111);
        asm.ret();
        let buffer = installed(asm);

        type F = unsafe extern "C" fn() -> u64;
        // SAFETY: complete zero-arg function.
        let f: F = unsafe { buffer.as_fn() };
        assert_eq!(unsafe { f() }, 111);

        let region = CodeRegion::new(buffer.base_addr(), buffer.len());
        // SAFETY: buffer outlives the patch scope.
        let patcher = unsafe { CodePatchBuffer::acquire(region) };
        patcher.repatch_ptr(imm, 222);
        drop(patcher);

        assert_eq!(unsafe { f() }, 222);
    }
}
