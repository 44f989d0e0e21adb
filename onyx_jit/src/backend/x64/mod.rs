//! x64 backend: registers, encoding, assembly, executable memory.

pub mod assembler;
pub mod encoder;
pub mod memory;
pub mod registers;

pub use assembler::{
    Assembler, Disp32Patch, Imm32Patch, Imm64Patch, Label, LoadPatch, NearCallPatch,
    NearJumpPatch,
};
pub use memory::{ExecutableBuffer, PAGE_SIZE};
pub use registers::{
    CallingConvention, Condition, Gpr, GprSet, MemOperand, Scale, ScratchRoles, Xmm,
};
