//! Generated stub routines.
//!
//! A stub is a small, independently allocated block of executable code
//! compiled for one specialized case of an inline cache: a direct slot
//! load, a prototype-chain walk, a replace-store, or the dispatcher over
//! a polymorphic entry list. Stubs are reference-counted; an installed
//! code object that branches into a stub holds an `Arc` to it, so a stub
//! is never freed while reachable and never mutated after installation.
//!
//! # Register protocol
//!
//! A stub is entered from the retargeted guard branch of its site's fast
//! path, with:
//! - the receiver's raw pointer in the accumulator (`rax`)
//! - for stores, the value to write in `r10`
//! - `r11` (and for loads `r10`) free as scratch
//!
//! Loads deliver their result in `rax` and jump to the site's rejoin
//! point; a stub that fails all its guards jumps to the site's slow-path
//! entry, which reloads operands from the frame.

use std::sync::Arc;

use onyx_runtime::object::{
    INLINE_SLOTS, INLINE_SLOTS_OFFSET, OVERFLOW_DATA_OFFSET, SHAPE_ID_OFFSET,
};
use onyx_runtime::ShapeId;
use smallvec::SmallVec;

use crate::backend::x64::{Assembler, ExecutableBuffer, Gpr, MemOperand, ScratchRoles};
use crate::baseline::compiler::CompileError;

// =============================================================================
// StubRoutine
// =============================================================================

/// A reference-counted block of installed stub code.
pub struct StubRoutine {
    buffer: ExecutableBuffer,
    /// The shapes this stub has specialized paths for.
    shapes: SmallVec<[ShapeId; 4]>,
}

impl StubRoutine {
    /// Finalize assembled stub code into an executable routine.
    pub fn install(
        asm: Assembler,
        shapes: SmallVec<[ShapeId; 4]>,
    ) -> Result<Arc<StubRoutine>, CompileError> {
        let code = asm.finalize();
        let mut buffer =
            ExecutableBuffer::from_code(&code).ok_or(CompileError::OutOfExecutableMemory)?;
        assert!(buffer.make_executable(), "failed to finalize stub pages");
        Ok(Arc::new(StubRoutine { buffer, shapes }))
    }

    /// Entry address of the stub.
    #[inline]
    pub fn entry(&self) -> usize {
        self.buffer.base_addr()
    }

    /// Shapes this stub handles.
    #[inline]
    pub fn shapes(&self) -> &[ShapeId] {
        &self.shapes
    }

    /// Code size, for stats.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for StubRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubRoutine")
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("shapes", &self.shapes.len())
            .finish()
    }
}

// =============================================================================
// Access variants
// =============================================================================

/// One specialized case a property stub can handle.
#[derive(Debug, Clone)]
pub enum AccessVariant {
    /// Property on the receiver itself at a known slot.
    SelfSlot { slot: u16 },
    /// Property on a prototype-chain holder. Every link is re-verified
    /// by an inline shape check; the chain runs receiver-exclusive from
    /// the first prototype down to the holder (last entry).
    ProtoSlot {
        slot: u16,
        chain: SmallVec<[(usize, ShapeId); 4]>,
    },
    /// Overwrite an existing own property at a known slot.
    ReplaceSlot { slot: u16 },
}

/// A (shape, variant) pair in a dispatcher stub.
#[derive(Debug, Clone)]
pub struct PolyEntry {
    pub shape: ShapeId,
    pub variant: AccessVariant,
}

// =============================================================================
// Stub compilation
// =============================================================================

/// Emit the slot read for a holder whose raw pointer is in `holder`,
/// leaving the value in `rax`. Clobbers `scratch`.
fn emit_slot_load(asm: &mut Assembler, holder: Gpr, slot: u16, scratch: Gpr) {
    if (slot as usize) < INLINE_SLOTS {
        let disp = INLINE_SLOTS_OFFSET + 8 * slot as i32;
        asm.mov_rm(Gpr::Rax, &MemOperand::base_disp(holder, disp));
    } else {
        let disp = 8 * (slot as i32 - INLINE_SLOTS as i32);
        asm.mov_rm(scratch, &MemOperand::base_disp(holder, OVERFLOW_DATA_OFFSET));
        asm.mov_rm(Gpr::Rax, &MemOperand::base_disp(scratch, disp));
    }
}

/// Emit the slot write of `value` into the receiver in `rax`.
fn emit_slot_store(asm: &mut Assembler, slot: u16, value: Gpr, scratch: Gpr) {
    if (slot as usize) < INLINE_SLOTS {
        let disp = INLINE_SLOTS_OFFSET + 8 * slot as i32;
        asm.mov_mr(&MemOperand::base_disp(Gpr::Rax, disp), value);
    } else {
        let disp = 8 * (slot as i32 - INLINE_SLOTS as i32);
        asm.mov_rm(scratch, &MemOperand::base_disp(Gpr::Rax, OVERFLOW_DATA_OFFSET));
        asm.mov_mr(&MemOperand::base_disp(scratch, disp), value);
    }
}

/// Compile a property-access dispatcher stub over `entries`, checked in
/// order (callers list most-recently-added first). Control leaves either
/// through `rejoin` (hit, result in `rax` for loads) or `slow_entry`
/// (every guard missed).
pub fn compile_access_stub(
    entries: &[PolyEntry],
    is_load: bool,
    slow_entry: usize,
    rejoin: usize,
) -> Result<Arc<StubRoutine>, CompileError> {
    let roles = ScratchRoles::host();
    let mut asm = Assembler::new();
    let mut shapes: SmallVec<[ShapeId; 4]> = SmallVec::new();

    for entry in entries {
        shapes.push(entry.shape);
        let next = asm.create_label();

        // Receiver shape guard.
        asm.cmp_m32_i32(
            &MemOperand::base_disp(Gpr::Rax, SHAPE_ID_OFFSET),
            entry.shape.0 as i32,
        );
        asm.jcc(crate::backend::x64::Condition::NotEqual, next);

        match &entry.variant {
            AccessVariant::SelfSlot { slot } => {
                assert!(is_load, "SelfSlot is a load variant");
                emit_slot_load(&mut asm, Gpr::Rax, *slot, roles.scratch2);
            }
            AccessVariant::ProtoSlot { slot, chain } => {
                assert!(is_load, "ProtoSlot is a load variant");
                assert!(!chain.is_empty(), "prototype chain cannot be empty");
                // Re-verify every link before trusting the holder.
                for (link_ptr, link_shape) in chain {
                    asm.mov_ri64(roles.scratch2, *link_ptr as i64);
                    asm.cmp_m32_i32(
                        &MemOperand::base_disp(roles.scratch2, SHAPE_ID_OFFSET),
                        link_shape.0 as i32,
                    );
                    asm.jcc(crate::backend::x64::Condition::NotEqual, next);
                }
                // scratch2 now holds the holder.
                emit_slot_load(&mut asm, roles.scratch2, *slot, roles.scratch1);
            }
            AccessVariant::ReplaceSlot { slot } => {
                assert!(!is_load, "ReplaceSlot is a store variant");
                emit_slot_store(&mut asm, *slot, roles.scratch1, roles.scratch2);
            }
        }

        asm.jmp_abs(roles.scratch2, rejoin);
        asm.bind(next);
    }

    // All guards missed: fall through to the generic slow path.
    asm.jmp_abs(roles.scratch2, slow_entry);

    StubRoutine::install(asm, shapes)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_records_shapes_in_order() {
        let entries = [
            PolyEntry {
                shape: ShapeId(9),
                variant: AccessVariant::SelfSlot { slot: 0 },
            },
            PolyEntry {
                shape: ShapeId(4),
                variant: AccessVariant::SelfSlot { slot: 1 },
            },
        ];
        let stub = compile_access_stub(&entries, true, 0x1000, 0x2000).expect("stub");
        assert_eq!(stub.shapes(), &[ShapeId(9), ShapeId(4)]);
        assert!(stub.code_size() > 0);
        assert_ne!(stub.entry(), 0);
    }

    #[test]
    fn test_out_of_line_slot_uses_two_loads() {
        let inline = [PolyEntry {
            shape: ShapeId(1),
            variant: AccessVariant::SelfSlot { slot: 0 },
        }];
        let spilled = [PolyEntry {
            shape: ShapeId(1),
            variant: AccessVariant::SelfSlot {
                slot: INLINE_SLOTS as u16,
            },
        }];
        let a = compile_access_stub(&inline, true, 0x1000, 0x2000).expect("stub");
        let b = compile_access_stub(&spilled, true, 0x1000, 0x2000).expect("stub");
        // The spilled variant has the extra overflow-pointer load.
        assert!(b.code_size() > a.code_size());
    }

    #[test]
    fn test_proto_chain_checks_every_link() {
        let one_link = [PolyEntry {
            shape: ShapeId(1),
            variant: AccessVariant::ProtoSlot {
                slot: 0,
                chain: smallvec::smallvec![(0x4000usize, ShapeId(2))],
            },
        }];
        let two_links = [PolyEntry {
            shape: ShapeId(1),
            variant: AccessVariant::ProtoSlot {
                slot: 0,
                chain: smallvec::smallvec![(0x4000usize, ShapeId(2)), (0x5000usize, ShapeId(3))],
            },
        }];
        let a = compile_access_stub(&one_link, true, 0x1000, 0x2000).expect("stub");
        let b = compile_access_stub(&two_links, true, 0x1000, 0x2000).expect("stub");
        assert!(b.code_size() > a.code_size());
    }
}
