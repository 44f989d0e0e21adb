//! Indexed-access emitters.
//!
//! Unlike the property caches, element accesses are specialized at
//! compile time from the site's array profile: the lowering pass picks
//! exactly one backing representation to fast-path (the single observed
//! mode, if any) and guards on the elements-kind word; every other mode
//! bails to the generic helper. The fast path records its mode into the
//! profile with a single OR so later compilations still see the truth.

use onyx_core::bytecode::Instruction;
use onyx_core::profile::ArrayModes;
use onyx_runtime::object::{
    ElementsKind, ELEMENTS_DATA_OFFSET, ELEMENTS_KIND_OFFSET, ELEMENTS_LEN_OFFSET,
};

use crate::backend::x64::{Condition, Gpr, MemOperand, Scale, Xmm};
use crate::baseline::arith::{emit_double_box, emit_int_guard, emit_number_to_xmm};
use crate::baseline::compiler::LoweringContext;
use crate::runtime::helpers::HelperKind;

use onyx_core::value::{cell_tag_check, INT_PATTERN};

/// Map a profiled mode to the kind the guard compares and the element
/// scale, for the modes the read fast path supports.
fn read_specialization(mode: ArrayModes) -> Option<(ElementsKind, Scale)> {
    if mode == ArrayModes::INT32_DENSE {
        Some((ElementsKind::Int32Dense, Scale::X4))
    } else if mode == ArrayModes::DOUBLE_DENSE {
        Some((ElementsKind::DoubleDense, Scale::X8))
    } else if mode == ArrayModes::VALUE_DENSE {
        Some((ElementsKind::ValueDense, Scale::X8))
    } else if mode == ArrayModes::TYPED_I8 {
        Some((ElementsKind::TypedI8, Scale::X1))
    } else if mode == ArrayModes::TYPED_U8 {
        Some((ElementsKind::TypedU8, Scale::X1))
    } else if mode == ArrayModes::TYPED_I16 {
        Some((ElementsKind::TypedI16, Scale::X2))
    } else if mode == ArrayModes::TYPED_U16 {
        Some((ElementsKind::TypedU16, Scale::X2))
    } else if mode == ArrayModes::TYPED_I32 {
        Some((ElementsKind::TypedI32, Scale::X4))
    } else if mode == ArrayModes::TYPED_F64 {
        Some((ElementsKind::TypedF64, Scale::X8))
    } else {
        None
    }
}

/// Write fast paths cover only the common stores.
fn write_specialization(mode: ArrayModes) -> Option<(ElementsKind, Scale)> {
    if mode == ArrayModes::INT32_DENSE {
        Some((ElementsKind::Int32Dense, Scale::X4))
    } else if mode == ArrayModes::DOUBLE_DENSE {
        Some((ElementsKind::DoubleDense, Scale::X8))
    } else if mode == ArrayModes::VALUE_DENSE {
        Some((ElementsKind::ValueDense, Scale::X8))
    } else if mode == ArrayModes::TYPED_F64 {
        Some((ElementsKind::TypedF64, Scale::X8))
    } else {
        None
    }
}

/// Guard object cell-ness, strip the tag (pointer in `rax`), check the
/// elements kind and bounds, leaving the zero-extended index in `r11`.
fn emit_elements_guards(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    obj: &MemOperand,
    idx: &MemOperand,
    kind: ElementsKind,
    record_mode: ArrayModes,
) {
    let roles = lowering.roles;
    let slow_cell = lowering.slow_case(bc);
    let slow_index = lowering.slow_case(bc);
    let slow_kind = lowering.slow_case(bc);
    let slow_bounds = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, obj);
    lowering.asm.mov_rr(roles.scratch1, Gpr::Rax);
    lowering.asm.shr_ri(roles.scratch1, 48);
    lowering
        .asm
        .cmp_r32_i32(roles.scratch1, cell_tag_check() as i32);
    lowering.asm.jcc(Condition::NotEqual, slow_cell);
    lowering.asm.shl_ri(Gpr::Rax, 16);
    lowering.asm.shr_ri(Gpr::Rax, 16);

    lowering.asm.mov_rm(roles.scratch2, idx);
    emit_int_guard(lowering, roles.scratch2, roles.scratch1, slow_index);
    // Zero-extend the payload; a negative index becomes huge and fails
    // the unsigned bounds check below.
    lowering.asm.mov_rr32(roles.scratch2, roles.scratch2);

    lowering.asm.cmp_m32_i32(
        &MemOperand::base_disp(Gpr::Rax, ELEMENTS_KIND_OFFSET),
        kind as u32 as i32,
    );
    lowering.asm.jcc(Condition::NotEqual, slow_kind);
    lowering.asm.cmp_r32_m32(
        roles.scratch2,
        &MemOperand::base_disp(Gpr::Rax, ELEMENTS_LEN_OFFSET),
    );
    lowering.asm.jcc(Condition::AboveOrEqual, slow_bounds);

    // Fast-path profile record: one OR into the mode word.
    if lowering.ctx.options.profiling_enabled {
        if let Some(profile) = lowering.program.array_profile(bc) {
            lowering
                .asm
                .mov_ri64(roles.scratch1, profile.modes_addr() as i64);
            lowering.asm.or_m32_i32(
                &MemOperand::base_disp(roles.scratch1, 0),
                record_mode.bits() as i32,
            );
        }
    }
}

/// `GetElem dst, obj, idx`.
pub(crate) fn emit_get_elem(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let mode = lowering
        .program
        .array_profile(bc)
        .and_then(|profile| profile.mode_to_specialize());
    let Some((kind, scale)) = mode.and_then(read_specialization) else {
        // No usable specialization: everything goes generic.
        let slow = lowering.slow_case(bc);
        lowering.asm.jmp(slow);
        return;
    };

    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let obj = lowering.frame.slot(instr.reg(1));
    let idx = lowering.frame.slot(instr.reg(2));
    emit_elements_guards(lowering, bc, &obj, &idx, kind, mode.unwrap());

    lowering.asm.mov_rm(
        roles.scratch1,
        &MemOperand::base_disp(Gpr::Rax, ELEMENTS_DATA_OFFSET),
    );
    let element = MemOperand::base_index(roles.scratch1, roles.scratch2, scale, 0);

    match kind {
        ElementsKind::Int32Dense | ElementsKind::TypedI32 => {
            lowering.asm.mov_rm32(Gpr::Rax, &element);
            lowering.asm.mov_ri64(roles.scratch2, INT_PATTERN as i64);
            lowering.asm.or_rr(Gpr::Rax, roles.scratch2);
        }
        ElementsKind::TypedU8 => {
            lowering.asm.movzx_rm8(Gpr::Rax, &element);
            lowering.asm.mov_ri64(roles.scratch2, INT_PATTERN as i64);
            lowering.asm.or_rr(Gpr::Rax, roles.scratch2);
        }
        ElementsKind::TypedI8 => {
            lowering.asm.movsx_rm8(Gpr::Rax, &element);
            lowering.asm.mov_rr32(Gpr::Rax, Gpr::Rax);
            lowering.asm.mov_ri64(roles.scratch2, INT_PATTERN as i64);
            lowering.asm.or_rr(Gpr::Rax, roles.scratch2);
        }
        ElementsKind::TypedU16 => {
            lowering.asm.movzx_rm16(Gpr::Rax, &element);
            lowering.asm.mov_ri64(roles.scratch2, INT_PATTERN as i64);
            lowering.asm.or_rr(Gpr::Rax, roles.scratch2);
        }
        ElementsKind::TypedI16 => {
            lowering.asm.movsx_rm16(Gpr::Rax, &element);
            lowering.asm.mov_rr32(Gpr::Rax, Gpr::Rax);
            lowering.asm.mov_ri64(roles.scratch2, INT_PATTERN as i64);
            lowering.asm.or_rr(Gpr::Rax, roles.scratch2);
        }
        ElementsKind::DoubleDense | ElementsKind::TypedF64 => {
            lowering.asm.movsd_xm(Xmm::Xmm0, &element);
            emit_double_box(lowering);
        }
        ElementsKind::ValueDense => {
            lowering.asm.mov_rm(Gpr::Rax, &element);
        }
        other => unreachable!("unsupported read specialization: {other:?}"),
    }

    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
}

/// Cold path: generic indexed read.
pub(crate) fn emit_get_elem_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let obj = lowering.frame.slot(instr.reg(1));
    let idx = lowering.frame.slot(instr.reg(2));
    let rejoin = lowering.next_label(bc);
    let profile = lowering
        .program
        .array_profile(bc)
        .map(|profile| profile as *const _ as usize)
        .unwrap_or(0);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &obj);
    lowering.asm.mov_rm(cc.arg(2), &idx);
    lowering.asm.mov_ri64(cc.arg(3), profile as i64);
    let entry = lowering.helper_entry(HelperKind::GetElemGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

/// `SetElem obj, idx, src`.
pub(crate) fn emit_set_elem(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let mode = lowering
        .program
        .array_profile(bc)
        .and_then(|profile| profile.mode_to_specialize());
    let Some((kind, scale)) = mode.and_then(write_specialization) else {
        let slow = lowering.slow_case(bc);
        lowering.asm.jmp(slow);
        return;
    };

    let roles = lowering.roles;
    let obj = lowering.frame.slot(instr.reg(0));
    let idx = lowering.frame.slot(instr.reg(1));
    let value = lowering.frame.slot(instr.reg(2));
    emit_elements_guards(lowering, bc, &obj, &idx, kind, mode.unwrap());

    // The data pointer rides in rdx: the value conversion below owns rax
    // and both scratch registers.
    lowering.asm.mov_rm(
        Gpr::Rdx,
        &MemOperand::base_disp(Gpr::Rax, ELEMENTS_DATA_OFFSET),
    );
    let element = MemOperand::base_index(Gpr::Rdx, roles.scratch2, scale, 0);

    match kind {
        ElementsKind::Int32Dense => {
            let slow_value = lowering.slow_case(bc);
            lowering.asm.mov_rm(Gpr::Rax, &value);
            emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow_value);
            lowering.asm.mov_mr32(&element, Gpr::Rax);
        }
        ElementsKind::DoubleDense | ElementsKind::TypedF64 => {
            let slow_value = lowering.slow_case(bc);
            emit_number_to_xmm(lowering, &value, Xmm::Xmm0, slow_value);
            lowering.asm.movsd_mx(&element, Xmm::Xmm0);
        }
        ElementsKind::ValueDense => {
            lowering.asm.mov_rm(Gpr::Rax, &value);
            lowering.asm.mov_mr(&element, Gpr::Rax);
        }
        other => unreachable!("unsupported write specialization: {other:?}"),
    }
}

/// Cold path: generic indexed write; value and profile staged in the
/// frame's scratch slots.
pub(crate) fn emit_set_elem_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let obj = lowering.frame.slot(instr.reg(0));
    let idx = lowering.frame.slot(instr.reg(1));
    let value = lowering.frame.slot(instr.reg(2));
    let rejoin = lowering.next_label(bc);
    let profile = lowering
        .program
        .array_profile(bc)
        .map(|profile| profile as *const _ as usize)
        .unwrap_or(0);

    let scratch0 = lowering.frame.scratch(0);
    let scratch1 = lowering.frame.scratch(1);
    lowering.asm.mov_rm(roles.scratch1, &value);
    lowering.asm.mov_mr(&scratch0, roles.scratch1);
    lowering.asm.mov_ri64(roles.scratch1, profile as i64);
    lowering.asm.mov_mr(&scratch1, roles.scratch1);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &obj);
    lowering.asm.mov_rm(cc.arg(2), &idx);
    let scratch0_disp = lowering.frame.scratch_disp(0);
    lowering
        .asm
        .lea(cc.arg(3), &MemOperand::base_disp(Gpr::Rbp, scratch0_disp));
    let entry = lowering.helper_entry(HelperKind::SetElemGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}
