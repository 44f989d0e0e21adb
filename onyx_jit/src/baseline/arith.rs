//! Arithmetic and comparison emitters.
//!
//! The integer fast paths guard on the int32 tag and on overflow, then
//! bail to the slow-case list. Cold paths try the scalar-double path
//! first and only then call the generic helper, so a site that merely
//! mixes int32 and double never pays for a full helper call. Division is
//! special: when profiling says a site has only ever produced int32, the
//! quotient is speculatively re-converted to keep downstream
//! representations narrow.

use onyx_core::bytecode::Instruction;
use onyx_core::value::{
    cell_tag_check, int_tag_check, special_tag_check, INT_PATTERN, PAYLOAD_FALSE, QNAN_BITS,
    SPECIAL_PATTERN,
};
use onyx_core::bytecode::Opcode;

use crate::backend::x64::{Condition, Gpr, Label, MemOperand, Xmm};
use crate::baseline::compiler::LoweringContext;
use crate::runtime::helpers::HelperKind;

/// Boxed-false bit pattern; `or`-ing the comparison bit in yields
/// boxed true/false directly.
const FALSE_BITS: u64 = SPECIAL_PATTERN | PAYLOAD_FALSE;

/// Guard that `value` is a boxed int32, clobbering `scratch`.
pub(crate) fn emit_int_guard(
    lowering: &mut LoweringContext<'_>,
    value: Gpr,
    scratch: Gpr,
    slow: Label,
) {
    lowering.asm.mov_rr(scratch, value);
    lowering.asm.shr_ri(scratch, 48);
    lowering.asm.cmp_r32_i32(scratch, int_tag_check() as i32);
    lowering.asm.jcc(Condition::NotEqual, slow);
}

/// Box the int32 payload in `payload32` (upper bits already zero) into
/// `rax`.
fn emit_int_box(lowering: &mut LoweringContext<'_>, payload32: Gpr) {
    lowering.asm.mov_ri64(Gpr::Rax, INT_PATTERN as i64);
    lowering.asm.or_rr(Gpr::Rax, payload32);
}

/// Convert the number in `slot` into `xmm`, branching to `not_number`
/// for anything else. Clobbers `rax` and `scratch1`.
pub(crate) fn emit_number_to_xmm(
    lowering: &mut LoweringContext<'_>,
    slot: &MemOperand,
    xmm: Xmm,
    not_number: Label,
) {
    let scratch = lowering.roles.scratch1;
    let int_case = lowering.asm.create_label();
    let done = lowering.asm.create_label();

    lowering.asm.mov_rm(Gpr::Rax, slot);
    lowering.asm.mov_rr(scratch, Gpr::Rax);
    lowering.asm.shr_ri(scratch, 48);
    lowering.asm.cmp_r32_i32(scratch, int_tag_check() as i32);
    lowering.asm.jcc(Condition::Equal, int_case);
    lowering.asm.cmp_r32_i32(scratch, special_tag_check() as i32);
    lowering.asm.jcc(Condition::Equal, not_number);
    lowering.asm.cmp_r32_i32(scratch, cell_tag_check() as i32);
    lowering.asm.jcc(Condition::Equal, not_number);
    lowering.asm.movq_xr(xmm, Gpr::Rax);
    lowering.asm.jmp(done);

    lowering.asm.bind(int_case);
    lowering.asm.movsxd_rr(Gpr::Rax, Gpr::Rax);
    lowering.asm.cvtsi2sd(xmm, Gpr::Rax);
    lowering.asm.bind(done);
}

/// Box the double in `xmm0` into `rax`, canonicalizing NaN so the result
/// can never alias a tagged value.
pub(crate) fn emit_double_box(lowering: &mut LoweringContext<'_>) {
    let ok = lowering.asm.create_label();
    lowering.asm.movq_rx(Gpr::Rax, Xmm::Xmm0);
    lowering.asm.ucomisd(Xmm::Xmm0, Xmm::Xmm0);
    lowering.asm.jcc(Condition::NoParity, ok);
    lowering.asm.mov_ri64(Gpr::Rax, QNAN_BITS as i64);
    lowering.asm.bind(ok);
}

/// Call setup shared by the generic arithmetic paths:
/// `(vm, lhs, rhs, profile)`.
fn emit_generic_binary_call(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    instr: &Instruction,
    kind: HelperKind,
    with_profile: bool,
) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));
    let profile = if with_profile {
        lowering
            .program
            .value_profile(bc)
            .map(|profile| profile as *const _ as usize)
            .unwrap_or(0)
    } else {
        0
    };

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &lhs);
    lowering.asm.mov_rm(cc.arg(2), &rhs);
    lowering.asm.mov_ri64(cc.arg(3), profile as i64);
    let entry = lowering.helper_entry(kind);
    lowering.asm.call_abs(roles.scratch1, entry);
}

// =============================================================================
// Add / Sub / Mul
// =============================================================================

/// Integer fast path with tag and overflow guards.
pub(crate) fn emit_int_binary(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));
    let dst = lowering.frame.slot(instr.reg(0));

    let slow_lhs = lowering.slow_case(bc);
    let slow_rhs = lowering.slow_case(bc);
    let slow_overflow = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &lhs);
    emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow_lhs);
    lowering.asm.mov_rm(roles.scratch2, &rhs);
    emit_int_guard(lowering, roles.scratch2, roles.scratch1, slow_rhs);

    lowering.asm.mov_rr32(roles.scratch1, Gpr::Rax);
    match instr.opcode {
        Opcode::Add => lowering.asm.add_rr32(roles.scratch1, roles.scratch2),
        Opcode::Sub => lowering.asm.sub_rr32(roles.scratch1, roles.scratch2),
        Opcode::Mul => lowering.asm.imul_rr32(roles.scratch1, roles.scratch2),
        other => unreachable!("not an int binary opcode: {other:?}"),
    }
    lowering.asm.jcc(Condition::Overflow, slow_overflow);

    if instr.opcode == Opcode::Mul {
        // A zero product from a negative operand is -0, which int32
        // cannot represent.
        let nonzero = lowering.asm.create_label();
        lowering.asm.test_rr(roles.scratch1, roles.scratch1);
        lowering.asm.jcc(Condition::NotEqual, nonzero);
        let slow_negative_zero = lowering.slow_case(bc);
        lowering.asm.or_rr32(Gpr::Rax, roles.scratch2);
        lowering.asm.jcc(Condition::Sign, slow_negative_zero);
        lowering.asm.bind(nonzero);
    }

    emit_int_box(lowering, roles.scratch1);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
}

/// Cold path: double fast path first, generic helper second.
pub(crate) fn emit_int_binary_slow(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    instr: &Instruction,
) {
    let dst = lowering.frame.slot(instr.reg(0));
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));
    let generic = lowering.asm.create_label();
    let rejoin = lowering.next_label(bc);

    emit_number_to_xmm(lowering, &lhs, Xmm::Xmm0, generic);
    emit_number_to_xmm(lowering, &rhs, Xmm::Xmm1, generic);
    match instr.opcode {
        Opcode::Add => lowering.asm.addsd(Xmm::Xmm0, Xmm::Xmm1),
        Opcode::Sub => lowering.asm.subsd(Xmm::Xmm0, Xmm::Xmm1),
        Opcode::Mul => lowering.asm.mulsd(Xmm::Xmm0, Xmm::Xmm1),
        other => unreachable!("not an int binary opcode: {other:?}"),
    }
    emit_double_box(lowering);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
    lowering.asm.jmp(rejoin);

    lowering.asm.bind(generic);
    let kind = match instr.opcode {
        Opcode::Add => HelperKind::AddGeneric,
        Opcode::Sub => HelperKind::SubGeneric,
        Opcode::Mul => HelperKind::MulGeneric,
        other => unreachable!("not an int binary opcode: {other:?}"),
    };
    emit_generic_binary_call(lowering, bc, instr, kind, true);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Div
// =============================================================================

/// Double division over any numeric operands, with speculative int32
/// re-conversion when the site's profile has only ever produced int32.
pub(crate) fn emit_div(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));
    let slow = lowering.slow_case(bc);

    emit_number_to_xmm(lowering, &lhs, Xmm::Xmm0, slow);
    emit_number_to_xmm(lowering, &rhs, Xmm::Xmm1, slow);
    lowering.asm.divsd(Xmm::Xmm0, Xmm::Xmm1);

    let speculate_int = lowering
        .program
        .value_profile(bc)
        .map(|profile| profile.observed().is_only_int32())
        .unwrap_or(false);

    let store = lowering.asm.create_label();
    if speculate_int {
        let as_double = lowering.asm.create_label();
        let box_int = lowering.asm.create_label();

        // Exact round-trip proves the quotient is integral.
        lowering.asm.cvttsd2si(roles.scratch1, Xmm::Xmm0);
        lowering.asm.cvtsi2sd(Xmm::Xmm1, roles.scratch1);
        lowering.asm.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
        lowering.asm.jcc(Condition::Parity, as_double);
        lowering.asm.jcc(Condition::NotEqual, as_double);

        // Within int32 range?
        lowering.asm.movsxd_rr(roles.scratch2, roles.scratch1);
        lowering.asm.cmp_rr(roles.scratch2, roles.scratch1);
        lowering.asm.jcc(Condition::NotEqual, as_double);

        // A zero quotient might be -0.
        lowering.asm.test_rr(roles.scratch1, roles.scratch1);
        lowering.asm.jcc(Condition::NotEqual, box_int);
        lowering.asm.movq_rx(roles.scratch2, Xmm::Xmm0);
        lowering.asm.test_rr(roles.scratch2, roles.scratch2);
        lowering.asm.jcc(Condition::NotEqual, as_double);

        lowering.asm.bind(box_int);
        lowering.asm.mov_rr32(roles.scratch1, roles.scratch1);
        emit_int_box(lowering, roles.scratch1);
        lowering.asm.jmp(store);

        lowering.asm.bind(as_double);
    }
    emit_double_box(lowering);
    lowering.asm.bind(store);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
}

/// Cold path: generic helper only (operands were not numbers).
pub(crate) fn emit_div_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let dst = lowering.frame.slot(instr.reg(0));
    let rejoin = lowering.next_label(bc);
    emit_generic_binary_call(lowering, bc, instr, HelperKind::DivGeneric, true);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Mod
// =============================================================================

/// Integer remainder fast path: non-negative dividend, nonzero divisor.
pub(crate) fn emit_mod(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));

    let slow_lhs = lowering.slow_case(bc);
    let slow_rhs = lowering.slow_case(bc);
    let slow_zero_divisor = lowering.slow_case(bc);
    let slow_negative = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &lhs);
    emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow_lhs);
    lowering.asm.mov_rm(roles.scratch2, &rhs);
    emit_int_guard(lowering, roles.scratch2, roles.scratch1, slow_rhs);

    lowering.asm.movsxd_rr(Gpr::Rax, Gpr::Rax);
    lowering.asm.movsxd_rr(roles.scratch2, roles.scratch2);
    lowering.asm.test_rr(roles.scratch2, roles.scratch2);
    lowering.asm.jcc(Condition::Equal, slow_zero_divisor);
    // A negative dividend can produce -0; leave it to the helper.
    lowering.asm.test_rr(Gpr::Rax, Gpr::Rax);
    lowering.asm.jcc(Condition::Sign, slow_negative);

    lowering.asm.cqo();
    lowering.asm.idiv(roles.scratch2);
    lowering.asm.mov_rr32(roles.scratch1, Gpr::Rdx);
    emit_int_box(lowering, roles.scratch1);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
}

pub(crate) fn emit_mod_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let dst = lowering.frame.slot(instr.reg(0));
    let rejoin = lowering.next_label(bc);
    emit_generic_binary_call(lowering, bc, instr, HelperKind::ModGeneric, true);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Neg
// =============================================================================

pub(crate) fn emit_neg(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let src = lowering.frame.slot(instr.reg(1));

    let slow_tag = lowering.slow_case(bc);
    let slow_zero = lowering.slow_case(bc);
    let slow_overflow = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &src);
    emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow_tag);
    lowering.asm.mov_rr32(roles.scratch1, Gpr::Rax);
    // -0 and -INT_MIN both leave int32.
    lowering.asm.test_rr(roles.scratch1, roles.scratch1);
    lowering.asm.jcc(Condition::Equal, slow_zero);
    lowering.asm.neg32(roles.scratch1);
    lowering.asm.jcc(Condition::Overflow, slow_overflow);

    emit_int_box(lowering, roles.scratch1);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
}

pub(crate) fn emit_neg_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let src = lowering.frame.slot(instr.reg(1));
    let rejoin = lowering.next_label(bc);
    let profile = lowering
        .program
        .value_profile(bc)
        .map(|profile| profile as *const _ as usize)
        .unwrap_or(0);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &src);
    lowering.asm.mov_ri64(cc.arg(2), profile as i64);
    let entry = lowering.helper_entry(HelperKind::NegGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Comparisons
// =============================================================================

pub(crate) fn emit_compare(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let lhs = lowering.frame.slot(instr.reg(1));
    let rhs = lowering.frame.slot(instr.reg(2));

    let slow_lhs = lowering.slow_case(bc);
    let slow_rhs = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &lhs);
    emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow_lhs);
    lowering.asm.mov_rm(roles.scratch2, &rhs);
    emit_int_guard(lowering, roles.scratch2, roles.scratch1, slow_rhs);

    let condition = match instr.opcode {
        Opcode::Eq => Condition::Equal,
        Opcode::Less => Condition::Less,
        Opcode::LessEq => Condition::LessOrEqual,
        other => unreachable!("not a comparison opcode: {other:?}"),
    };
    lowering.asm.cmp_rr32(Gpr::Rax, roles.scratch2);
    lowering.asm.setcc(condition, roles.scratch1);
    lowering.asm.movzx_rb(roles.scratch1, roles.scratch1);
    lowering.asm.mov_ri64(Gpr::Rax, FALSE_BITS as i64);
    lowering.asm.or_rr(Gpr::Rax, roles.scratch1);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
}

pub(crate) fn emit_compare_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let dst = lowering.frame.slot(instr.reg(0));
    let rejoin = lowering.next_label(bc);
    let kind = match instr.opcode {
        Opcode::Eq => HelperKind::EqGeneric,
        Opcode::Less => HelperKind::LessGeneric,
        Opcode::LessEq => HelperKind::LessEqGeneric,
        other => unreachable!("not a comparison opcode: {other:?}"),
    };
    emit_generic_binary_call(lowering, bc, instr, kind, false);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    if instr.opcode != Opcode::Eq {
        // Ordering comparisons throw on non-numbers.
        lowering.emit_exception_check(bc);
    }
    lowering.asm.jmp(rejoin);
}
