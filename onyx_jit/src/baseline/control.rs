//! Branch, boolean, and switch emitters.
//!
//! Conditional branches fast-path exactly the two boolean encodings and
//! leave every other truthiness question to the helper. Dense switches
//! compile to a bounds check plus an indirect jump through a native
//! address table that the link/install steps fill in; sparse (string)
//! switches always dispatch through the generic helper, which returns
//! the native destination to jump to.

use onyx_core::bytecode::{Instruction, Opcode, SwitchTable};
use onyx_core::value::{PAYLOAD_FALSE, PAYLOAD_TRUE, SPECIAL_PATTERN};

use crate::backend::x64::{Condition, Gpr, MemOperand, Scale};
use crate::baseline::compiler::{DenseJumpTable, LoweringContext, SwitchSite};
use crate::runtime::helpers::HelperKind;

const TRUE_BITS: u64 = SPECIAL_PATTERN | PAYLOAD_TRUE;
const FALSE_BITS: u64 = SPECIAL_PATTERN | PAYLOAD_FALSE;

// =============================================================================
// Not
// =============================================================================

/// Boolean fast path: xor against the false pattern maps false/true to
/// 0/1, anything else to a large value.
pub(crate) fn emit_not(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let src = lowering.frame.slot(instr.reg(1));
    let slow = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &src);
    lowering.asm.mov_ri64(roles.scratch1, FALSE_BITS as i64);
    lowering.asm.xor_rr(Gpr::Rax, roles.scratch1);
    lowering.asm.cmp_ri(Gpr::Rax, 1);
    lowering.asm.jcc(Condition::Above, slow);
    lowering.asm.xor_ri(Gpr::Rax, 1);
    lowering.asm.or_rr(Gpr::Rax, roles.scratch1);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
}

pub(crate) fn emit_not_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let src = lowering.frame.slot(instr.reg(1));
    let rejoin = lowering.next_label(bc);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &src);
    let entry = lowering.helper_entry(HelperKind::NotGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Conditional jumps
// =============================================================================

pub(crate) fn emit_conditional_jump(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    instr: &Instruction,
) {
    let roles = lowering.roles;
    let cond = lowering.frame.slot(instr.reg(0));
    let taken = lowering.labels[instr.op(1) as usize];
    let slow = lowering.slow_case(bc);

    let (first, second) = match instr.opcode {
        Opcode::JumpIfTrue => (TRUE_BITS, FALSE_BITS),
        Opcode::JumpIfFalse => (FALSE_BITS, TRUE_BITS),
        other => unreachable!("not a conditional jump: {other:?}"),
    };

    lowering.asm.mov_rm(Gpr::Rax, &cond);
    lowering.asm.mov_ri64(roles.scratch1, first as i64);
    lowering.asm.cmp_rr(Gpr::Rax, roles.scratch1);
    lowering.asm.jcc(Condition::Equal, taken);
    lowering.asm.mov_ri64(roles.scratch1, second as i64);
    lowering.asm.cmp_rr(Gpr::Rax, roles.scratch1);
    lowering.asm.jcc(Condition::NotEqual, slow);
    // Fall through: the other boolean.
}

pub(crate) fn emit_conditional_jump_slow(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    instr: &Instruction,
) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let cond = lowering.frame.slot(instr.reg(0));
    let taken = lowering.labels[instr.op(1) as usize];
    let rejoin = lowering.next_label(bc);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &cond);
    let entry = lowering.helper_entry(HelperKind::ToBoolean);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.test_rr(Gpr::Rax, Gpr::Rax);
    let branch_taken = match instr.opcode {
        Opcode::JumpIfTrue => Condition::NotEqual,
        Opcode::JumpIfFalse => Condition::Equal,
        other => unreachable!("not a conditional jump: {other:?}"),
    };
    lowering.asm.jcc(branch_taken, taken);
    lowering.asm.jmp(rejoin);
}

// =============================================================================
// Dense switches
// =============================================================================

fn dense_parts(table: &SwitchTable, opcode: Opcode) -> (i64, Vec<u32>, u32) {
    match (opcode, table) {
        (
            Opcode::SwitchImm,
            SwitchTable::DenseImm {
                min,
                targets,
                default,
            },
        ) => (*min as i64, targets.clone(), *default),
        (
            Opcode::SwitchChar,
            SwitchTable::DenseChar {
                min,
                targets,
                default,
            },
        ) => (*min as i64, targets.clone(), *default),
        _ => unreachable!("switch opcode/table kind mismatch"),
    }
}

/// Dense jump table over `min..min+len`, with out-of-range keys going to
/// the default label.
pub(crate) fn emit_dense_switch(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let scrutinee = lowering.frame.slot(instr.reg(0));
    let table = lowering.program.switch_table(instr.op(1) as u32);
    let (min, targets, default_bc) = dense_parts(table, instr.opcode);
    let default_label = lowering.labels[default_bc as usize];
    let slow = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &scrutinee);
    crate::baseline::arith::emit_int_guard(lowering, Gpr::Rax, roles.scratch1, slow);
    lowering.asm.movsxd_rr(roles.scratch1, Gpr::Rax);
    lowering
        .asm
        .sub_ri(roles.scratch1, i32::try_from(min).expect("dense switch base"));
    lowering
        .asm
        .cmp_ri(roles.scratch1, targets.len() as i32);
    lowering.asm.jcc(Condition::AboveOrEqual, default_label);

    let data: Box<[std::sync::atomic::AtomicUsize]> = (0..targets.len())
        .map(|_| std::sync::atomic::AtomicUsize::new(0))
        .collect();
    let table_addr = data.as_ptr() as usize;
    lowering.jump_tables.push(DenseJumpTable {
        data,
        targets: targets.clone(),
    });

    lowering.asm.mov_ri64(roles.scratch2, table_addr as i64);
    lowering.asm.jmp_m(&MemOperand::base_index(
        roles.scratch2,
        roles.scratch1,
        Scale::X8,
        0,
    ));

    // Cold dispatch for non-int32 scrutinees wants the sparse site too.
    let pairs = targets
        .iter()
        .enumerate()
        .map(|(offset, &target)| (min + offset as i64, target))
        .collect();
    lowering
        .switch_sites
        .push(SwitchSite::new_with_offset(bc, pairs, default_bc));
}

/// Cold path: the helper resolves doubles and anything else to a native
/// destination.
pub(crate) fn emit_dense_switch_slow(
    lowering: &mut LoweringContext<'_>,
    bc: u32,
    instr: &Instruction,
) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let scrutinee = lowering.frame.slot(instr.reg(0));
    let site_addr = lowering
        .switch_sites
        .iter()
        .find(|site| site.bytecode_offset() == bc)
        .map(|site| &**site as *const SwitchSite as usize)
        .expect("slow path without a matching switch site");

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &scrutinee);
    lowering.asm.mov_ri64(cc.arg(2), site_addr as i64);
    let entry = lowering.helper_entry(HelperKind::SwitchGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.jmp_r(Gpr::Rax);
}

// =============================================================================
// String switches
// =============================================================================

/// Sparse switch: always helper-dispatched, no fast path.
pub(crate) fn emit_string_switch(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let scrutinee = lowering.frame.slot(instr.reg(0));
    let table = lowering.program.switch_table(instr.op(1) as u32);
    let SwitchTable::String { cases, default } = table else {
        unreachable!("switch opcode/table kind mismatch");
    };
    let pairs = cases
        .iter()
        .map(|(&key, &target)| (key as i64, target))
        .collect();
    let site = SwitchSite::new_with_offset(bc, pairs, *default);
    let site_addr = &*site as *const SwitchSite as usize;
    lowering.switch_sites.push(site);

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &scrutinee);
    lowering.asm.mov_ri64(cc.arg(2), site_addr as i64);
    let entry = lowering.helper_entry(HelperKind::SwitchGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.jmp_r(Gpr::Rax);
}
