//! Property-access emitters.
//!
//! Both fast paths follow the same patchable skeleton:
//!
//! ```text
//! load boxed object; cell-tag guard            → slow case
//! strip tag                                    (raw pointer in rax)
//! cmp dword [obj + shape], imm32 #0            ← patchable, always misses
//! jne → slow case                              ← retargetable at stubs
//! mov r11, [obj + disp32]                      ← convertible base load
//! payload load/store through r11 + disp32      ← patchable displacement
//! rejoin:
//! ```
//!
//! The placeholder shape id 0 is never allocated, so the unspecialized
//! guard is guaranteed to miss and every first execution goes through
//! the generic helper, which resolves the access and asks the linker to
//! specialize.

use onyx_core::bytecode::Instruction;
use onyx_core::value::cell_tag_check;
use onyx_runtime::object::{OVERFLOW_DATA_OFFSET, SHAPE_ID_OFFSET};
use onyx_runtime::ShapeId;

use crate::backend::x64::{Condition, Gpr, MemOperand};
use crate::baseline::compiler::LoweringContext;
use crate::ic::access_site::{AccessKind, AccessSite};
use crate::runtime::helpers::HelperKind;

/// Guard that `rax` holds a cell and strip the tag, leaving the raw
/// pointer in `rax`.
fn emit_cell_guard_and_untag(
    lowering: &mut LoweringContext<'_>,
    slow: crate::backend::x64::Label,
) {
    let scratch = lowering.roles.scratch1;
    lowering.asm.mov_rr(scratch, Gpr::Rax);
    lowering.asm.shr_ri(scratch, 48);
    lowering.asm.cmp_r32_i32(scratch, cell_tag_check() as i32);
    lowering.asm.jcc(Condition::NotEqual, slow);
    lowering.asm.shl_ri(Gpr::Rax, 16);
    lowering.asm.shr_ri(Gpr::Rax, 16);
}

/// `GetProp dst, obj, ident`: patchable monomorphic read.
pub(crate) fn emit_get_prop(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let obj = lowering.frame.slot(instr.reg(1));
    let name = lowering.program.identifier(instr.op(2) as u32).clone();

    let slow_cell = lowering.slow_case(bc);
    let slow_miss = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &obj);
    emit_cell_guard_and_untag(lowering, slow_cell);

    let shape_guard = lowering.asm.cmp_m32_i32_patchable(
        &MemOperand::base_disp(Gpr::Rax, SHAPE_ID_OFFSET),
        ShapeId::INVALID.0 as i32,
    );
    let guard_branch = lowering.asm.jcc_patchable(Condition::NotEqual, slow_miss);

    let base = lowering
        .asm
        .load_disp32_patchable(roles.scratch2, Gpr::Rax, OVERFLOW_DATA_OFFSET);
    let payload = lowering
        .asm
        .load_disp32_patchable(Gpr::Rax, roles.scratch2, 0);
    let rejoin_offset = lowering.asm.offset();

    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);

    lowering.access_sites.push(AccessSite::new(
        AccessKind::Get,
        name,
        bc,
        shape_guard,
        guard_branch,
        base,
        payload.disp(),
        rejoin_offset,
        lowering.program.clone(),
    ));
}

/// Cold path: generic read + miss handling through the helper.
pub(crate) fn emit_get_prop_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let dst = lowering.frame.slot(instr.reg(0));
    let obj = lowering.frame.slot(instr.reg(1));
    let rejoin = lowering.next_label(bc);

    let slow_entry = lowering.asm.offset();
    let site_addr = {
        let site = site_for(lowering, bc);
        site.set_slow_entry(slow_entry);
        site as *const AccessSite as usize
    };

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &obj);
    lowering.asm.mov_ri64(cc.arg(2), site_addr as i64);
    let entry = lowering.helper_entry(HelperKind::GetPropGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

/// `SetProp obj, ident, src`: patchable monomorphic replace.
pub(crate) fn emit_set_prop(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let obj = lowering.frame.slot(instr.reg(0));
    let name = lowering.program.identifier(instr.op(1) as u32).clone();
    let value = lowering.frame.slot(instr.reg(2));

    let slow_cell = lowering.slow_case(bc);
    let slow_miss = lowering.slow_case(bc);

    lowering.asm.mov_rm(Gpr::Rax, &obj);
    emit_cell_guard_and_untag(lowering, slow_cell);
    // The value travels in scratch1 so stubs see it uniformly.
    lowering.asm.mov_rm(roles.scratch1, &value);

    let shape_guard = lowering.asm.cmp_m32_i32_patchable(
        &MemOperand::base_disp(Gpr::Rax, SHAPE_ID_OFFSET),
        ShapeId::INVALID.0 as i32,
    );
    let guard_branch = lowering.asm.jcc_patchable(Condition::NotEqual, slow_miss);

    let base = lowering
        .asm
        .load_disp32_patchable(roles.scratch2, Gpr::Rax, OVERFLOW_DATA_OFFSET);
    let payload = lowering
        .asm
        .store_disp32_patchable(roles.scratch2, 0, roles.scratch1);
    let rejoin_offset = lowering.asm.offset();

    lowering.access_sites.push(AccessSite::new(
        AccessKind::Put,
        name,
        bc,
        shape_guard,
        guard_branch,
        base,
        payload,
        rejoin_offset,
        lowering.program.clone(),
    ));
}

/// Cold path: generic write + miss handling.
pub(crate) fn emit_set_prop_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let cc = lowering.cc;
    let roles = lowering.roles;
    let obj = lowering.frame.slot(instr.reg(0));
    let value = lowering.frame.slot(instr.reg(2));
    let rejoin = lowering.next_label(bc);

    let slow_entry = lowering.asm.offset();
    let site_addr = {
        let site = site_for(lowering, bc);
        site.set_slow_entry(slow_entry);
        site as *const AccessSite as usize
    };

    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering.asm.mov_rm(cc.arg(1), &obj);
    lowering.asm.mov_rm(cc.arg(2), &value);
    lowering.asm.mov_ri64(cc.arg(3), site_addr as i64);
    let entry = lowering.helper_entry(HelperKind::SetPropGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}

/// The access site the main pass created for `bc`.
fn site_for<'l>(lowering: &'l LoweringContext<'_>, bc: u32) -> &'l AccessSite {
    lowering
        .access_sites
        .iter()
        .find(|site| site.bytecode_offset == bc)
        .expect("slow path without a matching access site")
}
