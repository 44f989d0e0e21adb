//! Call-site emitters.
//!
//! The bytecode convention keeps the callee in the register immediately
//! before its arguments, so `&frame[callee]` is a ready-made call frame:
//! `[callee, arg0, arg1, ...]`. Every callable target (linked entries,
//! closure stubs, the virtual trampoline, the generic helper)
//! receives the same `(vm, call_frame, argc, site)` quadruple, which is
//! what lets escalation swap targets without re-shuffling arguments.

use onyx_core::bytecode::Instruction;
use onyx_core::value::cell_tag_check;

use crate::backend::x64::{Condition, Gpr, MemOperand};
use crate::baseline::compiler::LoweringContext;
use crate::ic::call_link::CallSite;
use crate::runtime::helpers::HelperKind;

/// `Call dst, callee, first_arg, argc`.
pub(crate) fn emit_call(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let cc = lowering.cc;
    let dst = lowering.frame.slot(instr.reg(0));
    let callee_reg = instr.reg(1);
    let first_arg = instr.reg(2);
    let argc = instr.op(3) as u32;
    // The frame-contiguity invariant the emitter depends on.
    assert_eq!(
        first_arg,
        callee_reg + 1,
        "call arguments must follow the callee in the frame"
    );
    assert!(
        first_arg as u32 + argc <= lowering.frame.register_count() as u32,
        "call arguments exceed the register file"
    );

    let slow_cell = lowering.slow_case(bc);
    let slow_unlinked = lowering.slow_case(bc);

    // Arguments for whatever target ends up being called. The site
    // pointer must be staged before the guard branch: stubs entered
    // through it forward all four arguments to the virtual dispatch.
    let callee_slot_disp = lowering.frame.slot_disp(callee_reg);
    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering
        .asm
        .lea(cc.arg(1), &MemOperand::base_disp(Gpr::Rbp, callee_slot_disp));
    lowering.asm.mov_ri32(cc.arg(2), argc);
    let site_placeholder = lowering.asm.mov_ri64_patchable(cc.arg(3), 0);

    // Callee cell guard.
    lowering
        .asm
        .mov_rm(Gpr::Rax, &lowering.frame.slot(callee_reg));
    lowering.asm.mov_rr(roles.scratch1, Gpr::Rax);
    lowering.asm.shr_ri(roles.scratch1, 48);
    lowering
        .asm
        .cmp_r32_i32(roles.scratch1, cell_tag_check() as i32);
    lowering.asm.jcc(Condition::NotEqual, slow_cell);
    lowering.asm.shl_ri(Gpr::Rax, 16);
    lowering.asm.shr_ri(Gpr::Rax, 16);

    // Identity compare against a placeholder that never matches. The
    // direct call starts out aimed at the cold path and is retargeted
    // when linked.
    let identity = lowering.asm.mov_ri64_patchable(roles.scratch1, 0);
    lowering.asm.cmp_rr(Gpr::Rax, roles.scratch1);
    let link_branch = lowering.asm.jcc_patchable(Condition::NotEqual, slow_unlinked);
    let call = lowering.asm.call_label_patchable(slow_unlinked);
    let rejoin_offset = lowering.asm.offset();

    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_profile_store(bc, Gpr::Rax);
    lowering.emit_exception_check(bc);

    let site = CallSite::new(bc, identity, link_branch, call, rejoin_offset);
    // The site's own address is an immediate in the code; install-time
    // patching is too late because the cold path also needs it, so the
    // boxed descriptor address is patched into the stream right here.
    lowering.site_fixups.push((site_placeholder, &*site as *const CallSite as usize));
    lowering.call_sites.push(site);
}

/// Cold path: the generic call helper links the site and dispatches.
pub(crate) fn emit_call_slow(lowering: &mut LoweringContext<'_>, bc: u32, instr: &Instruction) {
    let roles = lowering.roles;
    let cc = lowering.cc;
    let dst = lowering.frame.slot(instr.reg(0));
    let callee_reg = instr.reg(1);
    let argc = instr.op(3) as u32;
    let rejoin = lowering.next_label(bc);

    let slow_entry = lowering.asm.offset();
    let site_addr = {
        let site = lowering
            .call_sites
            .iter()
            .find(|site| site.bytecode_offset == bc)
            .expect("slow path without a matching call site");
        site.set_slow_entry(slow_entry);
        &**site as *const CallSite as usize
    };

    let callee_slot_disp = lowering.frame.slot_disp(callee_reg);
    lowering.asm.mov_rr(cc.arg(0), roles.context);
    lowering
        .asm
        .lea(cc.arg(1), &MemOperand::base_disp(Gpr::Rbp, callee_slot_disp));
    lowering.asm.mov_ri32(cc.arg(2), argc);
    lowering.asm.mov_ri64(cc.arg(3), site_addr as i64);
    let entry = lowering.helper_entry(HelperKind::CallGeneric);
    lowering.asm.call_abs(roles.scratch1, entry);
    lowering.asm.mov_mr(&dst, Gpr::Rax);
    lowering.emit_exception_check(bc);
    lowering.asm.jmp(rejoin);
}
