//! Generic operation helpers.
//!
//! The fixed table of non-specializing functions the slow paths call by
//! address: one per opcode family, correct for any representation, never
//! fast. The property and call helpers double as inline-cache miss entry
//! points: they perform the generic operation, record profiles, and
//! then ask the linker to specialize the site.
//!
//! Dynamic-language failures are signalled by storing a thrown value in
//! the `VmContext` exception slot; emitted code checks it after every
//! helper call and unwinds through the epilogue with the bytecode offset
//! recorded. Error objects are not modeled in this engine, so thrown
//! values are the undefined sentinel.

use onyx_core::profile::{ArrayProfile, ValueProfile};
use onyx_core::Value;
use onyx_runtime::function::Callee;
use onyx_runtime::object::{cell_kind, HeapObject, CELL_KIND_CALLEE, CELL_KIND_OBJECT};

use crate::baseline::compiler::SwitchSite;
use crate::ic::access_site::AccessSite;
use crate::ic::call_link::{self, CallSite};
use crate::ic::linker;
use crate::runtime::context::VmContext;

/// The baseline calling convention every compiled entry point follows:
/// `(vm, call_frame, argc, site)` where `call_frame[0]` is the boxed
/// callee and `call_frame[1..]` the arguments.
pub type EntryFn = unsafe extern "C" fn(*mut VmContext, *mut u64, u32, usize) -> u64;

// =============================================================================
// Helper table
// =============================================================================

/// One entry per opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HelperKind {
    AddGeneric = 0,
    SubGeneric,
    MulGeneric,
    DivGeneric,
    ModGeneric,
    NegGeneric,
    EqGeneric,
    LessGeneric,
    LessEqGeneric,
    NotGeneric,
    ToBoolean,
    GetPropGeneric,
    SetPropGeneric,
    GetElemGeneric,
    SetElemGeneric,
    CallGeneric,
    SwitchGeneric,
}

impl HelperKind {
    /// Number of helper kinds (the table's fixed size).
    pub const COUNT: usize = 17;
}

/// Address of a helper, for emission and for the trampoline pool.
pub fn helper_address(kind: HelperKind) -> usize {
    match kind {
        HelperKind::AddGeneric => helper_add as usize,
        HelperKind::SubGeneric => helper_sub as usize,
        HelperKind::MulGeneric => helper_mul as usize,
        HelperKind::DivGeneric => helper_div as usize,
        HelperKind::ModGeneric => helper_mod as usize,
        HelperKind::NegGeneric => helper_neg as usize,
        HelperKind::EqGeneric => helper_eq as usize,
        HelperKind::LessGeneric => helper_less as usize,
        HelperKind::LessEqGeneric => helper_less_eq as usize,
        HelperKind::NotGeneric => helper_not as usize,
        HelperKind::ToBoolean => helper_to_boolean as usize,
        HelperKind::GetPropGeneric => helper_get_prop as usize,
        HelperKind::SetPropGeneric => helper_set_prop as usize,
        HelperKind::GetElemGeneric => helper_get_elem as usize,
        HelperKind::SetElemGeneric => helper_set_elem as usize,
        HelperKind::CallGeneric => helper_call_generic as usize,
        HelperKind::SwitchGeneric => helper_switch_generic as usize,
    }
}

// =============================================================================
// Numeric helpers
// =============================================================================

/// Box an f64 result the way every tier does: integral values in int32
/// range (excluding -0) renarrow to int32.
fn box_number(result: f64) -> Value {
    if result == result.trunc()
        && result >= i32::MIN as f64
        && result <= i32::MAX as f64
        && !(result == 0.0 && result.is_sign_negative())
    {
        Value::int32(result as i32)
    } else {
        Value::double(result)
    }
}

fn throw_type_error(vm: &VmContext, what: &'static str) -> u64 {
    tracing::debug!(what, "type error thrown");
    vm.throw(Value::undefined());
    Value::undefined().to_bits()
}

unsafe fn record_profile(profile: *const ValueProfile, value: Value) {
    if !profile.is_null() {
        // SAFETY: profile records live as long as their program, which
        // outlives all compiled code calling this helper.
        unsafe { (*profile).record(value) };
    }
}

macro_rules! binary_arith_helper {
    ($name:ident, $op:tt) => {
        /// Generic arithmetic: correct for every numeric representation.
        pub unsafe extern "C" fn $name(
            vm: *mut VmContext,
            lhs: u64,
            rhs: u64,
            profile: *const ValueProfile,
        ) -> u64 {
            // SAFETY: vm is the live context of the calling activation.
            let vm = unsafe { &*vm };
            let (lhs, rhs) = (Value::from_bits(lhs), Value::from_bits(rhs));
            match (lhs.to_number(), rhs.to_number()) {
                (Some(a), Some(b)) => {
                    let result = box_number(a $op b);
                    // SAFETY: profile outlives compiled code.
                    unsafe { record_profile(profile, result) };
                    result.to_bits()
                }
                _ => throw_type_error(vm, "arithmetic on non-number"),
            }
        }
    };
}

binary_arith_helper!(helper_add, +);
binary_arith_helper!(helper_sub, -);
binary_arith_helper!(helper_mul, *);
binary_arith_helper!(helper_div, /);
binary_arith_helper!(helper_mod, %);

/// Generic negation.
pub unsafe extern "C" fn helper_neg(
    vm: *mut VmContext,
    operand: u64,
    profile: *const ValueProfile,
) -> u64 {
    // SAFETY: vm is the live context of the calling activation.
    let vm = unsafe { &*vm };
    match Value::from_bits(operand).to_number() {
        Some(a) => {
            let result = box_number(-a);
            // SAFETY: profile outlives compiled code.
            unsafe { record_profile(profile, result) };
            result.to_bits()
        }
        None => throw_type_error(vm, "negation of non-number"),
    }
}

// =============================================================================
// Comparison and logic helpers
// =============================================================================

/// Strict equality over any representations.
pub unsafe extern "C" fn helper_eq(_vm: *mut VmContext, lhs: u64, rhs: u64) -> u64 {
    let result = Value::from_bits(lhs).strict_eq(Value::from_bits(rhs));
    Value::boolean(result).to_bits()
}

macro_rules! compare_helper {
    ($name:ident, $op:tt) => {
        /// Generic numeric ordering.
        pub unsafe extern "C" fn $name(vm: *mut VmContext, lhs: u64, rhs: u64) -> u64 {
            // SAFETY: vm is the live context of the calling activation.
            let vm = unsafe { &*vm };
            match (
                Value::from_bits(lhs).to_number(),
                Value::from_bits(rhs).to_number(),
            ) {
                (Some(a), Some(b)) => Value::boolean(a $op b).to_bits(),
                _ => throw_type_error(vm, "comparison of non-number"),
            }
        }
    };
}

compare_helper!(helper_less, <);
compare_helper!(helper_less_eq, <=);

/// Generic logical not.
pub unsafe extern "C" fn helper_not(_vm: *mut VmContext, operand: u64) -> u64 {
    Value::boolean(!Value::from_bits(operand).to_boolean()).to_bits()
}

/// Truthiness for branch slow paths; returns raw 0/1.
pub unsafe extern "C" fn helper_to_boolean(_vm: *mut VmContext, operand: u64) -> u64 {
    Value::from_bits(operand).to_boolean() as u64
}

// =============================================================================
// Property helpers (inline-cache miss entry points)
// =============================================================================

/// Generic property read plus get-site specialization.
pub unsafe extern "C" fn helper_get_prop(
    vm: *mut VmContext,
    object: u64,
    site: *const AccessSite,
) -> u64 {
    // SAFETY: vm and site belong to the calling activation's code.
    let (vm, site) = unsafe { (&*vm, &*site) };
    let object = Value::from_bits(object);
    // SAFETY: cells flowing through compiled code are live.
    if !object.is_cell() || unsafe { cell_kind(object) } != CELL_KIND_OBJECT {
        return throw_type_error(vm, "property read on non-object");
    }
    // SAFETY: checked object cell above.
    let object = unsafe { HeapObject::from_value(object) };

    // SAFETY: prototype cells are live while their objects are.
    let value = unsafe { object.get(&site.name) }.unwrap_or_default();
    if let Some(profile) = site.profile() {
        profile.record(value);
    }
    // SAFETY: same liveness argument; the stub embeds chain addresses.
    unsafe { linker::handle_get_miss(vm, site, object) };
    value.to_bits()
}

/// Generic property write plus put-site specialization.
pub unsafe extern "C" fn helper_set_prop(
    vm: *mut VmContext,
    object: u64,
    value: u64,
    site: *const AccessSite,
) -> u64 {
    // SAFETY: vm and site belong to the calling activation's code.
    let (vm, site) = unsafe { (&*vm, &*site) };
    let object = Value::from_bits(object);
    // SAFETY: cells flowing through compiled code are live.
    if !object.is_cell() || unsafe { cell_kind(object) } != CELL_KIND_OBJECT {
        return throw_type_error(vm, "property write on non-object");
    }
    // SAFETY: compiled frames hold the only reference during the write.
    let object = unsafe { HeapObject::from_value_mut(object) };

    object.put(&vm.jit().shapes, &site.name, Value::from_bits(value));
    linker::handle_put_miss(vm, site, object);
    0
}

// =============================================================================
// Indexed-access helpers
// =============================================================================

fn element_index(value: Value) -> Option<u32> {
    if value.is_int32() {
        u32::try_from(value.as_int32()).ok()
    } else if value.is_double() {
        let d = value.as_double();
        (d >= 0.0 && d == d.trunc() && d <= u32::MAX as f64).then(|| d as u32)
    } else {
        None
    }
}

/// Generic indexed read; records the observed backing mode.
pub unsafe extern "C" fn helper_get_elem(
    vm: *mut VmContext,
    object: u64,
    index: u64,
    profile: *const ArrayProfile,
) -> u64 {
    // SAFETY: vm is the live context of the calling activation.
    let vm = unsafe { &*vm };
    let object = Value::from_bits(object);
    // SAFETY: cells flowing through compiled code are live.
    if !object.is_cell() || unsafe { cell_kind(object) } != CELL_KIND_OBJECT {
        return throw_type_error(vm, "indexed read on non-object");
    }
    // SAFETY: checked object cell above.
    let object = unsafe { HeapObject::from_value(object) };

    if !profile.is_null() {
        if let Some(mode) = object.elements_kind().array_mode() {
            // SAFETY: profile outlives compiled code.
            unsafe { (*profile).record(mode) };
        }
    }

    let value = element_index(Value::from_bits(index))
        .and_then(|index| object.element(index))
        .unwrap_or_default();
    value.to_bits()
}

/// Out-of-line arguments for the indexed write helper; the slow path
/// stages them in the frame's scratch slots.
#[repr(C)]
pub struct SetElemArgs {
    pub value: u64,
    pub profile: *const ArrayProfile,
}

/// Generic indexed write; may widen or sparsify the backing store.
pub unsafe extern "C" fn helper_set_elem(
    vm: *mut VmContext,
    object: u64,
    index: u64,
    args: *const SetElemArgs,
) -> u64 {
    // SAFETY: vm and the staged args belong to the calling activation.
    let (vm, args) = unsafe { (&*vm, &*args) };
    let object = Value::from_bits(object);
    // SAFETY: cells flowing through compiled code are live.
    if !object.is_cell() || unsafe { cell_kind(object) } != CELL_KIND_OBJECT {
        return throw_type_error(vm, "indexed write on non-object");
    }
    // SAFETY: compiled frames hold the only reference during the write.
    let object = unsafe { HeapObject::from_value_mut(object) };

    if !args.profile.is_null() {
        if let Some(mode) = object.elements_kind().array_mode() {
            // SAFETY: profile outlives compiled code.
            unsafe { (*args.profile).record(mode) };
        }
    }

    match element_index(Value::from_bits(index)) {
        Some(index) => {
            object.put_element(index, Value::from_bits(args.value));
            0
        }
        None => throw_type_error(vm, "non-integer element index"),
    }
}

// =============================================================================
// Call helper
// =============================================================================

/// Generic call: validates the callee, links the site, and dispatches.
pub unsafe extern "C" fn helper_call_generic(
    vm: *mut VmContext,
    call_frame: *mut u64,
    argc: u32,
    site: usize,
) -> u64 {
    // SAFETY: vm and the call frame belong to the calling activation.
    let vm_ref = unsafe { &*vm };
    // SAFETY: call_frame[0] is the boxed callee slot.
    let callee_bits = unsafe { *call_frame };
    let callee = Value::from_bits(callee_bits);
    // SAFETY: cells flowing through compiled code are live.
    if !callee.is_cell() || unsafe { cell_kind(callee) } != CELL_KIND_CALLEE {
        return throw_type_error(vm_ref, "call of non-function");
    }
    // SAFETY: checked callee cell above.
    let callee = unsafe { Callee::from_value(callee) };

    let site = site as *const CallSite;
    assert!(!site.is_null(), "call helper without a site descriptor");
    // SAFETY: the site lives in the caller's BaselineCode.
    let entry = match call_link::link_on_call(vm_ref, unsafe { &*site }, callee) {
        Ok(entry) => entry,
        Err(_) => {
            // No executable pages for the callee; without an interpreter
            // to fall back on, surface it as a thrown error.
            return throw_type_error(vm_ref, "callee could not be compiled");
        }
    };

    // SAFETY: entry is a just-installed baseline entry point with the
    // standard signature.
    let entry: EntryFn = unsafe { std::mem::transmute(entry) };
    // SAFETY: forwarding the caller's live frame region.
    unsafe { entry(vm, call_frame, argc, site as usize) }
}

// =============================================================================
// Switch helper
// =============================================================================

/// Switch dispatch for scrutinees the dense fast path rejected:
/// resolves the key to a native destination address.
pub unsafe extern "C" fn helper_switch_generic(
    _vm: *mut VmContext,
    scrutinee: u64,
    site: *const SwitchSite,
) -> usize {
    // SAFETY: the site lives in the caller's BaselineCode.
    let site = unsafe { &*site };
    let key = Value::from_bits(scrutinee);
    if key.is_int32() {
        site.native_target(key.as_int32() as i64)
    } else if key.is_double() {
        let d = key.as_double();
        if d == d.trunc() && d >= i64::MIN as f64 && d <= i64::MAX as f64 {
            site.native_target(d as i64)
        } else {
            site.default_native_target()
        }
    } else {
        site.default_native_target()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use onyx_runtime::ShapeRegistry;
    use std::sync::Arc;

    fn test_vm() -> Box<VmContext> {
        let jit = crate::runtime::context::JitContext::new(Arc::new(ShapeRegistry::new()));
        VmContext::new(jit)
    }

    #[test]
    fn test_add_int_result_narrows() {
        let vm = test_vm();
        let result = unsafe {
            helper_add(
                &*vm as *const _ as *mut _,
                Value::int32(2).to_bits(),
                Value::int32(3).to_bits(),
                std::ptr::null(),
            )
        };
        let result = Value::from_bits(result);
        assert!(result.is_int32());
        assert_eq!(result.as_int32(), 5);
    }

    #[test]
    fn test_add_overflow_widens_to_double() {
        let vm = test_vm();
        let result = unsafe {
            helper_add(
                &*vm as *const _ as *mut _,
                Value::int32(i32::MAX).to_bits(),
                Value::int32(1).to_bits(),
                std::ptr::null(),
            )
        };
        let result = Value::from_bits(result);
        assert!(result.is_double());
        assert_eq!(result.as_double(), i32::MAX as f64 + 1.0);
    }

    #[test]
    fn test_div_exact_renarrows() {
        let vm = test_vm();
        let result = unsafe {
            helper_div(
                &*vm as *const _ as *mut _,
                Value::int32(6).to_bits(),
                Value::int32(2).to_bits(),
                std::ptr::null(),
            )
        };
        assert_eq!(Value::from_bits(result).as_int32(), 3);

        let result = unsafe {
            helper_div(
                &*vm as *const _ as *mut _,
                Value::int32(7).to_bits(),
                Value::int32(2).to_bits(),
                std::ptr::null(),
            )
        };
        assert_eq!(Value::from_bits(result).as_double(), 3.5);
    }

    #[test]
    fn test_negative_zero_stays_double() {
        let vm = test_vm();
        let result = unsafe {
            helper_mul(
                &*vm as *const _ as *mut _,
                Value::int32(-1).to_bits(),
                Value::int32(0).to_bits(),
                std::ptr::null(),
            )
        };
        let result = Value::from_bits(result);
        assert!(result.is_double());
        assert!(result.as_double().is_sign_negative());
    }

    #[test]
    fn test_arith_type_error_throws() {
        let vm = test_vm();
        let _ = unsafe {
            helper_add(
                &*vm as *const _ as *mut _,
                Value::undefined().to_bits(),
                Value::int32(1).to_bits(),
                std::ptr::null(),
            )
        };
        assert!(vm.has_exception());
    }

    #[test]
    fn test_profile_records_result_kind() {
        let vm = test_vm();
        let profile = ValueProfile::new();
        let _ = unsafe {
            helper_add(
                &*vm as *const _ as *mut _,
                Value::int32(1).to_bits(),
                Value::int32(2).to_bits(),
                &profile,
            )
        };
        assert!(profile.observed().is_only_int32());
    }

    #[test]
    fn test_compare_and_not() {
        let vm = test_vm();
        let vm_ptr = &*vm as *const _ as *mut _;
        unsafe {
            let lt = helper_less(vm_ptr, Value::int32(1).to_bits(), Value::int32(2).to_bits());
            assert!(Value::from_bits(lt).as_boolean());

            let eq = helper_eq(vm_ptr, Value::int32(3).to_bits(), Value::double(3.0).to_bits());
            assert!(Value::from_bits(eq).as_boolean());

            let not = helper_not(vm_ptr, Value::boolean(false).to_bits());
            assert!(Value::from_bits(not).as_boolean());

            assert_eq!(helper_to_boolean(vm_ptr, Value::int32(0).to_bits()), 0);
            assert_eq!(helper_to_boolean(vm_ptr, Value::int32(9).to_bits()), 1);
        }
    }

    #[test]
    fn test_helper_table_is_complete_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for index in 0..HelperKind::COUNT {
            // Round-trip through the discriminant.
            let kind: HelperKind = unsafe { std::mem::transmute(index) };
            let addr = helper_address(kind);
            assert_ne!(addr, 0);
            assert!(seen.insert(addr), "duplicate helper address");
        }
    }
}
