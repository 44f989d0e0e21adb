//! Inline-cache escalation tests.
//!
//! These drive the miss handlers directly against compiled (but not
//! executed) code, so they run on any host: specialization only reads
//! and rewrites installed bytes.

use std::sync::Arc;

use onyx_core::bytecode::{Opcode, ProgramBuilder};
use onyx_core::Value;
use onyx_jit::ic::call_link::{link_on_call, CallLinkKind};
use onyx_jit::ic::state::AccessStateKind;
use onyx_jit::runtime::helpers;
use onyx_jit::{compile_program, JitContext, VmContext};
use onyx_runtime::{Callee, Executable, HeapObject, ShapeRegistry};

fn jit() -> Arc<JitContext> {
    JitContext::new(Arc::new(ShapeRegistry::new()))
}

/// `fn(obj) { return obj.x; }`
fn get_prop_program() -> Arc<Executable> {
    let mut b = ProgramBuilder::new(2);
    b.set_param_count(1);
    let name = b.add_identifier("x");
    b.emit(Opcode::GetProp, [1, 0, name as i32, 0]);
    b.emit(Opcode::Return, [1, 0, 0, 0]);
    Executable::new(b.finish())
}

/// `fn(obj, v) { obj.x = v; return v; }`
fn set_prop_program() -> Arc<Executable> {
    let mut b = ProgramBuilder::new(2);
    b.set_param_count(2);
    let name = b.add_identifier("x");
    b.emit(Opcode::SetProp, [0, name as i32, 1, 0]);
    b.emit(Opcode::Return, [1, 0, 0, 0]);
    Executable::new(b.finish())
}

/// Drive one simulated miss through the generic helper.
fn miss_get(vm: &VmContext, site: &onyx_jit::ic::AccessSite, object: &HeapObject) -> Value {
    let bits = unsafe {
        helpers::helper_get_prop(
            vm as *const _ as *mut _,
            object.as_value().to_bits(),
            site,
        )
    };
    Value::from_bits(bits)
}

#[test]
fn test_get_prop_escalation_sequence() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &get_prop_program()).expect("compile");
    let site = &code.access_sites()[0];
    assert_eq!(site.state_kind(), AccessStateKind::Unspecialized);

    // Shape A: two objects built the same way share it.
    let mut a1 = HeapObject::with_prototype(&ctx.shapes, Value::null());
    a1.put(&ctx.shapes, "x", Value::int32(10));
    let mut a2 = HeapObject::with_prototype(&ctx.shapes, Value::null());
    a2.put(&ctx.shapes, "x", Value::int32(20));
    assert_eq!(a1.shape_id(), a2.shape_id());

    // First access: unspecialized → monomorphic(A).
    assert_eq!(miss_get(&vm, site, &a1).as_int32(), 10);
    let shape_a = onyx_runtime::ShapeId(a1.shape_id());
    assert_eq!(site.state_kind(), AccessStateKind::Monomorphic(shape_a));

    // The inline guard immediate now carries shape A.
    let guard_at = site.shape_guard.0 as usize;
    let guard = u32::from_le_bytes(code.code()[guard_at..guard_at + 4].try_into().unwrap());
    assert_eq!(guard, a1.shape_id());

    // Same shape again: a cache hit, no state change, no new patches.
    let patches_before = ctx
        .stats
        .patches_applied
        .load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(miss_get(&vm, site, &a2).as_int32(), 20);
    assert_eq!(site.state_kind(), AccessStateKind::Monomorphic(shape_a));
    assert_eq!(
        ctx.stats
            .patches_applied
            .load(std::sync::atomic::Ordering::Relaxed),
        patches_before
    );

    // Shape B (different insertion order): → polymorphic {B, A}.
    let mut b = HeapObject::with_prototype(&ctx.shapes, Value::null());
    b.put(&ctx.shapes, "y", Value::int32(1));
    b.put(&ctx.shapes, "x", Value::int32(30));
    assert_ne!(b.shape_id(), a1.shape_id());

    assert_eq!(miss_get(&vm, site, &b).as_int32(), 30);
    let shape_b = onyx_runtime::ShapeId(b.shape_id());
    match site.state_kind() {
        AccessStateKind::Polymorphic(shapes) => {
            // Most recently added first.
            assert_eq!(shapes.as_slice(), &[shape_b, shape_a]);
        }
        other => panic!("expected polymorphic, got {other:?}"),
    }
}

#[test]
fn test_escalation_to_generic_and_idempotence() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &get_prop_program()).expect("compile");
    let site = &code.access_sites()[0];

    // Distinct shapes via distinct leading properties.
    let mut objects = Vec::new();
    for index in 0..8 {
        let mut object = HeapObject::with_prototype(&ctx.shapes, Value::null());
        object.put(&ctx.shapes, &format!("p{index}"), Value::int32(0));
        object.put(&ctx.shapes, "x", Value::int32(index));
        objects.push(object);
    }

    for object in &objects {
        let expected = object.get_own("x").unwrap().as_int32();
        assert_eq!(miss_get(&vm, site, object).as_int32(), expected);
    }
    assert_eq!(site.state_kind(), AccessStateKind::Generic);

    // Applying the generic patch again is a behavioral no-op: state and
    // installed bytes are unchanged.
    let bytes_before = code.code().to_vec();
    let mut another = HeapObject::with_prototype(&ctx.shapes, Value::null());
    another.put(&ctx.shapes, "q", Value::int32(0));
    another.put(&ctx.shapes, "x", Value::int32(99));
    assert_eq!(miss_get(&vm, site, &another).as_int32(), 99);
    assert_eq!(site.state_kind(), AccessStateKind::Generic);
    assert_eq!(code.code(), &bytes_before[..]);
}

#[test]
fn test_previously_seen_shapes_survive_escalation() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &get_prop_program()).expect("compile");
    let site = &code.access_sites()[0];

    let mut shapes_seen = Vec::new();
    let mut objects = Vec::new();
    for index in 0..6 {
        let mut object = HeapObject::with_prototype(&ctx.shapes, Value::null());
        object.put(&ctx.shapes, &format!("k{index}"), Value::int32(0));
        object.put(&ctx.shapes, "x", Value::int32(100 + index));
        shapes_seen.push(object.shape_id());
        objects.push(object);
    }

    // Escalate through mono, poly, and past the cap.
    for object in &objects {
        miss_get(&vm, site, object);
    }
    // Every previously seen shape still reads correctly.
    for (index, object) in objects.iter().enumerate() {
        assert_eq!(
            miss_get(&vm, site, object).as_int32(),
            100 + index as i32,
            "shape {} lost correctness",
            shapes_seen[index]
        );
    }
}

#[test]
fn test_prototype_hit_compiles_stub_and_watches_chain() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &get_prop_program()).expect("compile");
    let site = &code.access_sites()[0];

    let mut proto = HeapObject::with_prototype(&ctx.shapes, Value::null());
    proto.put(&ctx.shapes, "x", Value::int32(7));
    let receiver = HeapObject::with_prototype(&ctx.shapes, proto.as_value());

    assert_eq!(miss_get(&vm, site, &receiver).as_int32(), 7);
    // Monomorphic, but stub-borne (prototype loads cannot live inline).
    assert!(matches!(
        site.state_kind(),
        AccessStateKind::Monomorphic(_)
    ));
    // The chain registered structural watchpoints.
    assert!(proto.shape().transition_watchpoint().is_being_watched());
}

#[test]
fn test_set_prop_replace_monomorphizes() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &set_prop_program()).expect("compile");
    let site = &code.access_sites()[0];

    let mut object = HeapObject::with_prototype(&ctx.shapes, Value::null());
    object.put(&ctx.shapes, "x", Value::int32(1));
    let shape = onyx_runtime::ShapeId(object.shape_id());

    unsafe {
        helpers::helper_set_prop(
            &*vm as *const _ as *mut _,
            object.as_value().to_bits(),
            Value::int32(5).to_bits(),
            &**site,
        );
    }
    assert_eq!(object.get_own("x").unwrap().as_int32(), 5);
    // Replacing an existing property is the inline-patchable case.
    assert_eq!(site.state_kind(), AccessStateKind::Monomorphic(shape));
}

#[test]
fn test_set_prop_transition_then_replace() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &set_prop_program()).expect("compile");
    let site = &code.access_sites()[0];

    // Adding a new property transitions the shape; only the replace on
    // the settled shape is the cacheable case, and the site keys on the
    // post-transition shape.
    let mut object = HeapObject::with_prototype(&ctx.shapes, Value::null());
    unsafe {
        helpers::helper_set_prop(
            &*vm as *const _ as *mut _,
            object.as_value().to_bits(),
            Value::int32(1).to_bits(),
            &**site,
        );
    }
    assert_eq!(object.get_own("x").unwrap().as_int32(), 1);

    // A second write is a replace on the settled shape.
    unsafe {
        helpers::helper_set_prop(
            &*vm as *const _ as *mut _,
            object.as_value().to_bits(),
            Value::int32(2).to_bits(),
            &**site,
        );
    }
    assert_eq!(object.get_own("x").unwrap().as_int32(), 2);
    assert!(matches!(
        site.state_kind(),
        AccessStateKind::Monomorphic(_)
    ));
}

// =============================================================================
// Call linking
// =============================================================================

fn trivial_callee(ctx: &Arc<JitContext>) -> (Arc<Executable>, Box<Callee>) {
    let mut b = ProgramBuilder::new(1);
    b.set_param_count(0);
    let k = b.add_constant(Value::int32(1));
    b.emit(Opcode::LoadConst, [0, k as i32, 0, 0]);
    b.emit(Opcode::Return, [0, 0, 0, 0]);
    let executable = Executable::new(b.finish());
    // Pre-compile so linking sees an entry point.
    compile_program(ctx, &executable).expect("callee compile");
    let callee = Callee::new(executable.clone(), Value::null());
    (executable, callee)
}

/// `fn(f) { return f(); }`: a call site with the callee in a register.
fn caller_program() -> Arc<Executable> {
    let mut b = ProgramBuilder::new(3);
    b.set_param_count(1);
    b.emit(Opcode::Call, [2, 0, 1, 0]);
    b.emit(Opcode::Return, [2, 0, 0, 0]);
    Executable::new(b.finish())
}

#[test]
fn test_call_site_linking_progression() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &caller_program()).expect("compile");
    let site = &code.call_sites()[0];
    assert_eq!(site.link_kind(), CallLinkKind::Unlinked);

    let (exec_a, callee_a) = trivial_callee(&ctx);

    // First callee links the site.
    link_on_call(&vm, site, &callee_a).expect("link");
    // Either directly linked or (if the entry landed out of near-call
    // range) immediately virtual; both are valid monotonic states.
    let after_first = site.link_kind();
    assert!(matches!(
        after_first,
        CallLinkKind::Monomorphic | CallLinkKind::Megamorphic
    ));

    // The same callee again changes nothing.
    link_on_call(&vm, site, &callee_a).expect("link");
    assert_eq!(site.link_kind(), after_first);

    if after_first == CallLinkKind::Monomorphic {
        // A closure over the same executable gets the closure stub.
        let callee_a2 = Callee::new(exec_a, Value::int32(1));
        link_on_call(&vm, site, &callee_a2).expect("link");
        assert_eq!(site.link_kind(), CallLinkKind::ClosureCall);

        // A different executable goes fully virtual.
        let (_, callee_b) = trivial_callee(&ctx);
        link_on_call(&vm, site, &callee_b).expect("link");
        assert_eq!(site.link_kind(), CallLinkKind::Megamorphic);

        // Megamorphic is terminal: more callees change nothing.
        let (_, callee_c) = trivial_callee(&ctx);
        link_on_call(&vm, site, &callee_c).expect("link");
        assert_eq!(site.link_kind(), CallLinkKind::Megamorphic);
    }
}

#[test]
fn test_distinct_executables_skip_closure_stub() {
    let ctx = jit();
    let vm = VmContext::new(ctx.clone());
    let code = compile_program(&ctx, &caller_program()).expect("compile");
    let site = &code.call_sites()[0];

    let (_, callee_a) = trivial_callee(&ctx);
    let (_, callee_b) = trivial_callee(&ctx);

    link_on_call(&vm, site, &callee_a).expect("link");
    link_on_call(&vm, site, &callee_b).expect("link");
    // Two unrelated functions: straight to the virtual trampoline, no
    // closure stage.
    assert_eq!(site.link_kind(), CallLinkKind::Megamorphic);
}
