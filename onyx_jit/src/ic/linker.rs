//! Miss handling and escalation for property-access sites.
//!
//! The generic helpers land here after performing an access the fast
//! path missed. The linker decides, under the patch lock, whether the
//! site is worth specializing further, compiles whatever stub the
//! escalation step needs, and rewrites the installed guard through the
//! code patch buffer.
//!
//! The simplest case, a same-shape self access, patches the inline fast
//! path directly: the shape immediate, the convertible base load (lea
//! for inline slots, overflow load for spilled ones), and the payload
//! displacement. Everything else goes through a compiled stub targeted
//! by the guard branch. Escalating to generic retargets the guard back
//! at the cold path and stops patching forever; the inline-patched shape
//! keeps its fast path, so previously-working accesses stay fast.

use onyx_runtime::object::{HeapObject, INLINE_SLOTS, INLINE_SLOTS_OFFSET, OVERFLOW_DATA_OFFSET};
use onyx_runtime::shape::PropertyFlags;
use onyx_runtime::{Shape, ShapeId};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::ic::access_site::{AccessKind, AccessSite};
use crate::ic::state::{escalate, AccessStateKind, Escalation};
use crate::ic::stub::{compile_access_stub, AccessVariant, PolyEntry};
use crate::patch::CodePatchBuffer;
use crate::runtime::context::VmContext;

/// Uncacheable misses tolerated before the site goes generic anyway.
const UNCACHEABLE_MISS_LIMIT: u32 = 8;

/// Longest prototype chain worth specializing.
const MAX_CHAIN_LENGTH: usize = 8;

/// How a miss resolved against the object model.
enum Resolution {
    /// Own data property at a slot.
    SelfSlot(u16),
    /// Property found on a prototype; chain runs first-prototype →
    /// holder, with the shapes to re-verify.
    Proto {
        slot: u16,
        chain: SmallVec<[(usize, Arc<Shape>); 4]>,
    },
    /// Not worth caching (missing property, unwritable slot, chain too
    /// deep).
    Uncacheable,
}

/// Resolve a read against the receiver and its prototype chain.
///
/// # Safety
/// Every prototype cell reachable from `object` must be live.
unsafe fn resolve_get(site: &AccessSite, object: &HeapObject) -> Resolution {
    if let Some(lookup) = object.shape().lookup(&site.name) {
        return Resolution::SelfSlot(lookup.slot);
    }

    let mut chain: SmallVec<[(usize, Arc<Shape>); 4]> = SmallVec::new();
    let mut current = object;
    loop {
        let proto = current.shape().prototype_for_lookup();
        if !proto.is_cell() {
            return Resolution::Uncacheable;
        }
        // SAFETY: caller guarantees prototype liveness.
        let proto = unsafe { HeapObject::from_value(proto) };
        chain.push((proto as *const _ as usize, proto.shape().clone()));
        if chain.len() > MAX_CHAIN_LENGTH {
            return Resolution::Uncacheable;
        }
        if let Some(lookup) = proto.shape().lookup(&site.name) {
            return Resolution::Proto {
                slot: lookup.slot,
                chain,
            };
        }
        current = proto;
    }
}

/// Resolve a write: only replacement of an existing own data property is
/// specialized.
fn resolve_put(site: &AccessSite, object: &HeapObject) -> Resolution {
    match object.shape().lookup(&site.name) {
        Some(lookup) if lookup.flags.contains(PropertyFlags::WRITABLE) => {
            Resolution::SelfSlot(lookup.slot)
        }
        _ => Resolution::Uncacheable,
    }
}

/// React to a property-read miss: the helper already produced the value;
/// this only specializes the site.
///
/// # Safety
/// Every prototype cell reachable from `object` must be live, and stay
/// live while the compiled stub is installed (the stub embeds chain
/// object addresses).
pub unsafe fn handle_get_miss(vm: &VmContext, site: &AccessSite, object: &HeapObject) {
    // SAFETY: forwarded from our caller.
    let resolution = unsafe { resolve_get(site, object) };
    apply_miss(vm, site, object, resolution);
}

/// React to a property-write miss.
pub fn handle_put_miss(vm: &VmContext, site: &AccessSite, object: &HeapObject) {
    let resolution = resolve_put(site, object);
    apply_miss(vm, site, object, resolution);
}

fn apply_miss(vm: &VmContext, site: &AccessSite, object: &HeapObject, resolution: Resolution) {
    let ctx = vm.jit();
    ctx.stats.record_ic_miss();

    // The patch lock is the single synchronization point for code
    // mutation; the site lock orders racing escalation decisions.
    let _patches = ctx.lock_patches();
    let mut state = site.state();

    let variant = match resolution {
        Resolution::SelfSlot(slot) => match site.kind {
            AccessKind::Get => AccessVariant::SelfSlot { slot },
            AccessKind::Put => AccessVariant::ReplaceSlot { slot },
        },
        Resolution::Proto { slot, chain } => {
            // Register the structural watchpoints; the stub still
            // re-checks every link inline, so these only steer future
            // decisions.
            for (_, shape) in &chain {
                shape.transition_watchpoint().watch();
            }
            AccessVariant::ProtoSlot {
                slot,
                chain: chain
                    .into_iter()
                    .map(|(ptr, shape)| (ptr, shape.id()))
                    .collect(),
            }
        }
        Resolution::Uncacheable => {
            state.uncacheable_misses += 1;
            if state.uncacheable_misses >= UNCACHEABLE_MISS_LIMIT
                && state.kind != AccessStateKind::Generic
            {
                retarget_to_generic(site, &mut state);
                state.kind = AccessStateKind::Generic;
                ctx.stats.record_patch();
            }
            return;
        }
    };

    let shape = ShapeId(object.shape_id());
    let (next, escalation) = escalate(&state.kind, shape);

    match escalation {
        Escalation::Hit | Escalation::StayGeneric => {}
        Escalation::Monomorphize => {
            let inline_capable = matches!(
                variant,
                AccessVariant::SelfSlot { .. } | AccessVariant::ReplaceSlot { .. }
            );
            if inline_capable {
                patch_inline(site, shape, &variant);
                state.inline_shape = Some(shape);
            } else {
                let entry = PolyEntry { shape, variant };
                if !install_stub(vm, site, &mut state, entry) {
                    return; // no executable memory; stay unspecialized
                }
            }
            state.kind = next;
            ctx.stats.record_patch();
            tracing::debug!(
                name = &*site.name,
                bc = site.bytecode_offset,
                shape = shape.0,
                "access site monomorphized"
            );
        }
        Escalation::Polymorphize => {
            let entry = PolyEntry { shape, variant };
            if !install_stub(vm, site, &mut state, entry) {
                return;
            }
            state.kind = next;
            ctx.stats.record_patch();
            tracing::debug!(
                name = &*site.name,
                bc = site.bytecode_offset,
                shapes = state.entries.len(),
                "access site polymorphized"
            );
        }
        Escalation::Generalize => {
            retarget_to_generic(site, &mut state);
            state.kind = next;
            ctx.stats.record_patch();
            tracing::debug!(
                name = &*site.name,
                bc = site.bytecode_offset,
                "access site went generic"
            );
        }
    }
}

/// Patch the inline fast path for a monomorphic self access.
fn patch_inline(site: &AccessSite, shape: ShapeId, variant: &AccessVariant) {
    let slot = match variant {
        AccessVariant::SelfSlot { slot } | AccessVariant::ReplaceSlot { slot } => *slot,
        AccessVariant::ProtoSlot { .. } => unreachable!("proto access is stub-borne"),
    };

    // SAFETY: the region is installed code owned by the BaselineCode
    // this site belongs to; the caller holds the patch lock.
    let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
    patcher.repatch_i32(site.shape_guard, shape.0 as i32);
    if (slot as usize) < INLINE_SLOTS {
        // Base becomes an address computation of the object itself.
        patcher.replace_load_with_lea(site.base);
        patcher.repatch_disp32(site.base.disp(), 0);
        patcher.repatch_disp32(site.payload, INLINE_SLOTS_OFFSET + 8 * slot as i32);
    } else {
        patcher.repatch_disp32(site.base.disp(), OVERFLOW_DATA_OFFSET);
        patcher.repatch_disp32(site.payload, 8 * (slot as i32 - INLINE_SLOTS as i32));
    }
}

/// Compile a dispatcher stub over the site's stub-borne entries plus the
/// new one, and retarget the guard branch at it. Returns false when no
/// executable memory was available (the site is left as it was).
fn install_stub(
    vm: &VmContext,
    site: &AccessSite,
    state: &mut crate::ic::access_site::SiteState,
    entry: PolyEntry,
) -> bool {
    let mut entries: SmallVec<[PolyEntry; 4]> = SmallVec::new();
    entries.push(entry);
    entries.extend(state.entries.iter().cloned());

    let is_load = site.kind == AccessKind::Get;
    let stub = match compile_access_stub(
        &entries,
        is_load,
        site.slow_entry_addr(),
        site.rejoin_addr(),
    ) {
        Ok(stub) => stub,
        Err(_) => return false,
    };
    vm.jit().stats.record_stub();

    // SAFETY: installed region; patch lock held by caller.
    let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
    patcher.retarget_jump(site.guard_branch, stub.entry());
    drop(patcher);

    if let Some(old) = state.stub.take() {
        state.retired.push(old);
    }
    state.entries = entries;
    state.stub = Some(stub);
    true
}

/// Terminal transition: route the guard back at the cold path. The
/// inline-patched shape, if any, keeps its fast path.
fn retarget_to_generic(site: &AccessSite, state: &mut crate::ic::access_site::SiteState) {
    // SAFETY: installed region; patch lock held by caller.
    let patcher = unsafe { CodePatchBuffer::acquire(site.region()) };
    patcher.retarget_jump(site.guard_branch, site.slow_entry_addr());
    drop(patcher);

    if let Some(old) = state.stub.take() {
        state.retired.push(old);
    }
}
