//! The inline-cache escalation state machine.
//!
//! Transitions are pure functions from (current state, newly observed
//! shape) to (next state, action); the linker applies the side effects.
//! Keeping the decision pure makes the monotonicity and idempotence
//! properties directly testable: states only ever move forward, a shape
//! once covered stays covered, and re-applying the generic transition
//! changes nothing.

use onyx_runtime::ShapeId;
use smallvec::SmallVec;

/// Fixed capacity of a polymorphic chain. Entries are checked
/// most-recently-added-first; a shape beyond the cap tips the site to
/// generic. The exact value is a tunable, not a semantic requirement.
pub const POLYMORPHIC_CACHE_CAPACITY: usize = 4;

/// Shapes a site currently covers, in check order.
pub type ShapeList = SmallVec<[ShapeId; POLYMORPHIC_CACHE_CAPACITY]>;

/// Specialization state of one access site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessStateKind {
    /// Compile-time placeholder guard; guaranteed to miss.
    Unspecialized,
    /// One shape, handled by the patched inline fast path or a single
    /// stub.
    Monomorphic(ShapeId),
    /// Up to `POLYMORPHIC_CACHE_CAPACITY` shapes behind a dispatcher
    /// stub, most recently added first.
    Polymorphic(ShapeList),
    /// Permanently routed to the non-specializing helper. Terminal.
    Generic,
}

impl AccessStateKind {
    /// Whether `shape` is already handled without repatching.
    pub fn covers(&self, shape: ShapeId) -> bool {
        match self {
            AccessStateKind::Unspecialized => false,
            AccessStateKind::Monomorphic(covered) => *covered == shape,
            AccessStateKind::Polymorphic(shapes) => shapes.contains(&shape),
            AccessStateKind::Generic => true,
        }
    }

    /// Every shape with a specialized path, in check order.
    pub fn shapes(&self) -> ShapeList {
        match self {
            AccessStateKind::Unspecialized | AccessStateKind::Generic => ShapeList::new(),
            AccessStateKind::Monomorphic(shape) => {
                let mut shapes = ShapeList::new();
                shapes.push(*shape);
                shapes
            }
            AccessStateKind::Polymorphic(shapes) => shapes.clone(),
        }
    }
}

/// What the linker must do to apply a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Shape already covered; no code change.
    Hit,
    /// First real shape: specialize the inline fast path (or a first
    /// stub, for accesses the inline path cannot express).
    Monomorphize,
    /// Compile a dispatcher stub covering the extended shape list.
    Polymorphize,
    /// Capacity exceeded: permanently route the guard to the generic
    /// slow path.
    Generalize,
    /// Already generic; the patch would be a no-op.
    StayGeneric,
}

/// Decide the next state for a site observing `shape`.
pub fn escalate(state: &AccessStateKind, shape: ShapeId) -> (AccessStateKind, Escalation) {
    debug_assert!(shape != ShapeId::INVALID, "placeholder shape observed");
    match state {
        AccessStateKind::Unspecialized => {
            (AccessStateKind::Monomorphic(shape), Escalation::Monomorphize)
        }
        AccessStateKind::Monomorphic(covered) if *covered == shape => {
            (state.clone(), Escalation::Hit)
        }
        AccessStateKind::Monomorphic(covered) => {
            let mut shapes = ShapeList::new();
            shapes.push(shape);
            shapes.push(*covered);
            (AccessStateKind::Polymorphic(shapes), Escalation::Polymorphize)
        }
        AccessStateKind::Polymorphic(shapes) if shapes.contains(&shape) => {
            (state.clone(), Escalation::Hit)
        }
        AccessStateKind::Polymorphic(shapes) => {
            if shapes.len() >= POLYMORPHIC_CACHE_CAPACITY {
                (AccessStateKind::Generic, Escalation::Generalize)
            } else {
                let mut extended = ShapeList::new();
                extended.push(shape);
                extended.extend_from_slice(shapes);
                (AccessStateKind::Polymorphic(extended), Escalation::Polymorphize)
            }
        }
        AccessStateKind::Generic => (AccessStateKind::Generic, Escalation::StayGeneric),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(id: u32) -> ShapeId {
        ShapeId(id)
    }

    #[test]
    fn test_unspecialized_to_monomorphic() {
        let (next, action) = escalate(&AccessStateKind::Unspecialized, shape(1));
        assert_eq!(next, AccessStateKind::Monomorphic(shape(1)));
        assert_eq!(action, Escalation::Monomorphize);
    }

    #[test]
    fn test_monomorphic_hit_is_stable() {
        let state = AccessStateKind::Monomorphic(shape(1));
        let (next, action) = escalate(&state, shape(1));
        assert_eq!(next, state);
        assert_eq!(action, Escalation::Hit);
    }

    #[test]
    fn test_second_shape_polymorphizes_most_recent_first() {
        let state = AccessStateKind::Monomorphic(shape(1));
        let (next, action) = escalate(&state, shape(2));
        assert_eq!(action, Escalation::Polymorphize);
        match next {
            AccessStateKind::Polymorphic(shapes) => {
                assert_eq!(shapes.as_slice(), &[shape(2), shape(1)]);
            }
            other => panic!("expected polymorphic, got {other:?}"),
        }
    }

    #[test]
    fn test_escalation_never_loses_shapes() {
        let mut state = AccessStateKind::Unspecialized;
        for id in 1..=POLYMORPHIC_CACHE_CAPACITY as u32 {
            let (next, _) = escalate(&state, shape(id));
            for seen in 1..=id {
                assert!(next.covers(shape(seen)), "lost shape {seen} at {id}");
            }
            state = next;
        }
    }

    #[test]
    fn test_cap_overflow_generalizes() {
        let mut state = AccessStateKind::Unspecialized;
        for id in 1..=POLYMORPHIC_CACHE_CAPACITY as u32 {
            state = escalate(&state, shape(id)).0;
        }
        assert!(matches!(state, AccessStateKind::Polymorphic(_)));

        let (next, action) = escalate(&state, shape(99));
        assert_eq!(next, AccessStateKind::Generic);
        assert_eq!(action, Escalation::Generalize);
        // Generic covers everything, including shapes never seen.
        assert!(next.covers(shape(1)));
        assert!(next.covers(shape(1000)));
    }

    #[test]
    fn test_generic_is_idempotent() {
        let (next, action) = escalate(&AccessStateKind::Generic, shape(5));
        assert_eq!(next, AccessStateKind::Generic);
        assert_eq!(action, Escalation::StayGeneric);
    }

    #[test]
    fn test_polymorphic_hit_does_not_reorder() {
        let mut shapes = ShapeList::new();
        shapes.push(shape(3));
        shapes.push(shape(2));
        let state = AccessStateKind::Polymorphic(shapes.clone());
        let (next, action) = escalate(&state, shape(2));
        assert_eq!(action, Escalation::Hit);
        assert_eq!(next, AccessStateKind::Polymorphic(shapes));
    }
}
