//! Hidden-class (shape) model.
//!
//! Objects that acquired the same properties in the same order share a
//! `Shape`. A shape is the key the inline caches specialize on: the JIT
//! compares an object's shape id against an immediate, and a match proves
//! the property layout statically.
//!
//! # Transitions
//!
//! Adding a property moves an object to a child shape; shapes form a
//! transition tree rooted at the per-prototype empty shape:
//!
//! ```text
//!     Empty ── "x" ──► Shape{x@0} ── "y" ──► Shape{x@0, y@1}
//!        └─── "y" ──► Shape{y@0}
//! ```
//!
//! Each shape carries a transition watchpoint. It fires when the shape
//! transitions (a property is added through it), which is the signal
//! prototype-chain stubs registered on; see `watchpoint`.

use std::sync::{Arc, Weak};

use onyx_core::Value;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::watchpoint::WatchpointSet;

// =============================================================================
// Property Descriptors
// =============================================================================

bitflags::bitflags! {
    /// Property attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u8 {
        /// Property value can be changed.
        const WRITABLE   = 1 << 0;
        /// Property appears in enumeration.
        const ENUMERABLE = 1 << 1;
        /// Plain data property (the only kind the fast paths cache).
        const DATA       = 1 << 2;
    }
}

impl Default for PropertyFlags {
    #[inline]
    fn default() -> Self {
        Self::WRITABLE | Self::ENUMERABLE | Self::DATA
    }
}

/// Describes the single property a shape adds over its parent.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    /// Interned property name.
    pub name: Arc<str>,
    /// Slot index in the object's property storage.
    pub slot: u16,
    /// Attributes.
    pub flags: PropertyFlags,
}

/// Result of looking a name up on a single shape.
#[derive(Debug, Clone)]
pub struct PropertyLookup {
    /// Slot index in the holder's property storage.
    pub slot: u16,
    /// Attributes.
    pub flags: PropertyFlags,
}

// =============================================================================
// Shape
// =============================================================================

/// Unique, never-reused shape identifier. The JIT embeds this as the
/// guard immediate, so it must stay 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// Id 0 is reserved as the guaranteed-to-miss placeholder compiled
    /// into unspecialized inline caches. No real shape ever gets it.
    pub const INVALID: ShapeId = ShapeId(0);
}

/// A hidden class.
///
/// Immutable except for its transition table and watchpoint; shapes are
/// shared freely behind `Arc`.
pub struct Shape {
    id: ShapeId,
    /// Parent in the transition tree; `None` for empty shapes.
    parent: Option<Arc<Shape>>,
    /// The property this shape adds over its parent.
    property: Option<PropertyDescriptor>,
    /// Total property count (slot indices are `0..property_count`).
    property_count: u16,
    /// The prototype all objects of this shape delegate to (cell or null).
    prototype: Value,
    /// Child shapes, keyed by added property name.
    transitions: RwLock<FxHashMap<Arc<str>, Weak<Shape>>>,
    /// Fires when this shape transitions.
    transition_watchpoint: WatchpointSet,
}

impl Shape {
    /// This shape's identifier.
    #[inline]
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// Parent shape, if any.
    #[inline]
    pub fn parent(&self) -> Option<&Arc<Shape>> {
        self.parent.as_ref()
    }

    /// Number of properties objects of this shape hold.
    #[inline]
    pub fn property_count(&self) -> u16 {
        self.property_count
    }

    /// The prototype objects of this shape delegate to.
    #[inline]
    pub fn prototype_for_lookup(&self) -> Value {
        self.prototype
    }

    /// The transition watchpoint for this shape.
    #[inline]
    pub fn transition_watchpoint(&self) -> &WatchpointSet {
        &self.transition_watchpoint
    }

    /// Look a property up on this shape alone (no prototype walk),
    /// following the parent chain of the transition tree.
    pub fn lookup(&self, name: &str) -> Option<PropertyLookup> {
        let mut current = Some(self);
        while let Some(shape) = current {
            if let Some(property) = &shape.property {
                if &*property.name == name {
                    return Some(PropertyLookup {
                        slot: property.slot,
                        flags: property.flags,
                    });
                }
            }
            current = shape.parent.as_deref();
        }
        None
    }

    /// An existing transition for `name`, if still alive.
    pub fn existing_transition(&self, name: &str) -> Option<Arc<Shape>> {
        self.transitions.read().get(name).and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("id", &self.id.0)
            .field("property_count", &self.property_count)
            .field(
                "property",
                &self.property.as_ref().map(|p| (&p.name, p.slot)),
            )
            .finish()
    }
}

// =============================================================================
// Shape Registry
// =============================================================================

/// Allocates shapes and owns the transition machinery.
///
/// Explicitly constructed and passed (no process-wide singleton) so tests
/// and embedders control shape-id allocation.
pub struct ShapeRegistry {
    next_id: AtomicU32,
    /// Empty shapes, keyed by prototype bits.
    empty_shapes: RwLock<FxHashMap<u64, Arc<Shape>>>,
}

impl ShapeRegistry {
    /// Create an empty registry. Ids start at 1; 0 is the IC placeholder.
    pub fn new() -> Self {
        ShapeRegistry {
            next_id: AtomicU32::new(1),
            empty_shapes: RwLock::new(FxHashMap::default()),
        }
    }

    #[inline]
    fn allocate_id(&self) -> ShapeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(id != u32::MAX, "shape id space exhausted");
        ShapeId(id)
    }

    /// The empty shape for a given prototype, creating it on first use.
    pub fn empty_shape(&self, prototype: Value) -> Arc<Shape> {
        let key = prototype.to_bits();
        if let Some(shape) = self.empty_shapes.read().get(&key) {
            return shape.clone();
        }
        let mut shapes = self.empty_shapes.write();
        shapes
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Shape {
                    id: self.allocate_id(),
                    parent: None,
                    property: None,
                    property_count: 0,
                    prototype,
                    transitions: RwLock::new(FxHashMap::default()),
                    transition_watchpoint: WatchpointSet::new(),
                })
            })
            .clone()
    }

    /// Transition `from` by adding `name`, reusing an existing child shape
    /// when one is cached. Fires `from`'s transition watchpoint.
    pub fn transition(
        &self,
        from: &Arc<Shape>,
        name: &str,
        flags: PropertyFlags,
    ) -> Arc<Shape> {
        if let Some(existing) = from.existing_transition(name) {
            from.transition_watchpoint.fire();
            return existing;
        }

        let name: Arc<str> = Arc::from(name);
        let child = Arc::new(Shape {
            id: self.allocate_id(),
            parent: Some(from.clone()),
            property: Some(PropertyDescriptor {
                name: name.clone(),
                slot: from.property_count,
                flags,
            }),
            property_count: from
                .property_count
                .checked_add(1)
                .expect("property slot space exhausted"),
            prototype: from.prototype,
            transitions: RwLock::new(FxHashMap::default()),
            transition_watchpoint: WatchpointSet::new(),
        });

        from.transitions
            .write()
            .insert(name, Arc::downgrade(&child));
        from.transition_watchpoint.fire();

        tracing::trace!(
            from = from.id.0,
            to = child.id.0,
            property = &*child.property.as_ref().unwrap().name,
            "shape transition"
        );
        child
    }

    /// Number of shapes allocated so far.
    pub fn shape_count(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_shape_cached_per_prototype() {
        let registry = ShapeRegistry::new();
        let a = registry.empty_shape(Value::null());
        let b = registry.empty_shape(Value::null());
        assert_eq!(a.id(), b.id());

        let proto = Value::cell(0x1000 as *const ());
        let c = registry.empty_shape(proto);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_ids_start_above_invalid() {
        let registry = ShapeRegistry::new();
        let shape = registry.empty_shape(Value::null());
        assert_ne!(shape.id(), ShapeId::INVALID);
    }

    #[test]
    fn test_transition_assigns_slots_in_order() {
        let registry = ShapeRegistry::new();
        let empty = registry.empty_shape(Value::null());
        let with_x = registry.transition(&empty, "x", PropertyFlags::default());
        let with_xy = registry.transition(&with_x, "y", PropertyFlags::default());

        assert_eq!(with_x.lookup("x").unwrap().slot, 0);
        assert_eq!(with_xy.lookup("x").unwrap().slot, 0);
        assert_eq!(with_xy.lookup("y").unwrap().slot, 1);
        assert!(with_xy.lookup("z").is_none());
        assert_eq!(with_xy.property_count(), 2);
    }

    #[test]
    fn test_transition_reuse() {
        let registry = ShapeRegistry::new();
        let empty = registry.empty_shape(Value::null());
        let a = registry.transition(&empty, "x", PropertyFlags::default());
        let b = registry.transition(&empty, "x", PropertyFlags::default());
        assert_eq!(a.id(), b.id());
        // Different insertion orders diverge.
        let c = registry.transition(&empty, "y", PropertyFlags::default());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_transition_fires_watchpoint() {
        let registry = ShapeRegistry::new();
        let empty = registry.empty_shape(Value::null());
        empty.transition_watchpoint().watch();
        assert!(empty.transition_watchpoint().is_still_valid());

        registry.transition(&empty, "x", PropertyFlags::default());
        assert!(!empty.transition_watchpoint().is_still_valid());
    }
}
