//! Heap objects with a fixed, JIT-visible header.
//!
//! The compiled fast paths load directly off an object pointer, so the
//! first part of `HeapObject` is a `#[repr(C)]` header with frozen byte
//! offsets (asserted by tests against `offset_of!`):
//!
//! ```text
//! +0   cell_kind      u32    ← discriminates objects from callees
//! +4   shape_id       u32    ← inline-cache guard compares this
//! +8   elements_kind  u32    ← array-mode guard compares this
//! +12  elements_len   u32    ← bounds checks compare this
//! +16  elements_data  *mut   ← element loads index off this
//! +24  overflow_data  *mut   ← out-of-line property slots
//! +32  inline_slots   [Value; 6]
//! ```
//!
//! Everything after the inline slots is Rust-managed backing storage the
//! JIT never touches. The raw pointers in the header are re-synced after
//! every mutation that can reallocate.

use std::ptr;
use std::sync::Arc;

use onyx_core::profile::ArrayModes;
use onyx_core::Value;
use rustc_hash::FxHashMap;

use crate::shape::{PropertyFlags, Shape, ShapeRegistry};

/// Number of inline property slots before storage spills out of line.
pub const INLINE_SLOTS: usize = 6;

/// Byte offset of the cell-kind discriminator shared by every cell.
pub const CELL_KIND_OFFSET: i32 = 0;
/// Cell-kind value for plain objects.
pub const CELL_KIND_OBJECT: u32 = 1;
/// Cell-kind value for callees (see `function`).
pub const CELL_KIND_CALLEE: u32 = 2;

/// Byte offset of the shape id in the object header.
pub const SHAPE_ID_OFFSET: i32 = 4;
/// Byte offset of the elements kind.
pub const ELEMENTS_KIND_OFFSET: i32 = 8;
/// Byte offset of the elements length.
pub const ELEMENTS_LEN_OFFSET: i32 = 12;
/// Byte offset of the elements data pointer.
pub const ELEMENTS_DATA_OFFSET: i32 = 16;
/// Byte offset of the out-of-line property slot pointer.
pub const OVERFLOW_DATA_OFFSET: i32 = 24;
/// Byte offset of the first inline property slot.
pub const INLINE_SLOTS_OFFSET: i32 = 32;

// =============================================================================
// Elements Kinds
// =============================================================================

/// Backing representation of indexed storage, as the header encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ElementsKind {
    None = 0,
    Int32Dense = 1,
    DoubleDense = 2,
    ValueDense = 3,
    Sparse = 4,
    TypedI8 = 5,
    TypedU8 = 6,
    TypedI16 = 7,
    TypedU16 = 8,
    TypedI32 = 9,
    TypedU32 = 10,
    TypedF32 = 11,
    TypedF64 = 12,
}

impl ElementsKind {
    /// The profile mode this kind records as.
    pub fn array_mode(self) -> Option<ArrayModes> {
        match self {
            ElementsKind::None => None,
            ElementsKind::Int32Dense => Some(ArrayModes::INT32_DENSE),
            ElementsKind::DoubleDense => Some(ArrayModes::DOUBLE_DENSE),
            ElementsKind::ValueDense => Some(ArrayModes::VALUE_DENSE),
            ElementsKind::Sparse => Some(ArrayModes::SPARSE),
            ElementsKind::TypedI8 => Some(ArrayModes::TYPED_I8),
            ElementsKind::TypedU8 => Some(ArrayModes::TYPED_U8),
            ElementsKind::TypedI16 => Some(ArrayModes::TYPED_I16),
            ElementsKind::TypedU16 => Some(ArrayModes::TYPED_U16),
            ElementsKind::TypedI32 => Some(ArrayModes::TYPED_I32),
            ElementsKind::TypedU32 => Some(ArrayModes::TYPED_U32),
            ElementsKind::TypedF32 => Some(ArrayModes::TYPED_F32),
            ElementsKind::TypedF64 => Some(ArrayModes::TYPED_F64),
        }
    }

    /// Per-element size in bytes, for kinds with linear backing.
    pub fn element_size(self) -> Option<usize> {
        match self {
            ElementsKind::Int32Dense => Some(4),
            ElementsKind::DoubleDense => Some(8),
            ElementsKind::ValueDense => Some(8),
            ElementsKind::TypedI8 | ElementsKind::TypedU8 => Some(1),
            ElementsKind::TypedI16 | ElementsKind::TypedU16 => Some(2),
            ElementsKind::TypedI32 | ElementsKind::TypedU32 => Some(4),
            ElementsKind::TypedF32 => Some(4),
            ElementsKind::TypedF64 => Some(8),
            ElementsKind::None | ElementsKind::Sparse => None,
        }
    }

    /// Whether this is a typed-array kind.
    pub fn is_typed(self) -> bool {
        matches!(
            self,
            ElementsKind::TypedI8
                | ElementsKind::TypedU8
                | ElementsKind::TypedI16
                | ElementsKind::TypedU16
                | ElementsKind::TypedI32
                | ElementsKind::TypedU32
                | ElementsKind::TypedF32
                | ElementsKind::TypedF64
        )
    }
}

/// Rust-managed element backing storage.
enum ElementsBacking {
    None,
    Int32(Vec<i32>),
    Double(Vec<f64>),
    Values(Vec<Value>),
    Sparse(FxHashMap<u32, Value>),
    TypedBytes(Vec<u8>),
}

// =============================================================================
// HeapObject
// =============================================================================

/// A heap object: JIT-visible header followed by Rust-managed storage.
///
/// Objects must not move while compiled code can reference them, so they
/// are always constructed boxed.
#[repr(C)]
pub struct HeapObject {
    cell_kind: u32,
    shape_id: u32,
    elements_kind: u32,
    elements_len: u32,
    elements_data: *mut u8,
    overflow_data: *mut Value,
    inline_slots: [Value; INLINE_SLOTS],

    // Not JIT-visible from here down.
    shape: Arc<Shape>,
    overflow: Vec<Value>,
    elements: ElementsBacking,
}

impl HeapObject {
    /// Create an object with the given shape and no indexed storage.
    pub fn new(shape: Arc<Shape>) -> Box<Self> {
        let mut object = Box::new(HeapObject {
            cell_kind: CELL_KIND_OBJECT,
            shape_id: shape.id().0,
            elements_kind: ElementsKind::None as u32,
            elements_len: 0,
            elements_data: ptr::null_mut(),
            overflow_data: ptr::null_mut(),
            inline_slots: [Value::undefined(); INLINE_SLOTS],
            shape,
            overflow: Vec::new(),
            elements: ElementsBacking::None,
        });
        object.sync_header();
        object
    }

    /// Create an empty object off the registry's empty shape.
    pub fn with_prototype(registry: &ShapeRegistry, prototype: Value) -> Box<Self> {
        Self::new(registry.empty_shape(prototype))
    }

    /// This object's shape.
    #[inline]
    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    /// The shape id as the header stores it.
    #[inline]
    pub fn shape_id(&self) -> u32 {
        self.shape_id
    }

    /// This object as a boxed cell value.
    #[inline]
    pub fn as_value(&self) -> Value {
        Value::cell(self as *const _ as *const ())
    }

    /// Recover an object reference from a cell value.
    ///
    /// # Safety
    /// `value` must be a cell created from a live `HeapObject` that
    /// outlives `'a`.
    #[inline]
    pub unsafe fn from_value<'a>(value: Value) -> &'a HeapObject {
        debug_assert!(value.is_cell());
        // SAFETY: caller guarantees the cell points at a live HeapObject.
        unsafe { &*(value.as_cell() as *const HeapObject) }
    }

    /// Mutable variant of `from_value`.
    ///
    /// # Safety
    /// Same as `from_value`, plus the usual exclusive-access rules.
    #[inline]
    pub unsafe fn from_value_mut<'a>(value: Value) -> &'a mut HeapObject {
        debug_assert!(value.is_cell());
        // SAFETY: caller guarantees exclusive access to a live HeapObject.
        unsafe { &mut *(value.as_cell() as *mut HeapObject) }
    }

    /// Re-sync the raw header pointers with the backing storage. Must run
    /// after any mutation that can reallocate.
    fn sync_header(&mut self) {
        self.shape_id = self.shape.id().0;
        self.overflow_data = self.overflow.as_mut_ptr();
        let (kind, len, data) = match &mut self.elements {
            ElementsBacking::None => (ElementsKind::None, 0, ptr::null_mut()),
            ElementsBacking::Int32(v) => (
                ElementsKind::Int32Dense,
                v.len() as u32,
                v.as_mut_ptr() as *mut u8,
            ),
            ElementsBacking::Double(v) => (
                ElementsKind::DoubleDense,
                v.len() as u32,
                v.as_mut_ptr() as *mut u8,
            ),
            ElementsBacking::Values(v) => (
                ElementsKind::ValueDense,
                v.len() as u32,
                v.as_mut_ptr() as *mut u8,
            ),
            ElementsBacking::Sparse(_) => (ElementsKind::Sparse, 0, ptr::null_mut()),
            ElementsBacking::TypedBytes(v) => {
                let kind = ElementsKind::from_u32(self.elements_kind)
                    .filter(|k| k.is_typed())
                    .expect("typed backing without typed kind");
                let size = kind.element_size().unwrap();
                (kind, (v.len() / size) as u32, v.as_mut_ptr())
            }
        };
        self.elements_kind = kind as u32;
        self.elements_len = len;
        self.elements_data = data;
    }

    // =========================================================================
    // Property storage
    // =========================================================================

    /// Read a property slot.
    #[inline]
    pub fn slot(&self, index: u16) -> Value {
        let index = index as usize;
        if index < INLINE_SLOTS {
            self.inline_slots[index]
        } else {
            self.overflow[index - INLINE_SLOTS]
        }
    }

    /// Write a property slot. The slot must already exist on the shape.
    #[inline]
    pub fn set_slot(&mut self, index: u16, value: Value) {
        let index = index as usize;
        debug_assert!(index < self.shape.property_count() as usize);
        if index < INLINE_SLOTS {
            self.inline_slots[index] = value;
        } else {
            self.overflow[index - INLINE_SLOTS] = value;
        }
    }

    /// Read an own property by name (no prototype walk).
    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.shape.lookup(name).map(|lookup| self.slot(lookup.slot))
    }

    /// Read a property, walking the prototype chain.
    ///
    /// # Safety
    /// Every prototype cell on the chain must point at a live object.
    pub unsafe fn get(&self, name: &str) -> Option<Value> {
        let mut current = self;
        loop {
            if let Some(value) = current.get_own(name) {
                return Some(value);
            }
            let proto = current.shape.prototype_for_lookup();
            if !proto.is_cell() {
                return None;
            }
            // SAFETY: caller guarantees prototype cells are live objects.
            current = unsafe { HeapObject::from_value(proto) };
        }
    }

    /// Write a property: replaces in place when the shape already has it,
    /// otherwise transitions to a child shape and extends storage.
    pub fn put(&mut self, registry: &ShapeRegistry, name: &str, value: Value) {
        if let Some(lookup) = self.shape.lookup(name) {
            if lookup.flags.contains(PropertyFlags::WRITABLE) {
                self.set_slot(lookup.slot, value);
            }
            return;
        }

        let new_shape = registry.transition(&self.shape, name, PropertyFlags::default());
        let slot = new_shape.property_count() - 1;
        if slot as usize >= INLINE_SLOTS {
            self.overflow
                .resize(slot as usize - INLINE_SLOTS + 1, Value::undefined());
        }
        self.shape = new_shape;
        self.sync_header();
        self.set_slot(slot, value);
    }

    // =========================================================================
    // Indexed storage
    // =========================================================================

    /// Current elements kind.
    #[inline]
    pub fn elements_kind(&self) -> ElementsKind {
        ElementsKind::from_u32(self.elements_kind).expect("corrupt elements kind")
    }

    /// Current element count (0 for sparse storage).
    #[inline]
    pub fn elements_len(&self) -> u32 {
        self.elements_len
    }

    /// Install dense int32 elements.
    pub fn set_elements_int32(&mut self, values: Vec<i32>) {
        self.elements = ElementsBacking::Int32(values);
        self.sync_header();
    }

    /// Install dense double elements.
    pub fn set_elements_double(&mut self, values: Vec<f64>) {
        self.elements = ElementsBacking::Double(values);
        self.sync_header();
    }

    /// Install dense boxed-value elements.
    pub fn set_elements_values(&mut self, values: Vec<Value>) {
        self.elements = ElementsBacking::Values(values);
        self.sync_header();
    }

    /// Install zeroed typed-array elements of the given kind.
    pub fn set_elements_typed(&mut self, kind: ElementsKind, len: usize) {
        assert!(kind.is_typed(), "not a typed-array kind: {kind:?}");
        let size = kind.element_size().unwrap();
        self.elements_kind = kind as u32;
        self.elements = ElementsBacking::TypedBytes(vec![0u8; len * size]);
        self.sync_header();
    }

    /// Generic indexed read (reference semantics for the helpers).
    pub fn element(&self, index: u32) -> Option<Value> {
        match &self.elements {
            ElementsBacking::None => None,
            ElementsBacking::Int32(v) => v.get(index as usize).map(|&i| Value::int32(i)),
            ElementsBacking::Double(v) => v.get(index as usize).map(|&d| Value::double(d)),
            ElementsBacking::Values(v) => v.get(index as usize).copied(),
            ElementsBacking::Sparse(map) => map.get(&index).copied(),
            ElementsBacking::TypedBytes(bytes) => {
                let kind = self.elements_kind();
                let size = kind.element_size().unwrap();
                let start = index as usize * size;
                let slice = bytes.get(start..start + size)?;
                Some(read_typed_element(kind, slice))
            }
        }
    }

    /// Generic indexed write. Dense storage widens on representation
    /// mismatch (int32 → double → value) and converts to sparse on
    /// out-of-bounds writes; typed storage clamps/converts numerically
    /// and ignores out-of-bounds writes.
    pub fn put_element(&mut self, index: u32, value: Value) {
        let in_bounds = (index as usize) < self.dense_len();
        match &mut self.elements {
            ElementsBacking::None => {
                let mut map = FxHashMap::default();
                map.insert(index, value);
                self.elements = ElementsBacking::Sparse(map);
            }
            ElementsBacking::Int32(v) => {
                if in_bounds && value.is_int32() {
                    v[index as usize] = value.as_int32();
                } else if in_bounds && value.is_double() {
                    let widened: Vec<f64> = v.iter().map(|&i| i as f64).collect();
                    self.elements = ElementsBacking::Double(widened);
                    self.sync_header();
                    return self.put_element(index, value);
                } else {
                    self.widen_to_values_or_sparse(index, value);
                }
            }
            ElementsBacking::Double(v) => {
                if in_bounds {
                    if let Some(d) = value.to_number() {
                        v[index as usize] = d;
                    } else {
                        self.widen_to_values_or_sparse(index, value);
                    }
                } else {
                    self.widen_to_values_or_sparse(index, value);
                }
            }
            ElementsBacking::Values(v) => {
                if in_bounds {
                    v[index as usize] = value;
                } else {
                    self.widen_to_values_or_sparse(index, value);
                }
            }
            ElementsBacking::Sparse(map) => {
                map.insert(index, value);
            }
            ElementsBacking::TypedBytes(bytes) => {
                let kind = ElementsKind::from_u32(self.elements_kind)
                    .expect("corrupt elements kind");
                let size = kind.element_size().unwrap();
                let start = index as usize * size;
                if let Some(slice) = bytes.get_mut(start..start + size) {
                    write_typed_element(kind, slice, value);
                }
            }
        }
        self.sync_header();
    }

    fn dense_len(&self) -> usize {
        match &self.elements {
            ElementsBacking::Int32(v) => v.len(),
            ElementsBacking::Double(v) => v.len(),
            ElementsBacking::Values(v) => v.len(),
            _ => 0,
        }
    }

    /// Dense storage escape hatch: in-bounds representation mismatch
    /// widens to boxed values, out-of-bounds goes sparse.
    fn widen_to_values_or_sparse(&mut self, index: u32, value: Value) {
        let dense: Vec<Value> = match &self.elements {
            ElementsBacking::Int32(v) => v.iter().map(|&i| Value::int32(i)).collect(),
            ElementsBacking::Double(v) => v.iter().map(|&d| Value::double(d)).collect(),
            ElementsBacking::Values(v) => v.clone(),
            _ => Vec::new(),
        };
        if (index as usize) < dense.len() {
            let mut values = dense;
            values[index as usize] = value;
            self.elements = ElementsBacking::Values(values);
        } else {
            let mut map: FxHashMap<u32, Value> = dense
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i as u32, v))
                .collect();
            map.insert(index, value);
            self.elements = ElementsBacking::Sparse(map);
        }
        self.sync_header();
    }
}

/// Read the kind discriminator of any cell (object or callee).
///
/// # Safety
/// `value` must be a cell pointing at a live cell header.
#[inline]
pub unsafe fn cell_kind(value: Value) -> u32 {
    debug_assert!(value.is_cell());
    // SAFETY: every cell starts with the u32 kind field.
    unsafe { *(value.as_cell() as *const u32) }
}

fn read_typed_element(kind: ElementsKind, bytes: &[u8]) -> Value {
    match kind {
        ElementsKind::TypedI8 => Value::int32(bytes[0] as i8 as i32),
        ElementsKind::TypedU8 => Value::int32(bytes[0] as i32),
        ElementsKind::TypedI16 => {
            Value::int32(i16::from_le_bytes([bytes[0], bytes[1]]) as i32)
        }
        ElementsKind::TypedU16 => {
            Value::int32(u16::from_le_bytes([bytes[0], bytes[1]]) as i32)
        }
        ElementsKind::TypedI32 => {
            Value::int32(i32::from_le_bytes(bytes.try_into().unwrap()))
        }
        ElementsKind::TypedU32 => {
            let raw = u32::from_le_bytes(bytes.try_into().unwrap());
            if raw <= i32::MAX as u32 {
                Value::int32(raw as i32)
            } else {
                Value::double(raw as f64)
            }
        }
        ElementsKind::TypedF32 => {
            Value::double(f32::from_le_bytes(bytes.try_into().unwrap()) as f64)
        }
        ElementsKind::TypedF64 => {
            Value::double(f64::from_le_bytes(bytes.try_into().unwrap()))
        }
        _ => unreachable!("not a typed kind"),
    }
}

fn write_typed_element(kind: ElementsKind, bytes: &mut [u8], value: Value) {
    let number = value.to_number().unwrap_or(0.0);
    match kind {
        ElementsKind::TypedI8 => bytes[0] = number as i8 as u8,
        ElementsKind::TypedU8 => bytes[0] = number as u8,
        ElementsKind::TypedI16 => bytes.copy_from_slice(&(number as i16).to_le_bytes()),
        ElementsKind::TypedU16 => bytes.copy_from_slice(&(number as u16).to_le_bytes()),
        ElementsKind::TypedI32 => bytes.copy_from_slice(&(number as i32).to_le_bytes()),
        ElementsKind::TypedU32 => bytes.copy_from_slice(&(number as u32).to_le_bytes()),
        ElementsKind::TypedF32 => bytes.copy_from_slice(&(number as f32).to_le_bytes()),
        ElementsKind::TypedF64 => bytes.copy_from_slice(&number.to_le_bytes()),
        _ => unreachable!("not a typed kind"),
    }
}

impl ElementsKind {
    /// Decode the header representation.
    pub fn from_u32(raw: u32) -> Option<ElementsKind> {
        Some(match raw {
            0 => ElementsKind::None,
            1 => ElementsKind::Int32Dense,
            2 => ElementsKind::DoubleDense,
            3 => ElementsKind::ValueDense,
            4 => ElementsKind::Sparse,
            5 => ElementsKind::TypedI8,
            6 => ElementsKind::TypedU8,
            7 => ElementsKind::TypedI16,
            8 => ElementsKind::TypedU16,
            9 => ElementsKind::TypedI32,
            10 => ElementsKind::TypedU32,
            11 => ElementsKind::TypedF32,
            12 => ElementsKind::TypedF64,
            _ => return None,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_header_offsets_frozen() {
        // The JIT hard-codes these; they must never drift.
        assert_eq!(offset_of!(HeapObject, cell_kind), CELL_KIND_OFFSET as usize);
        assert_eq!(offset_of!(HeapObject, shape_id), SHAPE_ID_OFFSET as usize);
        assert_eq!(
            offset_of!(HeapObject, elements_kind),
            ELEMENTS_KIND_OFFSET as usize
        );
        assert_eq!(
            offset_of!(HeapObject, elements_len),
            ELEMENTS_LEN_OFFSET as usize
        );
        assert_eq!(
            offset_of!(HeapObject, elements_data),
            ELEMENTS_DATA_OFFSET as usize
        );
        assert_eq!(
            offset_of!(HeapObject, overflow_data),
            OVERFLOW_DATA_OFFSET as usize
        );
        assert_eq!(
            offset_of!(HeapObject, inline_slots),
            INLINE_SLOTS_OFFSET as usize
        );
    }

    #[test]
    fn test_put_get_inline() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.put(&registry, "x", Value::int32(1));
        object.put(&registry, "y", Value::int32(2));

        assert_eq!(object.get_own("x").unwrap().as_int32(), 1);
        assert_eq!(object.get_own("y").unwrap().as_int32(), 2);
        assert!(object.get_own("z").is_none());
    }

    #[test]
    fn test_put_replaces_without_transition() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.put(&registry, "x", Value::int32(1));
        let shape_before = object.shape_id();
        object.put(&registry, "x", Value::int32(5));
        assert_eq!(object.shape_id(), shape_before);
        assert_eq!(object.get_own("x").unwrap().as_int32(), 5);
    }

    #[test]
    fn test_overflow_slots() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        for i in 0..(INLINE_SLOTS + 3) {
            object.put(&registry, &format!("p{i}"), Value::int32(i as i32));
        }
        for i in 0..(INLINE_SLOTS + 3) {
            assert_eq!(
                object.get_own(&format!("p{i}")).unwrap().as_int32(),
                i as i32
            );
        }
        assert!(!object.overflow_data.is_null());
    }

    #[test]
    fn test_prototype_chain_get() {
        let registry = ShapeRegistry::new();
        let mut proto = HeapObject::with_prototype(&registry, Value::null());
        proto.put(&registry, "shared", Value::int32(99));

        let mut object = HeapObject::with_prototype(&registry, proto.as_value());
        object.put(&registry, "own", Value::int32(1));

        // SAFETY: proto outlives this scope.
        unsafe {
            assert_eq!(object.get("own").unwrap().as_int32(), 1);
            assert_eq!(object.get("shared").unwrap().as_int32(), 99);
            assert!(object.get("missing").is_none());
        }
    }

    #[test]
    fn test_shape_sharing() {
        let registry = ShapeRegistry::new();
        let mut a = HeapObject::with_prototype(&registry, Value::null());
        let mut b = HeapObject::with_prototype(&registry, Value::null());
        a.put(&registry, "x", Value::int32(1));
        b.put(&registry, "x", Value::int32(2));
        assert_eq!(a.shape_id(), b.shape_id());

        b.put(&registry, "y", Value::int32(3));
        assert_ne!(a.shape_id(), b.shape_id());
    }

    #[test]
    fn test_dense_int32_elements() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.set_elements_int32(vec![10, 20, 30]);

        assert_eq!(object.elements_kind(), ElementsKind::Int32Dense);
        assert_eq!(object.elements_len(), 3);
        assert_eq!(object.element(1).unwrap().as_int32(), 20);
        assert!(object.element(3).is_none());
    }

    #[test]
    fn test_int32_widens_to_double() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.set_elements_int32(vec![1, 2, 3]);
        object.put_element(1, Value::double(1.5));

        assert_eq!(object.elements_kind(), ElementsKind::DoubleDense);
        assert_eq!(object.element(0).unwrap().as_double(), 1.0);
        assert_eq!(object.element(1).unwrap().as_double(), 1.5);
    }

    #[test]
    fn test_out_of_bounds_write_goes_sparse() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.set_elements_int32(vec![1]);
        object.put_element(1000, Value::int32(7));

        assert_eq!(object.elements_kind(), ElementsKind::Sparse);
        assert_eq!(object.element(0).unwrap().as_int32(), 1);
        assert_eq!(object.element(1000).unwrap().as_int32(), 7);
        assert!(object.element(500).is_none());
    }

    #[test]
    fn test_typed_f64_elements() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.set_elements_typed(ElementsKind::TypedF64, 4);

        assert_eq!(object.elements_len(), 4);
        object.put_element(2, Value::double(2.5));
        assert_eq!(object.element(2).unwrap().as_double(), 2.5);
        // Out-of-bounds typed writes are ignored, not sparse-converted.
        object.put_element(10, Value::double(9.0));
        assert_eq!(object.elements_kind(), ElementsKind::TypedF64);
        assert!(object.element(10).is_none());
    }

    #[test]
    fn test_typed_u8_clamps_representation() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.set_elements_typed(ElementsKind::TypedU8, 2);
        object.put_element(0, Value::int32(0x1FF));
        // Saturating conversion, as typed stores do.
        assert_eq!(object.element(0).unwrap().as_int32(), 0xFF);
    }

    #[test]
    fn test_as_value_roundtrip() {
        let registry = ShapeRegistry::new();
        let mut object = HeapObject::with_prototype(&registry, Value::null());
        object.put(&registry, "x", Value::int32(42));
        let cell = object.as_value();
        assert!(cell.is_cell());
        // SAFETY: object is live.
        let recovered = unsafe { HeapObject::from_value(cell) };
        assert_eq!(recovered.get_own("x").unwrap().as_int32(), 42);
    }
}
