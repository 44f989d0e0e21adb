//! Callees and executables.
//!
//! A `Callee` is what a call-site inline cache compares: one function
//! object with one captured scope. Closures of the same source function
//! share an `Executable`, which owns the bytecode program and the native
//! entry point once baseline compilation has happened. A call site whose
//! callee changed but whose executable did not is the "closure call"
//! case and keeps a specialized stub; a different executable escalates to
//! the virtual trampoline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use onyx_core::bytecode::Program;
use onyx_core::Value;

use crate::object::CELL_KIND_CALLEE;

/// Byte offset of the raw executable pointer in a callee, for the
/// closure-stub compare the JIT emits.
pub const CALLEE_EXECUTABLE_OFFSET: i32 = 8;
/// Byte offset of the captured scope.
pub const CALLEE_SCOPE_OFFSET: i32 = 16;
/// Byte offset of the native entry point inside an executable, for the
/// virtual-call trampoline's indirect dispatch.
pub const EXECUTABLE_ENTRY_OFFSET: i32 = 0;

// =============================================================================
// Executable
// =============================================================================

/// The compiled unit shared by all closures of one function.
///
/// `#[repr(C)]` with the entry point first: the virtual-call trampoline
/// loads it at a fixed offset.
#[repr(C)]
pub struct Executable {
    /// Native entry point, or 0 while only the interpreter can run this.
    entry_point: AtomicUsize,
    program: Arc<Program>,
}

impl Executable {
    /// Wrap a program.
    pub fn new(program: Arc<Program>) -> Arc<Self> {
        Arc::new(Executable {
            entry_point: AtomicUsize::new(0),
            program,
        })
    }

    /// The bytecode program.
    #[inline]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// The native entry point, if baseline code has been installed.
    #[inline]
    pub fn entry_point(&self) -> Option<usize> {
        match self.entry_point.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Install the native entry point. Later installs win, which is fine
    /// because any published entry point is valid.
    #[inline]
    pub fn set_entry_point(&self, addr: usize) {
        debug_assert!(addr != 0);
        self.entry_point.store(addr, Ordering::Release);
    }

    /// Whether baseline code exists.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.entry_point.load(Ordering::Acquire) != 0
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

// =============================================================================
// Callee
// =============================================================================

/// A function object: one executable plus one captured scope.
///
/// The header is `#[repr(C)]` so call stubs can compare the executable
/// pointer at a fixed offset. Callees must not move while linked into
/// compiled code, so they are always constructed boxed.
#[repr(C)]
pub struct Callee {
    cell_kind: u32,
    _pad: u32,
    executable_raw: *const Executable,
    scope: Value,
    executable: Arc<Executable>,
}

impl Callee {
    /// Create a callee for an executable with a captured scope.
    pub fn new(executable: Arc<Executable>, scope: Value) -> Box<Self> {
        Box::new(Callee {
            cell_kind: CELL_KIND_CALLEE,
            _pad: 0,
            executable_raw: Arc::as_ptr(&executable),
            scope,
            executable,
        })
    }

    /// The shared executable.
    #[inline]
    pub fn executable(&self) -> &Arc<Executable> {
        &self.executable
    }

    /// The captured scope.
    #[inline]
    pub fn scope(&self) -> Value {
        self.scope
    }

    /// Identity of this callee as call-site caches compare it.
    #[inline]
    pub fn identity(&self) -> usize {
        self as *const _ as usize
    }

    /// This callee as a boxed cell value.
    #[inline]
    pub fn as_value(&self) -> Value {
        Value::cell(self as *const _ as *const ())
    }

    /// Recover a callee reference from a cell value.
    ///
    /// # Safety
    /// `value` must be a cell created from a live `Callee` that outlives
    /// `'a`.
    #[inline]
    pub unsafe fn from_value<'a>(value: Value) -> &'a Callee {
        debug_assert!(value.is_cell());
        // SAFETY: caller guarantees the cell points at a live Callee.
        unsafe { &*(value.as_cell() as *const Callee) }
    }

    /// Whether two callees share an executable (the closure-call case).
    #[inline]
    pub fn same_executable(&self, other: &Callee) -> bool {
        self.executable_raw == other.executable_raw
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use onyx_core::bytecode::{Opcode, ProgramBuilder};
    use std::mem::offset_of;

    fn trivial_program() -> Arc<Program> {
        let mut b = ProgramBuilder::new(1);
        b.emit(Opcode::Return, [0, 0, 0, 0]);
        b.finish()
    }

    #[test]
    fn test_header_offsets_frozen() {
        assert_eq!(offset_of!(Callee, cell_kind), 0);
        assert_eq!(
            offset_of!(Callee, executable_raw),
            CALLEE_EXECUTABLE_OFFSET as usize
        );
        assert_eq!(offset_of!(Callee, scope), CALLEE_SCOPE_OFFSET as usize);
        assert_eq!(
            offset_of!(Executable, entry_point),
            EXECUTABLE_ENTRY_OFFSET as usize
        );
    }

    #[test]
    fn test_entry_point_lifecycle() {
        let executable = Executable::new(trivial_program());
        assert!(!executable.is_compiled());
        assert_eq!(executable.entry_point(), None);

        executable.set_entry_point(0x4000);
        assert!(executable.is_compiled());
        assert_eq!(executable.entry_point(), Some(0x4000));
    }

    #[test]
    fn test_closure_identity() {
        let executable = Executable::new(trivial_program());
        let a = Callee::new(executable.clone(), Value::null());
        let b = Callee::new(executable, Value::int32(1));

        // Distinct callees, shared executable.
        assert_ne!(a.identity(), b.identity());
        assert!(a.same_executable(&b));

        let other = Callee::new(Executable::new(trivial_program()), Value::null());
        assert!(!a.same_executable(&other));
    }

    #[test]
    fn test_callee_value_roundtrip() {
        let callee = Callee::new(Executable::new(trivial_program()), Value::null());
        let cell = callee.as_value();
        // SAFETY: callee is live.
        let recovered = unsafe { Callee::from_value(cell) };
        assert_eq!(recovered.identity(), callee.identity());
    }
}
