//! The compiler context and the per-execution VM context.
//!
//! All mutable per-process JIT state (the patch lock, the trampoline
//! pool, compiled-code ownership, statistics) lives in an explicitly
//! constructed `JitContext` that callers pass around. There are no
//! process-wide singletons; two contexts in one process are fully
//! independent (and tests rely on that).
//!
//! `VmContext` is the small `#[repr(C)]` record generated code holds in
//! its pinned context register: the exception slot and the unwind
//! bookkeeping live at fixed offsets.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use onyx_core::Value;
use onyx_runtime::ShapeRegistry;
use parking_lot::ReentrantMutex;

use crate::ic::trampoline::TrampolinePool;

/// Byte offset of the pending-exception slot in `VmContext`.
pub const VM_EXCEPTION_OFFSET: i32 = 0;
/// Byte offset of the unwind bytecode-offset slot.
pub const VM_UNWIND_BC_OFFSET: i32 = 8;

// =============================================================================
// Options and statistics
// =============================================================================

/// Tunables for the baseline tier.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Emit profiling record stores in the main pass.
    pub profiling_enabled: bool,
    /// OSR exits through one descriptor before the whole optimized
    /// compilation is thrown away.
    pub osr_failure_threshold: u32,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            profiling_enabled: true,
            osr_failure_threshold: 10,
        }
    }
}

/// Aggregate counters, cheap enough to keep on in release builds.
#[derive(Debug, Default)]
pub struct JitStats {
    pub programs_compiled: AtomicU64,
    pub code_bytes: AtomicU64,
    pub patches_applied: AtomicU64,
    pub ic_misses: AtomicU64,
    pub stubs_compiled: AtomicU64,
    pub exit_thunks_compiled: AtomicU64,
    pub deopts_scheduled: AtomicU64,
}

impl JitStats {
    #[inline]
    pub fn record_patch(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ic_miss(&self) {
        self.ic_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stub(&self) {
        self.stubs_compiled.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// JitContext
// =============================================================================

/// Everything the compiler and the inline caches share.
pub struct JitContext {
    /// The shape model this context compiles against.
    pub shapes: Arc<ShapeRegistry>,
    /// Compile-time options.
    pub options: JitOptions,
    /// The single synchronization point for code mutation. Reentrant
    /// because linking a call can trigger a nested compile-and-link.
    patch_lock: ReentrantMutex<()>,
    /// Shared trampolines, one per operation kind, compiled lazily.
    pub trampolines: TrampolinePool,
    /// Compiled baseline code, keyed by program address. Owning the Arcs
    /// here is what keeps installed entry points alive.
    pub(crate) code_map: DashMap<usize, Arc<crate::baseline::compiler::BaselineCode>>,
    /// Counters.
    pub stats: JitStats,
}

impl JitContext {
    /// Create a context over a shape registry.
    pub fn new(shapes: Arc<ShapeRegistry>) -> Arc<Self> {
        Arc::new(JitContext {
            shapes,
            options: JitOptions::default(),
            patch_lock: ReentrantMutex::new(()),
            trampolines: TrampolinePool::new(),
            code_map: DashMap::new(),
            stats: JitStats::default(),
        })
    }

    /// Create a context with custom options.
    pub fn with_options(shapes: Arc<ShapeRegistry>, options: JitOptions) -> Arc<Self> {
        Arc::new(JitContext {
            shapes,
            options,
            patch_lock: ReentrantMutex::new(()),
            trampolines: TrampolinePool::new(),
            code_map: DashMap::new(),
            stats: JitStats::default(),
        })
    }

    /// Hold the patch lock for the duration of a code mutation.
    #[inline]
    pub fn lock_patches(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.patch_lock.lock()
    }

    /// Already-compiled baseline code for a program, if any.
    pub fn compiled_code(
        &self,
        program_key: usize,
    ) -> Option<Arc<crate::baseline::compiler::BaselineCode>> {
        self.code_map.get(&program_key).map(|entry| entry.clone())
    }
}

// =============================================================================
// VmContext
// =============================================================================

/// Per-execution state generated code addresses at fixed offsets.
#[repr(C)]
pub struct VmContext {
    /// Pending exception (boxed value bits), or 0 for none.
    exception: AtomicU64,
    /// Bytecode offset recorded by the unwind path ("where was I").
    unwind_bc: AtomicU32,
    _pad: u32,
    /// The owning compiler context. Not JIT-visible.
    jit: Arc<JitContext>,
}

impl VmContext {
    /// Create a VM context bound to a compiler context.
    pub fn new(jit: Arc<JitContext>) -> Box<Self> {
        Box::new(VmContext {
            exception: AtomicU64::new(0),
            unwind_bc: AtomicU32::new(0),
            _pad: 0,
            jit,
        })
    }

    /// The owning compiler context.
    #[inline]
    pub fn jit(&self) -> &Arc<JitContext> {
        &self.jit
    }

    /// Record a thrown value. The zero encoding is reserved for "no
    /// exception", which is safe because thrown values are always cells
    /// or specials.
    #[inline]
    pub fn throw(&self, value: Value) {
        debug_assert!(value.to_bits() != 0, "cannot throw the zero encoding");
        self.exception.store(value.to_bits(), Ordering::Release);
    }

    /// Whether an exception is pending.
    #[inline]
    pub fn has_exception(&self) -> bool {
        self.exception.load(Ordering::Acquire) != 0
    }

    /// Take and clear the pending exception.
    #[inline]
    pub fn take_exception(&self) -> Option<Value> {
        let bits = self.exception.swap(0, Ordering::AcqRel);
        (bits != 0).then(|| Value::from_bits(bits))
    }

    /// The bytecode offset the unwind path recorded.
    #[inline]
    pub fn unwind_bc(&self) -> u32 {
        self.unwind_bc.load(Ordering::Acquire)
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
    fn test_vm_context_offsets_frozen() {
        assert_eq!(offset_of!(VmContext, exception), VM_EXCEPTION_OFFSET as usize);
        assert_eq!(offset_of!(VmContext, unwind_bc), VM_UNWIND_BC_OFFSET as usize);
    }

    #[test]
    fn test_exception_lifecycle() {
        let jit = JitContext::new(Arc::new(ShapeRegistry::new()));
        let vm = VmContext::new(jit);
        assert!(!vm.has_exception());

        vm.throw(Value::int32(7));
        assert!(vm.has_exception());
        assert_eq!(vm.take_exception().unwrap().as_int32(), 7);
        assert!(!vm.has_exception());
        assert!(vm.take_exception().is_none());
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = JitContext::new(Arc::new(ShapeRegistry::new()));
        let b = JitContext::new(Arc::new(ShapeRegistry::new()));
        a.stats.record_ic_miss();
        assert_eq!(a.stats.ic_misses.load(Ordering::Relaxed), 1);
        assert_eq!(b.stats.ic_misses.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_patch_lock_is_reentrant() {
        let jit = JitContext::new(Arc::new(ShapeRegistry::new()));
        let _outer = jit.lock_patches();
        let _inner = jit.lock_patches();
    }
}
