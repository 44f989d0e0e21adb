//! Property-access site descriptors.
//!
//! One `AccessSite` exists per `GetProp`/`SetProp` bytecode. It records
//! the patch locations the main pass emitted (a shape-compare immediate,
//! a convertible base load, a payload displacement, and the guard branch
//! that escalation retargets), plus the site's runtime specialization
//! state. Patch locations never move once emitted; only their targets
//! and immediates are rewritten, always through the patch buffer.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use onyx_core::bytecode::Program;
use onyx_core::profile::ValueProfile;
use onyx_runtime::ShapeId;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::x64::{Disp32Patch, Imm32Patch, LoadPatch, NearJumpPatch};
use crate::ic::state::AccessStateKind;
use crate::ic::stub::{PolyEntry, StubRoutine};
use crate::patch::CodeRegion;

/// Which way the access goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Get,
    Put,
}

/// Runtime specialization state guarded by the site lock.
pub struct SiteState {
    /// Shapes covered, and how far escalation has gone.
    pub kind: AccessStateKind,
    /// The shape the patched *inline* fast path handles, if any. Only a
    /// self-slot monomorphic access can live inline; everything else is
    /// stub-borne.
    pub inline_shape: Option<ShapeId>,
    /// Stub-borne cases, most recently added first.
    pub entries: SmallVec<[PolyEntry; 4]>,
    /// The installed dispatcher stub the guard branch targets, if any.
    pub stub: Option<Arc<StubRoutine>>,
    /// Superseded stubs, kept alive until the owning code is torn down
    /// (installed code may still be mid-flight inside one).
    pub retired: Vec<Arc<StubRoutine>>,
    /// Misses that could not be cached (missing property, invalidated
    /// chain). Enough of them tips the site to generic.
    pub uncacheable_misses: u32,
}

/// One property-access inline cache.
pub struct AccessSite {
    pub kind: AccessKind,
    /// Property name, resolved from the identifier table at compile time.
    pub name: Arc<str>,
    pub bytecode_offset: u32,

    /// Patch location of the shape-compare immediate.
    pub shape_guard: Imm32Patch,
    /// The guard's miss branch; escalation retargets it at stubs or,
    /// terminally, back at the slow path.
    pub guard_branch: NearJumpPatch,
    /// The convertible base load (overflow pointer ↔ lea of the object).
    pub base: LoadPatch,
    /// Displacement of the payload load/store.
    pub payload: Disp32Patch,
    /// Native offset stubs rejoin at (just past the payload access).
    pub rejoin_offset: u32,

    /// Native offset of the cold path, bound during the slow-case pass.
    slow_entry_offset: AtomicU32,
    /// Installed code region, set at install time.
    region_base: AtomicUsize,
    region_len: AtomicUsize,

    /// The program this site belongs to (profiles, identifiers).
    pub program: Arc<Program>,

    state: Mutex<SiteState>,
}

impl AccessSite {
    /// Create a descriptor with placeholder runtime fields. The compiler
    /// fills patch locations; `install` pins the code region.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: AccessKind,
        name: Arc<str>,
        bytecode_offset: u32,
        shape_guard: Imm32Patch,
        guard_branch: NearJumpPatch,
        base: LoadPatch,
        payload: Disp32Patch,
        rejoin_offset: u32,
        program: Arc<Program>,
    ) -> Box<Self> {
        Box::new(AccessSite {
            kind,
            name,
            bytecode_offset,
            shape_guard,
            guard_branch,
            base,
            payload,
            rejoin_offset,
            slow_entry_offset: AtomicU32::new(u32::MAX),
            region_base: AtomicUsize::new(0),
            region_len: AtomicUsize::new(0),
            program,
            state: Mutex::new(SiteState {
                kind: AccessStateKind::Unspecialized,
                inline_shape: None,
                entries: SmallVec::new(),
                stub: None,
                retired: Vec::new(),
                uncacheable_misses: 0,
            }),
        })
    }

    /// Record the cold-path entry (slow-case pass).
    pub fn set_slow_entry(&self, offset: u32) {
        self.slow_entry_offset.store(offset, Ordering::Release);
    }

    /// Pin the installed code region (install time).
    pub fn install(&self, region: CodeRegion) {
        self.region_base.store(region.base(), Ordering::Release);
        self.region_len.store(region.len(), Ordering::Release);
    }

    /// The installed code region.
    ///
    /// # Panics
    /// Before installation: a miss cannot precede installation.
    pub fn region(&self) -> CodeRegion {
        let base = self.region_base.load(Ordering::Acquire);
        assert!(base != 0, "access site used before installation");
        CodeRegion::new(base, self.region_len.load(Ordering::Acquire))
    }

    /// Absolute address of the cold-path entry.
    pub fn slow_entry_addr(&self) -> usize {
        let offset = self.slow_entry_offset.load(Ordering::Acquire);
        assert!(offset != u32::MAX, "slow path not yet emitted");
        self.region().base() + offset as usize
    }

    /// Absolute address of the rejoin point.
    pub fn rejoin_addr(&self) -> usize {
        self.region().base() + self.rejoin_offset as usize
    }

    /// The value profile of this site, if the opcode records one.
    pub fn profile(&self) -> Option<&ValueProfile> {
        self.program.value_profile(self.bytecode_offset)
    }

    /// Lock the specialization state.
    pub fn state(&self) -> parking_lot::MutexGuard<'_, SiteState> {
        self.state.lock()
    }

    /// Current escalation state (for tests and tracing).
    pub fn state_kind(&self) -> AccessStateKind {
        self.state.lock().kind.clone()
    }
}

// SAFETY: raw addresses inside (region, stub chain entries) are stable
// installed-code and heap addresses; all mutation goes through the site
// lock and the patch lock.
unsafe impl Send for AccessSite {}
unsafe impl Sync for AccessSite {}

impl std::fmt::Debug for AccessSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSite")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("bc", &self.bytecode_offset)
            .field("state", &self.state.lock().kind)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use onyx_core::bytecode::{Opcode, ProgramBuilder};

    fn test_site() -> Box<AccessSite> {
        let mut b = ProgramBuilder::new(2);
        let name = b.add_identifier("x");
        b.emit(Opcode::GetProp, [0, 1, name as i32, 0]);
        b.emit(Opcode::Return, [0, 0, 0, 0]);
        let program = b.finish();
        let name = program.identifier(name).clone();
        AccessSite::new(
            AccessKind::Get,
            name,
            0,
            Imm32Patch(10),
            NearJumpPatch(20),
            LoadPatch { instr: 30 },
            Disp32Patch(40),
            50,
            program,
        )
    }

    #[test]
    fn test_site_starts_unspecialized() {
        let site = test_site();
        assert_eq!(site.state_kind(), AccessStateKind::Unspecialized);
        assert!(site.profile().is_some());
    }

    #[test]
    #[should_panic(expected = "used before installation")]
    fn test_region_before_install_is_fatal() {
        let site = test_site();
        let _ = site.region();
    }

    #[test]
    fn test_addresses_after_install() {
        let site = test_site();
        site.install(CodeRegion::new(0x10000, 0x1000));
        site.set_slow_entry(0x200);
        assert_eq!(site.slow_entry_addr(), 0x10200);
        assert_eq!(site.rejoin_addr(), 0x10032);
    }
}
