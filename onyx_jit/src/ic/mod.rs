//! Self-specializing inline caches.
//!
//! Property-access and call bytecodes compile to patchable fast paths
//! that start in a guaranteed-miss state. The subsystem here reacts to
//! misses: it resolves what actually happened, compiles a specialized
//! stub when one is worth having, and rewrites the installed code
//! through the patch buffer. Escalation is strictly monotonic:
//! unspecialized → monomorphic → polymorphic → generic.

pub mod access_site;
pub mod call_link;
pub mod linker;
pub mod state;
pub mod stub;
pub mod trampoline;

pub use access_site::{AccessKind, AccessSite};
pub use call_link::CallSite;
pub use state::{escalate, AccessStateKind, Escalation, POLYMORPHIC_CACHE_CAPACITY};
pub use stub::StubRoutine;
