//! OSR exits: abandoning a speculative compilation mid-execution and
//! resuming in baseline code at an equivalent program point.

pub mod compiler;
pub mod exit;

pub use compiler::{take_osr_exit, OsrExitOutcome};
pub use exit::{
    ExitContext, ExitDescriptor, ExitState, OptimizedCompilation, RecomputeOp, RecoverSource,
    ValueRecovery,
};
