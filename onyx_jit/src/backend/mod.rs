//! Native code generation backends.
//!
//! Only x64 is implemented; the baseline tier's fixed scratch-register
//! discipline is a per-target constant, not an allocation problem.

pub mod x64;
