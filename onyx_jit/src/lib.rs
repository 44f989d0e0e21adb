//! Baseline JIT compiler for the Onyx engine.
//!
//! This crate lowers bytecode programs to native x64 code and keeps that
//! code honest at runtime:
//! - `backend`: register definitions, instruction encoding, the
//!   assembler, and executable memory
//! - `patch`: the scoped primitive that mutates installed code safely
//! - `baseline`: the three-pass bytecode lowering compiler
//! - `ic`: self-specializing inline caches for property access and calls
//! - `osr`: the exit compiler that lands speculative code back in
//!   baseline frames
//! - `runtime`: the compiler context, generic helpers, and compiled-code
//!   ownership

#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod baseline;
pub mod ic;
pub mod osr;
pub mod patch;
pub mod runtime;

pub use baseline::compiler::{compile_program, BaselineCode, CompileError};
pub use runtime::context::{JitContext, JitOptions, VmContext};
