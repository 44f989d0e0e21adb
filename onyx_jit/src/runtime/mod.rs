//! Compiler context, generic operation helpers, and shared trampolines.

pub mod context;
pub mod helpers;
