//! Core data model for the Onyx engine.
//!
//! This crate holds everything the execution tiers agree on by value:
//! - NaN-boxed value encoding (`value`)
//! - The immutable bytecode program model (`bytecode`)
//! - Per-site type/array profiles and tier-up counters (`profile`)
//!
//! Nothing in here allocates executable memory or touches the heap object
//! model; those live in `onyx_runtime` and `onyx_jit`.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod bytecode;
pub mod profile;
pub mod value;

pub use value::Value;
