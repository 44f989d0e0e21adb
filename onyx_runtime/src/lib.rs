//! Runtime object model for the Onyx engine.
//!
//! This crate provides exactly what the inline-cache subsystem needs to
//! know about objects and nothing more:
//! - The hidden-class (shape) model with transitions and watchpoints
//! - Heap objects with a fixed, JIT-visible header layout
//! - Callees (function objects) and their shared executables
//!
//! Property storage layout beyond the header offsets, and garbage
//! collection, are out of scope; objects here are plainly owned.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod function;
pub mod object;
pub mod shape;
pub mod watchpoint;

pub use function::{Callee, Executable};
pub use object::{ElementsKind, HeapObject};
pub use shape::{PropertyFlags, PropertyLookup, Shape, ShapeId, ShapeRegistry};
pub use watchpoint::WatchpointSet;
