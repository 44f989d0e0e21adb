//! The bytecode program model.
//!
//! A program is a linear sequence of fixed-width instruction records plus
//! the out-of-line tables they reference: constants, identifiers, switch
//! tables, and per-site profiles. Programs are immutable once built; only
//! the profile records (interior-mutable) change during execution.

pub mod opcode;
pub mod program;

pub use opcode::Opcode;
pub use program::{Instruction, Program, ProgramBuilder, SwitchTable, VirtualReg};
