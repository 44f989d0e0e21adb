//! Program representation: instructions plus out-of-line tables.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bytecode::opcode::Opcode;
use crate::profile::{ArrayProfile, ExecutionCounter, ValueProfile};
use crate::value::Value;

/// A virtual register index into the program's frame.
pub type VirtualReg = u16;

// =============================================================================
// Instruction
// =============================================================================

/// One fixed-width instruction record: an opcode plus four operand slots.
///
/// Operand meanings are per-opcode; see the table in `opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: [i32; 4],
}

impl Instruction {
    /// Build an instruction from up to four operands.
    #[inline]
    pub const fn new(opcode: Opcode, operands: [i32; 4]) -> Self {
        Instruction { opcode, operands }
    }

    /// Operand slot accessor.
    #[inline]
    pub const fn op(&self, slot: usize) -> i32 {
        self.operands[slot]
    }

    /// Operand slot as a virtual register index.
    #[inline]
    pub fn reg(&self, slot: usize) -> VirtualReg {
        debug_assert!(self.operands[slot] >= 0);
        self.operands[slot] as VirtualReg
    }

    /// The jump target, if this is a branch instruction.
    #[inline]
    pub fn jump_target(&self) -> Option<u32> {
        self.opcode
            .jump_target_slot()
            .map(|slot| self.operands[slot] as u32)
    }
}

// =============================================================================
// Switch Tables
// =============================================================================

/// Out-of-line table for a multi-way branch.
///
/// Dense tables (integer and character scrutinees) map a contiguous key
/// range to bytecode targets; string switches go through a hash map and
/// are always dispatched by the generic helper.
#[derive(Debug, Clone)]
pub enum SwitchTable {
    /// Dense jump table over `min..min + targets.len()`.
    DenseImm {
        min: i32,
        targets: Vec<u32>,
        default: u32,
    },
    /// Dense jump table over a character range.
    DenseChar {
        min: u32,
        targets: Vec<u32>,
        default: u32,
    },
    /// Sparse string table, keyed by identifier index.
    String {
        cases: FxHashMap<u32, u32>,
        default: u32,
    },
}

impl SwitchTable {
    /// The default target.
    #[inline]
    pub fn default_target(&self) -> u32 {
        match self {
            SwitchTable::DenseImm { default, .. } => *default,
            SwitchTable::DenseChar { default, .. } => *default,
            SwitchTable::String { default, .. } => *default,
        }
    }

    /// Every bytecode target this table can reach, default included.
    pub fn all_targets(&self) -> Vec<u32> {
        let mut out = match self {
            SwitchTable::DenseImm { targets, .. } => targets.clone(),
            SwitchTable::DenseChar { targets, .. } => targets.clone(),
            SwitchTable::String { cases, .. } => cases.values().copied().collect(),
        };
        out.push(self.default_target());
        out
    }

    /// Resolve a key to its target (reference semantics, used by the
    /// generic helpers and by tests).
    pub fn lookup(&self, key: i64) -> u32 {
        match self {
            SwitchTable::DenseImm {
                min,
                targets,
                default,
            } => {
                let index = key - *min as i64;
                if index >= 0 && (index as usize) < targets.len() {
                    targets[index as usize]
                } else {
                    *default
                }
            }
            SwitchTable::DenseChar {
                min,
                targets,
                default,
            } => {
                let index = key - *min as i64;
                if index >= 0 && (index as usize) < targets.len() {
                    targets[index as usize]
                } else {
                    *default
                }
            }
            SwitchTable::String { cases, default } => {
                if key >= 0 {
                    cases.get(&(key as u32)).copied().unwrap_or(*default)
                } else {
                    *default
                }
            }
        }
    }
}

// =============================================================================
// Program
// =============================================================================

/// An immutable bytecode program for one function/script unit.
///
/// Owns its constant and identifier tables and the per-instruction
/// auxiliary records (profiles, switch tables) keyed by instruction
/// offset. Created before JIT involvement, destroyed when the executable
/// unit is collected.
pub struct Program {
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    identifiers: Vec<Arc<str>>,
    switch_tables: Vec<SwitchTable>,
    value_profiles: FxHashMap<u32, ValueProfile>,
    array_profiles: FxHashMap<u32, ArrayProfile>,
    register_count: u16,
    param_count: u16,
    execution_counter: ExecutionCounter,
}

impl Program {
    /// The instruction stream.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Look up a constant by table index.
    #[inline]
    pub fn constant(&self, index: u32) -> Value {
        self.constants[index as usize]
    }

    /// Look up an identifier by table index.
    #[inline]
    pub fn identifier(&self, index: u32) -> &Arc<str> {
        &self.identifiers[index as usize]
    }

    /// Look up a switch table by index.
    #[inline]
    pub fn switch_table(&self, index: u32) -> &SwitchTable {
        &self.switch_tables[index as usize]
    }

    /// Number of virtual registers the frame needs.
    #[inline]
    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Number of declared parameters, copied into the first virtual
    /// registers on entry.
    #[inline]
    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    /// The value profile at a bytecode offset, if that opcode is profiled.
    #[inline]
    pub fn value_profile(&self, offset: u32) -> Option<&ValueProfile> {
        self.value_profiles.get(&offset)
    }

    /// The array profile at a bytecode offset, if present.
    #[inline]
    pub fn array_profile(&self, offset: u32) -> Option<&ArrayProfile> {
        self.array_profiles.get(&offset)
    }

    /// The tier-up counter for this program.
    #[inline]
    pub fn execution_counter(&self) -> &ExecutionCounter {
        &self.execution_counter
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("instructions", &self.instructions.len())
            .field("constants", &self.constants.len())
            .field("identifiers", &self.identifiers.len())
            .field("register_count", &self.register_count)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for `Program`. The front end (or a test) appends instructions
/// and tables, then `finish` freezes everything, allocating the profile
/// records for each profiled offset.
#[derive(Default)]
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    identifiers: Vec<Arc<str>>,
    switch_tables: Vec<SwitchTable>,
    register_count: u16,
    param_count: u16,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new(register_count: u16) -> Self {
        ProgramBuilder {
            register_count,
            ..Default::default()
        }
    }

    /// Declare the parameter count (defaults to zero).
    pub fn set_param_count(&mut self, count: u16) {
        assert!(count <= self.register_count, "params exceed register file");
        self.param_count = count;
    }

    /// Append an instruction; returns its bytecode offset.
    pub fn emit(&mut self, opcode: Opcode, operands: [i32; 4]) -> u32 {
        let offset = self.instructions.len() as u32;
        self.instructions.push(Instruction::new(opcode, operands));
        offset
    }

    /// Intern a constant; returns its table index.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(existing) = self
            .constants
            .iter()
            .position(|c| c.to_bits() == value.to_bits())
        {
            return existing as u32;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        index
    }

    /// Intern an identifier; returns its table index.
    pub fn add_identifier(&mut self, name: &str) -> u32 {
        if let Some(existing) = self.identifiers.iter().position(|i| &**i == name) {
            return existing as u32;
        }
        let index = self.identifiers.len() as u32;
        self.identifiers.push(Arc::from(name));
        index
    }

    /// Append a switch table; returns its index.
    pub fn add_switch_table(&mut self, table: SwitchTable) -> u32 {
        let index = self.switch_tables.len() as u32;
        self.switch_tables.push(table);
        index
    }

    /// Freeze into an immutable program.
    ///
    /// Jump targets are validated here: a branch to a nonexistent offset
    /// is a front-end bug and panics.
    pub fn finish(self) -> Arc<Program> {
        let len = self.instructions.len() as u32;
        let mut value_profiles = FxHashMap::default();
        let mut array_profiles = FxHashMap::default();

        for (offset, instr) in self.instructions.iter().enumerate() {
            if let Some(target) = instr.jump_target() {
                assert!(target < len, "jump target {target} out of range");
            }
            if instr.opcode.has_value_profile() {
                value_profiles.insert(offset as u32, ValueProfile::new());
            }
            if instr.opcode.has_array_profile() {
                array_profiles.insert(offset as u32, ArrayProfile::new());
            }
        }
        for table in &self.switch_tables {
            for target in table.all_targets() {
                assert!(target < len, "switch target {target} out of range");
            }
        }

        Arc::new(Program {
            instructions: self.instructions,
            constants: self.constants,
            identifiers: self.identifiers,
            switch_tables: self.switch_tables,
            value_profiles,
            array_profiles,
            register_count: self.register_count,
            param_count: self.param_count,
            execution_counter: ExecutionCounter::new(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_basic() {
        let mut b = ProgramBuilder::new(4);
        let k = b.add_constant(Value::int32(42));
        b.emit(Opcode::LoadConst, [0, k as i32, 0, 0]);
        b.emit(Opcode::Return, [0, 0, 0, 0]);
        let program = b.finish();

        assert_eq!(program.instructions().len(), 2);
        assert_eq!(program.constant(k).as_int32(), 42);
        assert_eq!(program.register_count(), 4);
    }

    #[test]
    fn test_constant_interning() {
        let mut b = ProgramBuilder::new(1);
        let a = b.add_constant(Value::int32(7));
        let b2 = b.add_constant(Value::int32(7));
        let c = b.add_constant(Value::int32(8));
        assert_eq!(a, b2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identifier_interning() {
        let mut b = ProgramBuilder::new(1);
        let x = b.add_identifier("x");
        let x2 = b.add_identifier("x");
        let y = b.add_identifier("y");
        assert_eq!(x, x2);
        assert_ne!(x, y);
        b.emit(Opcode::Return, [0, 0, 0, 0]);
        let program = b.finish();
        assert_eq!(&**program.identifier(x), "x");
    }

    #[test]
    fn test_profiles_allocated_per_site() {
        let mut b = ProgramBuilder::new(4);
        b.emit(Opcode::Add, [0, 1, 2, 0]);
        b.emit(Opcode::Mov, [3, 0, 0, 0]);
        b.emit(Opcode::GetElem, [0, 1, 2, 0]);
        b.emit(Opcode::Return, [0, 0, 0, 0]);
        let program = b.finish();

        assert!(program.value_profile(0).is_some());
        assert!(program.value_profile(1).is_none());
        assert!(program.array_profile(2).is_some());
        assert!(program.value_profile(2).is_some());
    }

    #[test]
    #[should_panic(expected = "jump target")]
    fn test_bad_jump_target_panics() {
        let mut b = ProgramBuilder::new(1);
        b.emit(Opcode::Jump, [99, 0, 0, 0]);
        let _ = b.finish();
    }

    #[test]
    fn test_switch_table_lookup() {
        let table = SwitchTable::DenseImm {
            min: 10,
            targets: vec![100, 101, 102],
            default: 7,
        };
        assert_eq!(table.lookup(10), 100);
        assert_eq!(table.lookup(12), 102);
        assert_eq!(table.lookup(13), 7);
        assert_eq!(table.lookup(9), 7);
        assert_eq!(table.lookup(-5), 7);
    }

    #[test]
    fn test_switch_string_lookup() {
        let mut cases = FxHashMap::default();
        cases.insert(0u32, 50u32);
        cases.insert(1, 60);
        let table = SwitchTable::String { cases, default: 9 };
        assert_eq!(table.lookup(0), 50);
        assert_eq!(table.lookup(1), 60);
        assert_eq!(table.lookup(2), 9);
    }
}
