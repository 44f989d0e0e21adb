//! x64 register definitions, operands, and the baseline register roles.
//!
//! Register types are `Copy` with `#[repr(u8)]` so encodings fall out of
//! the discriminant. The baseline tier deliberately uses a handful of
//! fixed scratch roles instead of an allocator; compilation speed beats
//! code quality in this tier.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x64 general-purpose register with hardware encoding.
///
/// Bits 0-2 go into ModR/M; bit 3 goes into the REX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Bits 0-2 for ModR/M.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP/R12 encode 0b100, which is the SIB escape when used as base.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP/R13 encode 0b101, which means `[disp32]` in mod=00.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    /// Decode an encoding value.
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        match enc {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rcx),
            2 => Some(Gpr::Rdx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsp),
            5 => Some(Gpr::Rbp),
            6 => Some(Gpr::Rsi),
            7 => Some(Gpr::Rdi),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// SSE register for scalar double arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    /// Hardware encoding (0-7; the baseline tier never needs XMM8+).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        false
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// A bitset of general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// The empty set.
    pub const EMPTY: GprSet = GprSet(0);

    /// Add a register (value form, usable in const contexts).
    #[inline]
    pub const fn insert(self, reg: Gpr) -> GprSet {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Membership test.
    #[inline]
    pub const fn contains(self, reg: Gpr) -> bool {
        self.0 & (1 << reg.encoding()) != 0
    }

    /// Number of members.
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate members in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0u8..16).filter_map(move |enc| {
            let reg = Gpr::from_encoding(enc)?;
            self.contains(reg).then_some(reg)
        })
    }
}

// =============================================================================
// Memory Operands
// =============================================================================

/// SIB scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
}

/// A memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: Scale,
    pub disp: i32,
}

impl MemOperand {
    /// `[base + disp]`
    #[inline]
    pub const fn base_disp(base: Gpr, disp: i32) -> Self {
        MemOperand {
            base: Some(base),
            index: None,
            scale: Scale::X1,
            disp,
        }
    }

    /// `[base + index * scale + disp]`
    #[inline]
    pub const fn base_index(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        MemOperand {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }
}

// =============================================================================
// Condition Codes
// =============================================================================

/// x64 condition codes (the low nibble of `0F 8x` / `0F 9x`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveOrEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowOrEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterOrEqual = 0xD,
    LessOrEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    /// The inverse condition.
    #[inline]
    pub const fn inverted(self) -> Condition {
        // Conditions pair up by flipping the low bit.
        match self {
            Condition::Overflow => Condition::NoOverflow,
            Condition::NoOverflow => Condition::Overflow,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::BelowOrEqual => Condition::Above,
            Condition::Above => Condition::BelowOrEqual,
            Condition::Sign => Condition::NoSign,
            Condition::NoSign => Condition::Sign,
            Condition::Parity => Condition::NoParity,
            Condition::NoParity => Condition::Parity,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::LessOrEqual => Condition::Greater,
            Condition::Greater => Condition::LessOrEqual,
        }
    }
}

// =============================================================================
// Calling Convention
// =============================================================================

/// The host C calling convention, as far as the baseline tier needs it.
#[derive(Debug, Clone, Copy)]
pub struct CallingConvention {
    /// Integer argument registers in order.
    pub args: [Gpr; 4],
    /// Return value register.
    pub ret: Gpr,
    /// Callee-saved registers the prologue must preserve if used.
    pub callee_saved: GprSet,
}

impl CallingConvention {
    /// System V AMD64.
    pub const SYSV: CallingConvention = CallingConvention {
        args: [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx],
        ret: Gpr::Rax,
        callee_saved: GprSet::EMPTY
            .insert(Gpr::Rbx)
            .insert(Gpr::R12)
            .insert(Gpr::R13)
            .insert(Gpr::R14)
            .insert(Gpr::R15),
    };

    /// Windows x64.
    pub const WINDOWS: CallingConvention = CallingConvention {
        args: [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9],
        ret: Gpr::Rax,
        callee_saved: GprSet::EMPTY
            .insert(Gpr::Rbx)
            .insert(Gpr::Rsi)
            .insert(Gpr::Rdi)
            .insert(Gpr::R12)
            .insert(Gpr::R13)
            .insert(Gpr::R14)
            .insert(Gpr::R15),
    };

    /// The convention for the current platform.
    pub const fn host() -> Self {
        #[cfg(target_os = "windows")]
        {
            Self::WINDOWS
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self::SYSV
        }
    }

    /// The n-th integer argument register.
    #[inline]
    pub fn arg(&self, index: usize) -> Gpr {
        self.args[index]
    }
}

// =============================================================================
// Scratch Roles
// =============================================================================

/// The baseline tier's fixed register roles.
///
/// These are constants of the tier, not allocation results. The roles
/// avoid every argument register of both ABIs so slow-path call setup
/// never clobbers a live scratch.
#[derive(Debug, Clone, Copy)]
pub struct ScratchRoles {
    /// Primary value register (also the return register).
    pub accumulator: Gpr,
    /// Volatile scratch.
    pub scratch1: Gpr,
    /// Second volatile scratch.
    pub scratch2: Gpr,
    /// Callee-saved register pinned to the VM context pointer.
    pub context: Gpr,
    /// Scalar-double scratch registers.
    pub fp0: Xmm,
    pub fp1: Xmm,
}

impl ScratchRoles {
    /// The role assignment shared by both ABIs.
    pub const HOST: ScratchRoles = ScratchRoles {
        accumulator: Gpr::Rax,
        scratch1: Gpr::R10,
        scratch2: Gpr::R11,
        context: Gpr::R14,
        fp0: Xmm::Xmm0,
        fp1: Xmm::Xmm1,
    };

    #[inline]
    pub const fn host() -> Self {
        Self::HOST
    }
}

// =============================================================================
// Tests
// =============================================================================
