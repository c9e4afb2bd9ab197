#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub mod csr;
pub mod dbbcache;
pub mod decode;
pub mod fpu;
pub mod hart;
pub mod interfaces;
pub mod lscache;
pub mod mmu;
pub mod registers;
pub mod trap;
pub mod vector;

/// Width of the integer register file and program counter: either 32 or 64 bits.
///
/// Most of this crate stores XLEN-wide values in a `u64` regardless of `Xlen`, sign- or
/// zero-extending on read/write at the boundary. This mirrors how the register file of a real
/// RV32 hart is a strict subset of an RV64 one, and keeps a single code path for both widths.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Truncates/sign-extends `value` as if stored in an `XLEN`-wide register.
    pub fn sext(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as i32 as i64 as u64,
            Xlen::Rv64 => value,
        }
    }

    /// Masks `value` down to the bits that fit in an `XLEN`-wide register, without sign extension.
    pub fn mask(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as u64,
            Xlen::Rv64 => value,
        }
    }
}

/// Bitmap of the optional ISA extensions a [`Config`] enables.
///
/// Unset bits make the decoder treat the corresponding encodings as `UNDEF`, per the instruction
/// decoder's contract.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExtensionSet {
    pub m: bool,
    pub a: bool,
    pub f: bool,
    pub d: bool,
    pub c: bool,
    pub v: bool,
    pub s: bool,
    pub u: bool,
    pub n: bool,
}

impl ExtensionSet {
    /// `M A F D C S U`, the common "IMAFDC" Linux-capable baseline, without the vector or
    /// user-level-interrupt (`N`) extensions.
    pub const RV_GC: Self = Self {
        m: true,
        a: true,
        f: true,
        d: true,
        c: true,
        v: false,
        s: true,
        u: true,
        n: false,
    };

    /// No optional extensions at all: plain RV32I/RV64I running only in machine mode.
    pub const NONE: Self = Self {
        m: false,
        a: false,
        f: false,
        d: false,
        c: false,
        v: false,
        s: false,
        u: false,
        n: false,
    };
}

/// Per-operation cycle costs charged by the DBBCache when retiring an [`crate::decode::OpId`].
///
/// Not architectural: implementers may pick their own values. The defaults mirror the source's
/// "memory-access = 4, multiply/divide = 8, others = 1".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CycleCosts {
    pub default: u32,
    pub memory_access: u32,
    pub multiply_divide: u32,
}

impl Default for CycleCosts {
    fn default() -> Self {
        Self {
            default: 1,
            memory_access: 4,
            multiply_divide: 8,
        }
    }
}

/// Construction-time configuration for a [`crate::hart::Hart`].
///
/// Mirrors `core::Config`'s shape, extended with the knobs this crate's ambient stack calls for:
/// extension gating, cache enable flags, the cycle-cost table, and the WFI-blocks-execution switch
/// used for headless benchmarking.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    pub xlen: Xlen,
    pub hart_id: u64,
    pub extensions: ExtensionSet,
    pub reset_vector: u64,
    pub nmi_vector: u64,
    pub support_misaligned_memory_access: bool,
    pub dbbcache_enabled: bool,
    pub lscache_enabled: bool,
    pub cycle_costs: CycleCosts,
    /// If `false`, `WFI` never actually blocks; used for headless/benchmark runs (distilled §5).
    pub wfi_blocks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            hart_id: 0,
            extensions: ExtensionSet::RV_GC,
            reset_vector: 0x8000_0000,
            nmi_vector: 0,
            support_misaligned_memory_access: false,
            dbbcache_enabled: true,
            lscache_enabled: true,
            cycle_costs: CycleCosts::default(),
            wfi_blocks: true,
        }
    }
}

/// List of all possible privilege levels for RISC-V.
///
/// Same as [`PrivilegeLevel`] except that it allows specifying the reserved privilege level `2`.
/// This can be useful in case a minimum required privilege level is specified as a 2-bit value,
/// since that value itself may be a reserved privilege level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    /// Privilege level `0b10` is reserved in the base ISA. When using the hypervisor extension,
    /// this becomes the Hypervisor privilege level.
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Convert a 2-bit value into a [`RawPrivilegeLevel`].
    /// Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            3 => Self::Machine,
            _ => panic!("out of range u2 used"),
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved)
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

/// List of defined privilege levels for RISC-V.
///
/// > The machine level has the highest privileges and is the only mandatory privilege level for a
/// > RISC-V hardware platform. Code run in machine-mode (M-mode) is usually inherently trusted, as
/// > it has low-level access to the machine implementation. M-mode can be used to manage secure
/// > execution environments on RISC-V. User-mode (U-mode) and supervisor-mode (S-mode) are intended
/// > for conventional application and operating system usage respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PartialEq<PrivilegeLevel> for RawPrivilegeLevel {
    fn eq(&self, other: &PrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialOrd<PrivilegeLevel> for RawPrivilegeLevel {
    fn partial_cmp(&self, other: &PrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl PartialOrd<RawPrivilegeLevel> for PrivilegeLevel {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl From<PrivilegeLevel> for RawPrivilegeLevel {
    fn from(value: PrivilegeLevel) -> Self {
        match value {
            PrivilegeLevel::User => Self::User,
            PrivilegeLevel::Supervisor => Self::Supervisor,
            PrivilegeLevel::Machine => Self::Machine,
        }
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

#[derive(Error, Debug)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

pub mod unit {
    //! Collection of the units in which memory can be addressed (in bytes).

    pub const BYTE: u32 = 1;
    pub const HALFWORD: u32 = 2;
    pub const WORD: u32 = 4;
    pub const DOUBLEWORD: u32 = 8;
    pub const QUADWORD: u32 = 16;
}

/// Address alignment ranging from no alignment (`1`) to `1 << 31` alignment.
// Maintains the invariant that self.0 is a power of two, or 0 (meaning 1 << 32).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    pub const BYTE: Self = Self(1);
    pub const HALFWORD: Self = Self(2);
    pub const WORD: Self = Self(4);
    pub const DOUBLEWORD: Self = Self(8);
    pub const QUADWORD: Self = Self(16);

    /// Creates the natural alignment for a unit of size `size`. Returns `None` if `size` is not a
    /// power of two.
    pub fn natural_for_size(size: u32) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size as u64))
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: u64) -> bool {
        address & self.0.wrapping_sub(1) == 0
    }
}
