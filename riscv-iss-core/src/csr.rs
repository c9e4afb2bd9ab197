//! Control and status register file.
//!
//! Address numbering and the `is_valid`/`is_read_only`/`required_privilege_level` rules are
//! grounded on the `specifier` address-space enumeration recovered from the source's CSR-handling
//! unit (the full FFLAGS/FRM/FCSR through TSELECT/TDATA/MCONTEXT sweep). Status-register bitfields
//! use `bitvec` to keep the packed layout readable field-by-field.

use crate::fpu::{ExceptionFlags, RoundingMode};
use crate::PrivilegeLevel;
use bitvec::prelude::*;
use std::collections::HashMap;
use thiserror::Error;

/// CSR addresses this file gives first-class storage to. Addresses not listed here but still
/// `is_valid()` (PMP configuration, unused HPM counters/events, `TSELECT`/`TDATA*`) fall back to
/// generic zero-initialized storage in [`CsrFile::generic`] — real implementations of those exist
/// mainly to be harmlessly read back, which the fallback preserves without hand-enumerating every
/// one.
pub mod addr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;

    pub const CYCLE: u16 = 0xC00;
    pub const TIME: u16 = 0xC01;
    pub const INSTRET: u16 = 0xC02;
    pub const CYCLEH: u16 = 0xC80;
    pub const TIMEH: u16 = 0xC81;
    pub const INSTRETH: u16 = 0xC82;

    pub const SSTATUS: u16 = 0x100;
    pub const SIE: u16 = 0x104;
    pub const STVEC: u16 = 0x105;
    pub const SCOUNTEREN: u16 = 0x106;
    pub const SENVCFG: u16 = 0x10A;
    pub const SSCRATCH: u16 = 0x140;
    pub const SEPC: u16 = 0x141;
    pub const SCAUSE: u16 = 0x142;
    pub const STVAL: u16 = 0x143;
    pub const SIP: u16 = 0x144;
    pub const SATP: u16 = 0x180;

    pub const MVENDORID: u16 = 0xF11;
    pub const MARCHID: u16 = 0xF12;
    pub const MIMPID: u16 = 0xF13;
    pub const MHARTID: u16 = 0xF14;
    pub const MCONFIGPTR: u16 = 0xF15;

    pub const MSTATUS: u16 = 0x300;
    pub const MISA: u16 = 0x301;
    pub const MEDELEG: u16 = 0x302;
    pub const MIDELEG: u16 = 0x303;
    pub const MIE: u16 = 0x304;
    pub const MTVEC: u16 = 0x305;
    pub const MCOUNTEREN: u16 = 0x306;
    pub const MSTATUSH: u16 = 0x310;
    pub const MENVCFG: u16 = 0x30A;
    pub const MENVCFGH: u16 = 0x31A;
    pub const MSECCFG: u16 = 0x747;
    pub const MSECCFGH: u16 = 0x757;

    pub const MSCRATCH: u16 = 0x340;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;
    pub const MTVAL: u16 = 0x343;
    pub const MIP: u16 = 0x344;
    pub const MTINST: u16 = 0x34A;
    pub const MTVAL2: u16 = 0x34B;

    pub const MCYCLE: u16 = 0xB00;
    pub const MINSTRET: u16 = 0xB02;
    pub const MCOUNTINHIBIT: u16 = 0x320;

    pub fn mhpmcounter(n: u8) -> u16 {
        0xB00 + n as u16
    }
    pub fn mhpmevent(n: u8) -> u16 {
        0x320 + n as u16
    }
    pub fn pmpcfg(n: u8) -> u16 {
        0x3A0 + n as u16
    }
    pub fn pmpaddr(n: u8) -> u16 {
        0x3B0 + n as u16
    }
}

/// `mstatus`/`sstatus` field accessors, stored as a single 64-bit word (RV64's `mstatus`, with
/// `sstatus` a read-masked view of the same bits).
#[derive(Debug, Copy, Clone, Default)]
pub struct Status(pub u64);

/// Extension-context status: off, or on with a coarse dirtiness level, per `mstatus.{FS,VS}`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextStatus {
    Off,
    Initial,
    Clean,
    Dirty,
}

impl ContextStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Off,
            1 => Self::Initial,
            2 => Self::Clean,
            _ => Self::Dirty,
        }
    }
    fn to_bits(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Initial => 1,
            Self::Clean => 2,
            Self::Dirty => 3,
        }
    }
}

macro_rules! status_bit {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            self.0.view_bits::<Lsb0>()[$bit]
        }
        pub fn $set(&mut self, value: bool) {
            self.0.view_bits_mut::<Lsb0>().set($bit, value);
        }
    };
}

impl Status {
    status_bit!(sie, set_sie, 1);
    status_bit!(mie, set_mie, 3);
    status_bit!(spie, set_spie, 5);
    status_bit!(ube, set_ube, 6);
    status_bit!(mpie, set_mpie, 7);
    status_bit!(spp, set_spp, 8);
    status_bit!(mprv, set_mprv, 17);
    status_bit!(sum, set_sum, 18);
    status_bit!(mxr, set_mxr, 19);
    status_bit!(tvm, set_tvm, 20);
    status_bit!(tw, set_tw, 21);
    status_bit!(tsr, set_tsr, 22);
    status_bit!(sd, set_sd, 63);

    pub fn mpp(&self) -> PrivilegeLevel {
        let bits: u8 = self.0.view_bits::<Lsb0>()[11..=12].load();
        crate::RawPrivilegeLevel::from_u2(bits)
            .try_into()
            .unwrap_or(PrivilegeLevel::User)
    }

    pub fn set_mpp(&mut self, level: PrivilegeLevel) {
        self.0.view_bits_mut::<Lsb0>()[11..=12].store(level as u8);
    }

    pub fn fs(&self) -> ContextStatus {
        ContextStatus::from_bits(self.0.view_bits::<Lsb0>()[13..=14].load())
    }
    pub fn set_fs(&mut self, status: ContextStatus) {
        self.0.view_bits_mut::<Lsb0>()[13..=14].store(status.to_bits());
    }
    pub fn vs(&self) -> ContextStatus {
        ContextStatus::from_bits(self.0.view_bits::<Lsb0>()[9..=10].load())
    }
    pub fn set_vs(&mut self, status: ContextStatus) {
        self.0.view_bits_mut::<Lsb0>()[9..=10].store(status.to_bits());
    }

    /// The subset of bits visible through `sstatus` (SIE, SPIE, SPP, FS, VS, SUM, MXR, UXL, SD).
    pub const SSTATUS_MASK: u64 = 0x8000_0003_000D_E762;

    pub fn read_sstatus(&self) -> u64 {
        self.0 & Self::SSTATUS_MASK
    }

    pub fn write_sstatus(&mut self, value: u64) {
        self.0 = (self.0 & !Self::SSTATUS_MASK) | (value & Self::SSTATUS_MASK);
    }
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum CsrError {
    #[error("csr {0:#06x} does not exist")]
    Unimplemented(u16),
    #[error("csr {0:#06x} is read-only")]
    ReadOnly(u16),
    #[error("csr {0:#06x} requires privilege level {1} (have {2})")]
    InsufficientPrivilege(u16, PrivilegeLevel, PrivilegeLevel),
    #[error("csr {0:#06x} is gated off by an extension-context status of Off")]
    ExtensionDisabled(u16),
    #[error("csr {0:#06x} is not enabled for the current privilege level by a counter-enable csr")]
    CounterDisabled(u16),
}

/// Bits `[9:8]` of a CSR address: the minimum privilege level required to access it.
fn required_privilege(csr_addr: u16) -> PrivilegeLevel {
    match (csr_addr >> 8) & 0b11 {
        0b00 => PrivilegeLevel::User,
        0b01 => PrivilegeLevel::Supervisor,
        _ => PrivilegeLevel::Machine,
    }
}

/// Bits `[11:10]` of a CSR address: `0b11` marks the CSR read-only.
fn is_read_only(csr_addr: u16) -> bool {
    (csr_addr >> 10) & 0b11 == 0b11
}

#[derive(Debug, Clone)]
pub struct CsrFile {
    status: Status,
    misa: u64,
    medeleg: u64,
    mideleg: u64,
    mie: u64,
    mip: u64,
    mtvec: u64,
    stvec: u64,
    mcounteren: u32,
    scounteren: u32,
    mscratch: u64,
    sscratch: u64,
    mepc: u64,
    sepc: u64,
    mcause: u64,
    scause: u64,
    mtval: u64,
    stval: u64,
    satp: u64,
    menvcfg: u64,
    senvcfg: u64,
    mcycle: u64,
    minstret: u64,
    mcountinhibit: u32,
    fflags: ExceptionFlags,
    frm: RoundingMode,
    hart_id: u64,
    generic: HashMap<u16, u64>,
}

impl CsrFile {
    pub fn new(hart_id: u64, misa: u64) -> Self {
        Self {
            status: Status::default(),
            misa,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mip: 0,
            mtvec: 0,
            stvec: 0,
            mcounteren: 0,
            scounteren: 0,
            mscratch: 0,
            sscratch: 0,
            mepc: 0,
            sepc: 0,
            mcause: 0,
            scause: 0,
            mtval: 0,
            stval: 0,
            satp: 0,
            menvcfg: 0,
            senvcfg: 0,
            mcycle: 0,
            minstret: 0,
            mcountinhibit: 0,
            fflags: ExceptionFlags::default(),
            frm: RoundingMode::RoundNearestEven,
            hart_id,
            generic: HashMap::new(),
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }
    pub fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }
    pub fn mie_bits(&self) -> u64 {
        self.mie
    }
    pub fn mip_bits(&self) -> u64 {
        self.mip
    }
    pub fn set_mip_bits(&mut self, bits: u64) {
        self.mip = bits;
    }
    pub fn medeleg(&self) -> u64 {
        self.medeleg
    }
    pub fn mideleg(&self) -> u64 {
        self.mideleg
    }
    pub fn mtvec(&self) -> u64 {
        self.mtvec
    }
    pub fn stvec(&self) -> u64 {
        self.stvec
    }
    pub fn mepc(&self) -> u64 {
        self.mepc
    }
    pub fn sepc(&self) -> u64 {
        self.sepc
    }
    pub fn set_mepc(&mut self, value: u64) {
        self.mepc = value;
    }
    pub fn set_sepc(&mut self, value: u64) {
        self.sepc = value;
    }
    pub fn set_mcause(&mut self, value: u64) {
        self.mcause = value;
    }
    pub fn set_scause(&mut self, value: u64) {
        self.scause = value;
    }
    pub fn set_mtval(&mut self, value: u64) {
        self.mtval = value;
    }
    pub fn set_stval(&mut self, value: u64) {
        self.stval = value;
    }
    pub fn satp(&self) -> u64 {
        self.satp
    }
    pub fn frm(&self) -> RoundingMode {
        self.frm
    }
    pub fn accrue_fp_flags(&mut self, flags: ExceptionFlags) {
        self.fflags.invalid |= flags.invalid;
        self.fflags.divide_by_zero |= flags.divide_by_zero;
        self.fflags.overflow |= flags.overflow;
        self.fflags.underflow |= flags.underflow;
        self.fflags.inexact |= flags.inexact;
    }

    /// Advances the free-running cycle/instret counters, unless inhibited by `mcountinhibit`.
    pub fn tick(&mut self, retired: bool) {
        if self.mcountinhibit & 0b1 == 0 {
            self.mcycle = self.mcycle.wrapping_add(1);
        }
        if retired && self.mcountinhibit & 0b100 == 0 {
            self.minstret = self.minstret.wrapping_add(1);
        }
    }

    fn counter_enabled(&self, csr_addr: u16, current: PrivilegeLevel) -> bool {
        let bit = csr_addr & 0x1f;
        if current == PrivilegeLevel::Machine {
            return true;
        }
        let s_ok = self.scounteren & (1 << bit) != 0;
        if current == PrivilegeLevel::Supervisor {
            return s_ok;
        }
        // User mode needs both scounteren and mcounteren to permit the access.
        s_ok && (self.mcounteren & (1 << bit) != 0)
    }

    pub fn read(&self, csr_addr: u16, current: PrivilegeLevel) -> Result<u64, CsrError> {
        self.check_privilege(csr_addr, current)?;
        self.check_extension_context(csr_addr)?;
        let value = match csr_addr {
            addr::FFLAGS => self.fflags.to_bits() as u64,
            addr::FRM => self.frm.to_bits() as u64,
            addr::FCSR => (self.frm.to_bits() << 5) as u64 | self.fflags.to_bits() as u64,
            addr::CYCLE | addr::MCYCLE => {
                self.require_counter(csr_addr, current)?;
                self.mcycle
            }
            addr::TIME => {
                self.require_counter(csr_addr, current)?;
                self.mcycle
            }
            addr::INSTRET | addr::MINSTRET => {
                self.require_counter(csr_addr, current)?;
                self.minstret
            }
            addr::CYCLEH | addr::TIMEH => {
                self.require_counter(csr_addr, current)?;
                self.mcycle >> 32
            }
            addr::INSTRETH => {
                self.require_counter(csr_addr, current)?;
                self.minstret >> 32
            }
            addr::SSTATUS => self.status.read_sstatus(),
            addr::SIE => self.mie & self.mideleg,
            addr::SIP => self.mip & self.mideleg,
            addr::STVEC => self.stvec,
            addr::SCOUNTEREN => self.scounteren as u64,
            addr::SENVCFG => self.senvcfg,
            addr::SSCRATCH => self.sscratch,
            addr::SEPC => self.sepc,
            addr::SCAUSE => self.scause,
            addr::STVAL => self.stval,
            addr::SATP => self.satp,
            addr::MVENDORID | addr::MARCHID | addr::MIMPID | addr::MCONFIGPTR => 0,
            addr::MHARTID => self.hart_id,
            addr::MSTATUS => self.status.0,
            addr::MSTATUSH => self.status.0 >> 32,
            addr::MISA => self.misa,
            addr::MEDELEG => self.medeleg,
            addr::MIDELEG => self.mideleg,
            addr::MIE => self.mie,
            addr::MTVEC => self.mtvec,
            addr::MCOUNTEREN => self.mcounteren as u64,
            addr::MENVCFG => self.menvcfg,
            addr::MENVCFGH => self.menvcfg >> 32,
            addr::MSECCFG | addr::MSECCFGH => 0,
            addr::MSCRATCH => self.mscratch,
            addr::MEPC => self.mepc,
            addr::MCAUSE => self.mcause,
            addr::MTVAL => self.mtval,
            addr::MIP => self.mip,
            addr::MTINST | addr::MTVAL2 => 0,
            addr::MCOUNTINHIBIT => self.mcountinhibit as u64,
            _ if (0xB03..=0xB1F).contains(&csr_addr) || (0xC03..=0xC1F).contains(&csr_addr) => {
                self.require_counter(csr_addr, current)?;
                *self.generic.get(&csr_addr).unwrap_or(&0)
            }
            _ if is_valid(csr_addr) => *self.generic.get(&csr_addr).unwrap_or(&0),
            _ => return Err(CsrError::Unimplemented(csr_addr)),
        };
        Ok(value)
    }

    pub fn write(&mut self, csr_addr: u16, value: u64, current: PrivilegeLevel) -> Result<(), CsrError> {
        self.check_privilege(csr_addr, current)?;
        self.check_extension_context(csr_addr)?;
        if is_read_only(csr_addr) {
            return Err(CsrError::ReadOnly(csr_addr));
        }
        match csr_addr {
            addr::FFLAGS => self.fflags = ExceptionFlags::from_bits(value as u32),
            addr::FRM => {
                self.frm = RoundingMode::from_bits(value as u32).unwrap_or(RoundingMode::RoundNearestEven)
            }
            addr::FCSR => {
                self.fflags = ExceptionFlags::from_bits(value as u32 & 0x1f);
                self.frm =
                    RoundingMode::from_bits((value as u32 >> 5) & 0x7).unwrap_or(RoundingMode::RoundNearestEven);
            }
            addr::SSTATUS => self.status.write_sstatus(value),
            addr::SIE => self.mie = (self.mie & !self.mideleg) | (value & self.mideleg),
            addr::SIP => {
                // Only the software-interrupt-pending bits are writable through sip.
                let writable = self.mideleg & 0x222;
                self.mip = (self.mip & !writable) | (value & writable);
            }
            addr::STVEC => self.stvec = value & !0b10,
            addr::SCOUNTEREN => self.scounteren = value as u32,
            addr::SENVCFG => self.senvcfg = value,
            addr::SSCRATCH => self.sscratch = value,
            addr::SEPC => self.sepc = value & !0b1,
            addr::SCAUSE => self.scause = value,
            addr::STVAL => self.stval = value,
            addr::SATP => self.satp = value,
            addr::MSTATUS => self.status.0 = (self.status.0 & 0xFFFF_FFFF_0000_0000) | (value & 0xFFFF_FFFF),
            addr::MSTATUSH => self.status.0 = (self.status.0 & 0xFFFF_FFFF) | (value << 32),
            addr::MISA => { /* implementations may fix MISA; treat as read-only here */ }
            addr::MEDELEG => self.medeleg = value,
            addr::MIDELEG => self.mideleg = value,
            addr::MIE => self.mie = value,
            addr::MTVEC => self.mtvec = value & !0b10,
            addr::MCOUNTEREN => self.mcounteren = value as u32,
            addr::MENVCFG => self.menvcfg = value,
            addr::MENVCFGH => self.menvcfg = (self.menvcfg & 0xFFFF_FFFF) | (value << 32),
            addr::MSECCFG | addr::MSECCFGH => {}
            addr::MSCRATCH => self.mscratch = value,
            addr::MEPC => self.mepc = value & !0b1,
            addr::MCAUSE => self.mcause = value,
            addr::MTVAL => self.mtval = value,
            addr::MIP => {
                // Only the locally-set-able bits (software interrupts) are writable via mip.
                let writable = 0x222u64;
                self.mip = (self.mip & !writable) | (value & writable);
            }
            addr::MTINST | addr::MTVAL2 => {}
            addr::MCOUNTINHIBIT => self.mcountinhibit = value as u32,
            _ if is_valid(csr_addr) => {
                self.generic.insert(csr_addr, value);
            }
            _ => return Err(CsrError::Unimplemented(csr_addr)),
        }
        Ok(())
    }

    /// Implements `csrrs`/`csrrc`/their immediate forms without a redundant read for callers that
    /// already have the old value (the decode/execute loop reads once up front for the
    /// destination register, then calls this to apply the masked update).
    pub fn update(&mut self, csr_addr: u16, current: PrivilegeLevel, f: impl FnOnce(u64) -> u64) -> Result<u64, CsrError> {
        let old = self.read(csr_addr, current)?;
        self.write(csr_addr, f(old), current)?;
        Ok(old)
    }

    fn check_privilege(&self, csr_addr: u16, current: PrivilegeLevel) -> Result<(), CsrError> {
        let required = required_privilege(csr_addr);
        if current < required {
            Err(CsrError::InsufficientPrivilege(csr_addr, required, current))
        } else {
            Ok(())
        }
    }

    fn require_counter(&self, csr_addr: u16, current: PrivilegeLevel) -> Result<(), CsrError> {
        if self.counter_enabled(csr_addr, current) {
            Ok(())
        } else {
            Err(CsrError::CounterDisabled(csr_addr))
        }
    }

    /// `fflags`/`frm`/`fcsr` are only accessible while `mstatus.FS != Off`, per the privileged
    /// spec's rule that an FP CSR access with the FP context disabled raises an illegal
    /// instruction exception exactly like an FP instruction would.
    fn check_extension_context(&self, csr_addr: u16) -> Result<(), CsrError> {
        let is_fp_csr = matches!(csr_addr, addr::FFLAGS | addr::FRM | addr::FCSR);
        if is_fp_csr && self.status.fs() == ContextStatus::Off {
            return Err(CsrError::ExtensionDisabled(csr_addr));
        }
        Ok(())
    }
}

/// Whether `csr_addr` names a defined CSR anywhere in the address space this simulator recognizes
/// (first-class or generically-backed), independent of whether the current privilege level may
/// access it.
pub fn is_valid(csr_addr: u16) -> bool {
    matches!(
        csr_addr,
        addr::FFLAGS
            | addr::FRM
            | addr::FCSR
            | addr::CYCLE
            | addr::TIME
            | addr::INSTRET
            | addr::CYCLEH
            | addr::TIMEH
            | addr::INSTRETH
            | addr::SSTATUS
            | addr::SIE
            | addr::STVEC
            | addr::SCOUNTEREN
            | addr::SENVCFG
            | addr::SSCRATCH
            | addr::SEPC
            | addr::SCAUSE
            | addr::STVAL
            | addr::SIP
            | addr::SATP
            | addr::MVENDORID
            | addr::MARCHID
            | addr::MIMPID
            | addr::MHARTID
            | addr::MCONFIGPTR
            | addr::MSTATUS
            | addr::MISA
            | addr::MEDELEG
            | addr::MIDELEG
            | addr::MIE
            | addr::MTVEC
            | addr::MCOUNTEREN
            | addr::MSTATUSH
            | addr::MENVCFG
            | addr::MENVCFGH
            | addr::MSECCFG
            | addr::MSECCFGH
            | addr::MSCRATCH
            | addr::MEPC
            | addr::MCAUSE
            | addr::MTVAL
            | addr::MIP
            | addr::MTINST
            | addr::MTVAL2
            | addr::MCYCLE
            | addr::MINSTRET
            | addr::MCOUNTINHIBIT
    ) || (0xB03..=0xB1F).contains(&csr_addr)
        || (0xC03..=0xC1F).contains(&csr_addr)
        || (0x323..=0x33F).contains(&csr_addr)
        || (0x3A0..=0x3AF).contains(&csr_addr)
        || (0x3B0..=0x3EF).contains(&csr_addr)
        || matches!(csr_addr, 0x7A0..=0x7A3 | 0x7A8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mstatus_mie_round_trips() {
        let mut status = Status::default();
        status.set_mie(true);
        assert!(status.mie());
        status.set_mie(false);
        assert!(!status.mie());
    }

    #[test]
    fn mpp_round_trips() {
        let mut status = Status::default();
        status.set_mpp(PrivilegeLevel::Supervisor);
        assert_eq!(status.mpp(), PrivilegeLevel::Supervisor);
    }

    #[test]
    fn user_mode_cannot_read_machine_csr() {
        let csr = CsrFile::new(0, 0);
        let err = csr.read(addr::MSTATUS, PrivilegeLevel::User).unwrap_err();
        assert!(matches!(err, CsrError::InsufficientPrivilege(..)));
    }

    #[test]
    fn mhartid_is_read_only() {
        let mut csr = CsrFile::new(3, 0);
        assert_eq!(csr.read(addr::MHARTID, PrivilegeLevel::Machine).unwrap(), 3);
        assert!(matches!(
            csr.write(addr::MHARTID, 9, PrivilegeLevel::Machine),
            Err(CsrError::ReadOnly(_))
        ));
    }

    #[test]
    fn cycle_counter_gated_by_mcounteren() {
        let csr = CsrFile::new(0, 0);
        let err = csr.read(addr::CYCLE, PrivilegeLevel::Supervisor).unwrap_err();
        assert!(matches!(err, CsrError::CounterDisabled(_)));
    }

    #[test]
    fn sie_mirrors_delegated_mie_bits() {
        let mut csr = CsrFile::new(0, 0);
        csr.write(addr::MIDELEG, 0b10, PrivilegeLevel::Machine).unwrap();
        csr.write(addr::MIE, 0b11, PrivilegeLevel::Machine).unwrap();
        assert_eq!(csr.read(addr::SIE, PrivilegeLevel::Supervisor).unwrap(), 0b10);
    }
}
