//! Sv32/Sv39/Sv48 address translation: page-table walk plus a small per-hart TLB.
//!
//! Generalized from the source's Sv32-only `translate_address_common` into a single walker
//! parameterized by [`PagingMode`]'s level count and page-table-entry width, rather than
//! duplicating a near-identical walker per mode.

use crate::interfaces::DataMemory;
use crate::trap::Exception;
use crate::PrivilegeLevel;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PagingMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

impl PagingMode {
    fn levels(self) -> u32 {
        match self {
            PagingMode::Bare => 0,
            PagingMode::Sv32 => 2,
            PagingMode::Sv39 => 3,
            PagingMode::Sv48 => 4,
        }
    }

    /// Bits per page-table entry in memory: 32 for Sv32, 64 for everything else.
    fn pte_bytes(self) -> u64 {
        match self {
            PagingMode::Sv32 => 4,
            _ => 8,
        }
    }

    /// Bits per virtual-page-number segment.
    fn vpn_bits(self) -> u32 {
        match self {
            PagingMode::Sv32 => 10,
            _ => 9,
        }
    }

    fn from_satp_mode(mode: u64, xlen64: bool) -> Option<Self> {
        if xlen64 {
            match mode {
                0 => Some(PagingMode::Bare),
                8 => Some(PagingMode::Sv39),
                9 => Some(PagingMode::Sv48),
                _ => None,
            }
        } else {
            match mode {
                0 => Some(PagingMode::Bare),
                1 => Some(PagingMode::Sv32),
                _ => None,
            }
        }
    }
}

/// `satp`, decoded.
#[derive(Debug, Copy, Clone)]
pub struct Satp {
    pub mode: PagingMode,
    pub asid: u32,
    pub root_ppn: u64,
}

impl Satp {
    pub fn decode(raw: u64, xlen64: bool) -> Self {
        if xlen64 {
            let mode_bits = raw >> 60;
            Self {
                mode: PagingMode::from_satp_mode(mode_bits, true).unwrap_or(PagingMode::Bare),
                asid: ((raw >> 44) & 0xffff) as u32,
                root_ppn: raw & ((1 << 44) - 1),
            }
        } else {
            let mode_bits = raw >> 31;
            Self {
                mode: PagingMode::from_satp_mode(mode_bits, false).unwrap_or(PagingMode::Bare),
                asid: ((raw >> 22) & 0x1ff) as u32,
                root_ppn: raw & ((1 << 22) - 1),
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// Page-table-entry permission/status bits, shared bit positions across Sv32/Sv39/Sv48.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct PteFlags(u64);

impl PteFlags {
    const V: u64 = 1 << 0;
    const R: u64 = 1 << 1;
    const W: u64 = 1 << 2;
    const X: u64 = 1 << 3;
    const U: u64 = 1 << 4;
    const G: u64 = 1 << 5;
    const A: u64 = 1 << 6;
    const D: u64 = 1 << 7;

    fn from_bits_truncate(raw: u64) -> Self {
        Self(raw & 0xff)
    }

    fn bits(self) -> u64 {
        self.0
    }

    fn contains(self, bit: u64) -> bool {
        self.0 & bit == bit
    }

    fn intersects(self, mask: u64) -> bool {
        self.0 & mask != 0
    }
}

#[derive(Debug, Copy, Clone)]
struct TlbEntry {
    vpn: u64,
    asid: u32,
    global: bool,
    ppn: u64,
    flags: u64,
    level: u32,
}

/// Small fully-associative per-hart TLB: few enough entries that flushes stay cheap, large enough
/// to amortize repeated walks of the same page.
pub struct Mmu {
    entries: Vec<TlbEntry>,
    capacity: usize,
}

impl Mmu {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn flush(&mut self, addr: Option<u64>, asid: Option<u32>) {
        match (addr, asid) {
            (None, None) => self.entries.clear(),
            (Some(addr), None) => self.entries.retain(|e| e.vpn != addr >> 12),
            (None, Some(asid)) => self.entries.retain(|e| e.global || e.asid != asid),
            (Some(addr), Some(asid)) => {
                self.entries
                    .retain(|e| !(e.vpn == addr >> 12 && (e.global || e.asid == asid)))
            }
        }
    }

    fn lookup(&self, vpn: u64, asid: u32) -> Option<&TlbEntry> {
        self.entries
            .iter()
            .find(|e| e.vpn == vpn && (e.global || e.asid == asid))
    }

    fn insert(&mut self, entry: TlbEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Translates `vaddr` to a physical address, walking the page table on a TLB miss.
    ///
    /// `mstatus_sum`/`mstatus_mxr` and `effective_privilege` implement the SUM/MXR permission
    /// overrides and the `mstatus.MPRV`-redirected effective privilege level a caller has already
    /// resolved.
    #[allow(clippy::too_many_arguments)]
    pub fn translate(
        &mut self,
        mem: &mut impl DataMemory,
        satp: Satp,
        kind: AccessKind,
        vaddr: u64,
        effective_privilege: PrivilegeLevel,
        sum: bool,
        mxr: bool,
    ) -> Result<u64, Exception> {
        if satp.mode == PagingMode::Bare || effective_privilege == PrivilegeLevel::Machine {
            return Ok(vaddr);
        }

        let page_offset = vaddr & 0xfff;
        let vpn = vaddr >> 12;

        if let Some(entry) = self.lookup(vpn, satp.asid) {
            let flags = PteFlags::from_bits_truncate(entry.flags);
            check_permission(flags, kind, effective_privilege, sum, mxr).map_err(|_| fault_for(kind))?;
            if flags.contains(PteFlags::A) && (kind != AccessKind::Store || flags.contains(PteFlags::D)) {
                let ppn = entry.ppn;
                let super_mask = (1u64 << (entry.level * satp.mode.vpn_bits())) - 1;
                let paddr = ((ppn & !super_mask) << 12) | (vpn & super_mask) << 12 | page_offset;
                return Ok(paddr);
            }
            // Stale accessed/dirty bookkeeping: fall through to a full walk, which will refresh it.
        }

        let (paddr, ppn, flags, level) = walk(mem, satp, vaddr, kind, effective_privilege, sum, mxr)?;
        self.insert(TlbEntry {
            vpn,
            asid: satp.asid,
            global: PteFlags::from_bits_truncate(flags).contains(PteFlags::G),
            ppn,
            flags,
            level,
        });
        Ok(paddr)
    }
}

fn fault_for(kind: AccessKind) -> Exception {
    match kind {
        AccessKind::Fetch => Exception::InstructionPageFault,
        AccessKind::Load => Exception::LoadPageFault,
        AccessKind::Store => Exception::StorePageFault,
    }
}

fn check_permission(
    flags: PteFlags,
    kind: AccessKind,
    privilege: PrivilegeLevel,
    sum: bool,
    mxr: bool,
) -> Result<(), ()> {
    if privilege == PrivilegeLevel::User && !flags.contains(PteFlags::U) {
        return Err(());
    }
    if privilege == PrivilegeLevel::Supervisor && flags.contains(PteFlags::U) && !sum {
        return Err(());
    }
    let ok = match kind {
        AccessKind::Fetch => flags.contains(PteFlags::X),
        AccessKind::Load => flags.contains(PteFlags::R) || (mxr && flags.contains(PteFlags::X)),
        AccessKind::Store => flags.contains(PteFlags::W),
    };
    if ok {
        Ok(())
    } else {
        Err(())
    }
}

/// Walks the page table for `vaddr`, returning `(physical_address, leaf_ppn, leaf_flags, level)`.
fn walk(
    mem: &mut impl DataMemory,
    satp: Satp,
    vaddr: u64,
    kind: AccessKind,
    privilege: PrivilegeLevel,
    sum: bool,
    mxr: bool,
) -> Result<(u64, u64, u64, u32), Exception> {
    let levels = satp.mode.levels();
    let vpn_bits = satp.mode.vpn_bits();
    let pte_bytes = satp.mode.pte_bytes();

    let mut ppn = satp.root_ppn;
    let mut level = levels - 1;
    loop {
        let vpn_i = (vaddr >> (12 + vpn_bits * level)) & ((1 << vpn_bits) - 1);
        let pte_addr = (ppn << 12) + vpn_i * pte_bytes;
        let raw = mem
            .load(pte_addr, pte_bytes as u32)
            .map_err(|_| fault_for(kind))?;
        let flags = PteFlags::from_bits_truncate(raw);

        if !flags.contains(PteFlags::V) || (!flags.contains(PteFlags::R) && flags.contains(PteFlags::W)) {
            return Err(fault_for(kind));
        }

        let is_leaf = flags.intersects(PteFlags::R | PteFlags::X);
        if !is_leaf {
            if level == 0 {
                return Err(fault_for(kind));
            }
            ppn = pte_ppn(raw, satp.mode);
            level -= 1;
            continue;
        }

        check_permission(flags, kind, privilege, sum, mxr).map_err(|_| fault_for(kind))?;

        let leaf_ppn = pte_ppn(raw, satp.mode);
        // A superpage leaf found above level 0 must have its low PPN bits all zero.
        if level > 0 {
            let low_mask = (1u64 << (vpn_bits * level)) - 1;
            if leaf_ppn & low_mask != 0 {
                return Err(fault_for(kind));
            }
        }
        if !flags.contains(PteFlags::A) || (kind == AccessKind::Store && !flags.contains(PteFlags::D)) {
            // A/D update: since this simulator does not model atomic PTE updates across harts,
            // write the updated PTE back directly rather than faulting (the "software managed A/D"
            // alternative the privileged spec also allows).
            let mut updated = raw | PteFlags::A;
            if kind == AccessKind::Store {
                updated |= PteFlags::D;
            }
            let _ = mem.store(pte_addr, pte_bytes as u32, updated);
        }

        let page_offset = vaddr & 0xfff;
        let super_mask = (1u64 << (vpn_bits * level)) - 1;
        let vpn = vaddr >> 12;
        let paddr = ((leaf_ppn & !super_mask) << 12) | ((vpn & super_mask) << 12) | page_offset;
        return Ok((paddr, leaf_ppn, raw, level));
    }
}

fn pte_ppn(raw: u64, mode: PagingMode) -> u64 {
    match mode {
        PagingMode::Sv32 => (raw >> 10) & ((1 << 22) - 1),
        _ => (raw >> 10) & ((1 << 44) - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::Exception;

    struct FlatMemory(Vec<u8>);
    impl DataMemory for FlatMemory {
        fn load(&mut self, addr: u64, len: u32) -> Result<u64, Exception> {
            let mut bytes = [0u8; 8];
            let start = addr as usize;
            bytes[..len as usize].copy_from_slice(&self.0[start..start + len as usize]);
            Ok(u64::from_le_bytes(bytes))
        }
        fn store(&mut self, addr: u64, len: u32, value: u64) -> Result<(), Exception> {
            let bytes = value.to_le_bytes();
            let start = addr as usize;
            self.0[start..start + len as usize].copy_from_slice(&bytes[..len as usize]);
            Ok(())
        }
    }

    fn make_sv39_identity_map() -> FlatMemory {
        // Single root page table at physical 0x1000, one leaf entry at VPN[2]=0 mapping a 1GiB
        // superpage 0..0x4000_0000 identically, RWX+V+A+D, ppn=0.
        let mut mem = vec![0u8; 0x2000];
        let pte: u64 = PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::A | PteFlags::D;
        mem[0x1000..0x1008].copy_from_slice(&pte.to_le_bytes());
        FlatMemory(mem)
    }

    #[test]
    fn bare_mode_is_identity() {
        let mut mem = make_sv39_identity_map();
        let mut mmu = Mmu::new(4);
        let satp = Satp {
            mode: PagingMode::Bare,
            asid: 0,
            root_ppn: 1,
        };
        let pa = mmu
            .translate(&mut mem, satp, AccessKind::Load, 0x1234, PrivilegeLevel::Supervisor, false, false)
            .unwrap();
        assert_eq!(pa, 0x1234);
    }

    #[test]
    fn sv39_superpage_translates() {
        let mut mem = make_sv39_identity_map();
        let mut mmu = Mmu::new(4);
        let satp = Satp {
            mode: PagingMode::Sv39,
            asid: 0,
            root_ppn: 1,
        };
        let pa = mmu
            .translate(&mut mem, satp, AccessKind::Load, 0x2000, PrivilegeLevel::Supervisor, false, false)
            .unwrap();
        assert_eq!(pa, 0x2000);
    }

    #[test]
    fn user_page_rejected_for_supervisor_without_sum() {
        let mut mem = make_sv39_identity_map();
        // Mark the leaf as user-only.
        let pte_addr = 0x1000;
        let mut raw = u64::from_le_bytes(mem.0[pte_addr..pte_addr + 8].try_into().unwrap());
        raw |= PteFlags::U;
        mem.0[pte_addr..pte_addr + 8].copy_from_slice(&raw.to_le_bytes());

        let mut mmu = Mmu::new(4);
        let satp = Satp {
            mode: PagingMode::Sv39,
            asid: 0,
            root_ppn: 1,
        };
        let err = mmu
            .translate(&mut mem, satp, AccessKind::Load, 0x2000, PrivilegeLevel::Supervisor, false, false)
            .unwrap_err();
        assert_eq!(err, Exception::LoadPageFault);
    }

    #[test]
    fn flush_evicts_matching_entry() {
        let mut mem = make_sv39_identity_map();
        let mut mmu = Mmu::new(4);
        let satp = Satp {
            mode: PagingMode::Sv39,
            asid: 0,
            root_ppn: 1,
        };
        mmu.translate(&mut mem, satp, AccessKind::Load, 0x2000, PrivilegeLevel::Supervisor, false, false)
            .unwrap();
        assert!(!mmu.entries.is_empty());
        mmu.flush(None, None);
        assert!(mmu.entries.is_empty());
    }
}
