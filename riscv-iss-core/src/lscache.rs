//! Load/Store Cache: a direct-mapped virtual-address-indexed cache of recently validated
//! translations, letting repeat accesses to the same page skip the full MMU walk.
//!
//! Grounded directly on `original_source/vp/src/core/common/lscache.h`: 256 sets
//! (`LSCACHE_SETS = 1 << 8`), index taken from virtual-address bits `[19:12]`, tag from the bits
//! above that, and a packed load/store-valid flag pair per entry (`store_valid` implies
//! `load_valid`). Host-pointer DMI installation and the bus-lock bypass for LR/SC sequences are
//! carried over from the same source file's `try_add_to_cache`/`load`/`store` methods.

use crate::interfaces::DataMemory;

const SETS: usize = 1 << 8;
const INDEX_SHIFT: u64 = 12;
const INDEX_BITS: u64 = 8;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const TAG_SHIFT: u64 = INDEX_SHIFT + INDEX_BITS;

const LOAD_VALID: u8 = 1 << 0;
const STORE_VALID: u8 = (1 << 1) | LOAD_VALID;

fn index_of(vaddr: u64) -> usize {
    ((vaddr >> INDEX_SHIFT) & INDEX_MASK) as usize
}

fn tag_of(vaddr: u64) -> u64 {
    vaddr >> TAG_SHIFT
}

#[derive(Debug, Copy, Clone, Default)]
struct Entry {
    tag: u64,
    valid: u8,
    /// Host pointer to the start of the backing page, if a DMI mapping was available when this
    /// entry was installed.
    host_page: Option<*mut u8>,
}

/// The direct-mapped load/store translation cache.
///
/// One instance guards loads, one guards stores in the original (`LSCache_T<LOAD_VALID_BITS, ...>`
/// vs `<STORE_VALID_BITS, ...>`); here a single cache tracks both flags per entry, since Rust makes
/// that no less type-safe and halves the bookkeeping.
pub struct LsCache {
    entries: Vec<Entry>,
    enabled: bool,
}

impl LsCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: vec![Entry::default(); SETS],
            enabled,
        }
    }

    /// Drops every entry. The conservative fallback for any address-space event (e.g. an ASID
    /// switch) that this cache does not track entry-by-entry.
    pub fn clear(&mut self) {
        for e in &mut self.entries {
            *e = Entry::default();
        }
    }

    /// `fence.vma`: flush the whole table and forward to the backend's own TLB flush, mirroring
    /// `LSCache_T::fence_vma` forwarding to `mem_if->flush_tlb()`.
    pub fn fence_vma(&mut self, mem: &mut impl DataMemory, addr: Option<u64>, asid: Option<u32>) {
        self.clear();
        mem.flush_tlb(addr, asid);
    }

    fn lookup(&self, vaddr: u64, need: u8) -> Option<&Entry> {
        if !self.enabled {
            return None;
        }
        let entry = &self.entries[index_of(vaddr)];
        if entry.tag == tag_of(vaddr) && entry.valid & need == need {
            Some(entry)
        } else {
            None
        }
    }

    fn install(&mut self, vaddr: u64, valid: u8, host_page: Option<*mut u8>) {
        if !self.enabled {
            return;
        }
        let idx = index_of(vaddr);
        let tag = tag_of(vaddr);
        let entry = &mut self.entries[idx];
        if entry.tag == tag {
            entry.valid |= valid;
            if host_page.is_some() {
                entry.host_page = host_page;
            }
        } else {
            *entry = Entry {
                tag,
                valid,
                host_page,
            };
        }
    }

    /// Performs a `len`-byte load from `vaddr`, consulting the cache first and installing a new
    /// entry on a miss that the backend serviced successfully.
    ///
    /// `bus_locked` bypasses the cache entirely: an LR/SC sequence in flight must observe the
    /// backend directly (`lscache.h`'s `is_bus_locked()` guard at the top of `load`/`store`).
    pub fn load(&mut self, mem: &mut impl DataMemory, vaddr: u64, len: u32, bus_locked: bool) -> Result<u64, crate::trap::Exception> {
        if !bus_locked {
            if let Some(entry) = self.lookup(vaddr, LOAD_VALID) {
                if let Some(page) = entry.host_page {
                    let offset = (vaddr & ((1 << INDEX_SHIFT) - 1)) as usize;
                    // SAFETY: `page` was returned by the backend for this exact page and `offset`
                    // is within the page by construction of `index_of`/`TAG_SHIFT`.
                    return Ok(unsafe { read_le(page.add(offset), len) });
                }
            }
        }
        let value = mem.load(vaddr, len)?;
        if !bus_locked {
            let host_page = mem.dmi_page(vaddr);
            self.install(vaddr, LOAD_VALID, host_page);
        }
        Ok(value)
    }

    pub fn store(
        &mut self,
        mem: &mut impl DataMemory,
        vaddr: u64,
        len: u32,
        value: u64,
        bus_locked: bool,
    ) -> Result<(), crate::trap::Exception> {
        if !bus_locked {
            if let Some(entry) = self.lookup(vaddr, STORE_VALID) {
                if let Some(page) = entry.host_page {
                    let offset = (vaddr & ((1 << INDEX_SHIFT) - 1)) as usize;
                    // SAFETY: see `load`.
                    unsafe { write_le(page.add(offset), len, value) };
                    return Ok(());
                }
            }
        }
        mem.store(vaddr, len, value)?;
        if !bus_locked {
            let host_page = mem.dmi_page(vaddr);
            self.install(vaddr, STORE_VALID, host_page);
        }
        Ok(())
    }
}

unsafe fn read_le(ptr: *mut u8, len: u32) -> u64 {
    let mut bytes = [0u8; 8];
    std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), len as usize);
    u64::from_le_bytes(bytes)
}

unsafe fn write_le(ptr: *mut u8, len: u32, value: u64) {
    let bytes = value.to_le_bytes();
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, len as usize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::Exception;

    struct FakeMemory {
        data: Vec<u8>,
        loads: u32,
        stores: u32,
        offer_dmi: bool,
    }

    impl DataMemory for FakeMemory {
        fn load(&mut self, addr: u64, len: u32) -> Result<u64, Exception> {
            self.loads += 1;
            let mut bytes = [0u8; 8];
            let start = addr as usize;
            bytes[..len as usize].copy_from_slice(&self.data[start..start + len as usize]);
            Ok(u64::from_le_bytes(bytes))
        }
        fn store(&mut self, addr: u64, len: u32, value: u64) -> Result<(), Exception> {
            self.stores += 1;
            let bytes = value.to_le_bytes();
            let start = addr as usize;
            self.data[start..start + len as usize].copy_from_slice(&bytes[..len as usize]);
            Ok(())
        }
        fn dmi_page(&mut self, addr: u64) -> Option<*mut u8> {
            if self.offer_dmi {
                let page_start = (addr as usize) & !0xfff;
                Some(self.data[page_start..].as_mut_ptr())
            } else {
                None
            }
        }
    }

    #[test]
    fn miss_then_hit_without_dmi_both_call_backend() {
        let mut mem = FakeMemory {
            data: vec![0u8; 4096],
            loads: 0,
            stores: 0,
            offer_dmi: false,
        };
        let mut cache = LsCache::new(true);
        cache.load(&mut mem, 0x100, 4, false).unwrap();
        cache.load(&mut mem, 0x100, 4, false).unwrap();
        // No DMI pointer was ever offered, so every access still reaches the backend.
        assert_eq!(mem.loads, 2);
    }

    #[test]
    fn store_hit_with_dmi_skips_backend() {
        let mut mem = FakeMemory {
            data: vec![0u8; 4096],
            loads: 0,
            stores: 0,
            offer_dmi: true,
        };
        let mut cache = LsCache::new(true);
        cache.store(&mut mem, 0x100, 4, 0xdead_beef, false).unwrap();
        assert_eq!(mem.stores, 1, "miss must still reach the backend once");
        cache.store(&mut mem, 0x100, 4, 0x1234_5678, false).unwrap();
        assert_eq!(mem.stores, 1, "a DMI hit writes through the host pointer, not the backend");
        assert_eq!(&mem.data[0x100..0x104], &0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn disabled_cache_never_installs() {
        let mut mem = FakeMemory {
            data: vec![0u8; 4096],
            loads: 0,
            stores: 0,
            offer_dmi: false,
        };
        let mut cache = LsCache::new(false);
        cache.load(&mut mem, 0x100, 4, false).unwrap();
        assert!(cache.lookup(0x100, LOAD_VALID).is_none());
    }

    #[test]
    fn fence_vma_clears_entries() {
        let mut mem = FakeMemory {
            data: vec![0u8; 4096],
            loads: 0,
            stores: 0,
            offer_dmi: false,
        };
        let mut cache = LsCache::new(true);
        cache.install(0x2000, LOAD_VALID, None);
        cache.fence_vma(&mut mem, None, None);
        assert!(cache.lookup(0x2000, LOAD_VALID).is_none());
    }

    #[test]
    fn store_valid_implies_load_valid() {
        assert_eq!(STORE_VALID & LOAD_VALID, LOAD_VALID);
    }
}
