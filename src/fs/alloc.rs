//! Block and inode allocation.
//!
//! The allocator owns the in-memory bitmaps. Allocations made inside a live
//! transaction are *reservations*: the bit is withheld from other
//! transactions but the bitmap itself still describes committed state only.
//! At commit the reservation is applied and the affected bitmap blocks are
//! journaled; at abort it simply evaporates. Frees are staged the same way,
//! so a block stays allocated until the freeing transaction commits.
//!
//! Strategies (spec'd per request kind):
//! - *first-fit*: scatter scan from a rotating cursor;
//! - *best-fit*: the tightest contiguous run that fits, for small requests
//!   under fragmentation pressure;
//! - *locality*: scatter scan starting near a caller hint, to colocate file
//!   data;
//! - *aligned*: a contiguous block run, used for vector payload extents and
//!   HNSW node records.

use crate::errors::{StoreError, StoreResult};
use crate::fs::bitmap::Bitmap;
use crate::fs::sb::{Superblock, INODES_PER_BLOCK};
use crate::io::BlockId;
use hashbrown::HashSet;
use spin::Mutex;

/// Allocation placement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Scatter scan from the rotating cursor.
    FirstFit,
    /// Tightest contiguous run that fits.
    BestFit,
    /// Scatter scan near the hint.
    Locality,
    /// Contiguous run, block-aligned by construction.
    Aligned,
}

/// Counters mirrored into the superblock at checkpoint time.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AllocCounters {
    pub(crate) free_blocks: u64,
    pub(crate) free_inodes: u32,
}

struct AllocState {
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
    /// Pool-relative bits held by live transactions.
    reserved_blocks: HashSet<u64>,
    /// Inode bits held by live transactions.
    reserved_inodes: HashSet<u64>,
    free_blocks: u64,
    free_inodes: u32,
    cursor: u64,
    inode_cursor: u64,
}

/// The process-wide allocator for one mounted store.
pub(crate) struct Allocator {
    state: Mutex<AllocState>,
    bitmap_start: u64,
    inode_bitmap_start: u64,
}

impl Allocator {
    pub(crate) fn new(sb: &Superblock, block_bitmap: Bitmap, inode_bitmap: Bitmap) -> Self {
        let free_blocks = block_bitmap.count_free();
        let free_inodes = inode_bitmap.count_free() as u32;
        Self {
            state: Mutex::new(AllocState {
                block_bitmap,
                inode_bitmap,
                reserved_blocks: HashSet::new(),
                reserved_inodes: HashSet::new(),
                free_blocks,
                free_inodes,
                cursor: 0,
                inode_cursor: 0,
            }),
            bitmap_start: sb.bitmap_start,
            inode_bitmap_start: sb.inode_bitmap_start,
        }
    }

    /// Reserves `count` pool-relative block bits for a live transaction.
    ///
    /// All-or-nothing: on `no-space` nothing is reserved.
    pub(crate) fn reserve_blocks(
        &self,
        count: usize,
        hint: u64,
        strategy: Strategy,
    ) -> StoreResult<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        if (state.free_blocks as usize) < count + state.reserved_blocks.len() {
            return Err(StoreError::NoSpace);
        }

        let bits = {
            let AllocState {
                block_bitmap,
                reserved_blocks,
                cursor,
                ..
            } = &mut *state;
            let taken = |idx: u64| reserved_blocks.contains(&idx);
            match strategy {
                Strategy::FirstFit => block_bitmap.scan_free(*cursor, count, taken),
                Strategy::Locality => block_bitmap.scan_free(hint, count, taken),
                Strategy::BestFit => block_bitmap
                    .find_best_run(count, taken)
                    .map(|start| (start..start + count as u64).collect())
                    .unwrap_or_default(),
                Strategy::Aligned => block_bitmap
                    .find_run(0, count, taken)
                    .map(|start| (start..start + count as u64).collect())
                    .unwrap_or_default(),
            }
        };

        if bits.len() < count {
            return Err(StoreError::NoSpace);
        }
        for &bit in &bits {
            state.reserved_blocks.insert(bit);
        }
        if strategy == Strategy::FirstFit {
            state.cursor = bits.last().map(|b| b + 1).unwrap_or(0);
        }
        Ok(bits)
    }

    /// Releases reservations without allocating. Abort path; idempotent.
    pub(crate) fn unreserve_blocks(&self, bits: &[u64]) {
        let mut state = self.state.lock();
        for bit in bits {
            state.reserved_blocks.remove(bit);
        }
    }

    /// Reserves one inode number (1-based).
    ///
    /// The scan cursor advances a whole inode-table block after each
    /// reservation so that freshly created inodes spread across table
    /// blocks instead of piling into one.
    pub(crate) fn reserve_inode(&self) -> StoreResult<u64> {
        let mut state = self.state.lock();
        if state.free_inodes as usize <= state.reserved_inodes.len() {
            return Err(StoreError::NoInode);
        }
        let bit = {
            let AllocState {
                inode_bitmap,
                reserved_inodes,
                inode_cursor,
                ..
            } = &mut *state;
            let found =
                inode_bitmap.scan_free(*inode_cursor, 1, |idx| reserved_inodes.contains(&idx));
            found.first().copied().ok_or(StoreError::NoInode)?
        };
        state.reserved_inodes.insert(bit);
        state.inode_cursor = (bit / INODES_PER_BLOCK as u64 + 1) * INODES_PER_BLOCK as u64;
        if state.inode_cursor >= state.inode_bitmap.len() {
            state.inode_cursor = 0;
        }
        Ok(bit + 1)
    }

    pub(crate) fn unreserve_inode(&self, ino: u64) {
        self.state.lock().reserved_inodes.remove(&(ino - 1));
    }

    /// Applies a committing transaction's allocator delta and serializes the
    /// touched bitmap blocks for journaling.
    ///
    /// Returned images describe committed state only: reservations of other
    /// live transactions are not in the bitmap yet.
    pub(crate) fn apply_commit(
        &self,
        alloc_bits: &[u64],
        free_bits: &[u64],
        alloc_inodes: &[u64],
        free_inodes: &[u64],
    ) -> Vec<(BlockId, Vec<u8>)> {
        let mut state = self.state.lock();
        let mut touched_block_bm = HashSet::new();
        let mut touched_inode_bm = HashSet::new();

        for &bit in alloc_bits {
            state.reserved_blocks.remove(&bit);
            if !state.block_bitmap.set(bit) {
                state.free_blocks -= 1;
            }
            touched_block_bm.insert(Bitmap::block_of(bit));
        }
        for &bit in free_bits {
            if state.block_bitmap.clear(bit) {
                state.free_blocks += 1;
            } else {
                log::warn!(
                    target: "vectorfs::fs",
                    "freeing already-free data block bit {bit}"
                );
            }
            touched_block_bm.insert(Bitmap::block_of(bit));
        }
        for &ino in alloc_inodes {
            let bit = ino - 1;
            state.reserved_inodes.remove(&bit);
            if !state.inode_bitmap.set(bit) {
                state.free_inodes -= 1;
            }
            touched_inode_bm.insert(Bitmap::block_of(bit));
        }
        for &ino in free_inodes {
            let bit = ino - 1;
            if state.inode_bitmap.clear(bit) {
                state.free_inodes += 1;
            } else {
                log::warn!(target: "vectorfs::fs", "freeing already-free inode {ino}");
            }
            touched_inode_bm.insert(Bitmap::block_of(bit));
        }

        let mut images = Vec::with_capacity(touched_block_bm.len() + touched_inode_bm.len());
        for idx in touched_block_bm {
            images.push((
                BlockId::from(self.bitmap_start + idx),
                state.block_bitmap.to_block(idx),
            ));
        }
        for idx in touched_inode_bm {
            images.push((
                BlockId::from(self.inode_bitmap_start + idx),
                state.inode_bitmap.to_block(idx),
            ));
        }
        images
    }

    /// Current committed counters.
    pub(crate) fn counters(&self) -> AllocCounters {
        let state = self.state.lock();
        AllocCounters {
            free_blocks: state.free_blocks,
            free_inodes: state.free_inodes,
        }
    }

    /// Recomputes the free counters from bitmap population. Called at mount
    /// and after recovery; the bitmap is authoritative.
    pub(crate) fn reconcile(&self) -> AllocCounters {
        let mut state = self.state.lock();
        let free_blocks = state.block_bitmap.count_free();
        let free_inodes = state.inode_bitmap.count_free() as u32;
        if free_blocks != state.free_blocks || free_inodes != state.free_inodes {
            log::warn!(
                target: "vectorfs::fs",
                "allocator counter skew repaired: blocks {} -> {free_blocks}, inodes {} -> {free_inodes}",
                state.free_blocks,
                state.free_inodes,
            );
        }
        state.free_blocks = free_blocks;
        state.free_inodes = free_inodes;
        AllocCounters {
            free_blocks,
            free_inodes,
        }
    }

    /// Test hook for the bitmap-reconciliation scenario: force the in-memory
    /// counter to a wrong value.
    #[cfg(test)]
    pub(crate) fn corrupt_free_blocks_counter(&self, value: u64) {
        self.state.lock().free_blocks = value;
    }

    /// Whether an inode number is allocated in committed state.
    pub(crate) fn inode_allocated(&self, ino: u64) -> bool {
        self.state.lock().inode_bitmap.is_set(ino - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatParams;

    fn test_allocator(data_blocks: u64, inodes: u64) -> Allocator {
        let sb = Superblock::build(262_144, &FormatParams::default(), [0u8; 16]).unwrap();
        Allocator::new(
            &sb,
            Bitmap::new_free(data_blocks),
            Bitmap::new_free(inodes),
        )
    }

    #[test]
    fn exhaustion_leaves_bitmap_unchanged() {
        let alloc = test_allocator(8, 16);
        let got = alloc.reserve_blocks(4, 0, Strategy::FirstFit).unwrap();
        assert_eq!(got.len(), 4);
        // 4 remain free but reserved+4 requested exceeds them.
        assert!(matches!(
            alloc.reserve_blocks(8, 0, Strategy::FirstFit),
            Err(StoreError::NoSpace)
        ));
        // Nothing leaked: the 4 survivors are still reservable.
        let rest = alloc.reserve_blocks(4, 0, Strategy::FirstFit).unwrap();
        assert_eq!(rest.len(), 4);
        assert_eq!(alloc.counters().free_blocks, 8);
    }

    #[test]
    fn aligned_runs_are_contiguous() {
        let alloc = test_allocator(64, 16);
        let first = alloc.reserve_blocks(3, 0, Strategy::FirstFit).unwrap();
        alloc.apply_commit(&first, &[], &[], &[]);
        let run = alloc.reserve_blocks(8, 0, Strategy::Aligned).unwrap();
        for pair in run.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn abort_returns_reservations() {
        let alloc = test_allocator(16, 16);
        let bits = alloc.reserve_blocks(16, 0, Strategy::FirstFit).unwrap();
        assert!(alloc.reserve_blocks(1, 0, Strategy::FirstFit).is_err());
        alloc.unreserve_blocks(&bits);
        assert_eq!(
            alloc.reserve_blocks(16, 0, Strategy::FirstFit).unwrap().len(),
            16
        );
    }

    #[test]
    fn double_free_warns_but_keeps_count() {
        let alloc = test_allocator(16, 16);
        let bits = alloc.reserve_blocks(2, 0, Strategy::FirstFit).unwrap();
        alloc.apply_commit(&bits, &[], &[], &[]);
        assert_eq!(alloc.counters().free_blocks, 14);
        alloc.apply_commit(&[], &bits, &[], &[]);
        assert_eq!(alloc.counters().free_blocks, 16);
        // Freeing again must not inflate the counter.
        alloc.apply_commit(&[], &bits, &[], &[]);
        assert_eq!(alloc.counters().free_blocks, 16);
    }

    #[test]
    fn inode_allocations_spread_across_table_blocks() {
        let alloc = test_allocator(16, 256);
        let a = alloc.reserve_inode().unwrap();
        let b = alloc.reserve_inode().unwrap();
        let c = alloc.reserve_inode().unwrap();
        let per_block = INODES_PER_BLOCK as u64;
        assert_ne!((a - 1) / per_block, (b - 1) / per_block);
        assert_ne!((b - 1) / per_block, (c - 1) / per_block);
    }

    #[test]
    fn reconcile_trusts_bitmap() {
        let alloc = test_allocator(32, 16);
        let bits = alloc.reserve_blocks(4, 0, Strategy::FirstFit).unwrap();
        alloc.apply_commit(&bits, &[], &[], &[]);
        alloc.corrupt_free_blocks_counter(999);
        let counters = alloc.reconcile();
        assert_eq!(counters.free_blocks, 28);
    }
}
