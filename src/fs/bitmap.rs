//! Allocation bitmaps.
//!
//! One bit per allocatable unit: 0 = free, 1 = allocated. The same structure
//! backs the data-block bitmap and the inode bitmap. On disk a bitmap spans
//! one or more typed blocks; in memory the whole map is kept in a [`Vob`] and
//! reconciled against the on-disk copy at mount and after recovery
//! (`free == popcount(0)`).

use crate::errors::StoreResult;
use crate::io::{seal_typed, verify_typed, BlockId, BlockSig, BLOCK_SIZE, TYPED_PAYLOAD_OFF};
use crate::fs::sb::BITS_PER_BITMAP_BLOCK;
use vob::Vob;

/// An in-memory allocation bitmap.
pub(crate) struct Bitmap {
    bits: Vob,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all free.
    pub(crate) fn new_free(len: u64) -> Self {
        let mut bits = Vob::new();
        for _ in 0..len {
            bits.push(false);
        }
        Self { bits }
    }

    /// Rebuilds a bitmap of `len` bits from its sealed on-disk blocks.
    pub(crate) fn from_blocks(blocks: &[(BlockId, Vec<u8>)], len: u64) -> StoreResult<Self> {
        let mut bits = Vob::new();
        'fill: for (block_no, buf) in blocks {
            verify_typed(buf, BlockSig::BITMAP, *block_no)?;
            let payload = &buf[TYPED_PAYLOAD_OFF..];
            for byte in payload {
                for bit in 0..8 {
                    if bits.len() as u64 == len {
                        break 'fill;
                    }
                    bits.push(byte & (1 << bit) != 0);
                }
            }
        }
        debug_assert_eq!(bits.len() as u64, len);
        Ok(Self { bits })
    }

    /// Number of bits tracked.
    pub(crate) fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    /// Whether bit `idx` is allocated.
    pub(crate) fn is_set(&self, idx: u64) -> bool {
        self.bits.get(idx as usize).unwrap_or(false)
    }

    /// Marks bit `idx` allocated. Returns the previous value.
    pub(crate) fn set(&mut self, idx: u64) -> bool {
        let prev = self.is_set(idx);
        self.bits.set(idx as usize, true);
        prev
    }

    /// Marks bit `idx` free. Returns the previous value.
    pub(crate) fn clear(&mut self, idx: u64) -> bool {
        let prev = self.is_set(idx);
        self.bits.set(idx as usize, false);
        prev
    }

    /// Returns the count of free bits.
    pub(crate) fn count_free(&self) -> u64 {
        self.bits.iter_unset_bits(..).count() as u64
    }

    /// Collects up to `want` free bits scanning from `cursor`, wrapping
    /// around once. Bits for which `skip` returns true are passed over.
    pub(crate) fn scan_free(
        &self,
        cursor: u64,
        want: usize,
        mut skip: impl FnMut(u64) -> bool,
    ) -> Vec<u64> {
        let len = self.len() as usize;
        let cursor = if len == 0 { 0 } else { cursor as usize % len };
        let mut found = Vec::with_capacity(want);

        for idx in self
            .bits
            .iter_unset_bits(cursor..)
            .chain(self.bits.iter_unset_bits(..cursor))
        {
            if found.len() == want {
                break;
            }
            if !skip(idx as u64) {
                found.push(idx as u64);
            }
        }
        found
    }

    /// Finds the first run of `count` contiguous free bits at or after
    /// `from`, skipping reserved bits.
    pub(crate) fn find_run(
        &self,
        from: u64,
        count: usize,
        mut skip: impl FnMut(u64) -> bool,
    ) -> Option<u64> {
        let mut run_start: Option<u64> = None;
        let mut run_len = 0usize;
        let mut expect = from;

        for idx in self.bits.iter_unset_bits(from as usize..) {
            let idx = idx as u64;
            if skip(idx) {
                run_start = None;
                run_len = 0;
                expect = idx + 1;
                continue;
            }
            if run_start.is_some() && idx == expect {
                run_len += 1;
            } else {
                run_start = Some(idx);
                run_len = 1;
            }
            expect = idx + 1;
            if run_len == count {
                return run_start;
            }
        }
        None
    }

    /// Finds the tightest run of free bits that still fits `count`,
    /// returning its start. Used under fragmentation pressure.
    pub(crate) fn find_best_run(
        &self,
        count: usize,
        mut skip: impl FnMut(u64) -> bool,
    ) -> Option<u64> {
        let mut best: Option<(u64, usize)> = None;
        let mut run_start: Option<u64> = None;
        let mut run_len = 0usize;
        let mut expect = 0u64;

        let mut close_run = |start: Option<u64>, len: usize, best: &mut Option<(u64, usize)>| {
            if let Some(start) = start {
                if len >= count && best.map_or(true, |(_, blen)| len < blen) {
                    *best = Some((start, len));
                }
            }
        };

        for idx in self.bits.iter_unset_bits(..) {
            let idx = idx as u64;
            if skip(idx) {
                close_run(run_start, run_len, &mut best);
                run_start = None;
                run_len = 0;
                expect = idx + 1;
                continue;
            }
            if run_start.is_some() && idx == expect {
                run_len += 1;
            } else {
                close_run(run_start, run_len, &mut best);
                run_start = Some(idx);
                run_len = 1;
            }
            expect = idx + 1;
        }
        close_run(run_start, run_len, &mut best);

        best.map(|(start, _)| start)
    }

    /// Serializes the bitmap block containing bit range
    /// `[block_idx * BITS_PER_BITMAP_BLOCK, ...)` into a sealed block image.
    pub(crate) fn to_block(&self, block_idx: u64) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let base = block_idx * BITS_PER_BITMAP_BLOCK;
        for off in 0..BITS_PER_BITMAP_BLOCK {
            let idx = base + off;
            if idx >= self.len() {
                break;
            }
            if self.is_set(idx) {
                buf[TYPED_PAYLOAD_OFF + (off / 8) as usize] |= 1 << (off % 8);
            }
        }
        seal_typed(&mut buf, BlockSig::BITMAP);
        buf
    }

    /// The on-disk bitmap block index holding `bit`.
    pub(crate) fn block_of(bit: u64) -> u64 {
        bit / BITS_PER_BITMAP_BLOCK
    }
}

/// Serializes every bitmap block image. Used at format time.
pub(crate) fn all_blocks(bitmap: &Bitmap, start: BlockId) -> Vec<(BlockId, Vec<u8>)> {
    let count = bitmap.len().div_ceil(BITS_PER_BITMAP_BLOCK).max(1);
    (0..count)
        .map(|idx| (BlockId::from(u64::from(start) + idx), bitmap.to_block(idx)))
        .collect()
}

/// Verifies that a stored free count matches the bitmap population.
pub(crate) fn reconcile(bitmap: &Bitmap, stored_free: u64, what: &str) -> (u64, bool) {
    let actual = bitmap.count_free();
    if actual != stored_free {
        log::warn!(
            target: "vectorfs::fs",
            "{what} free counter skew: stored {stored_free}, bitmap says {actual}; trusting the bitmap"
        );
        (actual, true)
    } else {
        (actual, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_wraps_around() {
        let mut bm = Bitmap::new_free(64);
        for idx in 0..32 {
            bm.set(idx);
        }
        // Cursor past the free area still finds free bits by wrapping.
        let found = bm.scan_free(60, 6, |_| false);
        assert_eq!(found, vec![60, 61, 62, 63, 32, 33]);
    }

    #[test]
    fn run_search_respects_reservations() {
        let mut bm = Bitmap::new_free(128);
        bm.set(10);
        // Free run [11..128), but 20 is reserved by a live transaction.
        let run = bm.find_run(0, 8, |idx| idx == 20).unwrap();
        assert_eq!(run, 11);
        let run = bm.find_run(15, 8, |idx| idx == 20).unwrap();
        assert_eq!(run, 21);
    }

    #[test]
    fn best_fit_picks_tightest() {
        let mut bm = Bitmap::new_free(64);
        // Runs: [0..8) free, [8..9) used, [9..12) free, [12..13) used, rest free.
        bm.set(8);
        bm.set(12);
        let start = bm.find_best_run(3, |_| false).unwrap();
        assert_eq!(start, 9);
    }

    #[test]
    fn block_serialization_round_trip() {
        let mut bm = Bitmap::new_free(BITS_PER_BITMAP_BLOCK + 100);
        bm.set(3);
        bm.set(BITS_PER_BITMAP_BLOCK + 1);
        let blocks = all_blocks(&bm, BlockId::from(2));
        assert_eq!(blocks.len(), 2);
        let back = Bitmap::from_blocks(&blocks, bm.len()).unwrap();
        assert!(back.is_set(3));
        assert!(!back.is_set(4));
        assert!(back.is_set(BITS_PER_BITMAP_BLOCK + 1));
        assert_eq!(back.count_free(), bm.count_free());
    }

    #[test]
    fn double_clear_is_idempotent() {
        let mut bm = Bitmap::new_free(16);
        bm.set(5);
        assert!(bm.clear(5));
        assert!(!bm.clear(5));
        assert_eq!(bm.count_free(), 16);
    }
}
