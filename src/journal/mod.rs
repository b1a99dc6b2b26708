//! Circular write-ahead journal with group commit.
//!
//! The journal region is the single serialization point for all mutations.
//! A committing transaction hands its shadow images to [`Journal::commit`];
//! the calling thread either becomes the batch leader or waits for one. The
//! leader collects companions for a bounded window, then writes every
//! transaction's `Descriptor` + `Block-data` (+ `Revocation`) records,
//! fences them with `sync`, writes one `Commit` record covering the whole
//! batch and fences again. A transaction is durable exactly when the commit
//! record that lists it is.
//!
//! Committed images stay in an in-memory overlay (the write-back set) until a
//! checkpoint writes them to their home blocks and advances the logical tail.
//! Readers resolve committed state through the overlay first, so in-place
//! home-block content may lag arbitrarily behind commit order.
//!
//! Lock order: fence leadership, then journal state, then allocator state.

pub(crate) mod record;
pub(crate) mod recovery;

use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::alloc::Allocator;
use crate::fs::bitmap::Bitmap;
use crate::fs::sb::Superblock;
use crate::io::{BlockId, Container, BLOCK_SIZE};
use hashbrown::{HashMap, HashSet};
use record::{
    encode_block_list, encode_txn_list, CheckpointPayload, RecordHeader, RecordType,
    RECORD_HEADER_LEN,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

/// Bytes kept free so a checkpoint record can always be appended.
const CHECKPOINT_SLACK: u64 = BLOCK_SIZE as u64;

/// A transaction's contribution to a commit batch.
pub(crate) struct CommitRequest {
    pub(crate) txn_id: u64,
    /// Home-block images, excluding allocation bitmap blocks (those are
    /// materialized by the leader in batch order).
    pub(crate) writes: Vec<(BlockId, Arc<Vec<u8>>)>,
    /// Home blocks freed by this transaction; earlier journaled images of
    /// them must not be replayed.
    pub(crate) revoked: Vec<BlockId>,
    pub(crate) alloc_bits: Vec<u64>,
    pub(crate) free_bits: Vec<u64>,
    pub(crate) alloc_inodes: Vec<u64>,
    pub(crate) free_inodes: Vec<u64>,
}

/// Counters exposed for tests and introspection.
#[derive(Debug, Default)]
pub(crate) struct JournalStats {
    pub(crate) commit_batches: AtomicU64,
    pub(crate) commit_records: AtomicU64,
    pub(crate) txns_committed: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
}

/// Result of a checkpoint, fed back into the superblock by the caller.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CheckpointOutcome {
    pub(crate) watermark_seq: u64,
    pub(crate) tail_off: u64,
    /// Sequence number of the first record at the new tail (the checkpoint
    /// record itself). A recovery scan starting at `tail_off` must expect
    /// exactly this sequence or it would discard everything after it.
    pub(crate) tail_seq: u64,
}

struct JournalState {
    /// Byte offset (relative to the region) of the next record write.
    head_off: u64,
    /// Byte offset of the oldest record still needed for recovery.
    tail_off: u64,
    next_seq: u64,
    live_bytes: u64,
    /// Committed images awaiting checkpoint: home block -> (record seq,
    /// image). Doubles as the read overlay.
    overlay: HashMap<u64, (u64, Arc<Vec<u8>>)>,
}

struct FenceInner {
    queue: Vec<CommitRequest>,
    leader: bool,
    results: HashMap<u64, Result<(), CommitFailure>>,
}

#[derive(Clone, Copy, Debug)]
enum CommitFailure {
    Io(std::io::ErrorKind),
    Full,
}

impl CommitFailure {
    fn into_error(self) -> StoreError {
        match self {
            Self::Io(kind) => StoreError::Io(std::io::Error::from(kind)),
            Self::Full => StoreError::JournalFull,
        }
    }
}

/// The mounted journal.
pub(crate) struct Journal {
    region_start_bytes: u64,
    region_len: u64,
    window: Duration,
    state: spin::Mutex<JournalState>,
    fence: StdMutex<FenceInner>,
    fence_cv: Condvar,
    pub(crate) stats: JournalStats,
    /// Set when a commit-path I/O error leaves the journal contents
    /// undefined; the store is read-only from then on.
    broken: AtomicBool,
}

/// Per-transaction write plan computed before any state is touched.
struct TxnPlan {
    index: usize,
    bytes_needed: u64,
    base_off: u64,
    base_seq: u64,
}

impl Journal {
    pub(crate) fn new(sb: &Superblock, window: Duration, tail_off: u64, next_seq: u64) -> Self {
        Self {
            region_start_bytes: sb.journal_start * BLOCK_SIZE as u64,
            region_len: sb.journal_bytes(),
            window,
            state: spin::Mutex::new(JournalState {
                head_off: tail_off,
                tail_off,
                next_seq,
                live_bytes: 0,
                overlay: HashMap::new(),
            }),
            fence: StdMutex::new(FenceInner {
                queue: Vec::new(),
                leader: false,
                results: HashMap::new(),
            }),
            fence_cv: Condvar::new(),
            stats: JournalStats::default(),
            broken: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Latest committed image of `block`, if it has not been checkpointed
    /// yet.
    pub(crate) fn overlay_get(&self, block: BlockId) -> Option<Arc<Vec<u8>>> {
        self.state
            .lock()
            .overlay
            .get(&u64::from(block))
            .map(|(_, image)| Arc::clone(image))
    }

    /// Whether a transaction journaling `estimated_blocks` images could
    /// commit right now.
    pub(crate) fn has_space_for(&self, estimated_blocks: u64) -> bool {
        let need = estimated_blocks * (BLOCK_SIZE as u64 + RECORD_HEADER_LEN as u64)
            + 2 * RECORD_HEADER_LEN as u64
            + 8 * estimated_blocks
            + 64;
        let state = self.state.lock();
        state.live_bytes + need + CHECKPOINT_SLACK <= self.region_len
    }

    /// Journal occupancy, in percent.
    pub(crate) fn occupancy_percent(&self) -> u8 {
        let state = self.state.lock();
        (state.live_bytes * 100 / self.region_len.max(1)) as u8
    }

    /// Current head offset, for crash-simulation tests that surgically
    /// destroy the most recent record.
    #[cfg(test)]
    pub(crate) fn head_off_for_test(&self) -> u64 {
        self.state.lock().head_off
    }

    /// Commits a transaction through group commit. Returns once the commit
    /// record covering this transaction is durable.
    pub(crate) fn commit(
        &self,
        container: &Container,
        allocator: &Allocator,
        req: CommitRequest,
    ) -> CanFail {
        if self.is_broken() {
            return Err(StoreError::FsCorruption("journal aborted by I/O error"));
        }
        let txn_id = req.txn_id;
        let mut inner = self.fence.lock().unwrap();
        inner.queue.push(req);
        loop {
            if let Some(result) = inner.results.remove(&txn_id) {
                return result.map_err(CommitFailure::into_error);
            }
            if !inner.leader {
                inner.leader = true;
                drop(inner);

                // Collect companions for the group-commit window.
                if !self.window.is_zero() {
                    std::thread::sleep(self.window);
                }
                let batch = {
                    let mut inner = self.fence.lock().unwrap();
                    std::mem::take(&mut inner.queue)
                };
                let results = self.flush_batch(container, allocator, batch);

                let mut guard = self.fence.lock().unwrap();
                guard.leader = false;
                for (id, result) in results {
                    guard.results.insert(id, result);
                }
                self.fence_cv.notify_all();
                inner = guard;
                continue;
            }
            inner = self.fence_cv.wait(inner).unwrap();
        }
    }

    /// Writes one batch of transactions and fences them durable.
    fn flush_batch(
        &self,
        container: &Container,
        allocator: &Allocator,
        batch: Vec<CommitRequest>,
    ) -> Vec<(u64, Result<(), CommitFailure>)> {
        let mut results = Vec::with_capacity(batch.len());
        let mut plans: Vec<TxnPlan> = Vec::with_capacity(batch.len());

        // Phase 1: size every transaction without touching shared state.
        // The bitmap images the leader will materialize are counted from the
        // touched-bit set; their number is deterministic.
        let mut sized: Vec<(usize, u64, usize)> = Vec::with_capacity(batch.len());
        for (index, req) in batch.iter().enumerate() {
            let bitmap_blocks = count_bitmap_blocks(req);
            let writes = req.writes.len() + bitmap_blocks;
            let mut need = (RECORD_HEADER_LEN + 8 + 8 * writes) as u64
                + writes as u64 * (RECORD_HEADER_LEN + BLOCK_SIZE) as u64;
            if !req.revoked.is_empty() {
                need += (RECORD_HEADER_LEN + 8 + 8 * req.revoked.len()) as u64;
            }
            sized.push((index, need, writes));
        }
        let commit_len = (RECORD_HEADER_LEN + 8 + 8 * batch.len()) as u64;

        // Phase 2: reserve offsets and sequence numbers under the state
        // lock. Transactions that no longer fit fail with journal-full and
        // journal nothing.
        let mut commit_slot: Option<(u64, u64)> = None;
        {
            let mut state = self.state.lock();
            for (index, need, writes) in sized {
                if state.live_bytes + need + commit_len + CHECKPOINT_SLACK > self.region_len {
                    results.push((batch[index].txn_id, Err(CommitFailure::Full)));
                    continue;
                }
                let base_off = state.head_off;
                let base_seq = state.next_seq;
                // Descriptor + block-data records + optional revocation.
                let mut record_count = 1 + writes as u64;
                if !batch[index].revoked.is_empty() {
                    record_count += 1;
                }
                state.head_off = (state.head_off + need) % self.region_len;
                state.live_bytes += need;
                state.next_seq += record_count;
                plans.push(TxnPlan {
                    index,
                    bytes_needed: need,
                    base_off,
                    base_seq,
                });
            }
            if !plans.is_empty() {
                commit_slot = Some((state.head_off, state.next_seq));
                state.head_off = (state.head_off + commit_len) % self.region_len;
                state.live_bytes += commit_len;
                state.next_seq += 1;
            }
        }
        let Some((commit_off, commit_seq)) = commit_slot else {
            return results;
        };

        // Phase 3: materialize allocator deltas (batch order), build record
        // bytes and write them.
        let mut overlay_entries: Vec<(BlockId, u64, Arc<Vec<u8>>)> = Vec::new();
        let mut committed_ids: Vec<u64> = Vec::with_capacity(plans.len());
        let mut io_result: Result<(), std::io::ErrorKind> = Ok(());

        for plan in &plans {
            let req = &batch[plan.index];
            let bitmap_images = allocator.apply_commit(
                &req.alloc_bits,
                &req.free_bits,
                &req.alloc_inodes,
                &req.free_inodes,
            );

            let mut writes: Vec<(BlockId, Arc<Vec<u8>>)> = req
                .writes
                .iter()
                .map(|(block, image)| (*block, Arc::clone(image)))
                .collect();
            for (block, image) in bitmap_images {
                writes.push((block, Arc::new(image)));
            }

            if io_result.is_ok() {
                io_result = self.write_txn_records(container, plan, req, &writes);
            }

            let mut seq = plan.base_seq + 1;
            for (block, image) in writes {
                overlay_entries.push((block, seq, image));
                seq += 1;
            }
            committed_ids.push(req.txn_id);
        }

        // Fence 1: all descriptor/data/revocation records durable.
        if io_result.is_ok() {
            io_result = container.sync().map_err(io_kind);
        }

        // Commit record for the whole batch, then fence 2.
        if io_result.is_ok() {
            let payload = encode_txn_list(&committed_ids);
            let header = RecordHeader::new(RecordType::Commit, commit_seq, 0, &payload);
            io_result = self
                .write_wrapped(container, commit_off, &header.to_bytes())
                .and_then(|_| {
                    self.write_wrapped(
                        container,
                        (commit_off + RECORD_HEADER_LEN as u64) % self.region_len,
                        &payload,
                    )
                })
                .map_err(io_kind)
                .and_then(|_| container.sync().map_err(io_kind));
        }

        match io_result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    for (block, seq, image) in overlay_entries {
                        let entry = state.overlay.entry(u64::from(block)).or_insert((0, Arc::clone(&image)));
                        if entry.0 <= seq {
                            *entry = (seq, image);
                        }
                    }
                }
                self.stats.commit_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.commit_records.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .txns_committed
                    .fetch_add(committed_ids.len() as u64, Ordering::Relaxed);
                for id in committed_ids {
                    results.push((id, Ok(())));
                }
            }
            Err(kind) => {
                // The journal contents past the last checkpoint are now
                // undefined; refuse further writes.
                log::error!(
                    target: "vectorfs::journal",
                    "commit batch failed ({kind:?}); journal aborted, store is read-only"
                );
                self.broken.store(true, Ordering::Release);
                for id in committed_ids {
                    results.push((id, Err(CommitFailure::Io(kind))));
                }
            }
        }
        results
    }

    /// Writes one transaction's descriptor, block-data and revocation
    /// records at its reserved offsets.
    fn write_txn_records(
        &self,
        container: &Container,
        plan: &TxnPlan,
        req: &CommitRequest,
        writes: &[(BlockId, Arc<Vec<u8>>)],
    ) -> Result<(), std::io::ErrorKind> {
        let mut off = plan.base_off;
        let mut seq = plan.base_seq;

        let block_list: Vec<BlockId> = writes.iter().map(|(block, _)| *block).collect();
        let descriptor = encode_block_list(&block_list);
        let header = RecordHeader::new(RecordType::Descriptor, seq, req.txn_id, &descriptor);
        self.write_record(container, &mut off, &header, &descriptor)
            .map_err(io_kind)?;
        seq += 1;

        for (_, image) in writes {
            let header = RecordHeader::new(RecordType::BlockData, seq, req.txn_id, image);
            self.write_record(container, &mut off, &header, image)
                .map_err(io_kind)?;
            seq += 1;
        }

        if !req.revoked.is_empty() {
            let payload = encode_block_list(&req.revoked);
            let header = RecordHeader::new(RecordType::Revocation, seq, req.txn_id, &payload);
            self.write_record(container, &mut off, &header, &payload)
                .map_err(io_kind)?;
        }

        debug_assert_eq!(
            (off + self.region_len - plan.base_off) % self.region_len,
            plan.bytes_needed % self.region_len,
        );
        Ok(())
    }

    fn write_record(
        &self,
        container: &Container,
        off: &mut u64,
        header: &RecordHeader,
        payload: &[u8],
    ) -> CanFail {
        self.write_wrapped(container, *off, &header.to_bytes())?;
        *off = (*off + RECORD_HEADER_LEN as u64) % self.region_len;
        self.write_wrapped(container, *off, payload)?;
        *off = (*off + payload.len() as u64) % self.region_len;
        Ok(())
    }

    /// Byte write into the circular region, splitting at the wrap point.
    fn write_wrapped(&self, container: &Container, rel_off: u64, bytes: &[u8]) -> CanFail {
        let rel_off = rel_off % self.region_len;
        let first = ((self.region_len - rel_off) as usize).min(bytes.len());
        container.write_at(self.region_start_bytes + rel_off, &bytes[..first])?;
        if first < bytes.len() {
            container.write_at(self.region_start_bytes, &bytes[first..])?;
        }
        Ok(())
    }

    /// Flushes the write-back overlay in place and advances the logical
    /// tail. The caller is quiesced against concurrent commits by the fence
    /// leadership this function takes.
    pub(crate) fn checkpoint(&self, container: &Container) -> StoreResult<CheckpointOutcome> {
        let mut inner = self.fence.lock().unwrap();
        while inner.leader {
            inner = self.fence_cv.wait(inner).unwrap();
        }
        inner.leader = true;
        drop(inner);

        let result = self.checkpoint_quiesced(container);

        let mut inner = self.fence.lock().unwrap();
        inner.leader = false;
        self.fence_cv.notify_all();
        drop(inner);
        result
    }

    fn checkpoint_quiesced(&self, container: &Container) -> StoreResult<CheckpointOutcome> {
        let (entries, snapshot_head, watermark) = {
            let state = self.state.lock();
            let entries: Vec<(u64, Arc<Vec<u8>>)> = state
                .overlay
                .iter()
                .map(|(block, (_, image))| (*block, Arc::clone(image)))
                .collect();
            (entries, state.head_off, state.next_seq.saturating_sub(1))
        };

        // In-place write-back. Order does not matter: the overlay already
        // holds last-writer-wins images per block.
        for (block, image) in &entries {
            container.write_block(BlockId::from(*block), image)?;
        }
        container.sync()?;

        // Append the checkpoint record and fence it.
        let payload_struct = CheckpointPayload {
            watermark_seq: watermark,
            tail_after: snapshot_head,
        };
        let payload = bytemuck::bytes_of(&payload_struct).to_vec();
        let (record_off, record_seq) = {
            let mut state = self.state.lock();
            let off = state.head_off;
            let seq = state.next_seq;
            state.head_off =
                (state.head_off + (RECORD_HEADER_LEN + payload.len()) as u64) % self.region_len;
            state.next_seq += 1;
            (off, seq)
        };
        let header = RecordHeader::new(RecordType::Checkpoint, record_seq, 0, &payload);
        let mut off = record_off;
        self.write_record(container, &mut off, &header, &payload)?;
        container.sync()?;

        // Reclaim everything up to the snapshot head.
        {
            let mut state = self.state.lock();
            state.tail_off = snapshot_head;
            state.live_bytes =
                (state.head_off + self.region_len - state.tail_off) % self.region_len;
            state.overlay.retain(|_, (seq, _)| *seq > watermark);
        }

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            target: "vectorfs::journal",
            "checkpoint: watermark {watermark}, {} blocks written in place, tail -> {snapshot_head}",
            entries.len()
        );
        Ok(CheckpointOutcome {
            watermark_seq: watermark,
            tail_off: snapshot_head,
            tail_seq: record_seq,
        })
    }
}

fn count_bitmap_blocks(req: &CommitRequest) -> usize {
    let mut block_bm: HashSet<u64> = HashSet::new();
    let mut inode_bm: HashSet<u64> = HashSet::new();
    for bit in req.alloc_bits.iter().chain(req.free_bits.iter()) {
        block_bm.insert(Bitmap::block_of(*bit));
    }
    for ino in req.alloc_inodes.iter().chain(req.free_inodes.iter()) {
        inode_bm.insert(Bitmap::block_of(ino - 1));
    }
    block_bm.len() + inode_bm.len()
}

fn io_kind(err: StoreError) -> std::io::ErrorKind {
    match err {
        StoreError::Io(err) => err.kind(),
        _ => std::io::ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatParams;
    use crate::test_util::mini_parts;
    use std::sync::Arc;

    fn image(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; BLOCK_SIZE])
    }

    fn plain_request(txn_id: u64, block: u64, byte: u8) -> CommitRequest {
        CommitRequest {
            txn_id,
            writes: vec![(BlockId::from(block), image(byte))],
            revoked: Vec::new(),
            alloc_bits: Vec::new(),
            free_bits: Vec::new(),
            alloc_inodes: Vec::new(),
            free_inodes: Vec::new(),
        }
    }

    #[test]
    fn committed_image_visible_in_overlay() {
        let parts = mini_parts("journal-overlay", FormatParams::default());
        let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
        let block = parts.sb.data_start + 3;
        journal
            .commit(&parts.container, &parts.allocator, plain_request(1, block, 0xAB))
            .unwrap();
        let got = journal.overlay_get(BlockId::from(block)).unwrap();
        assert_eq!(got[0], 0xAB);
        assert_eq!(journal.stats.txns_committed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn checkpoint_writes_home_blocks_and_reclaims() {
        let parts = mini_parts("journal-checkpoint", FormatParams::default());
        let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
        let block = parts.sb.data_start + 5;
        journal
            .commit(&parts.container, &parts.allocator, plain_request(1, block, 0x5A))
            .unwrap();
        assert!(journal.occupancy_percent() > 0 || journal.overlay_get(BlockId::from(block)).is_some());

        let outcome = journal.checkpoint(&parts.container).unwrap();
        assert!(outcome.watermark_seq >= 1);
        // The overlay entry is gone and the home block carries the image.
        assert!(journal.overlay_get(BlockId::from(block)).is_none());
        let home = parts.container.read_block(BlockId::from(block)).unwrap();
        assert_eq!(home[100], 0x5A);
    }

    #[test]
    fn group_commit_batches_concurrent_txns() {
        let mut params = FormatParams::default();
        params.journal_blocks = 256;
        let parts = Arc::new(mini_parts("journal-group", params));
        let journal = Arc::new(Journal::new(
            &parts.sb,
            Duration::from_millis(5),
            0,
            1,
        ));

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let journal = Arc::clone(&journal);
                let parts = Arc::clone(&parts);
                std::thread::spawn(move || {
                    for i in 0..4 {
                        let block = parts.sb.data_start + t * 8 + i;
                        journal
                            .commit(
                                &parts.container,
                                &parts.allocator,
                                plain_request(t * 100 + i, block, t as u8),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let txns = journal.stats.txns_committed.load(Ordering::Relaxed);
        let commits = journal.stats.commit_records.load(Ordering::Relaxed);
        assert_eq!(txns, 32);
        assert!(
            commits < txns,
            "expected batching: {commits} commit records for {txns} txns"
        );
    }

    #[test]
    fn journal_full_fails_cleanly() {
        let mut params = FormatParams::default();
        params.journal_blocks = 64;
        let parts = mini_parts("journal-full", params);
        let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);

        // One transaction larger than the region can never fit.
        let writes: Vec<(BlockId, Arc<Vec<u8>>)> = (0..70)
            .map(|i| (BlockId::from(parts.sb.data_start + i), image(1)))
            .collect();
        let req = CommitRequest {
            txn_id: 9,
            writes,
            revoked: Vec::new(),
            alloc_bits: Vec::new(),
            free_bits: Vec::new(),
            alloc_inodes: Vec::new(),
            free_inodes: Vec::new(),
        };
        assert!(matches!(
            journal.commit(&parts.container, &parts.allocator, req),
            Err(StoreError::JournalFull)
        ));
        // Nothing became visible.
        assert!(journal
            .overlay_get(BlockId::from(parts.sb.data_start))
            .is_none());
    }

    #[test]
    fn space_estimation_tracks_occupancy() {
        let mut params = FormatParams::default();
        params.journal_blocks = 64;
        let parts = mini_parts("journal-space", params);
        let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
        assert!(journal.has_space_for(32));
        assert!(!journal.has_space_for(1000));

        for i in 0..20 {
            journal
                .commit(
                    &parts.container,
                    &parts.allocator,
                    plain_request(i, parts.sb.data_start + i, 1),
                )
                .unwrap();
        }
        assert!(journal.occupancy_percent() > 25);
        let before = journal.occupancy_percent();
        journal.checkpoint(&parts.container).unwrap();
        assert!(journal.occupancy_percent() < before);
    }
}
