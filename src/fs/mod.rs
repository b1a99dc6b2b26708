//! The store: mount, format, checkpoint and the object-level API.
//!
//! [`Store`] is the root handle; every piece of state is reachable from it
//! and nothing lives in process globals. A mount validates the superblock
//! (primary, then backup), replays the journal, reconciles the allocator
//! against the bitmaps, and spins up two background tasks: the checkpoint
//! timer and the post-recovery ANN integrity check. Mutations go through
//! [`Store::begin`]; reads resolve committed state through the journal
//! overlay and the block cache.

pub(crate) mod alloc;
pub(crate) mod bitmap;
pub(crate) mod dir;
pub(crate) mod inode;
pub(crate) mod sb;

use crate::cache::{BlockCache, MetaCache};
use crate::config::{FormatParams, StoreConfig};
use crate::errors::{CanFail, StoreError, StoreResult};
use crate::io::{BlockId, BlockSig, Container, BLOCK_SIZE};
use crate::journal::{recovery, Journal};
use crate::txn::{Coordinator, Isolation, Transaction};
use crate::vector::distance::Metric;
use crate::vector::hnsw::node::GraphHeader;
use crate::vector::hnsw::{self, GraphState, HnswStats, ValidateReport};
use crate::vector::{self, VectorDescriptor, VectorId};
use alloc::Allocator;
use bitmap::Bitmap;
use dir::DirEntry;
use inode::{FileMode, InodeNo, InodeRecord, INODE_SIZE};
use sb::{Superblock, INODES_PER_BLOCK, NODE_SLOTS_PER_BLOCK, VECTOR_SLOTS_PER_BLOCK};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Lock-free copy of the superblock geometry, fixed for a mount's lifetime.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    pub(crate) total_blocks: u64,
    pub(crate) inode_table_start: u64,
    pub(crate) inode_count: u32,
    pub(crate) vector_index_start: u64,
    pub(crate) vector_capacity: u64,
    pub(crate) hnsw_start: u64,
    pub(crate) node_index_start: u64,
    pub(crate) node_capacity: u64,
    pub(crate) data_start: u64,
    pub(crate) data_blocks: u64,
}

impl Geometry {
    fn from_sb(sb: &Superblock) -> Self {
        Self {
            total_blocks: sb.total_blocks,
            inode_table_start: sb.inode_table_start,
            inode_count: sb.inode_count,
            vector_index_start: sb.vector_index_start,
            vector_capacity: sb.vector_capacity(),
            hnsw_start: sb.hnsw_start,
            node_index_start: sb.node_index_start(),
            node_capacity: sb.node_capacity(),
            data_start: sb.data_start,
            data_blocks: sb.data_blocks,
        }
    }

    /// Table block and byte offset of an inode slot.
    pub(crate) fn inode_slot(&self, ino: InodeNo) -> StoreResult<(BlockId, usize)> {
        let raw = u64::from(ino);
        if raw == 0 || raw > self.inode_count as u64 {
            return Err(StoreError::InvalidArgument("inode number out of range"));
        }
        let idx = raw - 1;
        let block = self.inode_table_start + idx / INODES_PER_BLOCK as u64;
        let offset = (idx % INODES_PER_BLOCK as u64) as usize * INODE_SIZE;
        Ok((BlockId::from(block), offset))
    }

    /// Index block and byte offset of a vector index slot.
    pub(crate) fn vector_slot(&self, id: VectorId) -> StoreResult<(BlockId, usize)> {
        let raw = u64::from(id);
        if raw == 0 || raw > self.vector_capacity {
            return Err(StoreError::InvalidArgument("vector id out of range"));
        }
        let idx = raw - 1;
        let block = self.vector_index_start + idx / VECTOR_SLOTS_PER_BLOCK;
        let offset = (idx % VECTOR_SLOTS_PER_BLOCK) as usize * vector::VECTOR_INDEX_ENTRY;
        Ok((BlockId::from(block), offset))
    }

    /// Node-index block and byte offset of an HNSW index slot.
    pub(crate) fn node_slot(&self, id: VectorId) -> StoreResult<(BlockId, usize)> {
        let raw = u64::from(id);
        if raw == 0 || raw > self.node_capacity {
            return Err(StoreError::InvalidArgument("vector id out of range"));
        }
        let idx = raw - 1;
        let block = self.node_index_start + idx / NODE_SLOTS_PER_BLOCK;
        let offset = crate::io::TYPED_PAYLOAD_OFF
            + (idx % NODE_SLOTS_PER_BLOCK) as usize * hnsw::node::NODE_INDEX_ENTRY;
        Ok((BlockId::from(block), offset))
    }
}

/// A consistent way to read blocks: either committed state or a
/// transaction's read-your-writes view.
pub(crate) trait BlockView {
    fn view_block(&self, block: BlockId) -> StoreResult<Arc<Vec<u8>>>;

    /// Reads a typed metadata block. The CRC is verified when the image
    /// comes cold off the container; overlay, cache and shadow images were
    /// produced sealed by this process.
    fn view_typed(&self, block: BlockId, sig: BlockSig) -> StoreResult<Arc<Vec<u8>>>;

    fn geometry(&self) -> &Geometry;

    /// A metadata cache serving this view, if committed values are safe to
    /// share through it.
    fn meta_cache(&self) -> Option<&MetaCache> {
        None
    }
}

/// Everything a mounted store shares between its handle, its transactions
/// and its background tasks.
pub(crate) struct StoreShared {
    pub(crate) container: Container,
    pub(crate) geometry: Geometry,
    pub(crate) sb: spin::RwLock<Superblock>,
    pub(crate) allocator: Allocator,
    pub(crate) journal: Journal,
    pub(crate) coordinator: Coordinator,
    pub(crate) block_cache: BlockCache,
    pub(crate) meta_cache: MetaCache,
    pub(crate) graph: GraphState,
    pub(crate) config: StoreConfig,
    metric: Metric,
    next_vector_id: AtomicU64,
    mount_generation: u64,
    read_only: AtomicBool,
    degraded: AtomicBool,
    in_checkpoint: AtomicBool,
    last_checkpoint: spin::Mutex<Instant>,
    shutdown: AtomicBool,
}

impl BlockView for StoreShared {
    fn view_block(&self, block: BlockId) -> StoreResult<Arc<Vec<u8>>> {
        self.read_block_committed(block)
    }

    fn view_typed(&self, block: BlockId, sig: BlockSig) -> StoreResult<Arc<Vec<u8>>> {
        self.read_block_committed_typed(block, sig)
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn meta_cache(&self) -> Option<&MetaCache> {
        Some(&self.meta_cache)
    }
}

impl BlockView for Transaction {
    fn view_block(&self, block: BlockId) -> StoreResult<Arc<Vec<u8>>> {
        self.read_block_view(block)
    }

    fn view_typed(&self, block: BlockId, sig: BlockSig) -> StoreResult<Arc<Vec<u8>>> {
        if let Some(shadow) = self.shadow_of(block) {
            return Ok(shadow);
        }
        self.shared.read_block_committed_typed(block, sig)
    }

    fn geometry(&self) -> &Geometry {
        &self.shared.geometry
    }
}

impl StoreShared {
    /// Committed state of a block: journal overlay first, then the block
    /// cache, then the container.
    pub(crate) fn read_block_committed(&self, block: BlockId) -> StoreResult<Arc<Vec<u8>>> {
        if let Some(image) = self.journal.overlay_get(block) {
            return Ok(image);
        }
        if let Some(image) = self.block_cache.get(u64::from(block)) {
            return Ok(image);
        }
        let image = Arc::new(self.container.read_block(block)?);
        self.block_cache.insert(u64::from(block), Arc::clone(&image));
        Ok(image)
    }

    /// Committed state of a typed metadata block. Cold container reads are
    /// checksum-verified before anything sees them.
    pub(crate) fn read_block_committed_typed(
        &self,
        block: BlockId,
        sig: BlockSig,
    ) -> StoreResult<Arc<Vec<u8>>> {
        if let Some(image) = self.journal.overlay_get(block) {
            return Ok(image);
        }
        if let Some(image) = self.block_cache.get(u64::from(block)) {
            return Ok(image);
        }
        let image = Arc::new(self.container.read_typed(block, sig)?);
        self.block_cache.insert(u64::from(block), Arc::clone(&image));
        Ok(image)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire) || self.journal.is_broken()
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.mount_generation
    }

    pub(crate) fn default_metric(&self) -> Metric {
        self.metric
    }

    /// Hands out the next vector id. Ids are never reused, even when the
    /// allocation later aborts.
    pub(crate) fn take_vector_id(&self) -> StoreResult<VectorId> {
        let cap = self.geometry.vector_capacity.min(self.geometry.node_capacity);
        let id = self.next_vector_id.fetch_add(1, Ordering::Relaxed);
        if id > cap {
            return Err(StoreError::NoSpace);
        }
        Ok(VectorId::from(id))
    }

    /// Upper bound (exclusive) of assigned vector ids.
    pub(crate) fn peek_vector_id(&self) -> u64 {
        self.next_vector_id.load(Ordering::Relaxed)
    }

    /// Post-commit hook: force a checkpoint when journal occupancy crosses
    /// the configured watermark.
    pub(crate) fn after_commit(self: &Arc<Self>) {
        if self.journal.occupancy_percent() >= self.config.checkpoint_watermark_percent
            && !self.in_checkpoint.load(Ordering::Acquire)
        {
            if let Err(err) = self.checkpoint() {
                log::error!(target: "vectorfs::fs", "watermark checkpoint failed: {err}");
            }
        }
    }

    /// Flushes committed state in place, compacts tombstoned vectors and
    /// persists the superblock. See the journal module for the quiescing
    /// rules.
    pub(crate) fn checkpoint(self: &Arc<Self>) -> CanFail {
        if self
            .in_checkpoint
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self.checkpoint_inner();
        self.in_checkpoint.store(false, Ordering::Release);
        result
    }

    fn checkpoint_inner(self: &Arc<Self>) -> CanFail {
        if !self.is_read_only() {
            if let Err(err) = self.compact_vectors() {
                // Compaction is housekeeping; a conflict just waits for the
                // next checkpoint.
                log::warn!(target: "vectorfs::fs", "vector compaction skipped: {err}");
            }
        }

        let outcome = self.journal.checkpoint(&self.container)?;
        let counters = self.allocator.counters();

        let mut sb = self.sb.write();
        sb.journal_tail_off = outcome.tail_off;
        sb.journal_seq = outcome.tail_seq;
        sb.free_blocks = counters.free_blocks;
        sb.free_inodes = counters.free_inodes;
        sb.next_vector_id = self.peek_vector_id();
        let primary = sb.to_block();
        drop(sb);

        // Primary first, fenced, then the backup: the two copies are never
        // in flight together.
        self.container
            .write_block(BlockId::PRIMARY_SUPERBLOCK, &primary)?;
        self.container.sync()?;
        self.container
            .write_block(BlockId::BACKUP_SUPERBLOCK, &primary)?;
        self.container.sync()?;

        *self.last_checkpoint.lock() = Instant::now();
        Ok(())
    }

    /// Reclaims the extents and index slots of tombstoned vectors.
    fn compact_vectors(self: &Arc<Self>) -> CanFail {
        let mut txn = Transaction::new(Arc::clone(self), Isolation::ReadCommitted);
        let mut reclaimed = 0u64;
        for raw in 1..self.peek_vector_id() {
            let id = VectorId::from(raw);
            let Some(entry) = vector::read_index_entry(&txn, id)? else {
                continue;
            };
            if !entry.is_tombstoned() {
                continue;
            }
            let blocks: Vec<BlockId> = (0..entry.block_count as u64)
                .map(|i| BlockId::from(entry.start_block + i))
                .collect();
            txn.stage_free_blocks(&blocks);
            txn.clear_index_entry(id)?;
            txn.hnsw_clear_index_slot(id)?;
            reclaimed += 1;
        }
        if reclaimed == 0 {
            txn.abort();
            return Ok(());
        }
        log::debug!(target: "vectorfs::fs", "compaction reclaimed {reclaimed} tombstoned vectors");
        txn.commit()
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }
}

/// Aggregate counters exposed by [`Store::stats`].
#[derive(Clone, Copy, Debug)]
pub struct StoreStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub journal_occupancy_percent: u8,
    pub txns_committed: u64,
    pub commit_records: u64,
    pub commit_batches: u64,
    pub checkpoints: u64,
    pub vectors_assigned: u64,
    pub read_only: bool,
    pub index_degraded: bool,
}

/// One ANN search hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchHit {
    pub vector_id: VectorId,
    /// IEEE-754 bit pattern of the f64 distance.
    pub distance_bits: u64,
}

impl SearchHit {
    pub fn distance(&self) -> f64 {
        f64::from_bits(self.distance_bits)
    }
}

/// The root handle of a mounted store.
pub struct Store {
    shared: Arc<StoreShared>,
    timer: Option<std::thread::JoinHandle<()>>,
}

impl Store {
    /// Creates a fresh store of `total_bytes` inside `path` and mounts it.
    pub fn format(
        path: &Path,
        total_bytes: u64,
        params: FormatParams,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        params.validate()?;
        config.validate()?;

        let container = Container::create(path, total_bytes)?;
        let uuid = *uuid::Uuid::new_v4().as_bytes();
        let mut sb = Superblock::build(container.block_count(), &params, uuid)?;

        // Allocation bitmaps: the root directory takes inode 1 and the
        // first data block.
        let mut block_bitmap = Bitmap::new_free(sb.data_blocks);
        block_bitmap.set(0);
        let mut inode_bitmap = Bitmap::new_free(sb.inode_count as u64);
        inode_bitmap.set(0);
        sb.free_blocks = sb.data_blocks - 1;
        sb.free_inodes = sb.inode_count - 1;

        for (block, image) in bitmap::all_blocks(&block_bitmap, BlockId::from(sb.bitmap_start)) {
            container.write_block(block, &image)?;
        }
        for (block, image) in
            bitmap::all_blocks(&inode_bitmap, BlockId::from(sb.inode_bitmap_start))
        {
            container.write_block(block, &image)?;
        }

        // The container may be a reused device: the inode table and the
        // vector index must not leak records from a previous life.
        let zero_block = vec![0u8; BLOCK_SIZE];
        for i in 1..sb.inode_table_blocks {
            container.write_block(BlockId::from(sb.inode_table_start + i), &zero_block)?;
        }
        for i in 0..sb.vector_index_blocks {
            container.write_block(BlockId::from(sb.vector_index_start + i), &zero_block)?;
        }

        // Root directory: inode record plus its "." and ".." entries.
        let root_block = sb.data_start;
        let mut root = InodeRecord::new(FileMode::DEFAULT_DIR, 0);
        root.links = 2;
        root.size = BLOCK_SIZE as u64;
        root.direct[0] = root_block;

        let mut table_block = vec![0u8; BLOCK_SIZE];
        table_block[..INODE_SIZE].copy_from_slice(&root.to_bytes());
        container.write_block(BlockId::from(sb.inode_table_start), &table_block)?;

        let mut root_dir = vec![0u8; BLOCK_SIZE];
        root_dir[..8].copy_from_slice(&1u64.to_le_bytes());
        root_dir[8..10].copy_from_slice(&16u16.to_le_bytes());
        root_dir[10] = 1;
        root_dir[11] = dir::DirentType::Directory as u8;
        root_dir[12] = b'.';
        root_dir[16..24].copy_from_slice(&1u64.to_le_bytes());
        root_dir[24..26].copy_from_slice(&((BLOCK_SIZE - 16) as u16).to_le_bytes());
        root_dir[26] = 2;
        root_dir[27] = dir::DirentType::Directory as u8;
        root_dir[28..30].copy_from_slice(b"..");
        container.write_block(BlockId::from(root_block), &root_dir)?;

        // HNSW header and an empty, sealed node index.
        let header_image = hnsw::graph_header_block(&GraphHeader::new(&params.hnsw));
        container.write_block(BlockId::from(sb.hnsw_start), &header_image)?;
        let mut index_image = vec![0u8; BLOCK_SIZE];
        crate::io::seal_typed(&mut index_image, BlockSig::NODE_INDEX);
        for i in 0..sb.hnsw_blocks - 1 {
            container.write_block(BlockId::from(sb.node_index_start() + i), &index_image)?;
        }

        // The recovery scan stops at the first unparsable record, so zeroing
        // the first journal block is enough to terminate it.
        container.write_block(BlockId::from(sb.journal_start), &zero_block)?;

        let image = sb.to_block();
        container.write_block(BlockId::PRIMARY_SUPERBLOCK, &image)?;
        container.write_block(BlockId::BACKUP_SUPERBLOCK, &image)?;
        container.sync()?;
        drop(container);

        log::info!(
            target: "vectorfs::fs",
            "formatted container {path:?}: {} blocks, {} inodes, journal {} blocks",
            sb.total_blocks,
            sb.inode_count,
            sb.journal_blocks
        );
        Self::open(path, config)
    }

    /// Mounts an existing container: superblock validation, journal
    /// recovery, allocator reconciliation, background integrity check.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let container = Container::open(path)?;

        // Primary superblock, backup as fallback.
        let primary = container.read_block(BlockId::PRIMARY_SUPERBLOCK)?;
        let mut sb = match Superblock::parse(&primary, BlockId::PRIMARY_SUPERBLOCK) {
            Ok(sb) => sb,
            Err(StoreError::IncompatibleVersion { major }) => {
                return Err(StoreError::IncompatibleVersion { major });
            }
            Err(primary_err) => {
                let backup = container.read_block(BlockId::BACKUP_SUPERBLOCK)?;
                match Superblock::parse(&backup, BlockId::BACKUP_SUPERBLOCK) {
                    Ok(sb) => {
                        log::warn!(
                            target: "vectorfs::fs",
                            "primary superblock invalid ({primary_err}); restored from backup"
                        );
                        container.write_block(BlockId::PRIMARY_SUPERBLOCK, &sb.to_block())?;
                        container.sync()?;
                        sb
                    }
                    Err(_) => {
                        log::error!(
                            target: "vectorfs::fs",
                            "both superblock copies are invalid"
                        );
                        return Err(StoreError::FsCorruption("both superblocks bad"));
                    }
                }
            }
        };

        // Journal replay.
        let report = recovery::recover(&container, &sb)?;

        // Bitmaps are authoritative after replay. The reserved region may be
        // one block larger than the populated prefix; only populated blocks
        // are sealed and read.
        let block_bitmap = {
            let populated = sb.data_blocks.div_ceil(sb::BITS_PER_BITMAP_BLOCK).max(1);
            let mut blocks = Vec::with_capacity(populated as usize);
            for i in 0..populated {
                let id = BlockId::from(sb.bitmap_start + i);
                blocks.push((id, container.read_block(id)?));
            }
            Bitmap::from_blocks(&blocks, sb.data_blocks)?
        };
        let inode_bitmap = {
            let populated = (sb.inode_count as u64)
                .div_ceil(sb::BITS_PER_BITMAP_BLOCK)
                .max(1);
            let mut blocks = Vec::with_capacity(populated as usize);
            for i in 0..populated {
                let id = BlockId::from(sb.inode_bitmap_start + i);
                blocks.push((id, container.read_block(id)?));
            }
            Bitmap::from_blocks(&blocks, sb.inode_count as u64)?
        };

        let allocator = Allocator::new(&sb, block_bitmap, inode_bitmap);
        let counters = allocator.reconcile();
        sb.free_blocks = counters.free_blocks;
        sb.free_inodes = counters.free_inodes;

        // The vector id watermark comes from the index itself, not the
        // superblock hint.
        let mut next_vector_id = 1u64;
        for i in 0..sb.vector_index_blocks {
            let image = container.read_block(BlockId::from(sb.vector_index_start + i))?;
            for slot in 0..VECTOR_SLOTS_PER_BLOCK as usize {
                let raw = &image[slot * vector::VECTOR_INDEX_ENTRY
                    ..(slot + 1) * vector::VECTOR_INDEX_ENTRY];
                let id = i * VECTOR_SLOTS_PER_BLOCK + slot as u64 + 1;
                if let Some(entry) =
                    vector::VectorIndexEntry::parse(raw, VectorId::from(id))?
                {
                    next_vector_id = next_vector_id.max(entry.vector_id + 1);
                }
            }
        }
        next_vector_id = next_vector_id.max(sb.next_vector_id);

        // Graph parameters come from the persisted header.
        let graph_header_image =
            container.read_typed(BlockId::from(sb.hnsw_start), BlockSig::GRAPH_HEADER)?;
        let graph_header: GraphHeader = bytemuck::pod_read_unaligned(
            &graph_header_image[crate::io::TYPED_PAYLOAD_OFF
                ..crate::io::TYPED_PAYLOAD_OFF + core::mem::size_of::<GraphHeader>()],
        );

        // Fresh generation: caches from a previous incarnation can never
        // serve this mount.
        sb.mount_generation += 1;
        sb.journal_tail_off = 0;
        sb.journal_seq = report.next_seq;
        sb.state = sb::STATE_CLEAN;
        let image = sb.to_block();
        container.write_block(BlockId::PRIMARY_SUPERBLOCK, &image)?;
        container.sync()?;
        container.write_block(BlockId::BACKUP_SUPERBLOCK, &image)?;
        container.sync()?;

        let metric = Metric::from_raw(sb.default_metric)
            .ok_or(StoreError::FsCorruption("unknown default metric"))?;
        let journal = Journal::new(
            &sb,
            Duration::from_micros(config.group_commit_window_us),
            0,
            report.next_seq,
        );

        let shared = Arc::new(StoreShared {
            geometry: Geometry::from_sb(&sb),
            block_cache: BlockCache::new(config.cache_block_mib, sb.mount_generation),
            meta_cache: MetaCache::new(config.cache_metadata_mib, sb.mount_generation),
            graph: GraphState::new(graph_header.seed),
            coordinator: Coordinator::new(),
            allocator,
            journal,
            metric,
            next_vector_id: AtomicU64::new(next_vector_id),
            mount_generation: sb.mount_generation,
            read_only: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            in_checkpoint: AtomicBool::new(false),
            last_checkpoint: spin::Mutex::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            sb: spin::RwLock::new(sb),
            config,
            container,
        });

        // Post-recovery ANN integrity check runs off the mount path; until
        // it fails, searches use the graph.
        let validate_shared = Arc::clone(&shared);
        std::thread::spawn(move || match hnsw::validate(&validate_shared) {
            Ok(report) if !report.ok => {
                log::error!(
                    target: "vectorfs::hnsw",
                    "post-recovery validation failed ({} errors); ANN queries degrade to linear scan",
                    report.errors.len()
                );
                validate_shared.mark_degraded();
            }
            Ok(_) => {}
            Err(err) => {
                log::error!(
                    target: "vectorfs::hnsw",
                    "post-recovery validation aborted: {err}; degrading"
                );
                validate_shared.mark_degraded();
            }
        });

        let timer = Self::spawn_checkpoint_timer(Arc::downgrade(&shared));

        if report.replayed_txns > 0 || report.discarded_txns > 0 {
            log::info!(
                target: "vectorfs::fs",
                "mounted after recovery: {} replayed, {} discarded",
                report.replayed_txns,
                report.discarded_txns
            );
        }

        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    fn spawn_checkpoint_timer(weak: Weak<StoreShared>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(200));
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let interval = Duration::from_millis(shared.config.checkpoint_interval_ms);
            let due = shared.last_checkpoint.lock().elapsed() >= interval;
            if due && !shared.is_read_only() {
                if let Err(err) = shared.checkpoint() {
                    log::error!(target: "vectorfs::fs", "timer checkpoint failed: {err}");
                }
            }
        })
    }

    pub(crate) fn shared(&self) -> &Arc<StoreShared> {
        &self.shared
    }

    /// Opens a transaction. Fails with `journal-full` when even a forced
    /// checkpoint cannot make room.
    pub fn begin(&self, isolation: Isolation) -> StoreResult<Transaction> {
        if self.shared.is_read_only() {
            return Err(StoreError::FsCorruption("store is read-only"));
        }
        // A conservative reservation for a typical transaction.
        const ESTIMATED_BLOCKS: u64 = 16;
        if !self.shared.journal.has_space_for(ESTIMATED_BLOCKS) {
            self.shared.checkpoint()?;
            if !self.shared.journal.has_space_for(ESTIMATED_BLOCKS) {
                return Err(StoreError::JournalFull);
            }
        }
        Ok(Transaction::new(Arc::clone(&self.shared), isolation))
    }

    /// Reads `len` bytes of a file at `offset` from committed state.
    pub fn read(&self, ino: InodeNo, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let inode = inode::load_inode(&self.shared, ino)?;
        inode::read_file(self.shared.as_ref(), &inode, offset, len)
    }

    /// Stat-level view of an inode.
    pub fn stat(&self, ino: InodeNo) -> StoreResult<InodeRecord> {
        Ok(*inode::load_inode(&self.shared, ino)?)
    }

    /// Looks up `name` under `parent` in committed state.
    pub fn lookup(&self, parent: InodeNo, name: &[u8]) -> StoreResult<Option<InodeNo>> {
        let dir = inode::load_inode(&self.shared, parent)?;
        dir::dir_lookup(self.shared.as_ref(), &dir, name)
    }

    /// Lists a directory from committed state.
    pub fn list_dir(&self, ino: InodeNo) -> StoreResult<Vec<DirEntry>> {
        let dir = inode::load_inode(&self.shared, ino)?;
        dir::dir_list(self.shared.as_ref(), &dir)
    }

    /// Reads a symlink target from committed state.
    pub fn read_link(&self, ino: InodeNo) -> StoreResult<Vec<u8>> {
        let inode = inode::load_inode(&self.shared, ino)?;
        if !inode.mode().is_symlink() {
            return Err(StoreError::InvalidArgument("not a symlink"));
        }
        inode::read_file(self.shared.as_ref(), &inode, 0, inode.size() as usize)
    }

    /// Loads a vector's descriptor and payload.
    pub fn load_vector(&self, id: VectorId) -> StoreResult<(VectorDescriptor, Vec<u8>)> {
        vector::load_vector(&self.shared, id)
    }

    /// ANN query: up to `k` hits ascending by distance, ties on the smaller
    /// id. While the index is degraded the query falls back to an exact
    /// linear scan.
    pub fn search(
        &self,
        owner_filter: Option<InodeNo>,
        descriptor: &VectorDescriptor,
        query: &[u8],
        k: usize,
        ef_search: Option<u32>,
    ) -> StoreResult<Vec<SearchHit>> {
        let ef = ef_search.unwrap_or(self.shared.config.default_ef_search) as usize;
        let hits = if self.shared.is_degraded() {
            vector::linear_search(
                &self.shared,
                owner_filter,
                self.shared.default_metric(),
                descriptor,
                query,
                k,
            )?
        } else {
            hnsw::search(&self.shared, owner_filter, descriptor, query, k, ef)?
        };
        Ok(hits
            .into_iter()
            .map(|(vector_id, dist)| SearchHit {
                vector_id,
                distance_bits: dist.to_bits(),
            })
            .collect())
    }

    /// Offline ANN integrity check.
    pub fn validate_index(&self) -> StoreResult<ValidateReport> {
        let report = hnsw::validate(&self.shared)?;
        if !report.ok {
            self.shared.mark_degraded();
        }
        Ok(report)
    }

    /// Construction statistics for the current mount.
    pub fn hnsw_stats(&self) -> HnswStats {
        self.shared.graph.stats()
    }

    /// Aggregate store statistics.
    pub fn stats(&self) -> StoreStats {
        let counters = self.shared.allocator.counters();
        let journal = &self.shared.journal;
        StoreStats {
            total_blocks: self.shared.geometry.total_blocks,
            free_blocks: counters.free_blocks,
            free_inodes: counters.free_inodes,
            journal_occupancy_percent: journal.occupancy_percent(),
            txns_committed: journal.stats.txns_committed.load(Ordering::Relaxed),
            commit_records: journal.stats.commit_records.load(Ordering::Relaxed),
            commit_batches: journal.stats.commit_batches.load(Ordering::Relaxed),
            checkpoints: journal.stats.checkpoints.load(Ordering::Relaxed),
            vectors_assigned: self.shared.peek_vector_id() - 1,
            read_only: self.shared.is_read_only(),
            index_degraded: self.shared.is_degraded(),
        }
    }

    /// Forces a checkpoint now.
    pub fn checkpoint(&self) -> CanFail {
        self.shared.checkpoint()
    }

    /// Graceful unmount: checkpoint, then stop the background tasks. A
    /// `Store` dropped without `close` behaves like a crash and relies on
    /// recovery, which the tests use deliberately.
    pub fn close(mut self) -> CanFail {
        let result = if self.shared.is_read_only() {
            Ok(())
        } else {
            self.shared.checkpoint()
        };
        self.stop_background();
        result
    }

    fn stop_background(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.stop_background();
    }
}

impl Transaction {
    /// Compaction-side helper: clears an HNSW index slot entirely.
    pub(crate) fn hnsw_clear_index_slot(&mut self, id: VectorId) -> CanFail {
        use crate::vector::hnsw::node::NodeIndexEntry;
        let (block, offset) = self.shared.geometry.node_slot(id)?;
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + core::mem::size_of::<NodeIndexEntry>()].fill(0);
        crate::io::seal_typed(shadow, BlockSig::NODE_INDEX);
        self.invalidate_meta(crate::cache::MetaKey::Node(u64::from(id)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::temp_container_path;
    use std::path::PathBuf;

    fn quick_config() -> StoreConfig {
        StoreConfig {
            group_commit_window_us: 0,
            ..StoreConfig::default()
        }
    }

    fn fresh_store(tag: &str) -> (Store, PathBuf) {
        let path = temp_container_path(tag);
        let store = Store::format(
            &path,
            64 * 1024 * 1024,
            FormatParams::default(),
            quick_config(),
        )
        .unwrap();
        (store, path)
    }

    /// Destroys the last-written commit record, simulating a crash where
    /// every preceding record reached the disk but the commit did not.
    fn destroy_last_commit(store: &Store) {
        let head = store.shared().journal.head_off_for_test();
        let commit_len = 48u64; // header + a one-txn id list
        let journal_start = store.shared().sb.read().journal_start;
        let region_off = journal_start * BLOCK_SIZE as u64;
        store
            .shared()
            .container
            .write_at(region_off + head - commit_len, &vec![0u8; commit_len as usize])
            .unwrap();
        store.shared().container.sync().unwrap();
    }

    #[test]
    fn format_then_remount_reads_back_files() {
        let (store, path) = fresh_store("fs-roundtrip");
        let mut contents = Vec::new();
        {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            for i in 0..8u8 {
                let name = format!("file-{i}");
                let ino = txn
                    .create_inode(InodeNo::ROOT, name.as_bytes(), FileMode::DEFAULT_FILE)
                    .unwrap();
                let body = vec![i ^ 0x5A; 5000 + i as usize * 137];
                txn.write(ino, 0, &body).unwrap();
                contents.push((name, ino, body));
            }
            txn.commit().unwrap();
        }
        store.close().unwrap();

        let store = Store::open(&path, quick_config()).unwrap();
        for (name, ino, body) in &contents {
            let found = store.lookup(InodeNo::ROOT, name.as_bytes()).unwrap();
            assert_eq!(found, Some(*ino));
            let back = store.read(*ino, 0, body.len()).unwrap();
            assert_eq!(&back, body);
        }
        // Root listing carries ".", ".." and the files.
        let listing = store.list_dir(InodeNo::ROOT).unwrap();
        assert_eq!(listing.len(), 2 + contents.len());
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn crash_before_commit_leaves_no_trace() {
        let (store, path) = fresh_store("fs-crash-early");
        let free_before = store.stats().free_blocks;

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"doomed", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(ino, 0, &vec![0xAB; BLOCK_SIZE]).unwrap();
        txn.commit().unwrap();

        // The commit record never became durable.
        destroy_last_commit(&store);
        drop(store); // crash: no checkpoint on drop

        let store = Store::open(&path, quick_config()).unwrap();
        assert_eq!(store.lookup(InodeNo::ROOT, b"doomed").unwrap(), None);
        assert_eq!(store.stats().free_blocks, free_before);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn crash_after_commit_preserves_the_txn() {
        let (store, path) = fresh_store("fs-crash-late");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"survivor", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(ino, 0, &vec![0xAB; BLOCK_SIZE]).unwrap();
        txn.commit().unwrap();
        drop(store); // crash after the commit record is durable

        let store = Store::open(&path, quick_config()).unwrap();
        let found = store.lookup(InodeNo::ROOT, b"survivor").unwrap().unwrap();
        assert_eq!(found, ino);
        let body = store.read(ino, 0, BLOCK_SIZE).unwrap();
        assert_eq!(body, vec![0xAB; BLOCK_SIZE]);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn commits_after_a_checkpoint_survive_a_crash() {
        let (store, path) = fresh_store("fs-post-checkpoint-crash");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let early = txn
            .create_inode(InodeNo::ROOT, b"early", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(early, 0, b"before the checkpoint").unwrap();
        txn.commit().unwrap();

        store.checkpoint().unwrap();

        // This transaction lives only in the journal, after the new tail.
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let late = txn
            .create_inode(InodeNo::ROOT, b"late", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(late, 0, b"after the checkpoint").unwrap();
        txn.commit().unwrap();
        drop(store); // crash

        let store = Store::open(&path, quick_config()).unwrap();
        assert_eq!(store.read(early, 0, 64).unwrap(), b"before the checkpoint");
        assert_eq!(
            store.lookup(InodeNo::ROOT, b"late").unwrap(),
            Some(late)
        );
        assert_eq!(store.read(late, 0, 64).unwrap(), b"after the checkpoint");
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn namespace_operations() {
        let (store, path) = fresh_store("fs-namespace");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let dir = txn
            .create_inode(InodeNo::ROOT, b"sub", FileMode::DEFAULT_DIR)
            .unwrap();
        let file = txn
            .create_inode(dir, b"data", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(file, 0, b"payload").unwrap();
        txn.link(dir, b"alias", file).unwrap();
        let symlink = txn.symlink(InodeNo::ROOT, b"ptr", b"sub/data").unwrap();
        txn.commit().unwrap();

        assert_eq!(store.lookup(dir, b"data").unwrap(), Some(file));
        assert_eq!(store.lookup(dir, b"alias").unwrap(), Some(file));
        assert_eq!(store.stat(file).unwrap().links(), 2);
        assert_eq!(store.read_link(symlink).unwrap(), b"sub/data");

        // Rename across directories in one transaction.
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.rename(dir, b"data", InodeNo::ROOT, b"moved").unwrap();
        txn.commit().unwrap();
        assert_eq!(store.lookup(dir, b"data").unwrap(), None);
        assert_eq!(store.lookup(InodeNo::ROOT, b"moved").unwrap(), Some(file));

        // Unlink both names; the second drop destroys the inode.
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.unlink(InodeNo::ROOT, b"moved").unwrap();
        txn.unlink(dir, b"alias").unwrap();
        txn.commit().unwrap();
        assert!(store.stat(file).is_err());

        // A populated directory refuses to die; an empty one does not.
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.unlink(InodeNo::ROOT, b"sub").unwrap();
        txn.commit().unwrap();
        assert_eq!(store.lookup(InodeNo::ROOT, b"sub").unwrap(), None);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn duplicate_names_rejected() {
        let (store, path) = fresh_store("fs-dup");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.create_inode(InodeNo::ROOT, b"x", FileMode::DEFAULT_FILE)
            .unwrap();
        assert!(matches!(
            txn.create_inode(InodeNo::ROOT, b"x", FileMode::DEFAULT_FILE),
            Err(StoreError::InvalidArgument(_))
        ));
        txn.abort();
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn group_commit_batches_under_contention() {
        let (store, path) = {
            let path = temp_container_path("fs-group");
            let store = Store::format(
                &path,
                64 * 1024 * 1024,
                FormatParams::default(),
                StoreConfig {
                    group_commit_window_us: 2_000,
                    ..StoreConfig::default()
                },
            )
            .unwrap();
            (store, path)
        };

        // One file per thread so the inode-table blocks do not collide
        // (inode allocation spreads them).
        let files: Vec<InodeNo> = {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            let files = (0..4u32)
                .map(|i| {
                    txn.create_inode(
                        InodeNo::ROOT,
                        format!("log-{i}").as_bytes(),
                        FileMode::DEFAULT_FILE,
                    )
                    .unwrap()
                })
                .collect();
            txn.commit().unwrap();
            files
        };

        let store = std::sync::Arc::new(store);
        let threads: Vec<_> = files
            .iter()
            .map(|&ino| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25u64 {
                        loop {
                            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
                            let r = txn
                                .write(ino, i * 64, &[i as u8; 64])
                                .and_then(|_| txn.commit());
                            match r {
                                Ok(()) => break,
                                Err(err) if err.is_retryable() => continue,
                                Err(err) => panic!("append failed: {err}"),
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.txns_committed, 101); // 1 setup + 100 appends
        assert!(
            stats.commit_records < stats.txns_committed,
            "group commit produced {} commit records for {} txns",
            stats.commit_records,
            stats.txns_committed
        );

        // Clean unmount, then verify nothing went missing.
        let store = std::sync::Arc::into_inner(store).unwrap();
        store.close().unwrap();
        let store = Store::open(&path, quick_config()).unwrap();
        for ino in files {
            let stat = store.stat(ino).unwrap();
            assert_eq!(stat.size(), 25 * 64);
        }
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn counter_skew_is_repaired_at_mount() {
        let (store, path) = fresh_store("fs-reconcile");
        {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            let ino = txn
                .create_inode(InodeNo::ROOT, b"ballast", FileMode::DEFAULT_FILE)
                .unwrap();
            txn.write(ino, 0, &vec![1u8; 3 * BLOCK_SIZE]).unwrap();
            txn.commit().unwrap();
        }
        let truth = store.stats().free_blocks;

        // Test hook: wreck the in-memory counter, then persist it through a
        // clean unmount. The wrong value must stay plausible or the next
        // mount rejects the superblock outright.
        store.shared().allocator.corrupt_free_blocks_counter(7);
        store.close().unwrap();

        let store = Store::open(&path, quick_config()).unwrap();
        assert_eq!(store.stats().free_blocks, truth);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn journal_pressure_forces_checkpoints() {
        let path = temp_container_path("fs-journal-pressure");
        let mut params = FormatParams::default();
        params.journal_blocks = 64;
        let store = Store::format(&path, 64 * 1024 * 1024, params, quick_config()).unwrap();

        let ino = {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            let ino = txn
                .create_inode(InodeNo::ROOT, b"big", FileMode::DEFAULT_FILE)
                .unwrap();
            txn.commit().unwrap();
            ino
        };

        // Far more journaled bytes than the region holds; begin-time and
        // watermark checkpoints must keep making room.
        for i in 0..40u64 {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            txn.write(ino, i * 8 * BLOCK_SIZE as u64, &vec![i as u8; 8 * BLOCK_SIZE])
                .unwrap();
            txn.commit().unwrap();
        }
        assert!(store.stats().checkpoints > 0);

        store.close().unwrap();
        let store = Store::open(&path, quick_config()).unwrap();
        let back = store.read(ino, 39 * 8 * BLOCK_SIZE as u64, BLOCK_SIZE).unwrap();
        assert_eq!(back, vec![39u8; BLOCK_SIZE]);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn exhaustion_returns_no_space_and_keeps_the_bitmap() {
        let path = temp_container_path("fs-nospace");
        let mut params = FormatParams::default();
        params.inode_count = 16;
        params.vector_index_blocks = 1;
        params.hnsw_index_blocks = 1;
        let store = Store::format(&path, 140 * BLOCK_SIZE as u64, params, quick_config()).unwrap();
        let free_before = store.stats().free_blocks;

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"hog", FileMode::DEFAULT_FILE)
            .unwrap();
        let result = txn.write(ino, 0, &vec![7u8; 200 * BLOCK_SIZE]);
        assert!(matches!(result, Err(StoreError::NoSpace)));
        txn.abort();

        assert_eq!(store.stats().free_blocks, free_before);

        // A reasonable write still succeeds afterwards.
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"modest", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.write(ino, 0, &vec![7u8; 4 * BLOCK_SIZE]).unwrap();
        txn.commit().unwrap();
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn vector_argument_validation_allocates_nothing() {
        let (store, path) = fresh_store("fs-vector-args");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"owner", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.commit().unwrap();
        let free_before = store.stats().free_blocks;

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        // 3 floats declared, 2 provided.
        let result = txn.store_vector(
            ino,
            VectorDescriptor::new(crate::vector::distance::ElementType::Float32, 3),
            &crate::vector::distance::f32_payload(&[1.0, 2.0]),
        );
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        txn.abort();
        assert_eq!(store.stats().free_blocks, free_before);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn checksum_mismatch_never_returns_data() {
        let (store, path) = fresh_store("fs-badsum");
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let ino = txn
            .create_inode(InodeNo::ROOT, b"target", FileMode::DEFAULT_FILE)
            .unwrap();
        txn.commit().unwrap();
        store.close().unwrap();

        // Flip a bit inside the victim's inode record on disk.
        {
            let container = Container::open(&path).unwrap();
            let sb = Superblock::parse(
                &container.read_block(BlockId::PRIMARY_SUPERBLOCK).unwrap(),
                BlockId::PRIMARY_SUPERBLOCK,
            )
            .unwrap();
            let (block, offset) = Geometry::from_sb(&sb).inode_slot(ino).unwrap();
            let mut image = container.read_block(block).unwrap();
            image[offset + 20] ^= 0xFF;
            container.write_block(block, &image).unwrap();
            container.sync().unwrap();
        }

        let store = Store::open(&path, quick_config()).unwrap();
        assert!(matches!(
            store.stat(ino),
            Err(StoreError::ChecksumMismatch { .. })
        ));
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn backup_superblock_rescues_a_bad_primary() {
        let (store, path) = fresh_store("fs-backup-sb");
        store.close().unwrap();

        {
            let container = Container::open(&path).unwrap();
            let mut primary = container.read_block(BlockId::PRIMARY_SUPERBLOCK).unwrap();
            primary[100] ^= 0xFF;
            container
                .write_block(BlockId::PRIMARY_SUPERBLOCK, &primary)
                .unwrap();
            container.sync().unwrap();
        }

        let store = Store::open(&path, quick_config()).unwrap();
        assert_eq!(store.lookup(InodeNo::ROOT, b".").unwrap(), Some(InodeNo::ROOT));
        drop(store);
        std::fs::remove_file(path).unwrap();
    }
}
