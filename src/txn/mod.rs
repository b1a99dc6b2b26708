//! Unified transaction coordinator.
//!
//! A [`Transaction`] is the only way to mutate the store. Every touched
//! block is copied into a private shadow buffer on first write access; the
//! shadow is guarded by a per-block lock in the coordinator's lock table, so
//! two live transactions can never hold the same block (`conflict`, later
//! loser aborts). Allocator changes are staged as reservations. Nothing is
//! visible to readers until the journal's commit record is durable; abort
//! discards the shadows and returns the reservations, touching no persistent
//! state.
//!
//! The coordinator is also where lower-layer failures turn into aborts: an
//! I/O error, a timeout or a conflict leaves the transaction dead and the
//! caller decides whether to retry.

use crate::cache::MetaKey;
use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::alloc::Strategy;
use crate::fs::StoreShared;
use crate::io::BlockId;
use crate::journal::CommitRequest;
use hashbrown::HashMap;
use spin::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Isolation level requested at `begin`.
///
/// Shadow-locked single-host writers already serialize conflicting writes;
/// the stricter levels are accepted and currently behave as read-committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Per-store coordinator state: the shadow-lock table and transaction id
/// source.
pub(crate) struct Coordinator {
    lock_table: Mutex<HashMap<u64, u64>>,
    next_txn_id: AtomicU64,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        Self {
            lock_table: Mutex::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    fn try_lock(&self, block: u64, txn_id: u64) -> CanFail {
        let mut table = self.lock_table.lock();
        match table.get(&block) {
            Some(&owner) if owner != txn_id => Err(StoreError::Conflict { block }),
            Some(_) => Ok(()),
            None => {
                table.insert(block, txn_id);
                Ok(())
            }
        }
    }

    fn unlock_all(&self, txn_id: u64, blocks: &[u64]) {
        let mut table = self.lock_table.lock();
        for block in blocks {
            if table.get(block) == Some(&txn_id) {
                table.remove(block);
            }
        }
    }
}

#[derive(PartialEq, Eq)]
enum TxnState {
    Running,
    Finished,
}

/// An open transaction. Dropped without `commit`, it aborts.
pub struct Transaction {
    pub(crate) shared: Arc<StoreShared>,
    id: u64,
    #[allow(dead_code)]
    isolation: Isolation,
    started: Instant,
    state: TxnState,
    /// Shadow buffers, keyed by absolute block number. Shared out to
    /// readers cheaply; mutation is copy-on-write.
    write_set: HashMap<u64, Arc<Vec<u8>>>,
    /// Journaling order: first-touch order of the shadows.
    write_order: Vec<u64>,
    /// Staged allocator delta (pool-relative block bits, 1-based inodes).
    alloc_bits: Vec<u64>,
    free_bits: Vec<u64>,
    alloc_inodes: Vec<u64>,
    free_inodes: Vec<u64>,
    /// Freed home blocks whose stale journal images must be revoked.
    revoked: Vec<BlockId>,
    /// Metadata cache entries to drop after commit.
    meta_dirty: Vec<MetaKey>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<StoreShared>, isolation: Isolation) -> Self {
        let id = shared.coordinator.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Self {
            shared,
            id,
            isolation,
            started: Instant::now(),
            state: TxnState::Running,
            write_set: HashMap::new(),
            write_order: Vec::new(),
            alloc_bits: Vec::new(),
            free_bits: Vec::new(),
            alloc_inodes: Vec::new(),
            free_inodes: Vec::new(),
            revoked: Vec::new(),
            meta_dirty: Vec::new(),
        }
    }

    /// Fails the transaction if it outlived its configured lifetime.
    pub(crate) fn check_alive(&mut self) -> CanFail {
        if self.state != TxnState::Running {
            return Err(StoreError::InvalidArgument("transaction already finished"));
        }
        let limit = self.shared.config.txn_max_lifetime_ms;
        if limit > 0 && self.started.elapsed().as_millis() as u64 > limit {
            self.cleanup();
            return Err(StoreError::Timeout);
        }
        Ok(())
    }

    /// Copies the current committed image of `block` into a private shadow
    /// and returns it for mutation. Fails with `conflict` if another live
    /// transaction holds the block.
    pub(crate) fn get_write_access(&mut self, block: BlockId) -> StoreResult<&mut Vec<u8>> {
        let key = u64::from(block);
        if !self.write_set.contains_key(&key) {
            self.shared.coordinator.try_lock(key, self.id)?;
            let image = match self.shared.read_block_committed(block) {
                Ok(image) => image,
                Err(err) => {
                    // The lock was taken; give it back before surfacing.
                    self.shared.coordinator.unlock_all(self.id, &[key]);
                    return Err(err);
                }
            };
            self.write_set.insert(key, image);
            self.write_order.push(key);
        }
        Ok(Arc::make_mut(self.write_set.get_mut(&key).unwrap()))
    }

    /// Shadow buffer for a freshly allocated block: starts zeroed, skipping
    /// the read of whatever stale content the block held.
    pub(crate) fn get_write_access_zeroed(&mut self, block: BlockId) -> StoreResult<&mut Vec<u8>> {
        let key = u64::from(block);
        if !self.write_set.contains_key(&key) {
            self.shared.coordinator.try_lock(key, self.id)?;
            self.write_set
                .insert(key, Arc::new(vec![0u8; crate::io::BLOCK_SIZE]));
            self.write_order.push(key);
        }
        Ok(Arc::make_mut(self.write_set.get_mut(&key).unwrap()))
    }

    /// Read-your-writes view of a block: the shadow if this transaction has
    /// one, the committed state otherwise.
    pub(crate) fn read_block_view(&self, block: BlockId) -> StoreResult<Arc<Vec<u8>>> {
        if let Some(shadow) = self.write_set.get(&u64::from(block)) {
            return Ok(Arc::clone(shadow));
        }
        self.shared.read_block_committed(block)
    }

    /// This transaction's shadow of `block`, if any.
    pub(crate) fn shadow_of(&self, block: BlockId) -> Option<Arc<Vec<u8>>> {
        self.write_set.get(&u64::from(block)).map(Arc::clone)
    }

    /// Stages an allocation of `count` data blocks and returns their
    /// absolute block numbers.
    pub(crate) fn stage_alloc_blocks(
        &mut self,
        count: usize,
        hint: BlockId,
        strategy: Strategy,
    ) -> StoreResult<Vec<BlockId>> {
        let data_start = self.shared.geometry.data_start;
        let hint_bit = u64::from(hint).saturating_sub(data_start);
        let bits = self
            .shared
            .allocator
            .reserve_blocks(count, hint_bit, strategy)?;
        let blocks = bits
            .iter()
            .map(|bit| BlockId::from(data_start + bit))
            .collect();
        self.alloc_bits.extend(bits);
        Ok(blocks)
    }

    /// Stages a free of absolute data-pool blocks. Idempotent at the bitmap
    /// level; stale journal images of the blocks are revoked at commit.
    pub(crate) fn stage_free_blocks(&mut self, blocks: &[BlockId]) {
        let data_start = self.shared.geometry.data_start;
        for block in blocks {
            let abs = u64::from(*block);
            debug_assert!(abs >= data_start, "freeing a non-data block");
            self.free_bits.push(abs - data_start);
            self.revoked.push(*block);
        }
    }

    pub(crate) fn stage_alloc_inode(&mut self) -> StoreResult<u64> {
        let ino = self.shared.allocator.reserve_inode()?;
        self.alloc_inodes.push(ino);
        Ok(ino)
    }

    pub(crate) fn stage_free_inode(&mut self, ino: u64) {
        self.free_inodes.push(ino);
    }

    /// Remembers a metadata cache entry to invalidate once the commit is
    /// durable.
    pub(crate) fn invalidate_meta(&mut self, key: MetaKey) {
        self.meta_dirty.push(key);
    }

    /// Commits: journals every shadow through group commit and waits for
    /// durability. On success the effects are visible to all readers; on
    /// failure nothing is.
    pub fn commit(mut self) -> CanFail {
        self.check_alive()?;
        if self.shared.is_read_only() {
            self.cleanup();
            return Err(StoreError::FsCorruption("store is read-only"));
        }

        // Nothing written: a no-op commit needs no journal round-trip.
        if self.write_set.is_empty()
            && self.alloc_bits.is_empty()
            && self.free_bits.is_empty()
            && self.alloc_inodes.is_empty()
            && self.free_inodes.is_empty()
        {
            self.cleanup();
            return Ok(());
        }

        let order = self.write_order.clone();
        let mut writes = Vec::with_capacity(order.len());
        for key in &order {
            let image = self.write_set.remove(key).unwrap();
            writes.push((BlockId::from(*key), image));
        }

        let request = CommitRequest {
            txn_id: self.id,
            writes: writes.clone(),
            revoked: std::mem::take(&mut self.revoked),
            alloc_bits: std::mem::take(&mut self.alloc_bits),
            free_bits: std::mem::take(&mut self.free_bits),
            alloc_inodes: std::mem::take(&mut self.alloc_inodes),
            free_inodes: std::mem::take(&mut self.free_inodes),
        };

        let result =
            self.shared
                .journal
                .commit(&self.shared.container, &self.shared.allocator, request);

        match result {
            Ok(()) => {
                // Publish the new images to the block cache and drop stale
                // metadata entries.
                for (block, image) in writes {
                    self.shared.block_cache.insert(u64::from(block), image);
                }
                for key in self.meta_dirty.drain(..) {
                    self.shared.meta_cache.invalidate(key);
                }
                self.release_locks();
                self.state = TxnState::Finished;
                self.shared.after_commit();
                Ok(())
            }
            Err(err) => {
                // The journal rejected or failed the batch; the staged
                // allocator delta was never applied for this transaction
                // unless the batch made it to the overlay, which only
                // happens on success.
                if matches!(err, StoreError::JournalFull | StoreError::Io(_)) {
                    log::warn!(
                        target: "vectorfs::txn",
                        "txn {} aborted at commit: {err}",
                        self.id
                    );
                }
                self.cleanup();
                Err(err)
            }
        }
    }

    /// Aborts: discards shadows, returns reservations. Idempotent.
    pub fn abort(mut self) {
        self.cleanup();
    }

    fn release_locks(&mut self) {
        let blocks: Vec<u64> = self.write_order.drain(..).collect();
        self.shared.coordinator.unlock_all(self.id, &blocks);
        self.write_set.clear();
    }

    fn cleanup(&mut self) {
        if self.state == TxnState::Finished {
            return;
        }
        self.shared.allocator.unreserve_blocks(&self.alloc_bits);
        for ino in &self.alloc_inodes {
            self.shared.allocator.unreserve_inode(*ino);
        }
        self.alloc_bits.clear();
        self.free_bits.clear();
        self.alloc_inodes.clear();
        self.free_inodes.clear();
        self.revoked.clear();
        self.meta_dirty.clear();
        self.release_locks();
        self.state = TxnState::Finished;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatParams, StoreConfig};
    use crate::fs::Store;
    use crate::test_util::temp_container_path;

    fn open_store(tag: &str) -> (Store, std::path::PathBuf) {
        let path = temp_container_path(tag);
        let store = Store::format(
            &path,
            64 * 1024 * 1024,
            FormatParams::default(),
            StoreConfig {
                group_commit_window_us: 0,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        (store, path)
    }

    #[test]
    fn conflicting_writes_abort_the_later_txn() {
        let (store, path) = open_store("txn-conflict");
        let mut a = store.begin(Isolation::ReadCommitted).unwrap();
        let mut b = store.begin(Isolation::ReadCommitted).unwrap();

        let block = BlockId::from(store.shared().geometry.data_start + 1);
        a.get_write_access(block).unwrap();
        assert!(matches!(
            b.get_write_access(block),
            Err(StoreError::Conflict { .. })
        ));

        // Once the winner finishes, the block is free again.
        a.abort();
        b.get_write_access(block).unwrap();
        b.abort();
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn abort_discards_shadow_writes() {
        let (store, path) = open_store("txn-abort");
        let block = BlockId::from(store.shared().geometry.data_start + 2);
        {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            let shadow = txn.get_write_access(block).unwrap();
            shadow.fill(0xEE);
            txn.abort();
        }
        let image = store.shared().read_block_committed(block).unwrap();
        assert!(image.iter().all(|&b| b == 0));
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn commit_publishes_atomically() {
        let (store, path) = open_store("txn-commit");
        let block_a = BlockId::from(store.shared().geometry.data_start + 3);
        let block_b = BlockId::from(store.shared().geometry.data_start + 4);

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.get_write_access(block_a).unwrap().fill(0x01);
        txn.get_write_access(block_b).unwrap().fill(0x02);
        txn.commit().unwrap();

        let a = store.shared().read_block_committed(block_a).unwrap();
        let b = store.shared().read_block_committed(block_b).unwrap();
        assert!(a.iter().all(|&v| v == 0x01));
        assert!(b.iter().all(|&v| v == 0x02));
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn dropped_transaction_releases_locks() {
        let (store, path) = open_store("txn-drop");
        let block = BlockId::from(store.shared().geometry.data_start + 5);
        {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            txn.get_write_access(block).unwrap();
            // Dropped without commit or abort.
        }
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.get_write_access(block).unwrap();
        txn.abort();
        drop(store);
        std::fs::remove_file(path).unwrap();
    }
}
