//! Vector storage.
//!
//! Vector payloads live in append-only extents inside the data pool: a
//! 64-byte header followed by the payload, padded to 64 bytes and starting
//! at a block boundary so SIMD kernels see aligned data. A flat vector index
//! region maps `vector_id -> extent`; ids are handed out monotonically and
//! never reused. Deletion sets a tombstone bit in the index entry; the
//! extent itself is reclaimed by checkpoint-time compaction. Updates append
//! a fresh extent and retire the old one in the same transaction.

pub mod distance;
pub(crate) mod hnsw;

use crate::cache::{MetaKey, MetaVal};
use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::alloc::Strategy;
use crate::fs::inode::{InodeNo, InodeRecord};
use crate::fs::BlockView;
use crate::io::{crc32_calc, BlockId, BlockSig, BLOCK_SIZE};
use crate::txn::Transaction;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use distance::{ElementType, Metric};
use std::sync::Arc;

/// Bytes per vector index entry.
pub(crate) const VECTOR_INDEX_ENTRY: usize = 64;
/// Bytes in an extent header; also the payload alignment.
pub(crate) const EXTENT_HEADER: usize = 64;
/// Owned-vector ids per list block.
pub(crate) const IDS_PER_LIST_BLOCK: usize = (BLOCK_SIZE - 16) / 8;

/// A vector id. Monotonically increasing, never reused; 0 is invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct VectorId(pub(crate) u64);

impl From<VectorId> for u64 {
    fn from(value: VectorId) -> Self {
        value.0
    }
}

impl From<u64> for VectorId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for VectorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vector state and storage flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct VectorFlags(pub(crate) u32);

impl VectorFlags {
    /// Logically deleted, awaiting compaction.
    pub const TOMBSTONE: Self = Self(0x1);

    /// The payload is L2-normalized.
    pub const NORMALIZED: Self = Self(0x2);

    /// The payload is quantized.
    pub const QUANTIZED: Self = Self(0x4);

    /// The payload is compressed.
    pub const COMPRESSED: Self = Self(0x8);

    /// The payload must never be updated in place.
    pub const IMMUTABLE: Self = Self(0x10);

    pub(crate) fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Caller-facing description of a stored vector.
#[derive(Clone, Copy, Debug)]
pub struct VectorDescriptor {
    pub element_type: ElementType,
    pub dimension: u32,
    pub flags: VectorFlags,
    /// Opaque caller metadata reference carried alongside the vector.
    pub metadata: u64,
}

impl VectorDescriptor {
    pub fn new(element_type: ElementType, dimension: u32) -> Self {
        Self {
            element_type,
            dimension,
            flags: VectorFlags::default(),
            metadata: 0,
        }
    }
}

/// One slot of the vector index region.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct VectorIndexEntry {
    pub(crate) vector_id: u64,
    pub(crate) owner_inode: u64,
    pub(crate) start_block: u64,
    pub(crate) block_count: u32,
    pub(crate) dimension: u32,
    pub(crate) elem_type: u32,
    pub(crate) flags: u32,
    pub(crate) byte_len: u32,
    _pad: u32,
    pub(crate) metadata_ref: u64,
    _reserved: u32,
    pub(crate) checksum: u32,
}

const _: () = assert!(core::mem::size_of::<VectorIndexEntry>() == VECTOR_INDEX_ENTRY);

impl VectorIndexEntry {
    pub(crate) fn to_bytes(&self) -> [u8; VECTOR_INDEX_ENTRY] {
        let mut copy = *self;
        copy.checksum = 0;
        let mut out = [0u8; VECTOR_INDEX_ENTRY];
        out.copy_from_slice(bytes_of(&copy));
        let crc = crc32_calc(&out[..VECTOR_INDEX_ENTRY - 4]);
        out[VECTOR_INDEX_ENTRY - 4..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parses a slot; a zeroed slot is an unassigned id.
    pub(crate) fn parse(slot: &[u8], id: VectorId) -> StoreResult<Option<Self>> {
        debug_assert_eq!(slot.len(), VECTOR_INDEX_ENTRY);
        if slot.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let stored = u32::from_le_bytes(slot[VECTOR_INDEX_ENTRY - 4..].try_into().unwrap());
        if crc32_calc(&slot[..VECTOR_INDEX_ENTRY - 4]) != stored {
            return Err(StoreError::ChecksumMismatch { block: id.0 });
        }
        Ok(Some(pod_read_unaligned(slot)))
    }

    pub(crate) fn is_tombstoned(&self) -> bool {
        VectorFlags(self.flags).contains(VectorFlags::TOMBSTONE)
    }

    pub(crate) fn element_type(&self) -> StoreResult<ElementType> {
        ElementType::from_raw(self.elem_type)
            .ok_or(StoreError::FsCorruption("unknown element type in vector index"))
    }

    pub(crate) fn descriptor(&self) -> StoreResult<VectorDescriptor> {
        Ok(VectorDescriptor {
            element_type: self.element_type()?,
            dimension: self.dimension,
            flags: VectorFlags(self.flags),
            metadata: self.metadata_ref,
        })
    }
}

/// On-disk extent header preceding a payload.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ExtentHeader {
    pub(crate) sig: u64,
    pub(crate) vector_id: u64,
    pub(crate) dimension: u32,
    pub(crate) elem_type: u32,
    pub(crate) byte_len: u32,
    pub(crate) flags: u32,
    pub(crate) payload_crc: u32,
    _pad: u32,
    _reserved: [u8; 24],
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() == EXTENT_HEADER);

impl ExtentHeader {
    fn new(id: VectorId, descriptor: &VectorDescriptor, payload: &[u8]) -> Self {
        let mut header = Self::zeroed();
        header.sig = u64::from_le_bytes(BlockSig::EXTENT.to_bytes());
        header.vector_id = id.0;
        header.dimension = descriptor.dimension;
        header.elem_type = descriptor.element_type as u32;
        header.byte_len = payload.len() as u32;
        header.flags = descriptor.flags.0;
        header.payload_crc = crc32_calc(payload);
        header
    }
}

/// Blocks an extent of `payload_len` bytes occupies.
pub(crate) fn extent_blocks(payload_len: usize) -> usize {
    (EXTENT_HEADER + payload_len).div_ceil(BLOCK_SIZE)
}

/// Reads a vector index entry through a view.
pub(crate) fn read_index_entry<V: BlockView>(
    view: &V,
    id: VectorId,
) -> StoreResult<Option<VectorIndexEntry>> {
    let (block, offset) = view.geometry().vector_slot(id)?;
    let image = view.view_block(block)?;
    VectorIndexEntry::parse(&image[offset..offset + VECTOR_INDEX_ENTRY], id)
}

/// Reads a vector payload through a view, verifying the extent header and
/// payload CRC.
pub(crate) fn read_payload<V: BlockView>(
    view: &V,
    entry: &VectorIndexEntry,
) -> StoreResult<Vec<u8>> {
    let mut raw = Vec::with_capacity(entry.block_count as usize * BLOCK_SIZE);
    for i in 0..entry.block_count as u64 {
        let image = view.view_block(BlockId::from(entry.start_block + i))?;
        raw.extend_from_slice(&image);
    }
    let header: ExtentHeader = pod_read_unaligned(&raw[..EXTENT_HEADER]);
    if header.sig != u64::from_le_bytes(BlockSig::EXTENT.to_bytes())
        || header.vector_id != entry.vector_id
        || header.byte_len != entry.byte_len
    {
        return Err(StoreError::ChecksumMismatch {
            block: entry.start_block,
        });
    }
    let payload = &raw[EXTENT_HEADER..EXTENT_HEADER + entry.byte_len as usize];
    if crc32_calc(payload) != header.payload_crc {
        return Err(StoreError::ChecksumMismatch {
            block: entry.start_block,
        });
    }
    Ok(payload.to_vec())
}

/// Loads `(descriptor, payload)` from committed state.
pub(crate) fn load_vector(
    shared: &crate::fs::StoreShared,
    id: VectorId,
) -> StoreResult<(VectorDescriptor, Vec<u8>)> {
    let entry = cached_index_entry(shared, id)?
        .ok_or(StoreError::InvalidArgument("unknown vector id"))?;
    if entry.is_tombstoned() {
        return Err(StoreError::InvalidArgument("unknown vector id"));
    }
    let payload = read_payload(shared, &entry)?;
    Ok((entry.descriptor()?, payload))
}

/// Committed index entry, through the metadata cache.
pub(crate) fn cached_index_entry(
    shared: &crate::fs::StoreShared,
    id: VectorId,
) -> StoreResult<Option<VectorIndexEntry>> {
    if id.0 == 0 || id.0 >= shared.geometry.vector_capacity + 1 {
        return Ok(None);
    }
    if let Some(MetaVal::Vector(entry)) = shared.meta_cache.get(MetaKey::Vector(id.0)) {
        return Ok(Some(*entry));
    }
    let entry = read_index_entry(shared, id)?;
    if let Some(entry) = entry {
        shared
            .meta_cache
            .insert(MetaKey::Vector(id.0), MetaVal::Vector(Arc::new(entry)));
        return Ok(Some(entry));
    }
    Ok(None)
}

impl Transaction {
    /// Stores a vector owned by `owner`, inserts it into the ANN index and
    /// returns its id. The whole effect is one atomic unit with everything
    /// else in this transaction.
    pub fn store_vector(
        &mut self,
        owner: InodeNo,
        descriptor: VectorDescriptor,
        payload: &[u8],
    ) -> StoreResult<VectorId> {
        self.check_alive()?;
        descriptor
            .element_type
            .check_payload(descriptor.dimension, payload)?;
        // The owner must exist (and not be a directory).
        let mut owner_inode = self.read_inode(owner)?;
        if owner_inode.mode().is_dir() {
            return Err(StoreError::InvalidArgument("directories cannot own vectors"));
        }

        let id = self.shared.take_vector_id()?;
        let blocks = self.write_extent(id, &descriptor, payload)?;

        // Index entry.
        let mut entry = VectorIndexEntry::zeroed();
        entry.vector_id = id.0;
        entry.owner_inode = u64::from(owner);
        entry.start_block = u64::from(blocks[0]);
        entry.block_count = blocks.len() as u32;
        entry.dimension = descriptor.dimension;
        entry.elem_type = descriptor.element_type as u32;
        entry.flags = descriptor.flags.0 & !VectorFlags::TOMBSTONE.0;
        entry.byte_len = payload.len() as u32;
        entry.metadata_ref = descriptor.metadata;
        self.write_index_entry(id, &entry)?;

        // Per-inode linkage.
        self.append_owned_vector(owner, &mut owner_inode, id)?;

        // ANN index.
        self.hnsw_insert(id, descriptor.element_type, descriptor.dimension, payload)?;
        Ok(id)
    }

    /// Tombstones a vector. Deleting an already-deleted id is a no-op.
    pub fn delete_vector(&mut self, id: VectorId) -> CanFail {
        self.check_alive()?;
        let Some(mut entry) = read_index_entry(self, id)? else {
            return Err(StoreError::InvalidArgument("unknown vector id"));
        };
        if entry.is_tombstoned() {
            return Ok(());
        }
        entry.flags |= VectorFlags::TOMBSTONE.0;
        self.write_index_entry(id, &entry)?;
        self.hnsw_tombstone(id)?;
        Ok(())
    }

    /// Replaces a vector's payload: a new extent is appended, the index
    /// entry swings over and the old extent's blocks are released, all in
    /// this transaction.
    pub fn update_vector(&mut self, id: VectorId, payload: &[u8]) -> CanFail {
        self.check_alive()?;
        let Some(mut entry) = read_index_entry(self, id)? else {
            return Err(StoreError::InvalidArgument("unknown vector id"));
        };
        if entry.is_tombstoned() {
            return Err(StoreError::InvalidArgument("unknown vector id"));
        }
        if VectorFlags(entry.flags).contains(VectorFlags::IMMUTABLE) {
            return Err(StoreError::InvalidArgument("vector is immutable"));
        }
        let descriptor = entry.descriptor()?;
        descriptor
            .element_type
            .check_payload(descriptor.dimension, payload)?;

        let old_blocks: Vec<BlockId> = (0..entry.block_count as u64)
            .map(|i| BlockId::from(entry.start_block + i))
            .collect();

        let blocks = self.write_extent(id, &descriptor, payload)?;
        entry.start_block = u64::from(blocks[0]);
        entry.block_count = blocks.len() as u32;
        entry.byte_len = payload.len() as u32;
        self.write_index_entry(id, &entry)?;
        self.stage_free_blocks(&old_blocks);

        // Re-link the node at its new position in vector space.
        self.hnsw_insert(id, descriptor.element_type, descriptor.dimension, payload)?;
        Ok(())
    }

    /// Writes an aligned extent for `payload` and returns its blocks.
    fn write_extent(
        &mut self,
        id: VectorId,
        descriptor: &VectorDescriptor,
        payload: &[u8],
    ) -> StoreResult<Vec<BlockId>> {
        let count = extent_blocks(payload.len());
        let blocks = self.stage_alloc_blocks(
            count,
            BlockId::from(self.shared.geometry.data_start),
            Strategy::Aligned,
        )?;

        let header = ExtentHeader::new(id, descriptor, payload);
        let mut cursor = 0usize; // bytes of payload written
        for (i, block) in blocks.iter().enumerate() {
            let shadow = self.get_write_access_zeroed(*block)?;
            let mut offset = 0usize;
            if i == 0 {
                shadow[..EXTENT_HEADER].copy_from_slice(bytes_of(&header));
                offset = EXTENT_HEADER;
            }
            let chunk = (BLOCK_SIZE - offset).min(payload.len() - cursor);
            shadow[offset..offset + chunk].copy_from_slice(&payload[cursor..cursor + chunk]);
            cursor += chunk;
        }
        debug_assert_eq!(cursor, payload.len());
        Ok(blocks)
    }

    /// Writes a vector index slot through this transaction.
    pub(crate) fn write_index_entry(&mut self, id: VectorId, entry: &VectorIndexEntry) -> CanFail {
        let (block, offset) = self.shared.geometry.vector_slot(id)?;
        let bytes = entry.to_bytes();
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + VECTOR_INDEX_ENTRY].copy_from_slice(&bytes);
        self.invalidate_meta(MetaKey::Vector(id.0));
        Ok(())
    }

    /// Zeroes a vector index slot (compaction).
    pub(crate) fn clear_index_entry(&mut self, id: VectorId) -> CanFail {
        let (block, offset) = self.shared.geometry.vector_slot(id)?;
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + VECTOR_INDEX_ENTRY].fill(0);
        self.invalidate_meta(MetaKey::Vector(id.0));
        Ok(())
    }

    /// Appends `id` to the owner inode's vector list chain, prepending a
    /// fresh list block when the head is full.
    fn append_owned_vector(
        &mut self,
        owner: InodeNo,
        owner_inode: &mut InodeRecord,
        id: VectorId,
    ) -> CanFail {
        let head = owner_inode.vector_meta;
        if head != 0 {
            let (count, _) = read_list_block(self, BlockId::from(head))?;
            if count < IDS_PER_LIST_BLOCK {
                let shadow = self.get_write_access(BlockId::from(head))?;
                let off = 16 + count * 8;
                shadow[off..off + 8].copy_from_slice(&id.0.to_le_bytes());
                shadow[8..12].copy_from_slice(&((count + 1) as u32).to_le_bytes());
                return Ok(());
            }
        }
        // Prepend a new list block.
        let block = self.stage_alloc_blocks(
            1,
            BlockId::from(self.shared.geometry.data_start),
            Strategy::FirstFit,
        )?[0];
        let shadow = self.get_write_access_zeroed(block)?;
        shadow[..8].copy_from_slice(&head.to_le_bytes());
        shadow[8..12].copy_from_slice(&1u32.to_le_bytes());
        shadow[16..24].copy_from_slice(&id.0.to_le_bytes());
        owner_inode.vector_meta = u64::from(block);
        self.write_inode(owner, owner_inode)
    }

    /// Releases every vector owned by a dying inode: tombstones the graph
    /// nodes, frees the extents and list blocks, and clears the index slots.
    pub(crate) fn release_owned_vectors(&mut self, inode: &InodeRecord) -> CanFail {
        let mut next = inode.vector_meta;
        while next != 0 {
            let block = BlockId::from(next);
            let (count, ids) = read_list_block(self, block)?;
            for id in ids.into_iter().take(count) {
                let id = VectorId(id);
                if let Some(entry) = read_index_entry(self, id)? {
                    let blocks: Vec<BlockId> = (0..entry.block_count as u64)
                        .map(|i| BlockId::from(entry.start_block + i))
                        .collect();
                    self.stage_free_blocks(&blocks);
                    self.clear_index_entry(id)?;
                    self.hnsw_tombstone(id)?;
                }
            }
            let image = self.read_block_view(block)?;
            next = u64::from_le_bytes(image[..8].try_into().unwrap());
            self.stage_free_blocks(&[block]);
        }
        Ok(())
    }
}

/// Parses an owned-vector list block: `(next: u64, count: u32, pad: u32,
/// ids...)`.
fn read_list_block<V: BlockView>(view: &V, block: BlockId) -> StoreResult<(usize, Vec<u64>)> {
    let image = view.view_block(block)?;
    let count = u32::from_le_bytes(image[8..12].try_into().unwrap()) as usize;
    if count > IDS_PER_LIST_BLOCK {
        return Err(StoreError::FsCorruption("vector list block overflow"));
    }
    let ids = (0..count)
        .map(|i| {
            let off = 16 + i * 8;
            u64::from_le_bytes(image[off..off + 8].try_into().unwrap())
        })
        .collect();
    Ok((count, ids))
}

/// Exhaustive scan used while the ANN index is degraded or when callers
/// filter by owner: distances against every live, type-compatible vector.
pub(crate) fn linear_search(
    shared: &crate::fs::StoreShared,
    filter: Option<InodeNo>,
    metric: Metric,
    query_descriptor: &VectorDescriptor,
    query: &[u8],
    k: usize,
) -> StoreResult<Vec<(VectorId, f64)>> {
    let mut results: Vec<(VectorId, f64)> = Vec::new();
    let next_id = shared.peek_vector_id();
    for raw in 1..next_id {
        let id = VectorId(raw);
        let Some(entry) = cached_index_entry(shared, id)? else {
            continue;
        };
        if entry.is_tombstoned() {
            continue;
        }
        if let Some(owner) = filter {
            if entry.owner_inode != u64::from(owner) {
                continue;
            }
        }
        if entry.elem_type != query_descriptor.element_type as u32
            || entry.dimension != query_descriptor.dimension
        {
            continue;
        }
        let payload = read_payload(shared, &entry)?;
        let dist = distance::distance(
            metric,
            query_descriptor.element_type,
            query_descriptor.dimension,
            query,
            &payload,
        )?;
        results.push((id, dist));
    }
    // Ascending distance; ties break on the smaller id for determinism.
    results.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    results.truncate(k);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_entry_round_trip() {
        let mut entry = VectorIndexEntry::zeroed();
        entry.vector_id = 42;
        entry.owner_inode = 7;
        entry.start_block = 1000;
        entry.block_count = 2;
        entry.dimension = 128;
        entry.elem_type = ElementType::Float32 as u32;
        entry.byte_len = 512;
        let bytes = entry.to_bytes();
        let parsed = VectorIndexEntry::parse(&bytes, VectorId(42)).unwrap().unwrap();
        assert_eq!(parsed.vector_id, 42);
        assert_eq!(parsed.dimension, 128);
        assert!(!parsed.is_tombstoned());
    }

    #[test]
    fn zeroed_slot_is_unassigned() {
        let slot = [0u8; VECTOR_INDEX_ENTRY];
        assert!(VectorIndexEntry::parse(&slot, VectorId(1)).unwrap().is_none());
    }

    #[test]
    fn corrupt_entry_rejected() {
        let mut entry = VectorIndexEntry::zeroed();
        entry.vector_id = 1;
        let mut bytes = entry.to_bytes();
        bytes[12] ^= 0x40;
        assert!(VectorIndexEntry::parse(&bytes, VectorId(1)).is_err());
    }

    #[test]
    fn extent_block_math() {
        assert_eq!(extent_blocks(0), 1);
        assert_eq!(extent_blocks(BLOCK_SIZE - EXTENT_HEADER), 1);
        assert_eq!(extent_blocks(BLOCK_SIZE - EXTENT_HEADER + 1), 2);
        assert_eq!(extent_blocks(512), 1);
    }
}
