//! Superblock layout and validation.
//!
//! The superblock describes the container geometry: where the allocation
//! bitmaps, the inode table, the journal, the vector and HNSW index regions
//! and the data pool start. Two copies are kept (block 0 primary, block 1
//! backup); both end with a CRC32 at offset 4092 that must validate before a
//! mount proceeds. The superblock is written at format, at unmount and at
//! checkpoint boundaries; it is deliberately not journaled, and recovery
//! reconciles its counters against the bitmaps.

use crate::config::FormatParams;
use crate::errors::{CanFail, StoreError, StoreResult};
use crate::io::{crc32_calc, BlockId, BlockSig, BLOCK_CRC_OFF, BLOCK_SIZE, TYPED_PAYLOAD_LEN};
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

/// Current on-disk format, major part. A higher major on disk than this
/// constant fails the mount with `incompatible-version`.
pub(crate) const VERSION_MAJOR: u16 = 1;
/// Current on-disk format, minor part. Minor increments are additive.
pub(crate) const VERSION_MINOR: u16 = 0;

/// State flag: the store was unmounted cleanly.
pub(crate) const STATE_CLEAN: u16 = 1;
/// State flag: the store has seen a structural error.
pub(crate) const STATE_ERROR: u16 = 2;

/// Bits tracked per allocation-bitmap block (typed-block payload, 8 bits per
/// byte).
pub(crate) const BITS_PER_BITMAP_BLOCK: u64 = TYPED_PAYLOAD_LEN as u64 * 8;

/// Inode records per inode-table block.
pub(crate) const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / 256) as u32;

/// Vector index entries per vector-index block.
pub(crate) const VECTOR_SLOTS_PER_BLOCK: u64 = (BLOCK_SIZE / 64) as u64;

/// HNSW node index entries per node-index block (typed-block payload, 16
/// bytes per entry).
pub(crate) const NODE_SLOTS_PER_BLOCK: u64 = (TYPED_PAYLOAD_LEN / 16) as u64;

/// The on-disk superblock. Exactly one block.
///
/// All integers little-endian; the struct is written with its native layout,
/// which is fixed by `repr(C)` and the field order below.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Superblock {
    /// Block signature ([`BlockSig::SUPERBLOCK`]).
    pub(crate) sig: u64,
    pub(crate) version_major: u16,
    pub(crate) version_minor: u16,
    /// [`STATE_CLEAN`] or [`STATE_ERROR`].
    pub(crate) state: u16,
    _pad0: u16,
    /// Fixed at 4096 in format v1.
    pub(crate) block_size: u32,
    pub(crate) compat_flags: u32,
    pub(crate) total_blocks: u64,
    /// Free data-pool blocks. Advisory between checkpoints; reconciled
    /// against the bitmap at mount and after recovery.
    pub(crate) free_blocks: u64,
    pub(crate) inode_count: u32,
    pub(crate) free_inodes: u32,
    pub(crate) bitmap_start: u64,
    pub(crate) bitmap_blocks: u64,
    pub(crate) inode_bitmap_start: u64,
    pub(crate) inode_bitmap_blocks: u64,
    pub(crate) inode_table_start: u64,
    pub(crate) inode_table_blocks: u64,
    pub(crate) journal_start: u64,
    pub(crate) journal_blocks: u64,
    pub(crate) vector_index_start: u64,
    pub(crate) vector_index_blocks: u64,
    pub(crate) hnsw_start: u64,
    pub(crate) hnsw_blocks: u64,
    pub(crate) data_start: u64,
    pub(crate) data_blocks: u64,
    /// Byte offset of the journal's logical tail inside the journal region.
    pub(crate) journal_tail_off: u64,
    /// Sequence number the next journal record will carry.
    pub(crate) journal_seq: u64,
    /// Hint for the next vector id; authoritative value is recomputed from
    /// the vector index at mount.
    pub(crate) next_vector_id: u64,
    /// Incremented on every successful read-write mount.
    pub(crate) mount_generation: u64,
    pub(crate) uuid: [u8; 16],
    /// Default distance metric, as a [`crate::vector::distance::Metric`]
    /// discriminant.
    pub(crate) default_metric: u32,
    _pad1: u32,
    _reserved: [u8; 3876],
    /// CRC32 over bytes `0..4092`.
    pub(crate) checksum: u32,
}

const _: () = assert!(core::mem::size_of::<Superblock>() == BLOCK_SIZE);

impl Superblock {
    /// Computes the container geometry and builds a fresh superblock.
    ///
    /// Region order: superblocks, block bitmap, inode bitmap, inode table,
    /// journal, vector index, HNSW header + node index, data pool.
    pub(crate) fn build(
        total_blocks: u64,
        params: &FormatParams,
        uuid: [u8; 16],
    ) -> StoreResult<Self> {
        params.validate()?;

        let inode_bitmap_blocks =
            (params.inode_count as u64).div_ceil(BITS_PER_BITMAP_BLOCK).max(1);
        let inode_table_blocks = (params.inode_count as u64).div_ceil(INODES_PER_BLOCK as u64);
        // Header block plus the node index.
        let hnsw_blocks = 1 + params.hnsw_index_blocks;

        let fixed = 2
            + inode_bitmap_blocks
            + inode_table_blocks
            + params.journal_blocks
            + params.vector_index_blocks
            + hnsw_blocks;
        let remaining = total_blocks
            .checked_sub(fixed)
            .ok_or(StoreError::InvalidArgument("container too small"))?;
        // One bitmap block describes BITS_PER_BITMAP_BLOCK data blocks and
        // consumes one block itself.
        let bitmap_blocks = remaining.div_ceil(BITS_PER_BITMAP_BLOCK + 1).max(1);
        let data_blocks = remaining
            .checked_sub(bitmap_blocks)
            .ok_or(StoreError::InvalidArgument("container too small"))?;
        if data_blocks < crate::config::MIN_DATA_BLOCKS {
            return Err(StoreError::InvalidArgument(
                "container too small for a usable data pool",
            ));
        }

        let bitmap_start = 2;
        let inode_bitmap_start = bitmap_start + bitmap_blocks;
        let inode_table_start = inode_bitmap_start + inode_bitmap_blocks;
        let journal_start = inode_table_start + inode_table_blocks;
        let vector_index_start = journal_start + params.journal_blocks;
        let hnsw_start = vector_index_start + params.vector_index_blocks;
        let data_start = hnsw_start + hnsw_blocks;

        let mut sb = Self::zeroed();
        sb.sig = u64::from_le_bytes(BlockSig::SUPERBLOCK.to_bytes());
        sb.version_major = VERSION_MAJOR;
        sb.version_minor = VERSION_MINOR;
        sb.state = STATE_CLEAN;
        sb.block_size = BLOCK_SIZE as u32;
        sb.total_blocks = total_blocks;
        sb.free_blocks = data_blocks;
        sb.inode_count = params.inode_count;
        sb.free_inodes = params.inode_count;
        sb.bitmap_start = bitmap_start;
        sb.bitmap_blocks = bitmap_blocks;
        sb.inode_bitmap_start = inode_bitmap_start;
        sb.inode_bitmap_blocks = inode_bitmap_blocks;
        sb.inode_table_start = inode_table_start;
        sb.inode_table_blocks = inode_table_blocks;
        sb.journal_start = journal_start;
        sb.journal_blocks = params.journal_blocks;
        sb.vector_index_start = vector_index_start;
        sb.vector_index_blocks = params.vector_index_blocks;
        sb.hnsw_start = hnsw_start;
        sb.hnsw_blocks = hnsw_blocks;
        sb.data_start = data_start;
        sb.data_blocks = data_blocks;
        sb.journal_seq = 1;
        sb.next_vector_id = 1;
        sb.mount_generation = 0;
        sb.uuid = uuid;
        sb.default_metric = params.default_metric as u32;
        Ok(sb)
    }

    /// Serializes the superblock into a sealed block image.
    pub(crate) fn to_block(&self) -> Vec<u8> {
        let mut copy = *self;
        copy.checksum = 0;
        let mut buf = bytes_of(&copy).to_vec();
        let crc = crc32_calc(&buf[..BLOCK_CRC_OFF]);
        buf[BLOCK_CRC_OFF..].copy_from_slice(&crc.to_le_bytes());
        copy.checksum = crc;
        buf
    }

    /// Parses and validates a superblock image.
    pub(crate) fn parse(buf: &[u8], block: BlockId) -> StoreResult<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(StoreError::FsCorruption("short superblock read"));
        }
        let sb: Superblock = pod_read_unaligned(buf);
        if sb.sig != u64::from_le_bytes(BlockSig::SUPERBLOCK.to_bytes()) {
            return Err(StoreError::ChecksumMismatch { block: block.0 });
        }
        let stored = u32::from_le_bytes(buf[BLOCK_CRC_OFF..].try_into().unwrap());
        if crc32_calc(&buf[..BLOCK_CRC_OFF]) != stored {
            return Err(StoreError::ChecksumMismatch { block: block.0 });
        }
        if sb.version_major > VERSION_MAJOR {
            return Err(StoreError::IncompatibleVersion {
                major: sb.version_major,
            });
        }
        sb.check_geometry()?;
        Ok(sb)
    }

    /// Structural sanity checks beyond the checksum.
    fn check_geometry(&self) -> CanFail {
        if self.block_size != BLOCK_SIZE as u32 {
            return Err(StoreError::FsCorruption("unsupported block size"));
        }
        if self.free_blocks > self.data_blocks || self.free_inodes > self.inode_count {
            return Err(StoreError::FsCorruption("free counters exceed totals"));
        }
        if self.data_start + self.data_blocks > self.total_blocks {
            return Err(StoreError::FsCorruption("regions exceed container"));
        }
        let ordered = self.bitmap_start >= 2
            && self.inode_bitmap_start >= self.bitmap_start + self.bitmap_blocks
            && self.inode_table_start >= self.inode_bitmap_start + self.inode_bitmap_blocks
            && self.journal_start >= self.inode_table_start + self.inode_table_blocks
            && self.vector_index_start >= self.journal_start + self.journal_blocks
            && self.hnsw_start >= self.vector_index_start + self.vector_index_blocks
            && self.data_start >= self.hnsw_start + self.hnsw_blocks;
        if !ordered {
            return Err(StoreError::FsCorruption("overlapping regions"));
        }
        Ok(())
    }

    /// First block of the HNSW node index (the block after the graph
    /// header).
    pub(crate) fn node_index_start(&self) -> u64 {
        self.hnsw_start + 1
    }

    /// Capacity of the vector index, in vector slots.
    pub(crate) fn vector_capacity(&self) -> u64 {
        self.vector_index_blocks * VECTOR_SLOTS_PER_BLOCK
    }

    /// Capacity of the HNSW node index, in node slots.
    pub(crate) fn node_capacity(&self) -> u64 {
        (self.hnsw_blocks - 1) * NODE_SLOTS_PER_BLOCK
    }

    /// Journal region size in bytes.
    pub(crate) fn journal_bytes(&self) -> u64 {
        self.journal_blocks * BLOCK_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatParams;

    fn build_default(total_blocks: u64) -> Superblock {
        Superblock::build(total_blocks, &FormatParams::default(), [7u8; 16]).unwrap()
    }

    #[test]
    fn geometry_is_contiguous() {
        let sb = build_default(262_144); // 1 GiB
        assert_eq!(sb.bitmap_start, 2);
        assert_eq!(sb.inode_bitmap_start, sb.bitmap_start + sb.bitmap_blocks);
        assert_eq!(sb.data_start, sb.hnsw_start + sb.hnsw_blocks);
        assert_eq!(sb.data_start + sb.data_blocks, sb.total_blocks);
        assert!(sb.bitmap_blocks * BITS_PER_BITMAP_BLOCK >= sb.data_blocks);
        assert_eq!(sb.free_blocks, sb.data_blocks);
    }

    #[test]
    fn serialization_round_trip() {
        let sb = build_default(65_536);
        let buf = sb.to_block();
        let parsed = Superblock::parse(&buf, BlockId::PRIMARY_SUPERBLOCK).unwrap();
        assert_eq!(parsed.total_blocks, sb.total_blocks);
        assert_eq!(parsed.uuid, sb.uuid);
        assert_eq!(parsed.version_major, VERSION_MAJOR);
    }

    #[test]
    fn corrupted_copy_rejected() {
        let sb = build_default(65_536);
        let mut buf = sb.to_block();
        buf[64] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&buf, BlockId::PRIMARY_SUPERBLOCK),
            Err(StoreError::ChecksumMismatch { block: 0 })
        ));
    }

    #[test]
    fn future_major_version_rejected() {
        let mut sb = build_default(65_536);
        sb.version_major = VERSION_MAJOR + 1;
        let buf = sb.to_block();
        assert!(matches!(
            Superblock::parse(&buf, BlockId::PRIMARY_SUPERBLOCK),
            Err(StoreError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn tiny_container_rejected() {
        assert!(Superblock::build(512, &FormatParams::default(), [0u8; 16]).is_err());
    }
}
