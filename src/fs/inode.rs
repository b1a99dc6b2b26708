//! Inode records and file block mapping.
//!
//! An inode is a fixed 256-byte record, 16 per table block, individually
//! checksummed. Data placement follows the classical scheme: 12 direct
//! block pointers, then single, double and triple indirect blocks, each
//! indirect block holding 512 little-endian block numbers. A pointer value
//! of 0 means a hole.

use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::alloc::Strategy;
use crate::fs::BlockView;
use crate::io::{crc32_calc, BlockId, BLOCK_SIZE};
use crate::txn::Transaction;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use std::sync::Arc;

/// Size of an on-disk inode record.
pub(crate) const INODE_SIZE: usize = 256;
/// Direct block pointers per inode.
pub(crate) const DIRECT_BLOCKS: usize = 12;
/// Block pointers per indirect block.
pub(crate) const PTRS_PER_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

/// An inode number. 1-based; inode 1 is the root directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNo(pub(crate) u64);

impl InodeNo {
    /// The root directory.
    pub const ROOT: Self = Self(1);
}

impl From<InodeNo> for u64 {
    fn from(value: InodeNo) -> Self {
        value.0
    }
}

impl From<u64> for InodeNo {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for InodeNo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File mode: type bits plus permissions, Unix layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    /// Mask covering the file-type bits.
    pub const S_IFMT: Self = Self(0xF000);

    /// Regular file.
    pub const S_IFREG: Self = Self(0x8000);

    /// Directory.
    pub const S_IFDIR: Self = Self(0x4000);

    /// Symbolic link.
    pub const S_IFLNK: Self = Self(0xA000);

    /// Default permissions for new regular files.
    pub const DEFAULT_FILE: Self = Self(0x8000 | 0o644);

    /// Default permissions for new directories.
    pub const DEFAULT_DIR: Self = Self(0x4000 | 0o755);

    pub fn is_dir(self) -> bool {
        self.0 & Self::S_IFMT.0 == Self::S_IFDIR.0
    }

    pub fn is_regular(self) -> bool {
        self.0 & Self::S_IFMT.0 == Self::S_IFREG.0
    }

    pub fn is_symlink(self) -> bool {
        self.0 & Self::S_IFMT.0 == Self::S_IFLNK.0
    }
}

/// The on-disk inode record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct InodeRecord {
    pub(crate) mode: u16,
    pub(crate) links: u16,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) flags: u32,
    pub(crate) size: u64,
    pub(crate) atime: u64,
    pub(crate) ctime: u64,
    pub(crate) mtime: u64,
    pub(crate) direct: [u64; DIRECT_BLOCKS],
    pub(crate) indirect: u64,
    pub(crate) dindirect: u64,
    pub(crate) tindirect: u64,
    /// First block of the owned-vector list chain, 0 if the inode owns no
    /// vectors.
    pub(crate) vector_meta: u64,
    pub(crate) generation: u64,
    _reserved: [u8; 68],
    pub(crate) checksum: u32,
}

const _: () = assert!(core::mem::size_of::<InodeRecord>() == INODE_SIZE);

impl InodeRecord {
    pub(crate) fn new(mode: FileMode, generation: u64) -> Self {
        let now = unix_now();
        let mut inode = Self::zeroed();
        inode.mode = mode.0;
        inode.links = 1;
        inode.atime = now;
        inode.ctime = now;
        inode.mtime = now;
        inode.generation = generation;
        inode
    }

    pub fn mode(&self) -> FileMode {
        FileMode(self.mode)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn links(&self) -> u16 {
        self.links
    }

    /// Serializes the record with a fresh checksum.
    pub(crate) fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut copy = *self;
        copy.checksum = 0;
        let mut out = [0u8; INODE_SIZE];
        out.copy_from_slice(bytes_of(&copy));
        let crc = crc32_calc(&out[..INODE_SIZE - 4]);
        out[INODE_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parses a table slot. A zeroed slot is a free inode, reported as
    /// `Ok(None)`; anything else must checksum.
    pub(crate) fn parse(slot: &[u8], ino: InodeNo) -> StoreResult<Option<Self>> {
        debug_assert_eq!(slot.len(), INODE_SIZE);
        if slot.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let stored = u32::from_le_bytes(slot[INODE_SIZE - 4..].try_into().unwrap());
        if crc32_calc(&slot[..INODE_SIZE - 4]) != stored {
            log::error!(target: "vectorfs::fs", "inode {ino} failed its checksum");
            return Err(StoreError::ChecksumMismatch { block: ino.0 });
        }
        Ok(Some(pod_read_unaligned(slot)))
    }

    /// Blocks the file's byte range occupies.
    pub(crate) fn block_count(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64)
    }
}

/// Current time as Unix seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resolves a file-relative block index through the direct and indirect
/// pointers. Returns `None` for holes and unmapped tails.
pub(crate) fn bmap<V: BlockView>(
    view: &V,
    inode: &InodeRecord,
    file_block: u64,
) -> StoreResult<Option<BlockId>> {
    let read_slot = |view: &V, block: u64, index: u64| -> StoreResult<u64> {
        if block == 0 {
            return Ok(0);
        }
        let image = view.view_block(BlockId::from(block))?;
        let off = index as usize * 8;
        Ok(u64::from_le_bytes(image[off..off + 8].try_into().unwrap()))
    };

    let resolved = if file_block < DIRECT_BLOCKS as u64 {
        inode.direct[file_block as usize]
    } else {
        let mut idx = file_block - DIRECT_BLOCKS as u64;
        if idx < PTRS_PER_BLOCK {
            read_slot(view, inode.indirect, idx)?
        } else {
            idx -= PTRS_PER_BLOCK;
            if idx < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
                let first = read_slot(view, inode.dindirect, idx / PTRS_PER_BLOCK)?;
                read_slot(view, first, idx % PTRS_PER_BLOCK)?
            } else {
                idx -= PTRS_PER_BLOCK * PTRS_PER_BLOCK;
                if idx >= PTRS_PER_BLOCK * PTRS_PER_BLOCK * PTRS_PER_BLOCK {
                    return Err(StoreError::InvalidArgument("file offset beyond maximum"));
                }
                let second = read_slot(
                    view,
                    inode.tindirect,
                    idx / (PTRS_PER_BLOCK * PTRS_PER_BLOCK),
                )?;
                let first = read_slot(view, second, (idx / PTRS_PER_BLOCK) % PTRS_PER_BLOCK)?;
                read_slot(view, first, idx % PTRS_PER_BLOCK)?
            }
        }
    };
    Ok((resolved != 0).then(|| BlockId::from(resolved)))
}

/// Walks every mapped block of the file, including the indirect blocks
/// themselves. Used to reclaim storage when an inode is destroyed. The walk
/// is a loop over an explicit stack of indirect levels, never recursion.
pub(crate) fn collect_blocks<V: BlockView>(
    view: &V,
    inode: &InodeRecord,
) -> StoreResult<Vec<BlockId>> {
    let mut out = Vec::new();
    for &ptr in &inode.direct {
        if ptr != 0 {
            out.push(BlockId::from(ptr));
        }
    }

    // (block, remaining indirection depth) pairs.
    let mut stack: Vec<(u64, u8)> = Vec::new();
    if inode.indirect != 0 {
        stack.push((inode.indirect, 1));
    }
    if inode.dindirect != 0 {
        stack.push((inode.dindirect, 2));
    }
    if inode.tindirect != 0 {
        stack.push((inode.tindirect, 3));
    }

    while let Some((block, depth)) = stack.pop() {
        out.push(BlockId::from(block));
        let image = view.view_block(BlockId::from(block))?;
        for slot in 0..PTRS_PER_BLOCK as usize {
            let ptr = u64::from_le_bytes(image[slot * 8..slot * 8 + 8].try_into().unwrap());
            if ptr == 0 {
                continue;
            }
            if depth == 1 {
                out.push(BlockId::from(ptr));
            } else {
                stack.push((ptr, depth - 1));
            }
        }
    }
    Ok(out)
}

impl Transaction {
    /// Reads an inode through this transaction's view, failing on free
    /// slots.
    pub(crate) fn read_inode(&self, ino: InodeNo) -> StoreResult<InodeRecord> {
        let (block, offset) = self.shared.geometry.inode_slot(ino)?;
        let image = self.read_block_view(block)?;
        InodeRecord::parse(&image[offset..offset + INODE_SIZE], ino)?
            .ok_or(StoreError::InvalidArgument("no such inode"))
    }

    /// Writes an inode record into its table block shadow.
    pub(crate) fn write_inode(&mut self, ino: InodeNo, inode: &InodeRecord) -> CanFail {
        let (block, offset) = self.shared.geometry.inode_slot(ino)?;
        let bytes = inode.to_bytes();
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + INODE_SIZE].copy_from_slice(&bytes);
        self.invalidate_meta(crate::cache::MetaKey::Inode(ino.0));
        Ok(())
    }

    /// Clears an inode slot (inode destruction).
    pub(crate) fn clear_inode(&mut self, ino: InodeNo) -> CanFail {
        let (block, offset) = self.shared.geometry.inode_slot(ino)?;
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + INODE_SIZE].fill(0);
        self.invalidate_meta(crate::cache::MetaKey::Inode(ino.0));
        Ok(())
    }

    /// Maps `file_block` to a data block, allocating data and indirect
    /// blocks as needed. `inode` is updated in place; the caller persists it.
    pub(crate) fn bmap_alloc(
        &mut self,
        inode: &mut InodeRecord,
        file_block: u64,
        hint: BlockId,
    ) -> StoreResult<BlockId> {
        if let Some(existing) = bmap(self, inode, file_block)? {
            return Ok(existing);
        }

        let data_block = self.stage_alloc_blocks(1, hint, Strategy::Locality)?[0];

        if file_block < DIRECT_BLOCKS as u64 {
            inode.direct[file_block as usize] = u64::from(data_block);
            return Ok(data_block);
        }

        // Indirect chains: ensure each level exists, then set the leaf slot.
        let mut idx = file_block - DIRECT_BLOCKS as u64;
        if idx < PTRS_PER_BLOCK {
            if inode.indirect == 0 {
                inode.indirect = self.alloc_pointer_block(hint)?;
            }
            self.set_pointer(BlockId::from(inode.indirect), idx, data_block)?;
            return Ok(data_block);
        }

        idx -= PTRS_PER_BLOCK;
        if idx < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
            if inode.dindirect == 0 {
                inode.dindirect = self.alloc_pointer_block(hint)?;
            }
            let first = self.ensure_pointer(
                BlockId::from(inode.dindirect),
                idx / PTRS_PER_BLOCK,
                hint,
            )?;
            self.set_pointer(first, idx % PTRS_PER_BLOCK, data_block)?;
            return Ok(data_block);
        }

        idx -= PTRS_PER_BLOCK * PTRS_PER_BLOCK;
        if idx >= PTRS_PER_BLOCK * PTRS_PER_BLOCK * PTRS_PER_BLOCK {
            return Err(StoreError::InvalidArgument("file offset beyond maximum"));
        }
        if inode.tindirect == 0 {
            inode.tindirect = self.alloc_pointer_block(hint)?;
        }
        let second = self.ensure_pointer(
            BlockId::from(inode.tindirect),
            idx / (PTRS_PER_BLOCK * PTRS_PER_BLOCK),
            hint,
        )?;
        let first = self.ensure_pointer(second, (idx / PTRS_PER_BLOCK) % PTRS_PER_BLOCK, hint)?;
        self.set_pointer(first, idx % PTRS_PER_BLOCK, data_block)?;
        Ok(data_block)
    }

    fn alloc_pointer_block(&mut self, hint: BlockId) -> StoreResult<u64> {
        // Pointer blocks are small one-off requests: best-fit keeps them out
        // of the large runs the aligned allocations want.
        let block = self.stage_alloc_blocks(1, hint, Strategy::BestFit)?[0];
        self.get_write_access_zeroed(block)?;
        Ok(u64::from(block))
    }

    fn set_pointer(&mut self, table: BlockId, slot: u64, value: BlockId) -> CanFail {
        let shadow = self.get_write_access(table)?;
        let off = slot as usize * 8;
        shadow[off..off + 8].copy_from_slice(&u64::from(value).to_le_bytes());
        Ok(())
    }

    /// Reads the pointer at `slot`, allocating a fresh pointer block there
    /// if the slot is empty.
    fn ensure_pointer(&mut self, table: BlockId, slot: u64, hint: BlockId) -> StoreResult<BlockId> {
        let current = {
            let image = self.read_block_view(table)?;
            let off = slot as usize * 8;
            u64::from_le_bytes(image[off..off + 8].try_into().unwrap())
        };
        if current != 0 {
            return Ok(BlockId::from(current));
        }
        let fresh = self.alloc_pointer_block(hint)?;
        self.set_pointer(table, slot, BlockId::from(fresh))?;
        Ok(BlockId::from(fresh))
    }

    /// Writes `data` into a file at `offset`, allocating blocks as needed
    /// and growing the size. The write is wholly inside this transaction.
    pub fn write(&mut self, ino: InodeNo, offset: u64, data: &[u8]) -> CanFail {
        self.check_alive()?;
        if data.is_empty() {
            return Ok(());
        }
        let mut inode = self.read_inode(ino)?;
        if inode.mode().is_dir() {
            return Err(StoreError::InvalidArgument("cannot write a directory"));
        }

        let hint = BlockId::from(if inode.direct[0] != 0 {
            inode.direct[0]
        } else {
            self.shared.geometry.data_start
        });

        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let file_block = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(data.len() - written);

            let mapped = bmap(self, &inode, file_block)?;
            let (block, fresh) = match mapped {
                Some(block) => (block, false),
                None => (self.bmap_alloc(&mut inode, file_block, hint)?, true),
            };
            let shadow = if fresh {
                self.get_write_access_zeroed(block)?
            } else {
                self.get_write_access(block)?
            };
            shadow[in_block..in_block + chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }

        inode.size = inode.size.max(offset + data.len() as u64);
        inode.mtime = unix_now();
        self.write_inode(ino, &inode)
    }

    /// Releases every data and indirect block of `inode` and stages the
    /// frees.
    pub(crate) fn free_inode_data(&mut self, inode: &InodeRecord) -> CanFail {
        let blocks = collect_blocks(self, inode)?;
        self.stage_free_blocks(&blocks);
        Ok(())
    }
}

/// Reads `len` bytes at `offset` from a file through an arbitrary view.
/// Holes and the unwritten tail read as zeroes; reads past `size` are
/// truncated.
pub(crate) fn read_file<V: BlockView>(
    view: &V,
    inode: &InodeRecord,
    offset: u64,
    len: usize,
) -> StoreResult<Vec<u8>> {
    if offset >= inode.size {
        return Ok(Vec::new());
    }
    let len = len.min((inode.size - offset) as usize);
    let mut out = vec![0u8; len];
    let mut read = 0usize;
    while read < len {
        let pos = offset + read as u64;
        let file_block = pos / BLOCK_SIZE as u64;
        let in_block = (pos % BLOCK_SIZE as u64) as usize;
        let chunk = (BLOCK_SIZE - in_block).min(len - read);
        if let Some(block) = bmap(view, inode, file_block)? {
            let image = view.view_block(block)?;
            out[read..read + chunk].copy_from_slice(&image[in_block..in_block + chunk]);
        }
        read += chunk;
    }
    Ok(out)
}

/// Loads an inode from committed state, failing on free slots.
pub(crate) fn load_inode(
    shared: &crate::fs::StoreShared,
    ino: InodeNo,
) -> StoreResult<Arc<InodeRecord>> {
    if let Some(crate::cache::MetaVal::Inode(inode)) =
        shared.meta_cache.get(crate::cache::MetaKey::Inode(ino.0))
    {
        return Ok(inode);
    }
    let (block, offset) = shared.geometry.inode_slot(ino)?;
    let image = shared.read_block_committed(block)?;
    let inode = InodeRecord::parse(&image[offset..offset + INODE_SIZE], ino)?
        .ok_or(StoreError::InvalidArgument("no such inode"))?;
    let inode = Arc::new(inode);
    shared.meta_cache.insert(
        crate::cache::MetaKey::Inode(ino.0),
        crate::cache::MetaVal::Inode(Arc::clone(&inode)),
    );
    Ok(inode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let inode = InodeRecord::new(FileMode::DEFAULT_FILE, 3);
        let bytes = inode.to_bytes();
        let parsed = InodeRecord::parse(&bytes, InodeNo::ROOT).unwrap().unwrap();
        assert_eq!(parsed.mode, inode.mode);
        assert_eq!(parsed.generation, 3);
        assert!(parsed.mode().is_regular());
    }

    #[test]
    fn zeroed_slot_is_free() {
        let slot = [0u8; INODE_SIZE];
        assert!(InodeRecord::parse(&slot, InodeNo::ROOT).unwrap().is_none());
    }

    #[test]
    fn corrupt_slot_is_rejected() {
        let inode = InodeRecord::new(FileMode::DEFAULT_DIR, 0);
        let mut bytes = inode.to_bytes();
        bytes[40] ^= 0xFF;
        assert!(InodeRecord::parse(&bytes, InodeNo::ROOT).is_err());
    }

    #[test]
    fn mode_predicates() {
        assert!(FileMode::DEFAULT_DIR.is_dir());
        assert!(!FileMode::DEFAULT_DIR.is_regular());
        assert!(FileMode::S_IFLNK.is_symlink());
    }
}
