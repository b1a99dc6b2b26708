//! Block-granular container I/O.
//!
//! The store lives inside a fixed-size container: a regular file or a block
//! device region. All persistent I/O goes through [`Container`] in 4 KiB
//! blocks; the journal additionally uses byte-granular access inside its own
//! region. Typed metadata blocks are self-identifying: an 8-byte signature at
//! offset 0 and a CRC32 over bytes `0..4092` stored at offset 4092. A block
//! whose checksum does not validate is never returned to a caller.

pub(crate) mod crc32;

use crate::errors::{CanFail, StoreError, StoreResult};
use bytemuck::{Pod, Zeroable};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub(crate) use crc32::crc32_calc;

/// Fixed unit of persistent I/O, in bytes.
pub(crate) const BLOCK_SIZE: usize = 4096;
/// Offset of the trailing CRC32 in a typed metadata block.
pub(crate) const BLOCK_CRC_OFF: usize = BLOCK_SIZE - 4;
/// Offset of the first payload byte in a typed metadata block.
pub(crate) const TYPED_PAYLOAD_OFF: usize = 8;
/// Payload bytes available in a typed metadata block.
pub(crate) const TYPED_PAYLOAD_LEN: usize = BLOCK_CRC_OFF - TYPED_PAYLOAD_OFF;

/// A block number inside the container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockId(pub(crate) u64);

impl BlockId {
    /// Block 0 holds the primary superblock.
    pub(crate) const PRIMARY_SUPERBLOCK: Self = Self(0);

    /// Block 1 holds the backup superblock.
    pub(crate) const BACKUP_SUPERBLOCK: Self = Self(1);
}

impl From<BlockId> for u64 {
    fn from(value: BlockId) -> Self {
        value.0
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for BlockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signature identifying the kind of a typed metadata block.
///
/// Signatures occupy the first 8 bytes of each typed block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub(crate) struct BlockSig(u64);

impl BlockSig {
    /// Superblock, primary and backup copies.
    pub(crate) const SUPERBLOCK: Self = Self(u64::from_le_bytes(*b"VFSUPER\0"));

    /// Allocation bitmap block (data blocks or inode slots).
    pub(crate) const BITMAP: Self = Self(u64::from_le_bytes(*b"VFBITMP\0"));

    /// HNSW node index block.
    pub(crate) const NODE_INDEX: Self = Self(u64::from_le_bytes(*b"VFNODIX\0"));

    /// HNSW graph header block.
    pub(crate) const GRAPH_HEADER: Self = Self(u64::from_le_bytes(*b"VFGRAPH\0"));

    /// Vector payload extent (first 8 bytes of the extent header).
    pub(crate) const EXTENT: Self = Self(u64::from_le_bytes(*b"VFVEXT\0\0"));

    pub(crate) fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

/// Writes the signature and trailing CRC of a typed metadata block.
pub(crate) fn seal_typed(buf: &mut [u8], sig: BlockSig) {
    debug_assert_eq!(buf.len(), BLOCK_SIZE);
    buf[..8].copy_from_slice(&sig.to_bytes());
    let crc = crc32_calc(&buf[..BLOCK_CRC_OFF]);
    buf[BLOCK_CRC_OFF..].copy_from_slice(&crc.to_le_bytes());
}

/// Validates the signature and trailing CRC of a typed metadata block.
///
/// On mismatch the block's content must not be interpreted.
pub(crate) fn verify_typed(buf: &[u8], sig: BlockSig, block: BlockId) -> CanFail {
    debug_assert_eq!(buf.len(), BLOCK_SIZE);
    if buf[..8] != sig.to_bytes() {
        return Err(StoreError::ChecksumMismatch { block: block.0 });
    }
    let stored = u32::from_le_bytes(buf[BLOCK_CRC_OFF..].try_into().unwrap());
    if crc32_calc(&buf[..BLOCK_CRC_OFF]) != stored {
        return Err(StoreError::ChecksumMismatch { block: block.0 });
    }
    Ok(())
}

/// The fixed-size container backing a store.
///
/// Positioned reads and writes only; the container is never memory-mapped for
/// writing. `sync` is the durability fence used by the journal.
pub(crate) struct Container {
    file: File,
    block_count: u64,
}

impl Container {
    /// Opens an existing container read-write.
    pub(crate) fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let bytes = container_size(&file)?;
        let block_count = bytes / BLOCK_SIZE as u64;
        if block_count < 2 {
            return Err(StoreError::InvalidArgument("container too small"));
        }
        Ok(Self { file, block_count })
    }

    /// Creates (or truncates) a regular-file container of `total_bytes`,
    /// rounded down to a whole number of blocks.
    pub(crate) fn create(path: &Path, total_bytes: u64) -> StoreResult<Self> {
        let block_count = total_bytes / BLOCK_SIZE as u64;
        if block_count < 2 {
            return Err(StoreError::InvalidArgument("container too small"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }

    /// Total number of blocks in the container.
    pub(crate) fn block_count(&self) -> u64 {
        self.block_count
    }

    fn check_bounds(&self, block: BlockId) -> CanFail {
        if block.0 >= self.block_count {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block number out of container bounds",
            )));
        }
        Ok(())
    }

    /// Reads one block into a fresh buffer.
    pub(crate) fn read_block(&self, block: BlockId) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block_into(block, &mut buf)?;
        Ok(buf)
    }

    /// Reads one block into `buf`.
    pub(crate) fn read_block_into(&self, block: BlockId, buf: &mut [u8]) -> CanFail {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.check_bounds(block)?;
        self.file.read_exact_at(buf, block.0 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Reads one typed metadata block, validating signature and CRC.
    pub(crate) fn read_typed(&self, block: BlockId, sig: BlockSig) -> StoreResult<Vec<u8>> {
        let buf = self.read_block(block)?;
        verify_typed(&buf, sig, block)?;
        Ok(buf)
    }

    /// Writes one block in place.
    pub(crate) fn write_block(&self, block: BlockId, buf: &[u8]) -> CanFail {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.check_bounds(block)?;
        self.file.write_all_at(buf, block.0 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Byte-granular read, used by the journal inside its own region.
    pub(crate) fn read_at(&self, off: u64, buf: &mut [u8]) -> CanFail {
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    /// Byte-granular write, used by the journal inside its own region.
    pub(crate) fn write_at(&self, off: u64, buf: &[u8]) -> CanFail {
        self.file.write_all_at(buf, off)?;
        Ok(())
    }

    /// Durability fence: everything written before this call is on stable
    /// storage when it returns.
    pub(crate) fn sync(&self) -> CanFail {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Returns the usable byte size of the container backing `file`.
///
/// Regular files report their length; block devices are sized with the
/// `BLKGETSIZE64` ioctl.
fn container_size(file: &File) -> StoreResult<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();

    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        use std::os::unix::fs::FileTypeExt;

        if file_type.is_block_device() {
            // ioctl command: get size of the device in bytes.
            const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

            let mut size: u64 = 0;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
            if ret < 0 {
                return Err(StoreError::Io(io::Error::last_os_error()));
            }
            return Ok(size);
        }
    }

    let _ = file_type;
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::temp_container_path;

    #[test]
    fn round_trip_block() {
        let path = temp_container_path("io-round-trip");
        let container = Container::create(&path, 64 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(container.block_count(), 64);

        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0] = 0xDE;
        buf[BLOCK_SIZE - 1] = 0xAD;
        container.write_block(BlockId(7), &buf).unwrap();

        let back = container.read_block(BlockId(7)).unwrap();
        assert_eq!(back, buf);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn out_of_bounds_rejected() {
        let path = temp_container_path("io-bounds");
        let container = Container::create(&path, 16 * BLOCK_SIZE as u64).unwrap();
        assert!(container.read_block(BlockId(16)).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn typed_block_seal_and_verify() {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[100] = 0x42;
        seal_typed(&mut buf, BlockSig::BITMAP);
        verify_typed(&buf, BlockSig::BITMAP, BlockId(3)).unwrap();

        // Wrong signature is rejected.
        assert!(matches!(
            verify_typed(&buf, BlockSig::NODE_INDEX, BlockId(3)),
            Err(StoreError::ChecksumMismatch { block: 3 })
        ));

        // A flipped payload bit is rejected.
        buf[2000] ^= 1;
        assert!(verify_typed(&buf, BlockSig::BITMAP, BlockId(3)).is_err());
    }
}
