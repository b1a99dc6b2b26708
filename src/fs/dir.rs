//! Directory entries and namespace operations.
//!
//! Directory contents are a chain of variable-length entries packed into the
//! directory inode's data blocks. An entry never spans blocks; every block
//! is fully covered by `rec_len` chains, and an entry with inode number 0 is
//! free space. Lookups are linear per directory.
//!
//! Entry layout: `inode: u64, rec_len: u16, name_len: u8, file_type: u8,
//! name bytes`, padded so `rec_len` is a multiple of 8.

use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::inode::{read_file, unix_now, FileMode, InodeNo, InodeRecord};
use crate::fs::BlockView;
use crate::io::{BlockId, BLOCK_SIZE};
use crate::txn::Transaction;

/// Fixed part of a directory entry.
pub(crate) const DIRENT_HEADER: usize = 12;
/// Maximum name length, in bytes.
pub(crate) const NAME_MAX: usize = 255;

/// File-type tag stored in a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum DirentType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 3,
}

impl DirentType {
    fn from_mode(mode: FileMode) -> Self {
        if mode.is_dir() {
            Self::Directory
        } else if mode.is_symlink() {
            Self::Symlink
        } else if mode.is_regular() {
            Self::Regular
        } else {
            Self::Unknown
        }
    }
}

/// One parsed directory entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub inode: InodeNo,
    pub name: Vec<u8>,
}

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn used_len(name_len: usize) -> usize {
    align8(DIRENT_HEADER + name_len)
}

struct RawEntry {
    offset: usize,
    inode: u64,
    rec_len: usize,
    name_len: usize,
}

/// Iterates the `rec_len` chain of one directory block.
struct BlockEntries<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> BlockEntries<'a> {
    fn new(block: &'a [u8]) -> Self {
        Self { block, offset: 0 }
    }
}

impl<'a> Iterator for BlockEntries<'a> {
    type Item = RawEntry;

    fn next(&mut self) -> Option<RawEntry> {
        if self.offset + DIRENT_HEADER > BLOCK_SIZE {
            return None;
        }
        let at = self.offset;
        let inode = u64::from_le_bytes(self.block[at..at + 8].try_into().unwrap());
        let rec_len = u16::from_le_bytes(self.block[at + 8..at + 10].try_into().unwrap()) as usize;
        let name_len = self.block[at + 10] as usize;
        if rec_len < DIRENT_HEADER || at + rec_len > BLOCK_SIZE || rec_len % 8 != 0 {
            // Malformed chain: stop rather than misinterpret.
            return None;
        }
        self.offset += rec_len;
        Some(RawEntry {
            offset: at,
            inode,
            rec_len,
            name_len,
        })
    }
}

fn entry_name<'a>(block: &'a [u8], entry: &RawEntry) -> &'a [u8] {
    &block[entry.offset + DIRENT_HEADER..entry.offset + DIRENT_HEADER + entry.name_len]
}

fn write_entry(block: &mut [u8], offset: usize, inode: u64, rec_len: usize, name: &[u8], ftype: DirentType) {
    block[offset..offset + 8].copy_from_slice(&inode.to_le_bytes());
    block[offset + 8..offset + 10].copy_from_slice(&(rec_len as u16).to_le_bytes());
    block[offset + 10] = name.len() as u8;
    block[offset + 11] = ftype as u8;
    block[offset + DIRENT_HEADER..offset + DIRENT_HEADER + name.len()].copy_from_slice(name);
}

fn check_name(name: &[u8]) -> CanFail {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(StoreError::InvalidArgument("bad name length"));
    }
    if name.contains(&0) || name.contains(&b'/') {
        return Err(StoreError::InvalidArgument("name contains reserved bytes"));
    }
    Ok(())
}

/// Looks a name up in a directory through an arbitrary view.
pub(crate) fn dir_lookup<V: BlockView>(
    view: &V,
    dir: &InodeRecord,
    name: &[u8],
) -> StoreResult<Option<InodeNo>> {
    if !dir.mode().is_dir() {
        return Err(StoreError::InvalidArgument("not a directory"));
    }
    for file_block in 0..dir.block_count() {
        let Some(block) = crate::fs::inode::bmap(view, dir, file_block)? else {
            continue;
        };
        let image = view.view_block(block)?;
        for entry in BlockEntries::new(&image) {
            if entry.inode != 0 && entry_name(&image, &entry) == name {
                return Ok(Some(InodeNo::from(entry.inode)));
            }
        }
    }
    Ok(None)
}

/// Lists the live entries of a directory.
pub(crate) fn dir_list<V: BlockView>(view: &V, dir: &InodeRecord) -> StoreResult<Vec<DirEntry>> {
    if !dir.mode().is_dir() {
        return Err(StoreError::InvalidArgument("not a directory"));
    }
    let mut out = Vec::new();
    for file_block in 0..dir.block_count() {
        let Some(block) = crate::fs::inode::bmap(view, dir, file_block)? else {
            continue;
        };
        let image = view.view_block(block)?;
        for entry in BlockEntries::new(&image) {
            if entry.inode != 0 {
                out.push(DirEntry {
                    inode: InodeNo::from(entry.inode),
                    name: entry_name(&image, &entry).to_vec(),
                });
            }
        }
    }
    Ok(out)
}

/// Whether a directory holds anything besides `.` and `..`.
fn dir_is_empty<V: BlockView>(view: &V, dir: &InodeRecord) -> StoreResult<bool> {
    for entry in dir_list(view, dir)? {
        if entry.name != b"." && entry.name != b".." {
            return Ok(false);
        }
    }
    Ok(true)
}

impl Transaction {
    /// Inserts `(name -> ino)` into the directory, growing it by one block
    /// if no chain has room. `dir` is updated in place when the directory
    /// grows; the caller persists the record.
    fn dirent_insert(
        &mut self,
        dir: &mut InodeRecord,
        name: &[u8],
        target: InodeNo,
        ftype: DirentType,
    ) -> CanFail {
        let needed = used_len(name.len());

        for file_block in 0..dir.block_count() {
            let Some(block) = crate::fs::inode::bmap(self, dir, file_block)? else {
                continue;
            };
            // Find a slot: a free entry or tail slack of a live one.
            let slot = {
                let image = self.read_block_view(block)?;
                let mut found = None;
                for entry in BlockEntries::new(&image) {
                    if entry.inode == 0 && entry.rec_len >= needed {
                        found = Some((entry.offset, 0usize, entry.rec_len));
                        break;
                    }
                    let used = used_len(entry.name_len);
                    if entry.inode != 0 && entry.rec_len - used >= needed {
                        found = Some((entry.offset, used, entry.rec_len));
                        break;
                    }
                }
                found
            };

            if let Some((offset, keep, rec_len)) = slot {
                let shadow = self.get_write_access(block)?;
                if keep == 0 {
                    // Reuse the free entry wholesale.
                    write_entry(shadow, offset, u64::from(target), rec_len, name, ftype);
                } else {
                    // Split the slack off a live entry.
                    shadow[offset + 8..offset + 10].copy_from_slice(&(keep as u16).to_le_bytes());
                    write_entry(
                        shadow,
                        offset + keep,
                        u64::from(target),
                        rec_len - keep,
                        name,
                        ftype,
                    );
                }
                return Ok(());
            }
        }

        // Every block is full: append one.
        let file_block = dir.block_count();
        let hint = BlockId::from(if dir.direct[0] != 0 {
            dir.direct[0]
        } else {
            self.shared.geometry.data_start
        });
        let block = self.bmap_alloc(dir, file_block, hint)?;
        let shadow = self.get_write_access_zeroed(block)?;
        write_entry(shadow, 0, u64::from(target), BLOCK_SIZE, name, ftype);
        dir.size = (file_block + 1) * BLOCK_SIZE as u64;
        Ok(())
    }

    /// Removes `name` from the directory chain. Fails if absent.
    fn dirent_remove(&mut self, dir: &InodeRecord, name: &[u8]) -> StoreResult<InodeNo> {
        for file_block in 0..dir.block_count() {
            let Some(block) = crate::fs::inode::bmap(self, dir, file_block)? else {
                continue;
            };
            let found = {
                let image = self.read_block_view(block)?;
                let mut prev: Option<RawEntry> = None;
                let mut found = None;
                for entry in BlockEntries::new(&image) {
                    if entry.inode != 0 && entry_name(&image, &entry) == name {
                        found = Some((
                            entry.offset,
                            entry.rec_len,
                            entry.inode,
                            prev.map(|p| (p.offset, p.rec_len)),
                        ));
                        break;
                    }
                    prev = Some(entry);
                }
                found
            };
            if let Some((offset, rec_len, inode, prev)) = found {
                let shadow = self.get_write_access(block)?;
                match prev {
                    Some((prev_off, prev_len)) => {
                        // Merge into the predecessor's chain.
                        let merged = (prev_len + rec_len) as u16;
                        shadow[prev_off + 8..prev_off + 10]
                            .copy_from_slice(&merged.to_le_bytes());
                    }
                    None => {
                        // First entry of the block becomes free space.
                        shadow[offset..offset + 8].copy_from_slice(&0u64.to_le_bytes());
                    }
                }
                return Ok(InodeNo::from(inode));
            }
        }
        Err(StoreError::InvalidArgument("no such directory entry"))
    }

    /// Creates a file, directory or symlink inode and links it under
    /// `parent`. Returns the new inode number.
    pub fn create_inode(
        &mut self,
        parent: InodeNo,
        name: &[u8],
        mode: FileMode,
    ) -> StoreResult<InodeNo> {
        self.check_alive()?;
        check_name(name)?;
        let mut parent_inode = self.read_inode(parent)?;
        if !parent_inode.mode().is_dir() {
            return Err(StoreError::InvalidArgument("parent is not a directory"));
        }
        if dir_lookup(self, &parent_inode, name)?.is_some() {
            return Err(StoreError::InvalidArgument("name already exists"));
        }

        let ino = InodeNo::from(self.stage_alloc_inode()?);
        let mut inode = InodeRecord::new(mode, self.shared.generation());

        if mode.is_dir() {
            inode.links = 2; // "." plus the parent entry
            self.dirent_insert(&mut inode, b".", ino, DirentType::Directory)?;
            self.dirent_insert(&mut inode, b"..", parent, DirentType::Directory)?;
            parent_inode.links += 1;
        }
        self.write_inode(ino, &inode)?;

        self.dirent_insert(&mut parent_inode, name, ino, DirentType::from_mode(mode))?;
        parent_inode.mtime = unix_now();
        self.write_inode(parent, &parent_inode)?;
        Ok(ino)
    }

    /// Adds a hard link `parent/name -> ino`.
    pub fn link(&mut self, parent: InodeNo, name: &[u8], ino: InodeNo) -> CanFail {
        self.check_alive()?;
        check_name(name)?;
        let mut parent_inode = self.read_inode(parent)?;
        if dir_lookup(self, &parent_inode, name)?.is_some() {
            return Err(StoreError::InvalidArgument("name already exists"));
        }
        let mut inode = self.read_inode(ino)?;
        if inode.mode().is_dir() {
            return Err(StoreError::InvalidArgument("cannot hard-link a directory"));
        }
        inode.links += 1;
        inode.ctime = unix_now();
        self.write_inode(ino, &inode)?;
        self.dirent_insert(&mut parent_inode, name, ino, DirentType::from_mode(inode.mode()))?;
        self.write_inode(parent, &parent_inode)?;
        Ok(())
    }

    /// Creates a symlink whose target is stored in the inode's data extent.
    pub fn symlink(&mut self, parent: InodeNo, name: &[u8], target: &[u8]) -> StoreResult<InodeNo> {
        if target.is_empty() || target.len() > BLOCK_SIZE {
            return Err(StoreError::InvalidArgument("bad symlink target length"));
        }
        let ino = self.create_inode(parent, name, FileMode(FileMode::S_IFLNK.0 | 0o777))?;
        let mut inode = self.read_inode(ino)?;
        let hint = BlockId::from(self.shared.geometry.data_start);
        let block = self.bmap_alloc(&mut inode, 0, hint)?;
        let shadow = self.get_write_access_zeroed(block)?;
        shadow[..target.len()].copy_from_slice(target);
        inode.size = target.len() as u64;
        self.write_inode(ino, &inode)?;
        Ok(ino)
    }

    /// Unlinks `parent/name`. When the link count reaches zero the inode's
    /// data blocks, owned vectors and table slot are released.
    pub fn unlink(&mut self, parent: InodeNo, name: &[u8]) -> CanFail {
        self.check_alive()?;
        if name == b"." || name == b".." {
            return Err(StoreError::InvalidArgument("refusing to unlink dot entries"));
        }
        let mut parent_inode = self.read_inode(parent)?;
        let target = dir_lookup(self, &parent_inode, name)?
            .ok_or(StoreError::InvalidArgument("no such directory entry"))?;
        let mut inode = self.read_inode(target)?;

        if inode.mode().is_dir() {
            if !dir_is_empty(self, &inode)? {
                return Err(StoreError::InvalidArgument("directory not empty"));
            }
            // "." and the parent entry die together.
            self.dirent_remove(&parent_inode, name)?;
            parent_inode.links -= 1;
            self.destroy_inode(target, &inode)?;
        } else {
            self.dirent_remove(&parent_inode, name)?;
            inode.links -= 1;
            if inode.links == 0 {
                self.destroy_inode(target, &inode)?;
            } else {
                inode.ctime = unix_now();
                self.write_inode(target, &inode)?;
            }
        }
        parent_inode.mtime = unix_now();
        self.write_inode(parent, &parent_inode)
    }

    /// Frees everything an inode owns and clears its slot.
    fn destroy_inode(&mut self, ino: InodeNo, inode: &InodeRecord) -> CanFail {
        self.free_inode_data(inode)?;
        self.release_owned_vectors(inode)?;
        self.clear_inode(ino)?;
        self.stage_free_inode(u64::from(ino));
        Ok(())
    }

    /// Atomically moves `src_parent/src_name` to `dst_parent/dst_name`,
    /// replacing a non-directory destination if present. Both directory
    /// updates and any link-count changes belong to this one transaction.
    pub fn rename(
        &mut self,
        src_parent: InodeNo,
        src_name: &[u8],
        dst_parent: InodeNo,
        dst_name: &[u8],
    ) -> CanFail {
        self.check_alive()?;
        check_name(dst_name)?;
        if src_name == b"." || src_name == b".." {
            return Err(StoreError::InvalidArgument("refusing to rename dot entries"));
        }
        if src_parent == dst_parent && src_name == dst_name {
            return Ok(());
        }

        let mut src_dir = self.read_inode(src_parent)?;
        let moved = dir_lookup(self, &src_dir, src_name)?
            .ok_or(StoreError::InvalidArgument("no such directory entry"))?;
        let moved_inode = self.read_inode(moved)?;

        if dst_parent != src_parent {
            let dst_dir = self.read_inode(dst_parent)?;
            if dir_lookup(self, &dst_dir, dst_name)?.is_some() {
                self.unlink(dst_parent, dst_name)?;
            }
        } else if dir_lookup(self, &src_dir, dst_name)?.is_some() {
            self.unlink(src_parent, dst_name)?;
        }

        // Re-read after the potential unlink rewired the chains.
        let mut src_dir = self.read_inode(src_parent)?;
        self.dirent_remove(&src_dir, src_name)?;

        if dst_parent == src_parent {
            self.dirent_insert(
                &mut src_dir,
                dst_name,
                moved,
                DirentType::from_mode(moved_inode.mode()),
            )?;
            src_dir.mtime = unix_now();
            self.write_inode(src_parent, &src_dir)?;
            return Ok(());
        }

        let mut dst_dir = self.read_inode(dst_parent)?;
        self.dirent_insert(
            &mut dst_dir,
            dst_name,
            moved,
            DirentType::from_mode(moved_inode.mode()),
        )?;

        if moved_inode.mode().is_dir() {
            // Rewire "..": the moved directory now hangs off dst_parent.
            let mut moved_dir = self.read_inode(moved)?;
            self.dirent_remove(&moved_dir, b"..")?;
            self.dirent_insert(&mut moved_dir, b"..", dst_parent, DirentType::Directory)?;
            self.write_inode(moved, &moved_dir)?;
            src_dir.links -= 1;
            dst_dir.links += 1;
        }

        src_dir.mtime = unix_now();
        dst_dir.mtime = unix_now();
        self.write_inode(src_parent, &src_dir)?;
        self.write_inode(dst_parent, &dst_dir)?;
        Ok(())
    }

    /// Reads a symlink target through this transaction's view.
    pub fn read_link(&self, ino: InodeNo) -> StoreResult<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        if !inode.mode().is_symlink() {
            return Err(StoreError::InvalidArgument("not a symlink"));
        }
        read_file(self, &inode, 0, inode.size as usize)
    }
}
