//! vectorfs: a persistent vector-database filesystem core.
//!
//! The store keeps ordinary file and directory data alongside
//! high-dimensional vectors in one fixed-size container, with an HNSW
//! approximate-nearest-neighbor index embedded in the store and a circular
//! write-ahead journal providing crash consistency and fast recovery.
//!
//! The public surface is deliberately small: [`Store`] is the root handle,
//! [`Transaction`] the only way to mutate. A commit either applies fully
//! and is durable before the call returns, or leaves no visible effect.
//!
//! ```no_run
//! use vectorfs::{
//!     ElementType, FileMode, FormatParams, InodeNo, Isolation, Store, StoreConfig,
//!     VectorDescriptor,
//! };
//!
//! # fn main() -> Result<(), vectorfs::StoreError> {
//! let store = Store::format(
//!     "vectors.img".as_ref(),
//!     1 << 30,
//!     FormatParams::default(),
//!     StoreConfig::default(),
//! )?;
//!
//! let mut txn = store.begin(Isolation::ReadCommitted)?;
//! let file = txn.create_inode(InodeNo::ROOT, b"embeddings", FileMode::DEFAULT_FILE)?;
//! let payload = vectorfs::f32_payload(&[0.1, 0.2, 0.3, 0.4]);
//! let id = txn.store_vector(file, VectorDescriptor::new(ElementType::Float32, 4), &payload)?;
//! txn.commit()?;
//!
//! let hits = store.search(None, &VectorDescriptor::new(ElementType::Float32, 4), &payload, 1, None)?;
//! assert_eq!(hits[0].vector_id, id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub(crate) mod cache;
pub(crate) mod fs;
pub(crate) mod io;
pub(crate) mod journal;
pub(crate) mod txn;
pub(crate) mod vector;

pub use config::{FormatParams, HnswParams, StoreConfig};
pub use errors::{CanFail, StoreError, StoreResult};
pub use fs::dir::DirEntry;
pub use fs::inode::{FileMode, InodeNo, InodeRecord};
pub use fs::{SearchHit, Store, StoreStats};
pub use io::BlockId;
pub use txn::{Isolation, Transaction};
pub use vector::distance::{f32_payload, ElementType, Metric};
pub use vector::hnsw::{HnswStats, ValidateReport};
pub use vector::{VectorDescriptor, VectorFlags, VectorId};

#[cfg(test)]
pub(crate) mod test_util {
    //! Shared fixtures: unique temp-file containers and pre-built store
    //! parts for the lower-layer tests.

    use crate::config::FormatParams;
    use crate::fs::alloc::Allocator;
    use crate::fs::bitmap::Bitmap;
    use crate::fs::sb::Superblock;
    use crate::io::{Container, BLOCK_SIZE};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// A unique container path under the system temp directory.
    pub(crate) fn temp_container_path(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "vectorfs-{tag}-{}-{n}.img",
            std::process::id()
        ))
    }

    /// Container, superblock and allocator for journal-layer tests that do
    /// not need a full mount. The container file is removed on drop.
    pub(crate) struct MiniParts {
        pub(crate) container: Container,
        pub(crate) sb: Superblock,
        pub(crate) allocator: Allocator,
        path: PathBuf,
    }

    impl Drop for MiniParts {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub(crate) fn mini_parts(tag: &str, params: FormatParams) -> MiniParts {
        let path = temp_container_path(tag);
        let total_blocks = 16_384u64;
        let container = Container::create(&path, total_blocks * BLOCK_SIZE as u64).unwrap();
        let sb = Superblock::build(total_blocks, &params, [0xA5; 16]).unwrap();
        let allocator = Allocator::new(
            &sb,
            Bitmap::new_free(sb.data_blocks),
            Bitmap::new_free(sb.inode_count as u64),
        );
        MiniParts {
            container,
            sb,
            allocator,
            path,
        }
    }
}
