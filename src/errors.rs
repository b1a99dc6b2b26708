//! Error kinds surfaced by the store.
//!
//! Every failure in the core is data: a variant of [`StoreError`]. There is no
//! panicking error path outside of debug assertions on lock-ordering bugs.
//! Recoverable conditions (`Conflict`, `Timeout`, `NoSpace`, `JournalFull`)
//! are reported to the caller of the outer operation, which may retry.
//! Corruption conditions are terminal: the store downgrades to read-only and
//! every writing caller observes [`StoreError::FsCorruption`] thereafter.

use core::fmt;
use std::io;

/// Return type for operations that are allowed to fail and produce a value.
pub type StoreResult<T> = Result<T, StoreError>;

/// Return type for operations that are allowed to fail, and don't need to
/// return anything.
pub type CanFail = Result<(), StoreError>;

/// The closed set of error kinds the core can return.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying container I/O failed. Not retried inside the core.
    Io(io::Error),

    /// A block's CRC did not validate. The block's data is never returned.
    ChecksumMismatch {
        /// The offending block number.
        block: u64,
    },

    /// A structural invariant is violated (both superblocks bad, bitmap
    /// population skew unrecoverable, ...). The store is read-only from this
    /// point on.
    FsCorruption(&'static str),

    /// The allocator cannot satisfy a request, even after a checkpoint
    /// attempt freed journal space.
    NoSpace,

    /// The inode table is full.
    NoInode,

    /// Journal occupancy prevents beginning a new transaction, even after a
    /// forced checkpoint.
    JournalFull,

    /// Dimension or type mismatch, unknown id, or bad parameters.
    InvalidArgument(&'static str),

    /// Two live transactions tried to write the same block; the later one
    /// loses and must abort.
    Conflict {
        /// The contended block number.
        block: u64,
    },

    /// The transaction exceeded its configured maximum lifetime and was
    /// aborted.
    Timeout,

    /// The on-disk major format version is newer than this implementation
    /// understands.
    IncompatibleVersion {
        /// Major version found in the superblock.
        major: u16,
    },

    /// The HNSW integrity check failed after recovery. ANN queries degrade to
    /// a linear scan until the index is rebuilt.
    NeedsRebuild,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "container I/O failed: {err}"),
            Self::ChecksumMismatch { block } => {
                write!(f, "checksum mismatch on block {block}")
            }
            Self::FsCorruption(what) => write!(f, "filesystem corruption: {what}"),
            Self::NoSpace => f.write_str("out of data blocks"),
            Self::NoInode => f.write_str("inode table full"),
            Self::JournalFull => f.write_str("journal full"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::Conflict { block } => {
                write!(f, "block {block} is held by another live transaction")
            }
            Self::Timeout => f.write_str("transaction lifetime exceeded"),
            Self::IncompatibleVersion { major } => {
                write!(f, "on-disk major version {major} is not supported")
            }
            Self::NeedsRebuild => f.write_str("vector index needs rebuild"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl StoreError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Timeout | Self::NoSpace | Self::JournalFull
        )
    }
}
