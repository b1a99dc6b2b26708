//! Format-time parameters and runtime tunables.
//!
//! [`FormatParams`] fixes the container geometry when the store is created;
//! [`StoreConfig`] carries the knobs a mount may vary (cache sizes, commit
//! window, checkpoint policy). Both come with validated defaults.

use crate::errors::{StoreError, StoreResult};
use crate::vector::distance::Metric;

/// The default journal region size, in blocks.
pub const DEFAULT_JOURNAL_BLOCKS: u64 = 1024;
/// The minimum journal region size, in blocks.
pub const MIN_JOURNAL_BLOCKS: u64 = 64;
/// The default number of inode slots.
pub const DEFAULT_INODE_COUNT: u32 = 8192;
/// The default number of vector index blocks (64 entries per block).
pub const DEFAULT_VECTOR_INDEX_BLOCKS: u64 = 256;
/// The default number of HNSW node index blocks (header block excluded).
pub const DEFAULT_HNSW_INDEX_BLOCKS: u64 = 256;
/// The minimum number of data-pool blocks a formatted container must hold.
pub const MIN_DATA_BLOCKS: u64 = 64;

/// HNSW construction parameters, fixed at format time.
#[derive(Clone, Copy, Debug)]
pub struct HnswParams {
    /// Neighbor cap per layer >= 1; layer 0 uses `2 * m`.
    pub m: u32,
    /// Candidate-list size during construction.
    pub ef_construction: u32,
    /// Hard cap on assigned levels.
    pub max_level: u32,
    /// Seed for the level-assignment PRNG. Fixed per store for reproducible
    /// construction.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            max_level: 16,
            seed: 0x5157_4643_5653_4557,
        }
    }
}

impl HnswParams {
    /// Neighbor cap at the given layer.
    pub(crate) fn cap(&self, layer: u32) -> usize {
        if layer == 0 {
            (self.m * 2) as usize
        } else {
            self.m as usize
        }
    }

    pub(crate) fn validate(&self) -> CanFailParams {
        if self.m < 2 || self.m > 128 {
            return Err(StoreError::InvalidArgument("hnsw_M out of range"));
        }
        if self.ef_construction < self.m {
            return Err(StoreError::InvalidArgument(
                "hnsw_efConstruction below hnsw_M",
            ));
        }
        if self.max_level == 0 || self.max_level > 16 {
            return Err(StoreError::InvalidArgument("hnsw_max_level out of range"));
        }
        Ok(())
    }
}

type CanFailParams = StoreResult<()>;

/// Container geometry, decided once at format time.
#[derive(Clone, Debug)]
pub struct FormatParams {
    /// Block size in bytes. Fixed at 4096 in format v1; the option is
    /// recognized so images can declare it.
    pub block_size: u32,
    /// Total journal region size, in blocks.
    pub journal_blocks: u64,
    /// Number of inode slots in the inode table.
    pub inode_count: u32,
    /// Blocks reserved for the vector index (64 vector slots per block).
    pub vector_index_blocks: u64,
    /// Blocks reserved for the HNSW node index (255 node slots per block).
    pub hnsw_index_blocks: u64,
    /// HNSW tuning.
    pub hnsw: HnswParams,
    /// Default distance metric for queries that do not name one.
    pub default_metric: Metric,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            block_size: 4096,
            journal_blocks: DEFAULT_JOURNAL_BLOCKS,
            inode_count: DEFAULT_INODE_COUNT,
            vector_index_blocks: DEFAULT_VECTOR_INDEX_BLOCKS,
            hnsw_index_blocks: DEFAULT_HNSW_INDEX_BLOCKS,
            hnsw: HnswParams::default(),
            default_metric: Metric::L2,
        }
    }
}

impl FormatParams {
    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.block_size != 4096 {
            return Err(StoreError::InvalidArgument(
                "block size is fixed at 4096 in format v1",
            ));
        }
        if self.journal_blocks < MIN_JOURNAL_BLOCKS {
            return Err(StoreError::InvalidArgument("journal region too small"));
        }
        if self.inode_count < 16 {
            return Err(StoreError::InvalidArgument("inode count too small"));
        }
        if self.vector_index_blocks == 0 || self.hnsw_index_blocks == 0 {
            return Err(StoreError::InvalidArgument("index region too small"));
        }
        self.hnsw.validate()
    }
}

/// Runtime tunables, passed at `open` (and used by `format` for the initial
/// mount).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Periodic checkpoint timer, in milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Force a checkpoint when journal occupancy exceeds this percentage.
    pub checkpoint_watermark_percent: u8,
    /// Maximum delay a committing transaction waits for companions, in
    /// microseconds.
    pub group_commit_window_us: u64,
    /// Block cache capacity, in MiB.
    pub cache_block_mib: u64,
    /// Metadata cache capacity, in MiB.
    pub cache_metadata_mib: u64,
    /// Candidate-list size for searches that do not name one.
    pub default_ef_search: u32,
    /// Abort threshold for stalled transactions, in milliseconds.
    pub txn_max_lifetime_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 300_000,
            checkpoint_watermark_percent: 75,
            group_commit_window_us: 5_000,
            cache_block_mib: 96,
            cache_metadata_mib: 32,
            default_ef_search: 50,
            txn_max_lifetime_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.checkpoint_watermark_percent == 0 || self.checkpoint_watermark_percent > 100 {
            return Err(StoreError::InvalidArgument(
                "checkpoint watermark must be within 1..=100",
            ));
        }
        if self.default_ef_search == 0 {
            return Err(StoreError::InvalidArgument("default_efSearch must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FormatParams::default().validate().unwrap();
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_params_rejected() {
        let mut p = FormatParams::default();
        p.journal_blocks = 8;
        assert!(p.validate().is_err());

        let mut p = FormatParams::default();
        p.block_size = 8192;
        assert!(p.validate().is_err());

        let mut p = FormatParams::default();
        p.hnsw.max_level = 40;
        assert!(p.validate().is_err());

        let mut c = StoreConfig::default();
        c.checkpoint_watermark_percent = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn layer_caps() {
        let h = HnswParams::default();
        assert_eq!(h.cap(0), 32);
        assert_eq!(h.cap(1), 16);
        assert_eq!(h.cap(16), 16);
    }
}
