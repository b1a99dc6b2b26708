//! Adjacency record storage.
//!
//! A node's adjacency is one record: a 32-byte header followed by per-layer
//! `(count: u32, neighbor_ids: [u64; count])` lists. Records are packed into
//! HNSW blocks at 64-byte-aligned offsets; a node's slot is reserved at the
//! layer caps for its level, so in-place rewrites always fit. The flat node
//! index maps `vector_id -> (block, offset)` plus presence and tombstone
//! flags.

use crate::config::HnswParams;
use crate::errors::{StoreError, StoreResult};
use crate::io::crc32_calc;
use bytemuck::{Pod, Zeroable};

/// Bytes per node index entry.
pub(crate) const NODE_INDEX_ENTRY: usize = 16;
/// Adjacency record header length.
pub(crate) const NODE_HEADER: usize = 32;
/// Slot alignment inside an HNSW block.
pub(crate) const NODE_SLOT_ALIGN: usize = 64;

/// One slot of the HNSW node index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct NodeIndexEntry {
    pub(crate) block: u64,
    pub(crate) offset: u32,
    pub(crate) flags: u32,
}

const _: () = assert!(core::mem::size_of::<NodeIndexEntry>() == NODE_INDEX_ENTRY);

impl NodeIndexEntry {
    /// The slot points at a live record.
    pub(crate) const PRESENT: u32 = 0x1;
    /// The node is logically deleted but kept for connectivity.
    pub(crate) const TOMBSTONE: u32 = 0x2;

    pub(crate) fn is_present(&self) -> bool {
        self.flags & Self::PRESENT != 0
    }

    pub(crate) fn is_tombstoned(&self) -> bool {
        self.flags & Self::TOMBSTONE != 0
    }
}

/// In-memory adjacency of one node.
#[derive(Clone, Debug)]
pub(crate) struct NodeRecord {
    pub(crate) id: u64,
    pub(crate) level: u32,
    pub(crate) flags: u32,
    /// `layers[l]` holds the neighbor ids at layer `l`, `l <= level`.
    pub(crate) layers: Vec<Vec<u64>>,
}

impl NodeRecord {
    pub(crate) fn new(id: u64, level: u32) -> Self {
        Self {
            id,
            level,
            flags: 0,
            layers: vec![Vec::new(); level as usize + 1],
        }
    }

    /// Reserved slot size for a node of `level`: header, per-layer counts
    /// and id arrays at the layer caps, rounded to the slot alignment.
    pub(crate) fn slot_size(level: u32, params: &HnswParams) -> usize {
        let mut size = NODE_HEADER;
        for layer in 0..=level {
            size += 4 + 8 * params.cap(layer);
        }
        size.next_multiple_of(NODE_SLOT_ALIGN)
    }

    /// Rough in-memory weight, for cache accounting.
    pub(crate) fn approx_bytes(&self) -> usize {
        NODE_HEADER + self.layers.iter().map(|l| 4 + 8 * l.len()).sum::<usize>()
    }

    /// Serializes into the variable on-disk form:
    /// header, then per-layer `(count, ids)`.
    ///
    /// Header: `vector_id: u64, level: u16, layer_count: u16, flags: u32,
    /// crc: u32, byte_len: u32, reserved: u64`. The CRC covers everything
    /// after the header.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let body_len: usize = self.layers.iter().map(|l| 4 + 8 * l.len()).sum();
        let mut out = vec![0u8; NODE_HEADER + body_len];

        let mut off = NODE_HEADER;
        for layer in &self.layers {
            out[off..off + 4].copy_from_slice(&(layer.len() as u32).to_le_bytes());
            off += 4;
            for id in layer {
                out[off..off + 8].copy_from_slice(&id.to_le_bytes());
                off += 8;
            }
        }
        let crc = crc32_calc(&out[NODE_HEADER..]);

        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..10].copy_from_slice(&(self.level as u16).to_le_bytes());
        out[10..12].copy_from_slice(&(self.layers.len() as u16).to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..20].copy_from_slice(&crc.to_le_bytes());
        out[20..24].copy_from_slice(&(body_len as u32).to_le_bytes());
        out
    }

    /// Parses a record at the start of `slot`, validating the CRC and the
    /// expected id.
    pub(crate) fn parse(slot: &[u8], expect_id: u64) -> StoreResult<Self> {
        if slot.len() < NODE_HEADER {
            return Err(StoreError::FsCorruption("short hnsw node record"));
        }
        let id = u64::from_le_bytes(slot[..8].try_into().unwrap());
        let level = u16::from_le_bytes(slot[8..10].try_into().unwrap()) as u32;
        let layer_count = u16::from_le_bytes(slot[10..12].try_into().unwrap()) as usize;
        let flags = u32::from_le_bytes(slot[12..16].try_into().unwrap());
        let crc = u32::from_le_bytes(slot[16..20].try_into().unwrap());
        let body_len = u32::from_le_bytes(slot[20..24].try_into().unwrap()) as usize;

        if id != expect_id || layer_count != level as usize + 1 {
            return Err(StoreError::FsCorruption("hnsw node record id mismatch"));
        }
        if NODE_HEADER + body_len > slot.len() {
            return Err(StoreError::FsCorruption("hnsw node record overflow"));
        }
        let body = &slot[NODE_HEADER..NODE_HEADER + body_len];
        if crc32_calc(body) != crc {
            return Err(StoreError::ChecksumMismatch { block: id });
        }

        let mut layers = Vec::with_capacity(layer_count);
        let mut off = 0usize;
        for _ in 0..layer_count {
            if off + 4 > body.len() {
                return Err(StoreError::FsCorruption("truncated hnsw layer list"));
            }
            let count = u32::from_le_bytes(body[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if off + count * 8 > body.len() {
                return Err(StoreError::FsCorruption("truncated hnsw layer list"));
            }
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                ids.push(u64::from_le_bytes(
                    body[off + i * 8..off + i * 8 + 8].try_into().unwrap(),
                ));
            }
            off += count * 8;
            layers.push(ids);
        }

        Ok(Self {
            id,
            level,
            flags,
            layers,
        })
    }

    /// Neighbors at `layer`, empty above the node's level.
    pub(crate) fn neighbors(&self, layer: u32) -> &[u64] {
        self.layers
            .get(layer as usize)
            .map(|l| l.as_slice())
            .unwrap_or(&[])
    }
}

/// On-disk graph header, stored in the typed header block's payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct GraphHeader {
    /// Entry point vector id, 0 when the graph is empty.
    pub(crate) entry_point: u64,
    /// Live (non-tombstoned) nodes.
    pub(crate) node_count: u64,
    pub(crate) max_level_seen: u32,
    pub(crate) m: u32,
    pub(crate) ef_construction: u32,
    pub(crate) max_level_cap: u32,
    /// `1 / ln(2)` as f64 bits; kept on disk so a remount reproduces the
    /// level distribution.
    pub(crate) ml_bits: u64,
    pub(crate) seed: u64,
    /// Bump state of the current record pack block.
    pub(crate) pack_block: u64,
    pub(crate) pack_used: u32,
    _pad: u32,
}

const _: () = assert!(core::mem::size_of::<GraphHeader>() == 64);

impl GraphHeader {
    pub(crate) fn new(params: &HnswParams) -> Self {
        Self {
            entry_point: 0,
            node_count: 0,
            max_level_seen: 0,
            m: params.m,
            ef_construction: params.ef_construction,
            max_level_cap: params.max_level,
            ml_bits: (1.0f64 / std::f64::consts::LN_2).to_bits(),
            seed: params.seed,
            pack_block: 0,
            pack_used: 0,
            _pad: 0,
        }
    }

    pub(crate) fn params(&self) -> HnswParams {
        HnswParams {
            m: self.m,
            ef_construction: self.ef_construction,
            max_level: self.max_level_cap,
            seed: self.seed,
        }
    }

    pub(crate) fn ml(&self) -> f64 {
        f64::from_bits(self.ml_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let mut record = NodeRecord::new(99, 2);
        record.layers[0] = vec![1, 2, 3];
        record.layers[1] = vec![4];
        record.layers[2] = vec![];
        let bytes = record.serialize();
        let parsed = NodeRecord::parse(&bytes, 99).unwrap();
        assert_eq!(parsed.level, 2);
        assert_eq!(parsed.neighbors(0), &[1, 2, 3]);
        assert_eq!(parsed.neighbors(1), &[4]);
        assert!(parsed.neighbors(2).is_empty());
        assert!(parsed.neighbors(7).is_empty());
    }

    #[test]
    fn tampered_record_rejected() {
        let mut record = NodeRecord::new(1, 0);
        record.layers[0] = vec![10, 20];
        let mut bytes = record.serialize();
        bytes[NODE_HEADER + 6] ^= 1;
        assert!(NodeRecord::parse(&bytes, 1).is_err());
    }

    #[test]
    fn slot_sizes_cover_caps() {
        let params = HnswParams::default();
        // Level 0: header + one layer at cap 32.
        let level0 = NodeRecord::slot_size(0, &params);
        assert!(level0 >= NODE_HEADER + 4 + 8 * 32);
        assert_eq!(level0 % NODE_SLOT_ALIGN, 0);

        // A full record at the caps must serialize within its slot.
        let mut record = NodeRecord::new(5, 1);
        record.layers[0] = (0..32u64).collect();
        record.layers[1] = (0..16u64).collect();
        assert!(record.serialize().len() <= NodeRecord::slot_size(1, &params));
    }
}
