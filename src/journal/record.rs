//! Journal record framing.
//!
//! Every record is a 32-byte header followed by a payload. The header carries
//! the record type, a monotonically increasing sequence number, the owning
//! transaction (0 for batch-level records) and a CRC32 of the payload.
//! Records are packed back to back in the circular journal region; a record
//! whose header or payload fails validation terminates a recovery scan.

use crate::errors::{StoreError, StoreResult};
use crate::io::{crc32_calc, BlockId, BLOCK_SIZE};
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

/// Size of a record header, in bytes.
pub(crate) const RECORD_HEADER_LEN: usize = 32;

/// Largest payload a record may carry: one block image plus slack for id
/// lists.
pub(crate) const MAX_PAYLOAD_LEN: usize = BLOCK_SIZE + 64 * 1024;

/// Record type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum RecordType {
    /// Announces the home block numbers of the block-data records that
    /// follow within the same transaction.
    Descriptor = 1,
    /// One journaled block image.
    BlockData = 2,
    /// Cancels earlier journaled images of the listed blocks.
    Revocation = 3,
    /// Terminates every open transaction listed in its payload. One commit
    /// record may cover a whole group-commit batch.
    Commit = 4,
    /// Marks that records at or below the watermark sequence have been
    /// written in place.
    Checkpoint = 5,
}

impl RecordType {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Descriptor),
            2 => Some(Self::BlockData),
            3 => Some(Self::Revocation),
            4 => Some(Self::Commit),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// On-disk record header.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RecordHeader {
    pub(crate) rtype: u32,
    _pad: u32,
    pub(crate) seq: u64,
    pub(crate) txn_id: u64,
    pub(crate) length: u32,
    pub(crate) crc: u32,
}

const _: () = assert!(core::mem::size_of::<RecordHeader>() == RECORD_HEADER_LEN);

impl RecordHeader {
    pub(crate) fn new(rtype: RecordType, seq: u64, txn_id: u64, payload: &[u8]) -> Self {
        Self {
            rtype: rtype as u32,
            _pad: 0,
            seq,
            txn_id,
            length: payload.len() as u32,
            crc: crc32_calc(payload),
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out.copy_from_slice(bytes_of(self));
        out
    }

    /// Parses a header, rejecting unknown types and absurd lengths. The
    /// payload CRC is checked separately once the payload has been read.
    pub(crate) fn parse(buf: &[u8; RECORD_HEADER_LEN]) -> Option<(Self, RecordType)> {
        let header: RecordHeader = pod_read_unaligned(buf);
        let rtype = RecordType::from_raw(header.rtype)?;
        if header.length as usize > MAX_PAYLOAD_LEN {
            return None;
        }
        Some((header, rtype))
    }

    pub(crate) fn check_payload(&self, payload: &[u8]) -> bool {
        payload.len() == self.length as usize && crc32_calc(payload) == self.crc
    }
}

/// Encodes a list of block numbers (descriptor and revocation payloads).
pub(crate) fn encode_block_list(blocks: &[BlockId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + blocks.len() * 8);
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for block in blocks {
        out.extend_from_slice(&u64::from(*block).to_le_bytes());
    }
    out
}

/// Decodes a block-number list payload.
pub(crate) fn decode_block_list(payload: &[u8]) -> StoreResult<Vec<BlockId>> {
    if payload.len() < 8 {
        return Err(StoreError::FsCorruption("truncated journal id list"));
    }
    let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() != 8 + count * 8 {
        return Err(StoreError::FsCorruption("journal id list length mismatch"));
    }
    Ok((0..count)
        .map(|i| {
            let off = 8 + i * 8;
            BlockId::from(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap()))
        })
        .collect())
}

/// Encodes a commit payload: the transaction ids the record completes.
pub(crate) fn encode_txn_list(txn_ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + txn_ids.len() * 8);
    out.extend_from_slice(&(txn_ids.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for id in txn_ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

/// Decodes a commit payload.
pub(crate) fn decode_txn_list(payload: &[u8]) -> StoreResult<Vec<u64>> {
    if payload.len() < 8 {
        return Err(StoreError::FsCorruption("truncated commit payload"));
    }
    let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() != 8 + count * 8 {
        return Err(StoreError::FsCorruption("commit payload length mismatch"));
    }
    Ok((0..count)
        .map(|i| {
            let off = 8 + i * 8;
            u64::from_le_bytes(payload[off..off + 8].try_into().unwrap())
        })
        .collect())
}

/// Checkpoint payload: `(sequence watermark, journal tail after)`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct CheckpointPayload {
    pub(crate) watermark_seq: u64,
    pub(crate) tail_after: u64,
}

pub(crate) fn decode_checkpoint(payload: &[u8]) -> StoreResult<CheckpointPayload> {
    if payload.len() != core::mem::size_of::<CheckpointPayload>() {
        return Err(StoreError::FsCorruption("checkpoint payload length mismatch"));
    }
    Ok(pod_read_unaligned(payload))
}
