//! Mount-time journal recovery.
//!
//! Scans the journal region from the superblock's recorded tail, collects
//! complete transactions (descriptor + block-data + a commit record listing
//! them, all CRCs valid) and applies their images to home blocks in record
//! order. Partial transactions are discarded wholesale. Revocation records
//! cancel earlier images of freed blocks; checkpoint records raise the floor
//! below which nothing is reapplied. The scan stops at the first record that
//! fails validation or breaks the sequence chain: that is the end of the log.

use crate::errors::StoreResult;
use crate::fs::sb::Superblock;
use crate::io::{BlockId, Container, BLOCK_SIZE};
use crate::journal::record::{
    decode_block_list, decode_checkpoint, decode_txn_list, RecordHeader, RecordType,
    RECORD_HEADER_LEN,
};
use hashbrown::HashMap;
use std::sync::Arc;

/// Outcome of a recovery pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RecoveryReport {
    /// Complete transactions whose effects were applied.
    pub(crate) replayed_txns: u64,
    /// Partial transactions discarded.
    pub(crate) discarded_txns: u64,
    /// Block images written in place.
    pub(crate) blocks_applied: u64,
    /// Sequence number the journal continues from.
    pub(crate) next_seq: u64,
}

#[derive(Default)]
struct OpenTxn {
    blocks: Vec<BlockId>,
    images: Vec<(u64, Arc<Vec<u8>>)>,
    revoked: Vec<(u64, Vec<BlockId>)>,
}

/// Replays the journal onto home blocks. Runs before the store's journal
/// handle exists; on success the journal is logically empty.
pub(crate) fn recover(container: &Container, sb: &Superblock) -> StoreResult<RecoveryReport> {
    let region_start = sb.journal_start * BLOCK_SIZE as u64;
    let region_len = sb.journal_bytes();

    let read_wrapped = |rel_off: u64, buf: &mut [u8]| -> StoreResult<()> {
        let rel_off = rel_off % region_len;
        let first = ((region_len - rel_off) as usize).min(buf.len());
        container.read_at(region_start + rel_off, &mut buf[..first])?;
        if first < buf.len() {
            let rest = buf.len() - first;
            let mut tail = vec![0u8; rest];
            container.read_at(region_start, &mut tail)?;
            buf[first..].copy_from_slice(&tail);
        }
        Ok(())
    };

    let mut off = sb.journal_tail_off % region_len.max(1);
    let mut expected_seq = sb.journal_seq;
    let mut scanned: u64 = 0;

    let mut open: HashMap<u64, OpenTxn> = HashMap::new();
    let mut committed: Vec<(u64, OpenTxn)> = Vec::new();
    let mut floor: u64 = 0;

    loop {
        if scanned + RECORD_HEADER_LEN as u64 > region_len {
            break;
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        read_wrapped(off, &mut header_buf)?;
        let Some((header, rtype)) = RecordHeader::parse(&header_buf) else {
            break;
        };
        if header.seq != expected_seq {
            break;
        }
        let length = header.length as u64;
        if scanned + RECORD_HEADER_LEN as u64 + length > region_len {
            break;
        }
        let mut payload = vec![0u8; length as usize];
        read_wrapped(
            (off + RECORD_HEADER_LEN as u64) % region_len,
            &mut payload,
        )?;
        if !header.check_payload(&payload) {
            break;
        }

        match rtype {
            RecordType::Descriptor => {
                let blocks = match decode_block_list(&payload) {
                    Ok(blocks) => blocks,
                    Err(_) => break,
                };
                open.entry(header.txn_id).or_default().blocks.extend(blocks);
            }
            RecordType::BlockData => {
                if payload.len() != BLOCK_SIZE {
                    break;
                }
                if let Some(txn) = open.get_mut(&header.txn_id) {
                    txn.images.push((header.seq, Arc::new(payload)));
                } else {
                    log::warn!(
                        target: "vectorfs::recovery",
                        "orphan block-data record (txn {}, seq {}); skipping",
                        header.txn_id,
                        header.seq
                    );
                }
            }
            RecordType::Revocation => {
                let blocks = match decode_block_list(&payload) {
                    Ok(blocks) => blocks,
                    Err(_) => break,
                };
                if let Some(txn) = open.get_mut(&header.txn_id) {
                    txn.revoked.push((header.seq, blocks));
                }
            }
            RecordType::Commit => {
                let ids = match decode_txn_list(&payload) {
                    Ok(ids) => ids,
                    Err(_) => break,
                };
                for id in ids {
                    if let Some(txn) = open.remove(&id) {
                        committed.push((id, txn));
                    }
                }
            }
            RecordType::Checkpoint => {
                if let Ok(cp) = decode_checkpoint(&payload) {
                    floor = floor.max(cp.watermark_seq);
                }
            }
        }

        let advance = RECORD_HEADER_LEN as u64 + length;
        off = (off + advance) % region_len;
        scanned += advance;
        expected_seq += 1;
    }

    // Revocations from committed transactions: a freed block's earlier
    // images must not come back.
    let mut revoke_table: HashMap<u64, u64> = HashMap::new();
    for (_, txn) in &committed {
        for (seq, blocks) in &txn.revoked {
            for block in blocks {
                let entry = revoke_table.entry(u64::from(*block)).or_insert(0);
                *entry = (*entry).max(*seq);
            }
        }
    }

    // Flatten to (record seq, home block, image) and apply in record order;
    // per-block last-writer-wins follows from ascending sequence.
    let mut applies: Vec<(u64, BlockId, Arc<Vec<u8>>)> = Vec::new();
    let mut replayed = 0u64;
    let mut broken = 0u64;
    for (id, txn) in &committed {
        if txn.blocks.len() != txn.images.len() {
            log::warn!(
                target: "vectorfs::recovery",
                "committed txn {id} has {} descriptor slots but {} images; discarding",
                txn.blocks.len(),
                txn.images.len()
            );
            broken += 1;
            continue;
        }
        replayed += 1;
        for (block, (seq, image)) in txn.blocks.iter().zip(txn.images.iter()) {
            applies.push((*seq, *block, Arc::clone(image)));
        }
    }
    applies.sort_by_key(|(seq, _, _)| *seq);

    let mut blocks_applied = 0u64;
    for (seq, block, image) in applies {
        if seq <= floor {
            continue;
        }
        if revoke_table.get(&u64::from(block)).copied().unwrap_or(0) > seq {
            continue;
        }
        container.write_block(block, &image)?;
        blocks_applied += 1;
    }
    if blocks_applied > 0 {
        container.sync()?;
    }

    let discarded = open.len() as u64 + broken;
    if replayed > 0 || discarded > 0 {
        log::info!(
            target: "vectorfs::recovery",
            "journal recovery: {replayed} txns replayed ({blocks_applied} blocks), {discarded} discarded"
        );
    }

    Ok(RecoveryReport {
        replayed_txns: replayed,
        discarded_txns: discarded,
        blocks_applied,
        next_seq: expected_seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatParams;
    use crate::journal::{CommitRequest, Journal};
    use crate::test_util::mini_parts;
    use std::time::Duration;

    fn request(txn_id: u64, block: u64, byte: u8) -> CommitRequest {
        CommitRequest {
            txn_id,
            writes: vec![(BlockId::from(block), Arc::new(vec![byte; BLOCK_SIZE]))],
            revoked: Vec::new(),
            alloc_bits: Vec::new(),
            free_bits: Vec::new(),
            alloc_inodes: Vec::new(),
            free_inodes: Vec::new(),
        }
    }

    #[test]
    fn committed_txn_replays_onto_home_block() {
        let parts = mini_parts("recovery-replay", FormatParams::default());
        let block = parts.sb.data_start + 2;
        {
            let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
            journal
                .commit(&parts.container, &parts.allocator, request(1, block, 0xAB))
                .unwrap();
            // No checkpoint: the home block still holds zeroes.
            let home = parts.container.read_block(BlockId::from(block)).unwrap();
            assert_eq!(home[0], 0);
        }

        let report = recover(&parts.container, &parts.sb).unwrap();
        assert_eq!(report.replayed_txns, 1);
        assert_eq!(report.discarded_txns, 0);
        let home = parts.container.read_block(BlockId::from(block)).unwrap();
        assert!(home.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn missing_commit_record_discards_txn() {
        let parts = mini_parts("recovery-discard", FormatParams::default());
        let block = parts.sb.data_start + 2;
        let head_after = {
            let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
            journal
                .commit(&parts.container, &parts.allocator, request(1, block, 0xCD))
                .unwrap();
            journal.head_off_for_test()
        };

        // Crash simulation: the commit record (the last 48 bytes written)
        // never became durable.
        let commit_len = (RECORD_HEADER_LEN + 8 + 8) as u64;
        let region_start = parts.sb.journal_start * BLOCK_SIZE as u64;
        let zeros = vec![0u8; commit_len as usize];
        parts
            .container
            .write_at(region_start + head_after - commit_len, &zeros)
            .unwrap();

        let report = recover(&parts.container, &parts.sb).unwrap();
        assert_eq!(report.replayed_txns, 0);
        assert_eq!(report.discarded_txns, 1);
        let home = parts.container.read_block(BlockId::from(block)).unwrap();
        assert!(home.iter().all(|&b| b == 0));
    }

    #[test]
    fn revoked_block_is_not_replayed() {
        let parts = mini_parts("recovery-revoke", FormatParams::default());
        let block = parts.sb.data_start + 4;
        {
            let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
            journal
                .commit(&parts.container, &parts.allocator, request(1, block, 0x11))
                .unwrap();
            // A later transaction frees the block and revokes its images.
            let req = CommitRequest {
                txn_id: 2,
                writes: Vec::new(),
                revoked: vec![BlockId::from(block)],
                alloc_bits: Vec::new(),
                free_bits: Vec::new(),
                alloc_inodes: Vec::new(),
                free_inodes: Vec::new(),
            };
            journal.commit(&parts.container, &parts.allocator, req).unwrap();
        }

        let report = recover(&parts.container, &parts.sb).unwrap();
        assert_eq!(report.replayed_txns, 2);
        // The stale 0x11 image was cancelled by the revocation.
        let home = parts.container.read_block(BlockId::from(block)).unwrap();
        assert!(home.iter().all(|&b| b == 0));
    }

    #[test]
    fn stale_records_below_floor_are_ignored() {
        let parts = mini_parts("recovery-floor", FormatParams::default());
        let block = parts.sb.data_start + 6;
        let outcome = {
            let journal = Journal::new(&parts.sb, Duration::ZERO, 0, 1);
            journal
                .commit(&parts.container, &parts.allocator, request(1, block, 0x77))
                .unwrap();
            let outcome = journal.checkpoint(&parts.container).unwrap();
            // Home block already carries the image; wipe it to prove the
            // replay does not reapply checkpointed records.
            parts
                .container
                .write_block(BlockId::from(block), &vec![0u8; BLOCK_SIZE])
                .unwrap();
            outcome
        };

        let mut sb = parts.sb;
        sb.journal_tail_off = outcome.tail_off;
        sb.journal_seq = outcome.tail_seq;
        let report = recover(&parts.container, &sb).unwrap();
        assert_eq!(report.replayed_txns, 0);
        let home = parts.container.read_block(BlockId::from(block)).unwrap();
        assert!(home.iter().all(|&b| b == 0));
    }
}
