//! HNSW graph construction and search.
//!
//! The index is a layered proximity graph: layer 0 holds every node, each
//! higher layer a geometrically thinner subset. Search descends greedily
//! from the top entry point with `ef = 1`, then runs the candidate-list
//! search at layer 0; insertion does the same descent and links the new
//! node to its nearest neighbors per layer, pruning any neighbor that
//! overflows its cap.
//!
//! Both traversals are loops over pooled heap state, carrying `(layer,
//! candidate heap, visited set, result heap)` without recursion per layer
//! or per neighbor, so the stack stays a small constant regardless of
//! graph depth, degree or `ef`. Ties on equal distance always resolve to
//! the smaller vector id, making results deterministic.
//!
//! Deletion removes the node's incoming edges and tombstones its index
//! slot; the record and its outgoing layer-0 edges stay behind for
//! opportunistic reconnection by later inserts. All graph mutations ride
//! the caller's transaction: an aborted insert leaves no node or edge
//! behind.

pub(crate) mod node;
pub(crate) mod scratch;

use crate::cache::{MetaKey, MetaVal};
use crate::errors::{CanFail, StoreError, StoreResult};
use crate::fs::alloc::Strategy;
use crate::fs::inode::InodeNo;
use crate::fs::BlockView;
use crate::io::{seal_typed, BlockId, BlockSig, BLOCK_SIZE, TYPED_PAYLOAD_OFF};
use crate::txn::Transaction;
use crate::vector::distance::{distance, ElementType, Metric};
use crate::vector::{
    cached_index_entry, read_index_entry, read_payload, VectorDescriptor, VectorId,
};
use bytemuck::{bytes_of, pod_read_unaligned};
use node::{GraphHeader, NodeIndexEntry, NodeRecord, NODE_INDEX_ENTRY};
use scratch::{HeapEntry, ScratchPool, SearchScratch};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Seeded xorshift64* generator driving level assignment. One per store,
/// so a fixed seed reproduces the same graph for the same insert order.
pub(crate) struct XorShift64(u64);

impl XorShift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform draw in `(0, 1]`.
    fn next_unit(&mut self) -> f64 {
        ((self.next_u64() >> 11) + 1) as f64 / (1u64 << 53) as f64
    }
}

/// `floor(-ln(u) * mL)`, clamped to the configured cap.
pub(crate) fn assign_level(rng: &mut XorShift64, ml: f64, max_level: u32) -> u32 {
    let raw = (-rng.next_unit().ln() * ml).floor();
    (raw as u32).min(max_level)
}

/// Construction statistics snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct HnswStats {
    pub nodes_inserted: u64,
    pub edges_created: u64,
    pub entry_point_updates: u64,
    pub prune_events: u64,
}

/// Per-store in-memory graph state: the traversal scratch pool, the level
/// PRNG and construction counters. All persistent graph state lives in the
/// header block and the node records.
pub(crate) struct GraphState {
    /// Graph-wide reader/writer gate: searches share it, inserts take it
    /// exclusively.
    pub(crate) gate: spin::RwLock<()>,
    pub(crate) scratch: ScratchPool,
    pub(crate) rng: spin::Mutex<XorShift64>,
    nodes_inserted: AtomicU64,
    edges_created: AtomicU64,
    entry_point_updates: AtomicU64,
    prune_events: AtomicU64,
}

impl GraphState {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            gate: spin::RwLock::new(()),
            scratch: ScratchPool::new(),
            rng: spin::Mutex::new(XorShift64::new(seed)),
            nodes_inserted: AtomicU64::new(0),
            edges_created: AtomicU64::new(0),
            entry_point_updates: AtomicU64::new(0),
            prune_events: AtomicU64::new(0),
        }
    }

    pub(crate) fn stats(&self) -> HnswStats {
        HnswStats {
            nodes_inserted: self.nodes_inserted.load(Ordering::Relaxed),
            edges_created: self.edges_created.load(Ordering::Relaxed),
            entry_point_updates: self.entry_point_updates.load(Ordering::Relaxed),
            prune_events: self.prune_events.load(Ordering::Relaxed),
        }
    }
}

/// Reads the graph header through a view.
pub(crate) fn read_graph_header<V: BlockView>(view: &V) -> StoreResult<GraphHeader> {
    let block = BlockId::from(view.geometry().hnsw_start);
    let image = view.view_typed(block, BlockSig::GRAPH_HEADER)?;
    let header: GraphHeader = pod_read_unaligned(
        &image[TYPED_PAYLOAD_OFF..TYPED_PAYLOAD_OFF + core::mem::size_of::<GraphHeader>()],
    );
    Ok(header)
}

/// Serializes a sealed graph-header block image.
pub(crate) fn graph_header_block(header: &GraphHeader) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    buf[TYPED_PAYLOAD_OFF..TYPED_PAYLOAD_OFF + core::mem::size_of::<GraphHeader>()]
        .copy_from_slice(bytes_of(header));
    seal_typed(&mut buf, BlockSig::GRAPH_HEADER);
    buf
}

/// Reads a node index slot; a zeroed slot reports an absent node.
pub(crate) fn node_index_entry<V: BlockView>(view: &V, id: u64) -> StoreResult<NodeIndexEntry> {
    let (block, offset) = view.geometry().node_slot(VectorId(id))?;
    let image = view.view_typed(block, BlockSig::NODE_INDEX)?;
    Ok(pod_read_unaligned(&image[offset..offset + NODE_INDEX_ENTRY]))
}

/// Loads a node's adjacency record, using the metadata cache when the view
/// offers one.
pub(crate) fn get_node<V: BlockView>(view: &V, id: u64) -> StoreResult<Option<Arc<NodeRecord>>> {
    let entry = node_index_entry(view, id)?;
    if !entry.is_present() {
        return Ok(None);
    }
    if let Some(cache) = view.meta_cache() {
        if let Some(MetaVal::Node(record)) = cache.get(MetaKey::Node(id)) {
            return Ok(Some(record));
        }
    }
    let image = view.view_block(BlockId::from(entry.block))?;
    let record = Arc::new(NodeRecord::parse(&image[entry.offset as usize..], id)?);
    if let Some(cache) = view.meta_cache() {
        cache.insert(MetaKey::Node(id), MetaVal::Node(Arc::clone(&record)));
    }
    Ok(Some(record))
}

/// Distance from the query to a stored vector, `None` when the vector is
/// unknown or type-incompatible (treated as infinitely far but traversable).
fn node_distance<V: BlockView>(
    view: &V,
    metric: Metric,
    etype: ElementType,
    dim: u32,
    query: &[u8],
    id: u64,
) -> StoreResult<Option<f64>> {
    let Some(entry) = read_index_entry(view, VectorId(id))? else {
        return Ok(None);
    };
    if entry.elem_type != etype as u32 || entry.dimension != dim {
        return Ok(None);
    }
    let payload = read_payload(view, &entry)?;
    Ok(Some(distance(metric, etype, dim, query, &payload)?))
}

/// One greedy `ef = 1` descent step sequence at `layer`: walks to the
/// lexicographically smallest `(distance, id)` neighbor until no neighbor
/// improves on the current position.
fn greedy_at_layer<V: BlockView>(
    view: &V,
    metric: Metric,
    etype: ElementType,
    dim: u32,
    query: &[u8],
    mut cur: HeapEntry,
    layer: u32,
) -> StoreResult<HeapEntry> {
    loop {
        let Some(record) = get_node(view, cur.id)? else {
            return Ok(cur);
        };
        let mut best = cur;
        for &neighbor in record.neighbors(layer) {
            let Some(d) = node_distance(view, metric, etype, dim, query, neighbor)? else {
                continue;
            };
            let candidate = HeapEntry {
                dist: d,
                id: neighbor,
            };
            if candidate < best {
                best = candidate;
            }
        }
        if best.id == cur.id {
            return Ok(cur);
        }
        cur = best;
    }
}

/// The standard HNSW candidate-list search at one layer. Returns up to `ef`
/// entries in ascending `(distance, id)` order.
#[allow(clippy::too_many_arguments)]
fn search_layer<V: BlockView>(
    view: &V,
    scratch: &mut SearchScratch,
    metric: Metric,
    etype: ElementType,
    dim: u32,
    query: &[u8],
    seeds: &[HeapEntry],
    layer: u32,
    ef: usize,
) -> StoreResult<Vec<HeapEntry>> {
    scratch.reset();
    for seed in seeds {
        if scratch.visited.insert(seed.id) {
            scratch.candidates.push(Reverse(*seed));
            scratch.results.push(*seed);
        }
    }
    while scratch.results.len() > ef {
        scratch.results.pop();
    }

    while let Some(Reverse(closest)) = scratch.candidates.pop() {
        let farthest = scratch
            .results
            .peek()
            .map(|e| e.dist)
            .unwrap_or(f64::INFINITY);
        if scratch.results.len() >= ef && closest.dist > farthest {
            break;
        }
        let Some(record) = get_node(view, closest.id)? else {
            continue;
        };
        for &neighbor in record.neighbors(layer) {
            if !scratch.visited.insert(neighbor) {
                continue;
            }
            let Some(d) = node_distance(view, metric, etype, dim, query, neighbor)? else {
                continue;
            };
            let farthest = scratch
                .results
                .peek()
                .map(|e| e.dist)
                .unwrap_or(f64::INFINITY);
            if scratch.results.len() < ef || d < farthest {
                let entry = HeapEntry {
                    dist: d,
                    id: neighbor,
                };
                scratch.candidates.push(Reverse(entry));
                scratch.results.push(entry);
                if scratch.results.len() > ef {
                    scratch.results.pop();
                }
            }
        }
    }

    let mut out = Vec::with_capacity(scratch.results.len());
    while let Some(entry) = scratch.results.pop() {
        out.push(entry);
    }
    out.reverse();
    Ok(out)
}

/// ANN query over committed state. `ef` is clamped up to `k`.
pub(crate) fn search(
    shared: &crate::fs::StoreShared,
    filter: Option<InodeNo>,
    descriptor: &VectorDescriptor,
    query: &[u8],
    k: usize,
    ef: usize,
) -> StoreResult<Vec<(VectorId, f64)>> {
    descriptor
        .element_type
        .check_payload(descriptor.dimension, query)?;
    if k == 0 {
        return Ok(Vec::new());
    }

    let _shared_gate = shared.graph.gate.read();
    let metric = shared.default_metric();
    let header = read_graph_header(shared)?;
    if header.entry_point == 0 {
        return Ok(Vec::new());
    }

    let etype = descriptor.element_type;
    let dim = descriptor.dimension;
    let ep_dist = node_distance(shared, metric, etype, dim, query, header.entry_point)?
        .unwrap_or(f64::INFINITY);
    let mut cur = HeapEntry {
        dist: ep_dist,
        id: header.entry_point,
    };
    for layer in (1..=header.max_level_seen).rev() {
        cur = greedy_at_layer(shared, metric, etype, dim, query, cur, layer)?;
    }

    let ef = ef.max(k);
    let mut scratch = shared.graph.scratch.acquire();
    let found = search_layer(shared, &mut scratch, metric, etype, dim, query, &[cur], 0, ef);
    shared.graph.scratch.release(scratch);
    let found = found?;

    let mut out = Vec::with_capacity(k);
    for entry in found {
        if out.len() == k {
            break;
        }
        let Some(index_entry) = cached_index_entry(shared, VectorId(entry.id))? else {
            continue;
        };
        if index_entry.is_tombstoned() {
            continue;
        }
        let node_entry = node_index_entry(shared, entry.id)?;
        if node_entry.is_tombstoned() {
            continue;
        }
        if let Some(owner) = filter {
            if index_entry.owner_inode != u64::from(owner) {
                continue;
            }
        }
        out.push((VectorId(entry.id), entry.dist));
    }
    Ok(out)
}

impl Transaction {
    /// Inserts (or replaces) a vector in the graph. Runs entirely inside
    /// this transaction: node record, neighbor updates, index slot and
    /// header all commit or vanish together.
    pub(crate) fn hnsw_insert(
        &mut self,
        id: VectorId,
        etype: ElementType,
        dim: u32,
        payload: &[u8],
    ) -> CanFail {
        let shared = Arc::clone(&self.shared);
        let _gate = shared.graph.gate.write();
        let metric = self.shared.default_metric();
        let mut header = read_graph_header(self)?;
        let params = header.params();

        // Idempotent replace: detach the previous incarnation first.
        let existing = node_index_entry(self, id.0)?;
        if existing.is_present() {
            self.hnsw_detach(id.0)?;
            if !existing.is_tombstoned() {
                header.node_count = header.node_count.saturating_sub(1);
            }
        }

        let level = {
            let mut rng = self.shared.graph.rng.lock();
            assign_level(&mut rng, header.ml(), header.max_level_cap)
        };
        let mut record = NodeRecord::new(id.0, level);

        if header.entry_point == 0 || header.node_count == 0 {
            self.hnsw_write_record(&mut header, &record, &params)?;
            header.entry_point = id.0;
            header.max_level_seen = level;
            header.node_count += 1;
            self.write_graph_header(&header)?;
            self.shared.graph.nodes_inserted.fetch_add(1, Ordering::Relaxed);
            self.shared
                .graph
                .entry_point_updates
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Greedy descent above the node's level.
        let ep_dist = node_distance(self, metric, etype, dim, payload, header.entry_point)?
            .unwrap_or(f64::INFINITY);
        let mut cur = HeapEntry {
            dist: ep_dist,
            id: header.entry_point,
        };
        for layer in (level + 1..=header.max_level_seen).rev() {
            cur = greedy_at_layer(self, metric, etype, dim, payload, cur, layer)?;
        }

        // Candidate-list phase per layer, top down.
        let mut edges = 0u64;
        let top = level.min(header.max_level_seen);
        let mut scratch = self.shared.graph.scratch.acquire();
        let result: CanFail = (|| {
            for layer in (0..=top).rev() {
                let found = search_layer(
                    self,
                    &mut scratch,
                    metric,
                    etype,
                    dim,
                    payload,
                    &[cur],
                    layer,
                    params.ef_construction as usize,
                )?;

                // Simple selection: the closest cap-many live candidates.
                let cap = params.cap(layer);
                let mut selected: Vec<HeapEntry> = Vec::with_capacity(cap);
                for entry in &found {
                    if selected.len() == cap {
                        break;
                    }
                    if entry.id == id.0 {
                        continue;
                    }
                    let neighbor_entry = node_index_entry(self, entry.id)?;
                    if !neighbor_entry.is_present() || neighbor_entry.is_tombstoned() {
                        continue;
                    }
                    selected.push(*entry);
                }

                let mut linked = Vec::with_capacity(selected.len());
                for entry in &selected {
                    if self.hnsw_link_back(entry.id, id.0, layer, metric, &params)? {
                        linked.push(entry.id);
                        edges += 1;
                    }
                }
                record.layers[layer as usize] = linked;

                if let Some(best) = found.first() {
                    cur = *best;
                }
            }
            Ok(())
        })();
        self.shared.graph.scratch.release(scratch);
        result?;

        self.hnsw_write_record(&mut header, &record, &params)?;
        header.node_count += 1;
        if level > header.max_level_seen {
            header.entry_point = id.0;
            header.max_level_seen = level;
            self.shared
                .graph
                .entry_point_updates
                .fetch_add(1, Ordering::Relaxed);
        }
        self.write_graph_header(&header)?;

        self.shared.graph.nodes_inserted.fetch_add(1, Ordering::Relaxed);
        self.shared.graph.edges_created.fetch_add(edges, Ordering::Relaxed);
        Ok(())
    }

    /// Adds `new_id` to `neighbor`'s list at `layer`, pruning to the cap if
    /// the list overflows. Tombstoned entries found in the list are dropped
    /// on the way (opportunistic repair). Returns whether the edge to
    /// `new_id` survived the prune.
    fn hnsw_link_back(
        &mut self,
        neighbor: u64,
        new_id: u64,
        layer: u32,
        metric: Metric,
        params: &crate::config::HnswParams,
    ) -> StoreResult<bool> {
        let Some(record) = get_node(self, neighbor)? else {
            return Ok(false);
        };
        let mut record = (*record).clone();
        let layer_idx = layer as usize;
        if layer_idx >= record.layers.len() {
            return Ok(false);
        }

        // Opportunistic repair: drop tombstoned neighbors while we are here.
        let mut list = Vec::with_capacity(record.layers[layer_idx].len() + 1);
        for &other in &record.layers[layer_idx] {
            let entry = node_index_entry(self, other)?;
            if entry.is_present() && !entry.is_tombstoned() {
                list.push(other);
            }
        }
        if !list.contains(&new_id) {
            list.push(new_id);
        }

        let cap = params.cap(layer);
        let mut kept_new = true;
        if list.len() > cap {
            // Distances from the neighbor's own payload.
            let Some(base) = read_index_entry(self, VectorId(neighbor))? else {
                return Ok(false);
            };
            let base_payload = read_payload(self, &base)?;
            let base_etype = base.element_type()?;

            let mut ranked: Vec<HeapEntry> = Vec::with_capacity(list.len());
            for &other in &list {
                let d = node_distance(
                    self,
                    metric,
                    base_etype,
                    base.dimension,
                    &base_payload,
                    other,
                )?
                .unwrap_or(f64::INFINITY);
                ranked.push(HeapEntry { dist: d, id: other });
            }
            ranked.sort();
            let keep: Vec<u64> = ranked.iter().take(cap).map(|e| e.id).collect();

            // Remove the reverse edges of everything pruned away.
            for entry in ranked.iter().skip(cap) {
                if entry.id == new_id {
                    kept_new = false;
                    continue;
                }
                self.hnsw_remove_edge(entry.id, neighbor, layer)?;
            }
            list = keep;
            self.shared.graph.prune_events.fetch_add(1, Ordering::Relaxed);
        }

        record.layers[layer_idx] = list;
        self.hnsw_rewrite_record(&record)?;
        Ok(kept_new)
    }

    /// Removes `target` from `holder`'s list at `layer`, if present.
    fn hnsw_remove_edge(&mut self, holder: u64, target: u64, layer: u32) -> CanFail {
        let Some(record) = get_node(self, holder)? else {
            return Ok(());
        };
        let mut record = (*record).clone();
        let layer_idx = layer as usize;
        if layer_idx >= record.layers.len() {
            return Ok(());
        }
        let before = record.layers[layer_idx].len();
        record.layers[layer_idx].retain(|&other| other != target);
        if record.layers[layer_idx].len() != before {
            self.hnsw_rewrite_record(&record)?;
        }
        Ok(())
    }

    /// Detaches a node: every incoming edge is removed. The record itself
    /// and its outgoing layer-0 edges stay for reconnection.
    fn hnsw_detach(&mut self, id: u64) -> CanFail {
        let Some(record) = get_node(self, id)? else {
            return Ok(());
        };
        let record = (*record).clone();
        for (layer, neighbors) in record.layers.iter().enumerate() {
            for &neighbor in neighbors {
                self.hnsw_remove_edge(neighbor, id, layer as u32)?;
            }
        }
        Ok(())
    }

    /// Tombstones a node: incoming edges removed, index slot flagged, entry
    /// point moved if it pointed here.
    pub(crate) fn hnsw_tombstone(&mut self, id: VectorId) -> CanFail {
        let shared = Arc::clone(&self.shared);
        let _gate = shared.graph.gate.write();
        let entry = node_index_entry(self, id.0)?;
        if !entry.is_present() || entry.is_tombstoned() {
            return Ok(());
        }
        self.hnsw_detach(id.0)?;

        let mut flagged = entry;
        flagged.flags |= NodeIndexEntry::TOMBSTONE;
        self.hnsw_write_index(id.0, flagged)?;

        let mut header = read_graph_header(self)?;
        header.node_count = header.node_count.saturating_sub(1);
        if header.node_count == 0 {
            header.entry_point = 0;
            header.max_level_seen = 0;
        } else if header.entry_point == id.0 {
            if let Some((replacement, level)) = self.hnsw_find_live_node(id.0)? {
                header.entry_point = replacement;
                header.max_level_seen = header.max_level_seen.max(level);
                self.shared
                    .graph
                    .entry_point_updates
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                header.entry_point = 0;
                header.max_level_seen = 0;
            }
        }
        self.write_graph_header(&header)
    }

    /// Linear scan for any live node, used when the entry point dies.
    fn hnsw_find_live_node(&mut self, exclude: u64) -> StoreResult<Option<(u64, u32)>> {
        let next = self.shared.peek_vector_id();
        let mut best: Option<(u64, u32)> = None;
        for raw in 1..next {
            if raw == exclude {
                continue;
            }
            let entry = node_index_entry(self, raw)?;
            if !entry.is_present() || entry.is_tombstoned() {
                continue;
            }
            if let Some(record) = get_node(self, raw)? {
                if best.map_or(true, |(_, level)| record.level > level) {
                    best = Some((raw, record.level));
                }
            }
        }
        Ok(best)
    }

    /// Writes a brand-new record, reserving a packed slot at the layer caps.
    fn hnsw_write_record(
        &mut self,
        header: &mut GraphHeader,
        record: &NodeRecord,
        params: &crate::config::HnswParams,
    ) -> CanFail {
        let slot_len = NodeRecord::slot_size(record.level, params);
        debug_assert!(slot_len <= BLOCK_SIZE);

        if header.pack_block == 0 || header.pack_used as usize + slot_len > BLOCK_SIZE {
            let fresh = self.stage_alloc_blocks(
                1,
                BlockId::from(self.shared.geometry.data_start),
                Strategy::Aligned,
            )?[0];
            self.get_write_access_zeroed(fresh)?;
            header.pack_block = u64::from(fresh);
            header.pack_used = 0;
        }

        let block = BlockId::from(header.pack_block);
        let offset = header.pack_used as usize;
        let bytes = record.serialize();
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + slot_len].fill(0);
        shadow[offset..offset + bytes.len()].copy_from_slice(&bytes);
        header.pack_used += slot_len as u32;

        self.hnsw_write_index(
            record.id,
            NodeIndexEntry {
                block: u64::from(block),
                offset: offset as u32,
                flags: NodeIndexEntry::PRESENT,
            },
        )
    }

    /// Rewrites an existing record in its reserved slot. The slot was sized
    /// at the layer caps for the node's level, so a capped record always
    /// fits; a record that somehow would not is given a fresh slot and the
    /// old one is abandoned to compaction.
    fn hnsw_rewrite_record(&mut self, record: &NodeRecord) -> CanFail {
        let entry = node_index_entry(self, record.id)?;
        if !entry.is_present() {
            return Ok(());
        }
        let params = read_graph_header(self)?.params();
        let slot_len = NodeRecord::slot_size(record.level, &params);
        let bytes = record.serialize();

        if bytes.len() > slot_len {
            // Slots are reserved at the layer caps, so this cannot trigger
            // for a capped record; give the oversized record a block of its
            // own rather than disturbing the shared pack state.
            let fresh = self.stage_alloc_blocks(
                1,
                BlockId::from(self.shared.geometry.data_start),
                Strategy::Aligned,
            )?[0];
            let shadow = self.get_write_access_zeroed(fresh)?;
            shadow[..bytes.len()].copy_from_slice(&bytes);
            return self.hnsw_write_index(
                record.id,
                NodeIndexEntry {
                    block: u64::from(fresh),
                    offset: 0,
                    flags: entry.flags,
                },
            );
        }

        let shadow = self.get_write_access(BlockId::from(entry.block))?;
        let offset = entry.offset as usize;
        shadow[offset..offset + slot_len].fill(0);
        shadow[offset..offset + bytes.len()].copy_from_slice(&bytes);
        self.invalidate_meta(MetaKey::Node(record.id));
        Ok(())
    }

    /// Writes a node index slot and reseals its block.
    fn hnsw_write_index(&mut self, id: u64, entry: NodeIndexEntry) -> CanFail {
        let (block, offset) = self.shared.geometry.node_slot(VectorId(id))?;
        let shadow = self.get_write_access(block)?;
        shadow[offset..offset + NODE_INDEX_ENTRY].copy_from_slice(bytes_of(&entry));
        seal_typed(shadow, BlockSig::NODE_INDEX);
        self.invalidate_meta(MetaKey::Node(id));
        Ok(())
    }

    /// Writes the graph header block and reseals it.
    pub(crate) fn write_graph_header(&mut self, header: &GraphHeader) -> CanFail {
        let block = BlockId::from(self.shared.geometry.hnsw_start);
        let image = graph_header_block(header);
        let shadow = self.get_write_access(block)?;
        shadow.copy_from_slice(&image);
        Ok(())
    }
}

/// Integrity report produced by [`validate`].
#[derive(Clone, Debug, Default)]
pub struct ValidateReport {
    pub ok: bool,
    pub live_nodes: u64,
    pub tombstoned_nodes: u64,
    pub max_level: u32,
    /// Edge count per layer, layer 0 first.
    pub edges_per_layer: Vec<u64>,
    /// Mean out-degree per layer over the nodes reaching that layer.
    pub average_degree_per_layer: Vec<f64>,
    pub errors: Vec<String>,
}

/// Offline integrity check: entry-point validity, edge bidirectionality,
/// degree caps, tombstone absence from adjacencies and layer-0 coverage of
/// every live vector.
pub(crate) fn validate(shared: &crate::fs::StoreShared) -> StoreResult<ValidateReport> {
    let _gate = shared.graph.gate.read();
    let header = read_graph_header(shared)?;
    let params = header.params();
    let mut report = ValidateReport {
        edges_per_layer: vec![0; params.max_level as usize + 1],
        average_degree_per_layer: vec![0.0; params.max_level as usize + 1],
        ..ValidateReport::default()
    };
    let mut nodes_per_layer = vec![0u64; params.max_level as usize + 1];

    let next = shared.peek_vector_id();
    for raw in 1..next {
        let entry = node_index_entry(shared, raw)?;
        if !entry.is_present() {
            continue;
        }
        if entry.is_tombstoned() {
            // A tombstoned node keeps its outgoing layer-0 edges for future
            // reconnection; only its *incoming* edges must be gone, which
            // the live nodes' scans verify below.
            report.tombstoned_nodes += 1;
            continue;
        }
        report.live_nodes += 1;
        let Some(record) = get_node(shared, raw)? else {
            report.errors.push(format!("node {raw} has no record"));
            continue;
        };
        if record.level > params.max_level {
            report
                .errors
                .push(format!("node {raw} claims level {}", record.level));
            continue;
        }
        report.max_level = report.max_level.max(record.level);

        for (layer, neighbors) in record.layers.iter().enumerate() {
            nodes_per_layer[layer] += 1;
            report.edges_per_layer[layer] += neighbors.len() as u64;

            if neighbors.len() > params.cap(layer as u32) {
                report.errors.push(format!(
                    "node {raw} exceeds the degree cap at layer {layer}: {}",
                    neighbors.len()
                ));
            }
            for &neighbor in neighbors {
                let peer_entry = node_index_entry(shared, neighbor)?;
                if peer_entry.is_tombstoned() {
                    report
                        .errors
                        .push(format!("node {raw} links to tombstoned node {neighbor}"));
                    continue;
                }
                let Some(peer) = get_node(shared, neighbor)? else {
                    report
                        .errors
                        .push(format!("node {raw} links to missing node {neighbor}"));
                    continue;
                };
                if !peer.neighbors(layer as u32).contains(&raw) {
                    report.errors.push(format!(
                        "edge {raw} -> {neighbor} at layer {layer} is not bidirectional"
                    ));
                }
            }
        }
    }

    // Entry point: exists exactly when the graph has live nodes.
    if (header.entry_point != 0) != (header.node_count > 0) {
        report.errors.push(format!(
            "entry point {} inconsistent with node count {}",
            header.entry_point, header.node_count
        ));
    }
    if header.entry_point != 0 {
        let entry = node_index_entry(shared, header.entry_point)?;
        if !entry.is_present() {
            report
                .errors
                .push(format!("entry point {} has no record", header.entry_point));
        }
    }
    if report.live_nodes != header.node_count {
        report.errors.push(format!(
            "header counts {} live nodes, index holds {}",
            header.node_count, report.live_nodes
        ));
    }

    // Layer-0 coverage: every live vector is a live graph node.
    for raw in 1..next {
        let Some(vec_entry) = cached_index_entry(shared, VectorId(raw))? else {
            continue;
        };
        if vec_entry.is_tombstoned() {
            continue;
        }
        let entry = node_index_entry(shared, raw)?;
        if !entry.is_present() || entry.is_tombstoned() {
            report
                .errors
                .push(format!("live vector {raw} is missing from layer 0"));
        }
    }

    for layer in 0..report.average_degree_per_layer.len() {
        if nodes_per_layer[layer] > 0 {
            report.average_degree_per_layer[layer] =
                report.edges_per_layer[layer] as f64 / nodes_per_layer[layer] as f64;
        }
    }
    report.ok = report.errors.is_empty();
    Ok(report)
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::config::{FormatParams, StoreConfig};
    use crate::errors::StoreError;
    use crate::fs::inode::FileMode;
    use crate::fs::Store;
    use crate::test_util::temp_container_path;
    use crate::txn::Isolation;
    use crate::vector::distance::f32_payload;
    use std::path::PathBuf;

    const DIM: u32 = 8;

    fn test_params() -> FormatParams {
        let mut params = FormatParams::default();
        params.hnsw.m = 8;
        params.hnsw.ef_construction = 64;
        params.hnsw.seed = 0xDEADBEEF;
        params
    }

    fn build_store(tag: &str) -> (Store, PathBuf) {
        let path = temp_container_path(tag);
        let store = Store::format(
            &path,
            64 * 1024 * 1024,
            test_params(),
            StoreConfig {
                group_commit_window_us: 0,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        (store, path)
    }

    /// Deterministic test payloads: one seeded stream shared by every run.
    fn dataset(count: usize) -> Vec<Vec<u8>> {
        let mut rng = XorShift64::new(0x0123_4567_89AB_CDEF);
        (0..count)
            .map(|_| {
                let values: Vec<f32> = (0..DIM)
                    .map(|_| (rng.next_u64() % 1000) as f32 / 250.0 - 2.0)
                    .collect();
                f32_payload(&values)
            })
            .collect()
    }

    fn ingest(store: &Store, payloads: &[Vec<u8>]) -> (crate::fs::inode::InodeNo, Vec<VectorId>) {
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let owner = txn
            .create_inode(
                crate::fs::inode::InodeNo::ROOT,
                b"embeddings",
                FileMode::DEFAULT_FILE,
            )
            .unwrap();
        txn.commit().unwrap();

        let mut ids = Vec::with_capacity(payloads.len());
        for chunk in payloads.chunks(25) {
            let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
            for payload in chunk {
                ids.push(
                    txn.store_vector(
                        owner,
                        VectorDescriptor::new(ElementType::Float32, DIM),
                        payload,
                    )
                    .unwrap(),
                );
            }
            txn.commit().unwrap();
        }
        (owner, ids)
    }

    #[test]
    fn exact_hit_and_brute_force_agreement() {
        let (store, path) = build_store("hnsw-exact");
        let payloads = dataset(200);
        let (_, ids) = ingest(&store, &payloads);

        let query_id = ids[42];
        let query = payloads[42].clone();
        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);

        // ef covering the whole graph makes the ANN walk exhaustive on a
        // connected graph; results must match brute force exactly.
        let hits = store
            .search(None, &descriptor, &query, 10, Some(250))
            .unwrap();
        assert_eq!(hits[0].vector_id, query_id);
        assert_eq!(hits[0].distance(), 0.0);

        let brute = crate::vector::linear_search(
            store.shared(),
            None,
            Metric::L2,
            &descriptor,
            &query,
            10,
        )
        .unwrap();
        let hnsw_ids: Vec<VectorId> = hits.iter().map(|h| h.vector_id).collect();
        let brute_ids: Vec<VectorId> = brute.iter().map(|(id, _)| *id).collect();
        assert_eq!(hnsw_ids, brute_ids);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn construction_is_deterministic_across_stores() {
        let payloads = dataset(120);
        let query = payloads[7].clone();
        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);

        let mut outputs = Vec::new();
        for tag in ["hnsw-det-a", "hnsw-det-b"] {
            let (store, path) = build_store(tag);
            ingest(&store, &payloads);
            let hits = store
                .search(None, &descriptor, &query, 10, Some(64))
                .unwrap();
            outputs.push(hits);
            drop(store);
            std::fs::remove_file(path).unwrap();
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn validation_passes_under_load() {
        let (store, path) = build_store("hnsw-validate");
        let payloads = dataset(300);
        ingest(&store, &payloads);

        let report = store.validate_index().unwrap();
        assert!(report.ok, "validation errors: {:?}", report.errors);
        assert_eq!(report.live_nodes, 300);
        assert!(report.average_degree_per_layer[0] > 1.0);

        let stats = store.hnsw_stats();
        assert_eq!(stats.nodes_inserted, 300);
        assert!(stats.edges_created > 300);
        assert!(stats.entry_point_updates >= 1);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn deleted_vectors_disappear_from_results() {
        let (store, path) = build_store("hnsw-delete");
        let payloads = dataset(60);
        let (_, ids) = ingest(&store, &payloads);
        let victim = ids[10];

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.delete_vector(victim).unwrap();
        // Idempotent: the second delete is a quiet no-op.
        txn.delete_vector(victim).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            store.load_vector(victim),
            Err(StoreError::InvalidArgument(_))
        ));
        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);
        let hits = store
            .search(None, &descriptor, &payloads[10], 5, Some(64))
            .unwrap();
        assert!(hits.iter().all(|h| h.vector_id != victim));
        assert!(hits[0].distance() > 0.0);

        let report = store.validate_index().unwrap();
        assert!(report.ok, "validation errors: {:?}", report.errors);
        assert_eq!(report.tombstoned_nodes, 1);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn update_vector_relinks_the_node() {
        let (store, path) = build_store("hnsw-update");
        let payloads = dataset(30);
        let (_, ids) = ingest(&store, &payloads);
        let moved = ids[3];

        let far = f32_payload(&[40.0, 40.0, 40.0, 40.0, 40.0, 40.0, 40.0, 40.0]);
        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        txn.update_vector(moved, &far).unwrap();
        txn.commit().unwrap();

        let (_, back) = store.load_vector(moved).unwrap();
        assert_eq!(back, far);

        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);
        let hits = store.search(None, &descriptor, &far, 1, Some(64)).unwrap();
        assert_eq!(hits[0].vector_id, moved);
        assert_eq!(hits[0].distance(), 0.0);

        let report = store.validate_index().unwrap();
        assert!(report.ok, "validation errors: {:?}", report.errors);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn remount_preserves_vectors_and_graph() {
        let (store, path) = build_store("hnsw-remount");
        let payloads = dataset(80);
        let (_, ids) = ingest(&store, &payloads);
        store.close().unwrap();

        let store = Store::open(
            &path,
            StoreConfig {
                group_commit_window_us: 0,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        for (id, payload) in ids.iter().zip(payloads.iter()) {
            let (descriptor, back) = store.load_vector(*id).unwrap();
            assert_eq!(&back, payload);
            assert_eq!(descriptor.dimension, DIM);
        }
        let report = store.validate_index().unwrap();
        assert!(report.ok, "validation errors: {:?}", report.errors);

        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);
        let hits = store
            .search(None, &descriptor, &payloads[5], 3, Some(64))
            .unwrap();
        assert_eq!(hits[0].vector_id, ids[5]);
        drop(store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn owner_filter_restricts_results() {
        let (store, path) = build_store("hnsw-owner");
        let payloads = dataset(40);

        let mut txn = store.begin(Isolation::ReadCommitted).unwrap();
        let owner_a = txn
            .create_inode(crate::fs::inode::InodeNo::ROOT, b"a", FileMode::DEFAULT_FILE)
            .unwrap();
        let owner_b = txn
            .create_inode(crate::fs::inode::InodeNo::ROOT, b"b", FileMode::DEFAULT_FILE)
            .unwrap();
        let descriptor = VectorDescriptor::new(ElementType::Float32, DIM);
        let mut b_ids = hashbrown::HashSet::new();
        for (i, payload) in payloads.iter().enumerate() {
            let owner = if i % 2 == 0 { owner_a } else { owner_b };
            let id = txn.store_vector(owner, descriptor, payload).unwrap();
            if i % 2 != 0 {
                b_ids.insert(id);
            }
        }
        txn.commit().unwrap();

        let hits = store
            .search(Some(owner_b), &descriptor, &payloads[0], 8, Some(64))
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| b_ids.contains(&h.vector_id)));
        drop(store);
        std::fs::remove_file(path).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_assignment_is_seeded_and_bounded() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        let levels_a: Vec<u32> = (0..64).map(|_| assign_level(&mut a, 1.0 / std::f64::consts::LN_2, 16)).collect();
        let levels_b: Vec<u32> = (0..64).map(|_| assign_level(&mut b, 1.0 / std::f64::consts::LN_2, 16)).collect();
        assert_eq!(levels_a, levels_b);
        assert!(levels_a.iter().all(|&l| l <= 16));
        // The geometric distribution puts most nodes at layer 0.
        assert!(levels_a.iter().filter(|&&l| l == 0).count() > 16);
    }

    #[test]
    fn level_capping_at_max() {
        let mut rng = XorShift64::new(7);
        // An enormous mL forces huge raw levels; the cap must hold.
        for _ in 0..32 {
            assert!(assign_level(&mut rng, 1000.0, 5) <= 5);
        }
    }
}
