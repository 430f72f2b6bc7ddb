use std::collections::{BTreeMap, HashSet, VecDeque};

use elastore_data::{TableSchema, TupleSerializer};
use elastore_errors::{invariant, ElastoreResult};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::block::{Block, BlockId, TupleAddr};
use crate::cow::cow_image;
use crate::pool::BlockPool;
use crate::stream::output::TupleOutputStream;
use crate::stream::predicate::StreamPredicate;

/// Outcome of offering one row to the output streams.
enum Emit {
    /// Written to every matching output.
    Written,
    /// Matched no predicate; visited but not written.
    Dropped,
    /// Some matching output lacks room; yield and retry the same row later.
    Full,
}

/// State of one active snapshot stream.
///
/// Activation freezes the table's block list; this context then walks it in
/// `(block, slot)` order across `stream_more` calls, consulting the
/// pre-image stash for slots mutated underneath it. Finishing a block hands
/// it back to the live table and clears its dirty bits, so the pending set
/// shrinks monotonically toward zero.
pub(crate) struct SnapshotContext {
    predicates: Vec<StreamPredicate>,
    /// The frozen block range, in block order.
    original_blocks: Vec<BlockId>,
    /// Blocks not yet fully streamed; front is the current block.
    queue: VecDeque<BlockId>,
    /// Next slot to visit within the front block.
    slot: u32,
    /// First-write pre-images of slots mutated since activation, keyed by
    /// address so one block's entries drain as a contiguous range.
    stash: BTreeMap<TupleAddr, Box<[u8]>>,
    /// Slots filled after activation; their live contents belong to the
    /// post-snapshot generation.
    inserted_after: HashSet<TupleAddr, ahash::RandomState>,
    /// Blocks the table handed over wholesale (truncate under snapshot).
    frozen: BTreeMap<BlockId, Block>,
    /// Active tuples at activation; exactly this many rows will be visited.
    total: u64,
    streamed: u64,
    /// Primary keys owed a post-completion delete (`triggersDelete`).
    delete_after: Vec<Box<[u8]>>,
    finished: bool,
}

impl SnapshotContext {
    pub(crate) fn new(predicates: Vec<StreamPredicate>, blocks: Vec<BlockId>, total: u64) -> Self {
        Self {
            queue: blocks.iter().copied().collect(),
            original_blocks: blocks,
            predicates,
            slot: 0,
            stash: BTreeMap::new(),
            inserted_after: HashSet::default(),
            frozen: BTreeMap::new(),
            total,
            streamed: 0,
            delete_after: Vec::new(),
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn captured_blocks(&self) -> &[BlockId] {
        &self.original_blocks
    }

    pub(crate) fn stashed(&self, addr: TupleAddr) -> Option<&[u8]> {
        self.stash.get(&addr).map(|b| &b[..])
    }

    pub(crate) fn is_inserted_after(&self, addr: TupleAddr) -> bool {
        self.inserted_after.contains(&addr)
    }

    pub(crate) fn frozen_block(&self, id: BlockId) -> Option<&Block> {
        self.frozen.get(&id)
    }

    /// First stash entry in `block` at or after `from_slot`.
    pub(crate) fn stash_next_in(&self, block: BlockId, from_slot: u32) -> Option<TupleAddr> {
        self.stash
            .range(TupleAddr::new(block, from_slot)..=TupleAddr::last_in(block))
            .next()
            .map(|(&addr, _)| addr)
    }

    fn remaining(&self) -> usize {
        self.total.saturating_sub(self.streamed) as usize
    }

    pub(crate) fn take_delete_after(&mut self) -> Vec<Box<[u8]>> {
        std::mem::take(&mut self.delete_after)
    }

    /// Table callout, delivered before an insert lands in `addr`.
    pub(crate) fn notify_tuple_insert(&mut self, pool: &BlockPool, addr: TupleAddr) {
        if !self.finished && pool.is_pending(addr.block) {
            self.inserted_after.insert(addr);
        }
    }

    /// Table callout, delivered before an update overwrites `addr`.
    pub(crate) fn notify_tuple_update(&mut self, pool: &BlockPool, addr: TupleAddr) {
        self.preserve_pre_image(pool, addr);
    }

    /// Table callout, delivered before a delete deactivates `addr`.
    pub(crate) fn notify_tuple_delete(&mut self, pool: &BlockPool, addr: TupleAddr) {
        self.preserve_pre_image(pool, addr);
    }

    /// Stash the activation-time row of `addr` if this is the first mutation
    /// to touch it. Later mutations of the same slot leave the stash alone:
    /// the first pre-image wins.
    fn preserve_pre_image(&mut self, pool: &BlockPool, addr: TupleAddr) {
        if self.finished || !pool.is_pending(addr.block) {
            return;
        }
        if self.inserted_after.contains(&addr) || self.stash.contains_key(&addr) {
            return;
        }
        if let Some(block) = pool.block(addr.block) {
            if block.is_active(addr.slot) {
                trace!(%addr, "stashed pre-image");
                self.stash.insert(addr, block.row(addr.slot).into());
            }
        }
    }

    /// Table callout for compaction moving `src` to `dst` (only reaches a
    /// pending `src` under `allow_pending_moves`). The pre-move row is
    /// stashed at the original address so the scan still yields it there,
    /// exactly once.
    pub(crate) fn notify_tuple_movement(
        &mut self,
        pool: &BlockPool,
        src: TupleAddr,
        _dst: TupleAddr,
        row: &[u8],
    ) {
        if self.finished || !pool.is_pending(src.block) {
            return;
        }
        if self.inserted_after.remove(&src) {
            // Post-snapshot tuple relocated out of the frozen range; the
            // snapshot owes nothing at either address.
            return;
        }
        if !self.stash.contains_key(&src) {
            self.stash.insert(src, row.into());
        }
    }

    /// Take ownership of the frozen block list on truncate-under-snapshot.
    pub(crate) fn notify_truncate(&mut self, blocks: BTreeMap<BlockId, Block>) {
        if !self.finished {
            self.frozen.extend(blocks);
        }
    }

    /// Abandon the stream: hand every block back and forget completion work.
    pub(crate) fn abort(&mut self, pool: &mut BlockPool) {
        pool.restore_all_pending();
        self.queue.clear();
        self.frozen.clear();
        self.delete_after.clear();
        self.finished = true;
        debug!(streamed = self.streamed, "snapshot stream cancelled");
    }

    /// Advance the scan until every output fills or the frozen range is
    /// exhausted. Returns the number of tuples still owed.
    pub(crate) fn handle_stream_more(
        &mut self,
        pool: &mut BlockPool,
        schema: &TableSchema,
        serializer: &dyn TupleSerializer,
        outputs: &mut [TupleOutputStream],
    ) -> ElastoreResult<usize> {
        if self.finished {
            return Ok(0);
        }
        invariant!(
            outputs.len() >= self.predicates.len(),
            "{} output buffers for {} predicates",
            outputs.len(),
            self.predicates.len()
        );
        loop {
            let Some(&bid) = self.queue.front() else {
                self.finished = true;
                debug!(streamed = self.streamed, "snapshot stream complete");
                return Ok(0);
            };
            let in_pool = pool.block(bid).is_some();
            if !in_pool && !self.frozen.contains_key(&bid) {
                // The block was compacted away while pending; its unstreamed
                // pre-images live in the stash.
                match self.stash_next_in(bid, self.slot) {
                    Some(addr) => {
                        let row = self.stash[&addr].to_vec();
                        match self.emit(schema, serializer, outputs, &row)? {
                            Emit::Full => return Ok(self.remaining()),
                            Emit::Written | Emit::Dropped => {
                                self.streamed += 1;
                                self.slot = addr.slot + 1;
                            }
                        }
                    }
                    None => self.finish_block(pool, bid),
                }
                continue;
            }
            let used_bound = if in_pool {
                pool.block(bid).map(Block::used_bound).unwrap_or(0)
            } else {
                self.frozen[&bid].used_bound()
            };
            if self.slot >= used_bound {
                self.finish_block(pool, bid);
                continue;
            }
            let addr = TupleAddr::new(bid, self.slot);
            let row: Option<Vec<u8>> = {
                let block = if in_pool {
                    pool.block(bid)
                } else {
                    self.frozen.get(&bid)
                };
                block.and_then(|b| cow_image(b, addr, Some(&*self)).map(<[u8]>::to_vec))
            };
            match row {
                None => self.slot += 1,
                Some(row) => match self.emit(schema, serializer, outputs, &row)? {
                    Emit::Full => return Ok(self.remaining()),
                    Emit::Written | Emit::Dropped => {
                        self.streamed += 1;
                        self.slot += 1;
                    }
                },
            }
        }
    }

    /// Offer one snapshot row to every matching output, whole or not at all.
    fn emit(
        &mut self,
        schema: &TableSchema,
        serializer: &dyn TupleSerializer,
        outputs: &mut [TupleOutputStream],
        row: &[u8],
    ) -> ElastoreResult<Emit> {
        let mut matched: SmallVec<[usize; 4]> = SmallVec::new();
        for (i, predicate) in self.predicates.iter().enumerate() {
            if predicate.matches_row(schema, row) == Some(true) {
                matched.push(i);
            }
        }
        if matched.is_empty() {
            return Ok(Emit::Dropped);
        }
        let mut serialized = Vec::with_capacity(serializer.serialized_len(schema, row));
        serializer.write_tuple(schema, row, &mut serialized);
        if matched.iter().any(|&i| !outputs[i].has_room(serialized.len())) {
            return Ok(Emit::Full);
        }
        let mut wants_delete = false;
        for &i in &matched {
            outputs[i].write_row(&serialized)?;
            wants_delete |= self.predicates[i].triggers_delete();
        }
        if wants_delete {
            self.delete_after.push(schema.primary_key_of(row).into());
        }
        Ok(Emit::Written)
    }

    /// The scan has passed the end of `bid`: hand it back to the live table
    /// (clearing dirty bits) and drop its stash entries.
    fn finish_block(&mut self, pool: &mut BlockPool, bid: BlockId) {
        if pool.block(bid).is_some() {
            pool.release_from_pending(bid);
        } else {
            self.frozen.remove(&bid);
        }
        let stale: Vec<TupleAddr> = self
            .stash
            .range(TupleAddr::first_in(bid)..=TupleAddr::last_in(bid))
            .map(|(&addr, _)| addr)
            .collect();
        for addr in stale {
            self.stash.remove(&addr);
        }
        trace!(block = %bid, "snapshot finished block");
        self.queue.pop_front();
        self.slot = 0;
    }
}
