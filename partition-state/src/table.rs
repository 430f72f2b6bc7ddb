use std::collections::HashMap;
use std::fmt;

use elastore_data::{RawTupleSerializer, TableSchema, TupleSerializer};
use elastore_errors::{internal, internal_err, invariant, ElastoreError, ElastoreResult};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::block::{BlockId, TupleAddr};
use crate::config::EngineConfig;
use crate::cow::CowIter;
use crate::pool::BlockPool;
use crate::stream::{ActiveStreams, StreamContext, StreamType};

/// A mutable row table for one partition.
///
/// All operations are synchronous and single-threaded; snapshot and elastic
/// streaming interleave with mutation on the caller's thread via
/// [`stream_more`](PersistentTable::stream_more). Every mutation notifies
/// the active stream contexts *before* touching the slot, which is what
/// lets a snapshot preserve the pre-image it still owes downstream.
pub struct PersistentTable {
    pub(crate) schema: TableSchema,
    pub(crate) config: EngineConfig,
    partition_id: i32,
    pub(crate) serializer: Box<dyn TupleSerializer>,
    pub(crate) pool: BlockPool,
    primary: HashMap<Box<[u8]>, TupleAddr, ahash::RandomState>,
    pub(crate) streams: ActiveStreams,
    pub(crate) active_tuples: u64,
}

impl PersistentTable {
    /// Create a table streaming raw row bytes.
    pub fn new(
        schema: TableSchema,
        config: EngineConfig,
        partition_id: i32,
    ) -> ElastoreResult<Self> {
        Self::with_serializer(schema, config, partition_id, Box::new(RawTupleSerializer))
    }

    /// Create a table with a caller-provided tuple serializer.
    pub fn with_serializer(
        schema: TableSchema,
        config: EngineConfig,
        partition_id: i32,
        serializer: Box<dyn TupleSerializer>,
    ) -> ElastoreResult<Self> {
        if schema.has_inline_strings() && !config.allow_inline_strings {
            return Err(ElastoreError::SchemaMismatch(
                "inline string columns require allow_inline_strings".into(),
            ));
        }
        let pool = BlockPool::new(schema.tuple_width(), config.resolved_block_target_bytes())?;
        Ok(Self {
            schema,
            config,
            partition_id,
            serializer,
            pool,
            primary: HashMap::default(),
            streams: SmallVec::new(),
            active_tuples: 0,
        })
    }

    /// The partition this table belongs to.
    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// The table's schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Number of logically present tuples.
    pub fn active_count(&self) -> u64 {
        self.active_tuples
    }

    /// Number of allocated blocks.
    pub fn block_count(&self) -> usize {
        self.pool.block_count()
    }

    /// Number of blocks still owed to an active snapshot.
    pub fn pending_block_count(&self) -> usize {
        self.pool.pending_count()
    }

    /// Bytes of block storage currently allocated.
    pub fn memory_footprint(&self) -> usize {
        self.pool.memory_footprint()
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Insert a row. Fails with
    /// [`ConstraintViolation`](ElastoreError::ConstraintViolation) on a
    /// duplicate primary key, with no side effects. Under an active
    /// snapshot the new tuple belongs to the post-snapshot generation and
    /// will not be streamed.
    pub fn insert(&mut self, row: &[u8]) -> ElastoreResult<TupleAddr> {
        self.schema.validate_row(row)?;
        let pk = self.schema.primary_key_of(row);
        if self.primary.contains_key(pk) {
            return Err(ElastoreError::ConstraintViolation(
                "duplicate primary key on insert".into(),
            ));
        }
        let addr = self.pool.allocate_slot()?;
        {
            let Self { pool, streams, schema, .. } = self;
            for context in streams.iter_mut() {
                match context {
                    StreamContext::Snapshot(ctx) => ctx.notify_tuple_insert(pool, addr),
                    StreamContext::ElasticIndex(ctx) => {
                        ctx.notify_tuple_insert(schema, addr, row)
                    }
                }
            }
        }
        let block = self
            .pool
            .block_mut(addr.block)
            .ok_or_else(|| internal_err!("freshly allocated block {} vanished", addr.block))?;
        block.row_mut(addr.slot).copy_from_slice(row);
        block.set_active(addr.slot, true);
        block.set_dirty(addr.slot, false);
        self.primary.insert(pk.into(), addr);
        self.active_tuples += 1;
        trace!(%addr, "insert");
        Ok(addr)
    }

    /// Overwrite the tuple at `addr` with `new_row`. The primary index
    /// follows a key change; a change that collides with an existing key
    /// fails with no side effects. Under an active snapshot the pre-image
    /// is preserved before the overwrite.
    pub fn update(&mut self, addr: TupleAddr, new_row: &[u8]) -> ElastoreResult<()> {
        self.schema.validate_row(new_row)?;
        let old_pk: Box<[u8]> = {
            let block = self
                .pool
                .block(addr.block)
                .ok_or_else(|| internal_err!("update in unknown block {}", addr.block))?;
            invariant!(
                block.is_occupied(addr.slot) && block.is_active(addr.slot),
                "update of inactive slot {addr}"
            );
            self.schema.primary_key_of(block.row(addr.slot)).into()
        };
        let new_pk = self.schema.primary_key_of(new_row);
        let key_changed = new_pk != &old_pk[..];
        if key_changed && self.primary.contains_key(new_pk) {
            return Err(ElastoreError::ConstraintViolation(
                "duplicate primary key on update".into(),
            ));
        }
        {
            let Self { pool, streams, schema, .. } = self;
            for context in streams.iter_mut() {
                match context {
                    StreamContext::Snapshot(ctx) => ctx.notify_tuple_update(pool, addr),
                    StreamContext::ElasticIndex(ctx) => {
                        ctx.notify_tuple_update(schema, addr, new_row)
                    }
                }
            }
        }
        let pending = self.pool.is_pending(addr.block);
        let block = self
            .pool
            .block_mut(addr.block)
            .ok_or_else(|| internal_err!("update in unknown block {}", addr.block))?;
        block.row_mut(addr.slot).copy_from_slice(new_row);
        if pending {
            block.set_dirty(addr.slot, true);
        }
        if key_changed {
            self.primary.remove(&old_pk);
            self.primary.insert(new_pk.into(), addr);
        }
        trace!(%addr, "update");
        Ok(())
    }

    /// Update the row with primary key `pk`, if present.
    pub fn update_by_key(&mut self, pk: &[u8], new_row: &[u8]) -> ElastoreResult<bool> {
        match self.primary.get(pk).copied() {
            Some(addr) => {
                self.update(addr, new_row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete the tuple at `addr`. The slot is deactivated only after the
    /// stream contexts have been notified, so an active snapshot keeps the
    /// pre-image. May trigger opportunistic compaction when the block
    /// crosses the configured free-ratio threshold.
    pub fn delete(&mut self, addr: TupleAddr) -> ElastoreResult<()> {
        let pk: Box<[u8]> = {
            let block = self
                .pool
                .block(addr.block)
                .ok_or_else(|| internal_err!("delete in unknown block {}", addr.block))?;
            invariant!(
                block.is_occupied(addr.slot) && block.is_active(addr.slot),
                "delete of inactive slot {addr}"
            );
            self.schema.primary_key_of(block.row(addr.slot)).into()
        };
        {
            let Self { pool, streams, .. } = self;
            for context in streams.iter_mut() {
                match context {
                    StreamContext::Snapshot(ctx) => ctx.notify_tuple_delete(pool, addr),
                    StreamContext::ElasticIndex(ctx) => ctx.notify_tuple_delete(addr),
                }
            }
        }
        if let Some(block) = self.pool.block_mut(addr.block) {
            block.set_active(addr.slot, false);
        }
        let crossed_threshold = self.free_and_check_threshold(addr)?;
        self.primary.remove(&pk);
        self.active_tuples -= 1;
        trace!(%addr, "delete");
        if crossed_threshold {
            self.do_forced_compaction()?;
        }
        Ok(())
    }

    /// Delete the row with primary key `pk`. Returns whether a row existed.
    pub fn delete_by_key(&mut self, pk: &[u8]) -> ElastoreResult<bool> {
        match self.primary.get(pk).copied() {
            Some(addr) => {
                self.delete(addr)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn free_and_check_threshold(&mut self, addr: TupleAddr) -> ElastoreResult<bool> {
        let threshold = self
            .config
            .compaction_threshold_slots(self.pool.slots_per_block());
        let old_free = self
            .pool
            .block(addr.block)
            .map(|b| b.free_count())
            .unwrap_or(0);
        let released = self.pool.free_slot(addr)?;
        if released || self.pool.is_pending(addr.block) {
            return Ok(false);
        }
        let new_free = self
            .pool
            .block(addr.block)
            .map(|b| b.free_count())
            .unwrap_or(0);
        Ok(old_free < threshold && new_free >= threshold)
    }

    /// Drop every tuple. Without an active snapshot this simply releases
    /// all blocks. Under an active snapshot, `force` hands the frozen block
    /// list to the snapshot (which proceeds against it); without `force`
    /// the truncate is refused.
    pub fn delete_all_tuples(&mut self, force: bool) -> ElastoreResult<()> {
        let snapshot_active = self
            .streams
            .iter()
            .any(|c| matches!(c, StreamContext::Snapshot(ctx) if !ctx.is_finished()));
        if snapshot_active {
            if !force {
                return Err(ElastoreError::AlreadyActive(
                    StreamType::Snapshot.to_string(),
                ));
            }
            let frozen = self.pool.take_blocks_for_truncate();
            let snapshot = self.streams.iter_mut().find_map(|c| match c {
                StreamContext::Snapshot(ctx) => Some(ctx),
                _ => None,
            });
            if let Some(ctx) = snapshot {
                ctx.notify_truncate(frozen);
            }
        } else {
            self.pool.clear();
        }
        for context in self.streams.iter_mut() {
            if let StreamContext::ElasticIndex(ctx) = context {
                ctx.notify_truncate();
            }
        }
        self.primary.clear();
        self.active_tuples = 0;
        debug!("truncated table");
        Ok(())
    }

    /// Look up the address of the row with primary key `pk`.
    pub fn lookup(&self, pk: &[u8]) -> Option<TupleAddr> {
        self.primary.get(pk).copied()
    }

    /// The live row bytes at `addr`, if the slot holds an active tuple.
    pub fn read_row(&self, addr: TupleAddr) -> Option<&[u8]> {
        let block = self.pool.block(addr.block)?;
        (block.is_occupied(addr.slot) && block.is_active(addr.slot))
            .then(|| block.row(addr.slot))
    }

    /// Iterate the addresses of live tuples in `(block, slot)` order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            pool: &self.pool,
            blocks: self.pool.block_ids().collect(),
            idx: 0,
            slot: 0,
        }
    }

    /// A consistent ordered scan honoring copy-on-write divergence. With an
    /// active snapshot this reads the frozen snapshot view; otherwise it is
    /// equivalent to [`iter`](Self::iter).
    pub fn cow_iter(&self) -> CowIter<'_> {
        CowIter::new(self)
    }

    /// Drain sparse blocks into denser ones until no block has at least the
    /// configured threshold of free slots, releasing the emptied blocks.
    /// Pending-snapshot blocks are left in place unless the engine was
    /// configured with `allow_pending_moves`. Returns the number of tuples
    /// moved.
    pub fn do_forced_compaction(&mut self) -> ElastoreResult<usize> {
        let include_pending = self.config.allow_pending_moves;
        let threshold = self
            .config
            .compaction_threshold_slots(self.pool.slots_per_block());
        let mut moved_total = 0usize;
        self.pool.release_empty_eligible(include_pending);
        while let Some(src_id) = self.pool.sparsest_eligible(threshold, include_pending) {
            let slots = self
                .pool
                .block(src_id)
                .map(|b| b.active_slots())
                .unwrap_or_default();
            invariant!(
                !slots.is_empty(),
                "compaction candidate {src_id} has no movable tuples"
            );
            let mut drained = true;
            for slot in slots {
                let src = TupleAddr::new(src_id, slot);
                let Some(dst) = self.pool.allocate_slot_excluding(src_id) else {
                    // No room anywhere else; compaction can make no further
                    // progress this round.
                    drained = false;
                    break;
                };
                self.move_tuple(src, dst)?;
                moved_total += 1;
            }
            if !drained {
                break;
            }
            if self.pool.block(src_id).is_some() && self.pool.is_pending(src_id) {
                self.pool.discard_pending_block(src_id)?;
            }
        }
        if moved_total > 0 {
            debug!(moved = moved_total, "forced compaction");
        }
        Ok(moved_total)
    }

    /// Relocate one tuple, repointing every index entry and informing every
    /// stream context before the move is applied.
    fn move_tuple(&mut self, src: TupleAddr, dst: TupleAddr) -> ElastoreResult<()> {
        let row: Vec<u8> = self
            .pool
            .block(src.block)
            .ok_or_else(|| internal_err!("compaction source block {} vanished", src.block))?
            .row(src.slot)
            .to_vec();
        {
            let Self { pool, streams, schema, .. } = self;
            for context in streams.iter_mut() {
                match context {
                    StreamContext::Snapshot(ctx) => {
                        ctx.notify_tuple_movement(pool, src, dst, &row)
                    }
                    StreamContext::ElasticIndex(ctx) => {
                        ctx.notify_tuple_movement(schema, src, dst, &row)
                    }
                }
            }
        }
        let dst_block = self
            .pool
            .block_mut(dst.block)
            .ok_or_else(|| internal_err!("compaction destination block {} vanished", dst.block))?;
        dst_block.row_mut(dst.slot).copy_from_slice(&row);
        dst_block.set_active(dst.slot, true);
        if let Some(src_block) = self.pool.block_mut(src.block) {
            src_block.set_active(src.slot, false);
        }
        self.pool.free_slot(src)?;
        let pk = self.schema.primary_key_of(&row);
        match self.primary.get_mut(pk) {
            Some(entry) => *entry = dst,
            None => internal!("moved tuple {src} missing from primary index"),
        }
        trace!(%src, %dst, "moved tuple");
        Ok(())
    }

    /// Whether any slot still carries a dirty flag. Test hook for the
    /// snapshot-end invariant.
    pub fn any_dirty(&self) -> bool {
        self.pool
            .block_ids()
            .filter_map(|id| self.pool.block(id))
            .any(|b| b.any_dirty())
    }
}

impl fmt::Debug for PersistentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentTable")
            .field("partition_id", &self.partition_id)
            .field("active_tuples", &self.active_tuples)
            .field("blocks", &self.pool.block_count())
            .field("pending_blocks", &self.pool.pending_count())
            .field("active_streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

/// Iterator over the addresses of live tuples, in `(block, slot)` order.
pub struct TableIter<'a> {
    pool: &'a BlockPool,
    blocks: Vec<BlockId>,
    idx: usize,
    slot: u32,
}

impl Iterator for TableIter<'_> {
    type Item = TupleAddr;

    fn next(&mut self) -> Option<TupleAddr> {
        loop {
            let &bid = self.blocks.get(self.idx)?;
            let Some(block) = self.pool.block(bid) else {
                self.idx += 1;
                self.slot = 0;
                continue;
            };
            if self.slot >= block.used_bound() {
                self.idx += 1;
                self.slot = 0;
                continue;
            }
            let slot = self.slot;
            self.slot += 1;
            if block.is_active(slot) {
                return Some(TupleAddr::new(bid, slot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use elastore_data::ColumnType;
    use pretty_assertions::assert_eq;

    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec![ColumnType::BigInt, ColumnType::BigInt], 0, 0).unwrap()
    }

    fn small_table() -> PersistentTable {
        let config = EngineConfig {
            // 8 tuples of 17 bytes per block
            block_allocation_target_bytes: 8 * 17,
            ..Default::default()
        };
        PersistentTable::new(schema(), config, 0).unwrap()
    }

    fn row(pk: i64, payload: i64) -> Vec<u8> {
        let mut row = Vec::with_capacity(16);
        row.extend_from_slice(&pk.to_be_bytes());
        row.extend_from_slice(&payload.to_be_bytes());
        row
    }

    #[test]
    fn insert_lookup_read_round_trip() {
        let mut t = small_table();
        let addr = t.insert(&row(1, 100)).unwrap();
        assert_eq!(t.lookup(&1i64.to_be_bytes()), Some(addr));
        assert_eq!(t.read_row(addr), Some(&row(1, 100)[..]));
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn duplicate_primary_key_has_no_side_effects() {
        let mut t = small_table();
        t.insert(&row(1, 100)).unwrap();
        let before = (t.active_count(), t.block_count());
        let err = t.insert(&row(1, 200)).unwrap_err();
        assert!(matches!(err, ElastoreError::ConstraintViolation(_)));
        assert_eq!((t.active_count(), t.block_count()), before);
        let addr = t.lookup(&1i64.to_be_bytes()).unwrap();
        assert_eq!(t.read_row(addr), Some(&row(1, 100)[..]));
    }

    #[test]
    fn update_follows_key_change() {
        let mut t = small_table();
        let addr = t.insert(&row(1, 100)).unwrap();
        t.update(addr, &row(2, 100)).unwrap();
        assert_eq!(t.lookup(&1i64.to_be_bytes()), None);
        assert_eq!(t.lookup(&2i64.to_be_bytes()), Some(addr));
    }

    #[test]
    fn update_to_colliding_key_fails_cleanly() {
        let mut t = small_table();
        let a = t.insert(&row(1, 100)).unwrap();
        t.insert(&row(2, 200)).unwrap();
        let err = t.update(a, &row(2, 999)).unwrap_err();
        assert!(matches!(err, ElastoreError::ConstraintViolation(_)));
        assert_eq!(t.read_row(a), Some(&row(1, 100)[..]));
    }

    #[test]
    fn delete_reclaims_and_releases() {
        let mut t = small_table();
        let mut addrs = Vec::new();
        for pk in 0..8 {
            addrs.push(t.insert(&row(pk, pk)).unwrap());
        }
        assert_eq!(t.block_count(), 1);
        for addr in addrs {
            t.delete(addr).unwrap();
        }
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.block_count(), 0);
    }

    #[test]
    fn iter_visits_in_block_slot_order() {
        let mut t = small_table();
        let mut expected = Vec::new();
        for pk in 0..20 {
            expected.push(t.insert(&row(pk, 0)).unwrap());
        }
        let got: Vec<TupleAddr> = t.iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn truncate_without_snapshot_releases_everything() {
        let mut t = small_table();
        for pk in 0..20 {
            t.insert(&row(pk, 0)).unwrap();
        }
        t.delete_all_tuples(false).unwrap();
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.block_count(), 0);
        assert_eq!(t.iter().count(), 0);
        // The table stays usable.
        t.insert(&row(5, 5)).unwrap();
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn forced_compaction_preserves_tuples_and_primary_index() {
        let mut t = small_table();
        let mut addrs = Vec::new();
        for pk in 0..32 {
            addrs.push(t.insert(&row(pk, pk * 7)).unwrap());
        }
        // Punch holes in the first blocks: delete 6 of 8 tuples in block 0
        // and 5 of 8 in block 1.
        for pk in [0i64, 1, 2, 3, 4, 5, 8, 9, 10, 11, 12] {
            t.delete_by_key(&pk.to_be_bytes()).unwrap();
        }
        let live_before = t.active_count();
        t.do_forced_compaction().unwrap();
        assert_eq!(t.active_count(), live_before);
        // Every surviving row is reachable through the primary index at a
        // valid live slot.
        for pk in [6i64, 7, 13, 14, 15, 16, 30, 31] {
            let addr = t.lookup(&pk.to_be_bytes()).unwrap();
            let got = t.read_row(addr).unwrap();
            assert_eq!(got, &row(pk, pk * 7)[..]);
        }
    }

    #[test]
    fn compaction_is_noop_when_nothing_qualifies() {
        let mut t = small_table();
        for pk in 0..8 {
            t.insert(&row(pk, 0)).unwrap();
        }
        assert_eq!(t.do_forced_compaction().unwrap(), 0);
        assert_eq!(t.block_count(), 1);
    }
}
