use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use elastore_errors::{internal_err, invariant, ElastoreError, ElastoreResult};
use tracing::trace;

use crate::block::{Block, BlockId, TupleAddr};

/// Number of free-count buckets per bucket map.
pub(crate) const FREE_BUCKETS: usize = 16;

/// Quantize a free-slot count into a bucket index.
///
/// Bucket 0 holds exactly the full blocks; buckets `1..FREE_BUCKETS` split
/// the remaining range so that an entirely free block lands in the last
/// bucket. Allocation walks buckets upward, so lower buckets mean fuller
/// blocks and better fits.
pub(crate) fn bucket_for(free: u32, capacity: u32) -> usize {
    if free == 0 {
        return 0;
    }
    let bucket = (free as usize * (FREE_BUCKETS - 1)).div_ceil(capacity as usize);
    bucket.min(FREE_BUCKETS - 1)
}

/// Blocks grouped by free-count bucket, ordered by creation within a bucket.
pub(crate) struct BucketMap {
    buckets: [BTreeSet<BlockId>; FREE_BUCKETS],
}

impl Default for BucketMap {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| BTreeSet::new()),
        }
    }
}

impl BucketMap {
    fn insert(&mut self, bucket: usize, id: BlockId) {
        self.buckets[bucket].insert(id);
    }

    fn remove(&mut self, bucket: usize, id: BlockId) -> bool {
        self.buckets[bucket].remove(&id)
    }

    /// The fullest non-full block, ties broken by creation order.
    fn best_fit(&self) -> Option<BlockId> {
        self.buckets[1..]
            .iter()
            .find_map(|bucket| bucket.iter().next().copied())
    }

    /// Like [`best_fit`](Self::best_fit), skipping `skip`.
    fn best_fit_excluding(&self, skip: BlockId) -> Option<BlockId> {
        self.buckets[1..]
            .iter()
            .find_map(|bucket| bucket.iter().find(|&&id| id != skip).copied())
    }
}

/// The table's block arena plus the pending / not-pending partition of it.
///
/// Every block lives in `blocks` and in exactly one of the two id sets; the
/// matching bucket map classifies it by free count. A block enters the
/// pending set when a snapshot activates and leaves it when the COW iterator
/// finishes with it (or the snapshot is cancelled).
pub(crate) struct BlockPool {
    blocks: BTreeMap<BlockId, Block>,
    next_id: u32,
    pending: BTreeSet<BlockId>,
    not_pending: BTreeSet<BlockId>,
    pending_buckets: BucketMap,
    not_pending_buckets: BucketMap,
    tuple_width: usize,
    slots_per_block: u32,
}

impl BlockPool {
    pub(crate) fn new(tuple_width: usize, target_bytes: usize) -> ElastoreResult<Self> {
        let slots = target_bytes / tuple_width;
        if slots == 0 {
            return Err(ElastoreError::SchemaMismatch(format!(
                "tuple width {tuple_width} exceeds block target of {target_bytes} bytes"
            )));
        }
        Ok(Self {
            blocks: BTreeMap::new(),
            next_id: 0,
            pending: BTreeSet::new(),
            not_pending: BTreeSet::new(),
            pending_buckets: BucketMap::default(),
            not_pending_buckets: BucketMap::default(),
            tuple_width,
            slots_per_block: slots.min(u32::MAX as usize) as u32,
        })
    }

    pub(crate) fn slots_per_block(&self) -> u32 {
        self.slots_per_block
    }

    pub(crate) fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    pub(crate) fn is_pending(&self, id: BlockId) -> bool {
        self.pending.contains(&id)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn memory_footprint(&self) -> usize {
        self.blocks.values().map(Block::data_bytes).sum()
    }

    pub(crate) fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    pub(crate) fn pending_ids(&self) -> Vec<BlockId> {
        self.pending.iter().copied().collect()
    }

    pub(crate) fn first_block_id(&self) -> Option<BlockId> {
        self.blocks.keys().next().copied()
    }

    pub(crate) fn next_block_after(&self, id: BlockId) -> Option<BlockId> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.blocks
            .range((Excluded(id), Unbounded))
            .next()
            .map(|(&id, _)| id)
    }

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        let block = Block::new(self.slots_per_block, self.tuple_width);
        let bucket = bucket_for(block.free_count(), self.slots_per_block);
        self.blocks.insert(id, block);
        self.not_pending.insert(id);
        self.not_pending_buckets.insert(bucket, id);
        trace!(%id, "allocated block");
        id
    }

    /// Re-bucket `id` after its free count changed from `old_free`.
    fn reclassify(&mut self, id: BlockId, old_free: u32) {
        let free = self.blocks[&id].free_count();
        let (old_bucket, new_bucket) = (
            bucket_for(old_free, self.slots_per_block),
            bucket_for(free, self.slots_per_block),
        );
        if old_bucket == new_bucket {
            return;
        }
        let buckets = if self.pending.contains(&id) {
            &mut self.pending_buckets
        } else {
            &mut self.not_pending_buckets
        };
        buckets.remove(old_bucket, id);
        buckets.insert(new_bucket, id);
    }

    /// Claim a slot: best fit among not-pending blocks, then pending blocks,
    /// then a fresh block.
    pub(crate) fn allocate_slot(&mut self) -> ElastoreResult<TupleAddr> {
        let id = self
            .not_pending_buckets
            .best_fit()
            .or_else(|| self.pending_buckets.best_fit())
            .unwrap_or_else(|| self.new_block());
        let block = self
            .blocks
            .get_mut(&id)
            .ok_or_else(|| internal_err!("bucketed block {id} missing from arena"))?;
        let old_free = block.free_count();
        let slot = block
            .allocate()
            .ok_or_else(|| internal_err!("best-fit block {id} had no free slot"))?;
        self.reclassify(id, old_free);
        Ok(TupleAddr::new(id, slot))
    }

    /// Claim a slot from an existing not-pending block other than `skip`.
    /// Used as the compaction destination; never allocates a new block.
    pub(crate) fn allocate_slot_excluding(&mut self, skip: BlockId) -> Option<TupleAddr> {
        let id = self.not_pending_buckets.best_fit_excluding(skip)?;
        let block = self.blocks.get_mut(&id)?;
        let old_free = block.free_count();
        let slot = block.allocate()?;
        self.reclassify(id, old_free);
        Some(TupleAddr::new(id, slot))
    }

    /// Free `addr`'s slot. Releases the block when it becomes empty and no
    /// snapshot holds it. Returns whether the block was released.
    pub(crate) fn free_slot(&mut self, addr: TupleAddr) -> ElastoreResult<bool> {
        let block = self
            .blocks
            .get_mut(&addr.block)
            .ok_or_else(|| internal_err!("free of slot in unknown block {}", addr.block))?;
        invariant!(
            block.is_occupied(addr.slot),
            "free of unoccupied slot {addr}"
        );
        let old_free = block.free_count();
        block.free(addr.slot);
        if block.is_empty() && !self.pending.contains(&addr.block) {
            self.release_block(addr.block, old_free);
            return Ok(true);
        }
        self.reclassify(addr.block, old_free);
        Ok(false)
    }

    fn release_block(&mut self, id: BlockId, old_free: u32) {
        let bucket = bucket_for(old_free, self.slots_per_block);
        if self.not_pending.remove(&id) {
            self.not_pending_buckets.remove(bucket, id);
        } else if self.pending.remove(&id) {
            self.pending_buckets.remove(bucket, id);
        }
        self.blocks.remove(&id);
        trace!(%id, "released block");
    }

    /// Move the entire not-pending set into the pending set (snapshot
    /// activation). The pending set must be empty beforehand.
    pub(crate) fn freeze_all(&mut self) -> ElastoreResult<()> {
        invariant!(
            self.pending.is_empty(),
            "snapshot activation with {} blocks still pending",
            self.pending.len()
        );
        mem::swap(&mut self.pending, &mut self.not_pending);
        mem::swap(&mut self.pending_buckets, &mut self.not_pending_buckets);
        Ok(())
    }

    /// Move `id` from pending back to not-pending, clearing dirty bits.
    /// Empty blocks are released instead. Returns whether the block was
    /// released. No-op when `id` is not pending (e.g. already compacted
    /// away).
    pub(crate) fn release_from_pending(&mut self, id: BlockId) -> bool {
        if !self.pending.remove(&id) {
            return false;
        }
        let Some(block) = self.blocks.get_mut(&id) else {
            // Compacted away while pending; nothing left to transfer.
            return true;
        };
        block.clear_all_dirty();
        let bucket = bucket_for(block.free_count(), self.slots_per_block);
        self.pending_buckets.remove(bucket, id);
        if block.is_empty() {
            self.blocks.remove(&id);
            trace!(%id, "released block at snapshot hand-back");
            return true;
        }
        self.not_pending.insert(id);
        self.not_pending_buckets.insert(bucket, id);
        false
    }

    /// Hand every pending block back (snapshot completion or cancellation).
    pub(crate) fn restore_all_pending(&mut self) {
        for id in self.pending_ids() {
            self.release_from_pending(id);
        }
    }

    /// Remove a pending block from the arena entirely, keeping it out of
    /// both sets. Only legal once the block is empty (forced compaction of a
    /// pending block with `allow_pending_moves`).
    pub(crate) fn discard_pending_block(&mut self, id: BlockId) -> ElastoreResult<()> {
        invariant!(self.pending.contains(&id), "discard of non-pending {id}");
        let block = self
            .blocks
            .get(&id)
            .ok_or_else(|| internal_err!("pending block {id} missing from arena"))?;
        invariant!(block.is_empty(), "discard of non-empty pending block {id}");
        let bucket = bucket_for(block.free_count(), self.slots_per_block);
        self.pending.remove(&id);
        self.pending_buckets.remove(bucket, id);
        self.blocks.remove(&id);
        Ok(())
    }

    /// Tear out every block for `delete_all_tuples` under an active
    /// snapshot: pending blocks are returned to become the snapshot's frozen
    /// copy, everything else is dropped.
    pub(crate) fn take_blocks_for_truncate(&mut self) -> BTreeMap<BlockId, Block> {
        let pending_ids = mem::take(&mut self.pending);
        self.not_pending.clear();
        self.pending_buckets = BucketMap::default();
        self.not_pending_buckets = BucketMap::default();
        let mut frozen = BTreeMap::new();
        for id in pending_ids {
            if let Some(block) = self.blocks.remove(&id) {
                frozen.insert(id, block);
            }
        }
        self.blocks.clear();
        frozen
    }

    /// Drop every block (truncate without an active snapshot).
    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.pending.clear();
        self.not_pending.clear();
        self.pending_buckets = BucketMap::default();
        self.not_pending_buckets = BucketMap::default();
    }

    /// The sparsest block eligible for forced compaction: free count at
    /// least `threshold_slots`, not empty, and not pending unless
    /// `include_pending`. Ties broken by creation order.
    pub(crate) fn sparsest_eligible(
        &self,
        threshold_slots: u32,
        include_pending: bool,
    ) -> Option<BlockId> {
        self.blocks
            .iter()
            .filter(|(id, block)| {
                block.free_count() >= threshold_slots
                    && !block.is_empty()
                    && (include_pending || !self.pending.contains(id))
            })
            .max_by(|(a_id, a), (b_id, b)| {
                a.free_count()
                    .cmp(&b.free_count())
                    // prefer the older block on equal sparseness
                    .then(b_id.cmp(a_id))
            })
            .map(|(&id, _)| id)
    }

    /// Release eligible blocks that are already empty.
    pub(crate) fn release_empty_eligible(&mut self, include_pending: bool) {
        let empties: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(id, block)| {
                block.is_empty() && (include_pending || !self.pending.contains(id))
            })
            .map(|(&id, _)| id)
            .collect();
        for id in empties {
            if self.pending.contains(&id) {
                let _ = self.discard_pending_block(id);
            } else {
                let old_free = self.blocks[&id].free_count();
                self.release_block(id, old_free);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prop_assert;
    use test_strategy::proptest;

    use super::*;

    const WIDTH: usize = 9;

    fn pool_with_slots(slots: u32) -> BlockPool {
        BlockPool::new(WIDTH, WIDTH * slots as usize).unwrap()
    }

    #[test]
    fn rejects_tuple_wider_than_block() {
        assert!(matches!(
            BlockPool::new(64, 32),
            Err(ElastoreError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn bucket_zero_is_exactly_full() {
        assert_eq!(bucket_for(0, 100), 0);
        assert_ne!(bucket_for(1, 100), 0);
        assert_eq!(bucket_for(100, 100), FREE_BUCKETS - 1);
    }

    #[proptest]
    fn bucket_is_monotone_in_free_count(#[strategy(1u32..10_000)] capacity: u32) {
        let mut last = 0;
        for free in 0..=capacity {
            let b = bucket_for(free, capacity);
            prop_assert!(b >= last);
            prop_assert!(b < FREE_BUCKETS);
            last = b;
        }
    }

    #[test]
    fn allocation_prefers_fullest_block() {
        let mut pool = pool_with_slots(4);
        // Fill one block completely and start a second.
        let mut addrs = Vec::new();
        for _ in 0..6 {
            addrs.push(pool.allocate_slot().unwrap());
        }
        assert_eq!(pool.block_count(), 2);
        // Free one slot in the first (now fullest-but-not-full is the
        // second, which has 2 free out of 4 vs 1 out of 4 for the first).
        pool.free_slot(addrs[0]).unwrap();
        let next = pool.allocate_slot().unwrap();
        // 1/4 free and 2/4 free quantize to different buckets; the fuller
        // first block wins.
        assert_eq!(next.block, addrs[0].block);
    }

    #[test]
    fn empty_block_is_released_unless_pending() {
        let mut pool = pool_with_slots(2);
        let a = pool.allocate_slot().unwrap();
        let b = pool.allocate_slot().unwrap();
        assert_eq!(pool.block_count(), 1);
        pool.free_slot(a).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert!(pool.free_slot(b).unwrap());
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn pending_block_survives_becoming_empty() {
        let mut pool = pool_with_slots(2);
        let a = pool.allocate_slot().unwrap();
        pool.freeze_all().unwrap();
        assert!(!pool.free_slot(a).unwrap());
        assert_eq!(pool.block_count(), 1);
        // Hand-back releases it.
        assert!(pool.release_from_pending(a.block));
        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn freeze_moves_every_block_to_pending() {
        let mut pool = pool_with_slots(2);
        for _ in 0..5 {
            pool.allocate_slot().unwrap();
        }
        let blocks = pool.block_count();
        pool.freeze_all().unwrap();
        assert_eq!(pool.pending_count(), blocks);
        pool.restore_all_pending();
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.block_count(), blocks);
    }

    #[test]
    fn block_ids_are_never_reused() {
        let mut pool = pool_with_slots(1);
        let a = pool.allocate_slot().unwrap();
        pool.free_slot(a).unwrap();
        let b = pool.allocate_slot().unwrap();
        assert!(b.block > a.block);
    }

    #[test]
    fn sparsest_eligible_picks_most_free() {
        let mut pool = pool_with_slots(4);
        let mut addrs = Vec::new();
        for _ in 0..8 {
            addrs.push(pool.allocate_slot().unwrap());
        }
        // Block 0: free 3 of 4; block 1: free 1 of 4.
        pool.free_slot(addrs[0]).unwrap();
        pool.free_slot(addrs[1]).unwrap();
        pool.free_slot(addrs[2]).unwrap();
        pool.free_slot(addrs[4]).unwrap();
        let sparsest = pool.sparsest_eligible(1, false).unwrap();
        assert_eq!(sparsest, addrs[0].block);
        assert_eq!(pool.sparsest_eligible(4, false), None);
    }
}
