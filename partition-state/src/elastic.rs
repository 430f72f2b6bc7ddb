//! The elastic scanner and the sorted hash index it feeds.
//!
//! Both are built for partition handoff: the rebalance plane asks for every
//! surviving tuple whose partition-column hash falls in a range, while the
//! table keeps mutating and compacting underneath. The scanner tolerates
//! that churn by holding only a weak block position; the index stays exact
//! by absorbing every mutation notification with no lag.

use std::collections::btree_set::Range as BTreeRange;
use std::collections::BTreeSet;
use std::collections::HashMap;

use tracing::trace;

use crate::block::{BlockId, TupleAddr};
use crate::pool::BlockPool;

/// Sorted index of `(hash, tuple address)` pairs, ordered by hash then
/// address.
///
/// Addresses are weak: compaction must repoint entries through
/// [`move_entry`](Self::move_entry). Insertion is idempotent, which lets the
/// build scan and concurrent insert notifications race benignly.
#[derive(Debug, Default)]
pub struct ElasticIndex {
    by_hash: BTreeSet<(i64, TupleAddr)>,
    by_addr: HashMap<TupleAddr, i64, ahash::RandomState>,
}

impl ElasticIndex {
    /// Add an entry. Replaces the entry for `addr` if one exists with a
    /// different hash. Returns whether the index changed.
    pub fn insert(&mut self, hash: i64, addr: TupleAddr) -> bool {
        if let Some(&old) = self.by_addr.get(&addr) {
            if old == hash {
                return false;
            }
            self.by_hash.remove(&(old, addr));
        }
        self.by_addr.insert(addr, hash);
        self.by_hash.insert((hash, addr))
    }

    /// Remove the entry for `addr`, if any.
    pub fn erase(&mut self, addr: TupleAddr) -> bool {
        match self.by_addr.remove(&addr) {
            Some(hash) => self.by_hash.remove(&(hash, addr)),
            None => false,
        }
    }

    /// Whether `addr` is indexed.
    pub fn has(&self, addr: TupleAddr) -> bool {
        self.by_addr.contains_key(&addr)
    }

    /// The indexed hash for `addr`, if any.
    pub fn hash_of(&self, addr: TupleAddr) -> Option<i64> {
        self.by_addr.get(&addr).copied()
    }

    /// Repoint the entry for `old` to `new` (tuple movement). Returns
    /// whether an entry was moved.
    pub fn move_entry(&mut self, old: TupleAddr, new: TupleAddr) -> bool {
        match self.by_addr.remove(&old) {
            Some(hash) => {
                self.by_hash.remove(&(hash, old));
                self.by_hash.insert((hash, new));
                self.by_addr.insert(new, hash);
                true
            }
            None => false,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// All entries in hash order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, TupleAddr)> + '_ {
        self.by_hash.iter().copied()
    }

    /// Entries with hash in `[start, end)`, in hash order.
    pub fn hash_range(&self, start: i64, end: i64) -> HashRangeIter<'_> {
        let lo = (start, TupleAddr::first_in(BlockId(0)));
        HashRangeIter {
            inner: self.by_hash.range(lo..),
            end,
        }
    }
}

/// Iterator over an [`ElasticIndex`] hash interval.
pub struct HashRangeIter<'a> {
    inner: BTreeRange<'a, (i64, TupleAddr)>,
    end: i64,
}

impl Iterator for HashRangeIter<'_> {
    type Item = (i64, TupleAddr);

    fn next(&mut self) -> Option<Self::Item> {
        let &(hash, addr) = self.inner.next()?;
        (hash < self.end).then_some((hash, addr))
    }
}

/// A forward block walk that survives concurrent mutation and compaction.
///
/// The position is a weak `(block, slot)` pair. When the current block
/// disappears, the scanner either follows the first recorded movement out of
/// its unvisited region or falls through to the next live block. Tuples
/// shuffled behind the position are lost to the scan; the caller's coverage
/// contract accounts for them as shuffles.
#[derive(Debug)]
pub(crate) struct ElasticScanner {
    block: Option<BlockId>,
    slot: u32,
    /// Movements out of the current block's unvisited region, in the order
    /// the compactor performed them.
    pending_moves: Vec<(TupleAddr, TupleAddr)>,
}

impl ElasticScanner {
    pub(crate) fn new(start: Option<BlockId>) -> Self {
        Self {
            block: start,
            slot: 0,
            pending_moves: Vec::new(),
        }
    }

    /// Record a compaction movement so a vanished block can be chased.
    pub(crate) fn note_move(&mut self, src: TupleAddr, dst: TupleAddr) {
        if self.block == Some(src.block) && src.slot >= self.slot {
            self.pending_moves.push((src, dst));
        }
    }

    /// Advance to the next active tuple, or `None` when the walk is done.
    pub(crate) fn advance(&mut self, pool: &BlockPool) -> Option<TupleAddr> {
        loop {
            let bid = self.block?;
            let Some(block) = pool.block(bid) else {
                self.reposition(pool, bid);
                continue;
            };
            if self.slot >= block.used_bound() {
                self.advance_block(pool, bid);
                continue;
            }
            let slot = self.slot;
            self.slot += 1;
            if block.is_active(slot) {
                return Some(TupleAddr::new(bid, slot));
            }
        }
    }

    fn advance_block(&mut self, pool: &BlockPool, bid: BlockId) {
        self.block = pool.next_block_after(bid);
        self.slot = 0;
        self.pending_moves.clear();
    }

    /// The current block was compacted away or released: jump to the block
    /// that received the first unvisited tuple, or to the next live block.
    /// Restarting the receiving block from slot zero can re-yield tuples,
    /// which callers absorb; skipping would lose them.
    fn reposition(&mut self, pool: &BlockPool, bid: BlockId) {
        let followed = self
            .pending_moves
            .iter()
            .min_by_key(|(src, _)| src.slot)
            .map(|&(_, dst)| dst);
        match followed {
            Some(dst) => {
                trace!(from = %bid, to = %dst, "scanner chasing compaction");
                self.block = Some(dst.block);
            }
            None => {
                self.block = pool.next_block_after(bid);
            }
        }
        self.slot = 0;
        self.pending_moves.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(block: u32, slot: u32) -> TupleAddr {
        TupleAddr::new(BlockId(block), slot)
    }

    #[test]
    fn insert_is_idempotent() {
        let mut index = ElasticIndex::default();
        assert!(index.insert(7, addr(0, 0)));
        assert!(!index.insert(7, addr(0, 0)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn insert_replaces_on_hash_change() {
        let mut index = ElasticIndex::default();
        index.insert(7, addr(0, 0));
        index.insert(9, addr(0, 0));
        assert_eq!(index.len(), 1);
        assert_eq!(index.iter().next(), Some((9, addr(0, 0))));
    }

    #[test]
    fn move_entry_preserves_hash_order() {
        let mut index = ElasticIndex::default();
        index.insert(5, addr(0, 1));
        index.insert(-3, addr(0, 2));
        index.insert(12, addr(1, 0));
        assert!(index.move_entry(addr(0, 2), addr(2, 4)));
        let hashes: Vec<i64> = index.iter().map(|(h, _)| h).collect();
        assert_eq!(hashes, vec![-3, 5, 12]);
        assert!(index.has(addr(2, 4)));
        assert!(!index.has(addr(0, 2)));
    }

    #[test]
    fn erase_unknown_is_noop() {
        let mut index = ElasticIndex::default();
        assert!(!index.erase(addr(3, 3)));
    }

    fn active_pool(slots_per_block: u32, tuples: u32) -> (crate::pool::BlockPool, Vec<TupleAddr>) {
        let width = 9;
        let mut pool =
            crate::pool::BlockPool::new(width, width * slots_per_block as usize).unwrap();
        let mut addrs = Vec::new();
        for _ in 0..tuples {
            let a = pool.allocate_slot().unwrap();
            pool.block_mut(a.block).unwrap().set_active(a.slot, true);
            addrs.push(a);
        }
        (pool, addrs)
    }

    #[test]
    fn scanner_walks_blocks_in_order() {
        let (pool, addrs) = active_pool(4, 10);
        let mut scanner = ElasticScanner::new(pool.first_block_id());
        let mut got = Vec::new();
        while let Some(a) = scanner.advance(&pool) {
            got.push(a);
        }
        assert_eq!(got, addrs);
    }

    #[test]
    fn scanner_skips_freed_slots() {
        let (mut pool, addrs) = active_pool(4, 4);
        pool.block_mut(addrs[1].block).unwrap().set_active(addrs[1].slot, false);
        pool.free_slot(addrs[1]).unwrap();
        let mut scanner = ElasticScanner::new(pool.first_block_id());
        let mut got = Vec::new();
        while let Some(a) = scanner.advance(&pool) {
            got.push(a);
        }
        assert_eq!(got, vec![addrs[0], addrs[2], addrs[3]]);
    }

    #[test]
    fn scanner_chases_compacted_block() {
        // Two blocks: the first full, the second half full.
        let (mut pool, addrs) = active_pool(4, 6);
        let src_block = addrs[0].block;
        let mut scanner = ElasticScanner::new(pool.first_block_id());
        assert_eq!(scanner.advance(&pool), Some(addrs[0]));
        assert_eq!(scanner.advance(&pool), Some(addrs[1]));

        // Compact the rest of the first block into the second, then release
        // the emptied source.
        let mut dsts = Vec::new();
        for &src in &addrs[2..4] {
            let dst = pool.allocate_slot_excluding(src_block).unwrap();
            pool.block_mut(dst.block).unwrap().set_active(dst.slot, true);
            scanner.note_move(src, dst);
            dsts.push(dst);
        }
        for &src in &addrs[..4] {
            pool.block_mut(src.block).unwrap().set_active(src.slot, false);
            pool.free_slot(src).unwrap();
        }
        assert!(pool.block(src_block).is_none());

        // The scanner lands on the receiving block and covers all of it,
        // including the tuples that were moved out from under it.
        let mut got = Vec::new();
        while let Some(a) = scanner.advance(&pool) {
            got.push(a);
        }
        assert_eq!(got, vec![addrs[4], addrs[5], dsts[0], dsts[1]]);
    }

    #[test]
    fn scanner_falls_through_released_block() {
        let (mut pool, addrs) = active_pool(4, 6);
        let mut scanner = ElasticScanner::new(pool.first_block_id());
        assert_eq!(scanner.advance(&pool), Some(addrs[0]));
        // Release the first block with no movement notifications.
        for &a in &addrs[..4] {
            pool.block_mut(a.block).unwrap().set_active(a.slot, false);
            pool.free_slot(a).unwrap();
        }
        assert_eq!(scanner.advance(&pool), Some(addrs[4]));
        assert_eq!(scanner.advance(&pool), Some(addrs[5]));
        assert_eq!(scanner.advance(&pool), None);
    }

    #[test]
    fn hash_range_is_half_open() {
        let mut index = ElasticIndex::default();
        for (i, h) in [-10i64, -1, 0, 4, 9, 9, 20].iter().enumerate() {
            index.insert(*h, addr(0, i as u32));
        }
        let got: Vec<i64> = index.hash_range(-1, 9).map(|(h, _)| h).collect();
        assert_eq!(got, vec![-1, 0, 4]);
        let got: Vec<i64> = index.hash_range(9, 21).map(|(h, _)| h).collect();
        assert_eq!(got, vec![9, 9, 20]);
    }
}
