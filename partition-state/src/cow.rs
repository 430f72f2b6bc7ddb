//! Consistent read-back of the snapshot view.
//!
//! The engine preserves pre-images in a per-snapshot side stash rather than
//! rewriting slots in place: the first mutation of a slot under an active
//! snapshot copies the activation-time row into the stash, and slots filled
//! after activation are tracked in a marker set. Reading the snapshot view
//! is then a three-way decision per slot, shared between the streaming
//! snapshot context and the standalone [`CowIter`].

use crate::block::{Block, BlockId, TupleAddr};
use crate::stream::snapshot::SnapshotContext;
use crate::table::PersistentTable;

/// The snapshot-consistent row at `addr`, or `None` when the slot holds
/// nothing that belongs to the snapshot generation.
///
/// Precedence: a stashed pre-image wins over live bytes, the
/// inserted-after-activation marker suppresses live bytes, and otherwise an
/// active slot yields its live row.
pub(crate) fn cow_image<'a>(
    block: &'a Block,
    addr: TupleAddr,
    ctx: Option<&'a SnapshotContext>,
) -> Option<&'a [u8]> {
    if let Some(ctx) = ctx {
        if let Some(pre) = ctx.stashed(addr) {
            return Some(pre);
        }
        if ctx.is_inserted_after(addr) {
            return None;
        }
    }
    block.is_active(addr.slot).then(|| block.row(addr.slot))
}

/// An ordered scan over a frozen block range, honoring copy-on-write
/// divergence.
///
/// The block list is captured at construction; slots are visited in
/// `(block order, slot order)` and each is yielded at most once, with the
/// value it had when the enclosing snapshot activated (or its live value
/// when no snapshot is active). Tuples inserted after activation are never
/// yielded; tuples deleted after activation are yielded from the stash.
pub struct CowIter<'a> {
    table: &'a PersistentTable,
    blocks: Vec<BlockId>,
    idx: usize,
    slot: u32,
}

impl<'a> CowIter<'a> {
    pub(crate) fn new(table: &'a PersistentTable) -> Self {
        let blocks = match table.snapshot_context() {
            Some(ctx) => ctx.captured_blocks().to_vec(),
            None => table.pool().block_ids().collect(),
        };
        Self {
            table,
            blocks,
            idx: 0,
            slot: 0,
        }
    }
}

impl Iterator for CowIter<'_> {
    type Item = TupleAddr;

    fn next(&mut self) -> Option<TupleAddr> {
        let ctx = self.table.snapshot_context();
        loop {
            let &bid = self.blocks.get(self.idx)?;
            let block = self
                .table
                .pool()
                .block(bid)
                .or_else(|| ctx.and_then(|c| c.frozen_block(bid)));
            match block {
                Some(block) => {
                    if self.slot >= block.used_bound() {
                        self.idx += 1;
                        self.slot = 0;
                        continue;
                    }
                    let addr = TupleAddr::new(bid, self.slot);
                    self.slot += 1;
                    if cow_image(block, addr, ctx).is_some() {
                        return Some(addr);
                    }
                }
                None => {
                    // Block compacted away while pending: what the snapshot
                    // still owes from it lives in the stash.
                    if let Some(addr) =
                        ctx.and_then(|c| c.stash_next_in(bid, self.slot))
                    {
                        self.slot = addr.slot + 1;
                        return Some(addr);
                    }
                    self.idx += 1;
                    self.slot = 0;
                }
            }
        }
    }
}
