use elastore_data::{partition_hash, TableSchema};
use tracing::debug;

use crate::block::{BlockId, TupleAddr};
use crate::elastic::{ElasticIndex, ElasticScanner};
use crate::pool::BlockPool;
use crate::stream::predicate::StreamPredicate;

/// State of one active elastic-index stream.
///
/// The build phase walks the table with the resilient scanner, a bounded
/// number of tuples per `stream_more` call. From activation onward the index
/// also absorbs every mutation notification, so once the walk completes the
/// index is exact with no lag and stays that way until deactivation.
pub(crate) struct ElasticIndexContext {
    predicates: Vec<StreamPredicate>,
    scanner: ElasticScanner,
    index: ElasticIndex,
    build_done: bool,
    visited: u64,
}

impl ElasticIndexContext {
    pub(crate) fn new(predicates: Vec<StreamPredicate>, start: Option<BlockId>) -> Self {
        Self {
            predicates,
            scanner: ElasticScanner::new(start),
            index: ElasticIndex::default(),
            build_done: false,
            visited: 0,
        }
    }

    pub(crate) fn index(&self) -> &ElasticIndex {
        &self.index
    }

    /// Whether `row` falls in any active elastic predicate range. A context
    /// activated without predicates indexes everything.
    fn in_ranges(&self, schema: &TableSchema, row: &[u8]) -> bool {
        self.predicates.is_empty()
            || self
                .predicates
                .iter()
                .any(|p| p.matches_row(schema, row) == Some(true))
    }

    fn hash_of(schema: &TableSchema, row: &[u8]) -> i64 {
        partition_hash(schema.partition_column_of(row)) as i64
    }

    /// Advance the build walk by at most `tuples_per_call` tuples. Returns
    /// an estimate of the tuples still to visit, zero once the walk is done.
    pub(crate) fn handle_stream_more(
        &mut self,
        pool: &BlockPool,
        schema: &TableSchema,
        tuples_per_call: usize,
        active_tuples: u64,
    ) -> usize {
        if self.build_done {
            return 0;
        }
        for _ in 0..tuples_per_call.max(1) {
            match self.scanner.advance(pool) {
                Some(addr) => {
                    self.visited += 1;
                    if let Some(block) = pool.block(addr.block) {
                        let row = block.row(addr.slot);
                        if self.in_ranges(schema, row) {
                            self.index.insert(Self::hash_of(schema, row), addr);
                        }
                    }
                }
                None => {
                    self.build_done = true;
                    debug!(
                        visited = self.visited,
                        entries = self.index.len(),
                        "elastic index build complete"
                    );
                    return 0;
                }
            }
        }
        (active_tuples.saturating_sub(self.visited).max(1)) as usize
    }

    pub(crate) fn notify_tuple_insert(
        &mut self,
        schema: &TableSchema,
        addr: TupleAddr,
        row: &[u8],
    ) {
        if self.in_ranges(schema, row) {
            self.index.insert(Self::hash_of(schema, row), addr);
        }
    }

    pub(crate) fn notify_tuple_update(
        &mut self,
        schema: &TableSchema,
        addr: TupleAddr,
        new_row: &[u8],
    ) {
        let new_hash = Self::hash_of(schema, new_row);
        let in_ranges = self.in_ranges(schema, new_row);
        if self.index.hash_of(addr) == Some(new_hash) && in_ranges {
            return;
        }
        self.index.erase(addr);
        if in_ranges {
            self.index.insert(new_hash, addr);
        }
    }

    pub(crate) fn notify_tuple_delete(&mut self, addr: TupleAddr) {
        self.index.erase(addr);
    }

    /// Compaction moved a tuple. A repointed entry keeps its hash; a tuple
    /// the build walk had not reached yet is indexed here instead, since the
    /// walk may never see its new address.
    pub(crate) fn notify_tuple_movement(
        &mut self,
        schema: &TableSchema,
        src: TupleAddr,
        dst: TupleAddr,
        row: &[u8],
    ) {
        if !self.index.move_entry(src, dst)
            && !self.build_done
            && self.in_ranges(schema, row)
        {
            self.index.insert(Self::hash_of(schema, row), dst);
        }
        self.scanner.note_move(src, dst);
    }

    /// The table was truncated: every entry is gone, and the walk has
    /// nothing left to visit.
    pub(crate) fn notify_truncate(&mut self) {
        self.index = ElasticIndex::default();
    }
}
