//! The table streamer: activation, cancellation and cooperative driving of
//! the stream contexts attached to a table.
//!
//! A table carries a small vector of active contexts, modeled as a sum type
//! rather than trait objects so the notification fan-out in the mutation
//! path stays a direct match. `stream_more` is the single cooperative yield
//! point of the engine: it advances every active context until output
//! buffers fill or per-call budgets run out, then returns control to the
//! caller, who interleaves further mutations at will.

pub(crate) mod elastic;
pub mod output;
pub(crate) mod predicate;
pub(crate) mod snapshot;

use std::mem;

use derive_more::From;
use elastore_errors::{ElastoreError, ElastoreResult};
use smallvec::SmallVec;
use tracing::debug;

use crate::elastic::ElasticIndex;
use crate::stream::elastic::ElasticIndexContext;
use crate::stream::output::TupleOutputStream;
use crate::stream::predicate::StreamPredicate;
use crate::stream::snapshot::SnapshotContext;
use crate::table::PersistentTable;

/// The kinds of stream a table can carry. At most one of each kind may be
/// active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    /// Point-in-time serialized image of the table.
    Snapshot,
    /// Sparse hash index of surviving tuples for rebalance handoff.
    ElasticIndex,
    /// Reserved for crash recovery replay.
    Recovery,
}

/// One active stream attached to a table.
#[derive(From)]
pub(crate) enum StreamContext {
    Snapshot(SnapshotContext),
    ElasticIndex(ElasticIndexContext),
}

impl StreamContext {
    pub(crate) fn stream_type(&self) -> StreamType {
        match self {
            StreamContext::Snapshot(_) => StreamType::Snapshot,
            StreamContext::ElasticIndex(_) => StreamType::ElasticIndex,
        }
    }
}

impl PersistentTable {
    /// Activate a stream of `ty` with one predicate string per output
    /// buffer position. An empty predicate list behaves as a single
    /// match-everything predicate for snapshot streams and indexes every
    /// tuple for elastic streams.
    ///
    /// Snapshot activation freezes the current block set: every block moves
    /// to the pending-snapshot side, where compaction will not touch it and
    /// mutations preserve pre-images.
    pub fn activate_stream(&mut self, ty: StreamType, predicates: &[&str]) -> ElastoreResult<()> {
        if self.streams.iter().any(|c| c.stream_type() == ty) {
            return Err(ElastoreError::AlreadyActive(ty.to_string()));
        }
        let mut parsed = predicates
            .iter()
            .map(|raw| StreamPredicate::parse(raw))
            .collect::<ElastoreResult<Vec<_>>>()?;
        let context: StreamContext = match ty {
            StreamType::Snapshot => {
                if parsed.is_empty() {
                    parsed.push(StreamPredicate::match_all());
                }
                self.pool.freeze_all()?;
                let blocks = self.pool.pending_ids();
                debug!(blocks = blocks.len(), tuples = self.active_tuples, "snapshot activated");
                SnapshotContext::new(parsed, blocks, self.active_tuples).into()
            }
            StreamType::ElasticIndex => {
                debug!("elastic index stream activated");
                ElasticIndexContext::new(parsed, self.pool.first_block_id()).into()
            }
            StreamType::Recovery => {
                return Err(elastore_errors::unsupported_err!(
                    "RECOVERY streams are reserved"
                ))
            }
        };
        self.streams.push(context);
        Ok(())
    }

    /// Cancel the stream of `ty`, if one is active. Snapshot cancellation
    /// hands every pending block back and clears dirty bits. Idempotent.
    pub fn deactivate_stream(&mut self, ty: StreamType) -> ElastoreResult<()> {
        let Some(at) = self.streams.iter().position(|c| c.stream_type() == ty) else {
            return Ok(());
        };
        match self.streams.remove(at) {
            StreamContext::Snapshot(mut ctx) => ctx.abort(&mut self.pool),
            StreamContext::ElasticIndex(_) => debug!("elastic index stream dropped"),
        }
        Ok(())
    }

    /// Drive every active stream: snapshot contexts write rows matching
    /// predicate `i` into `outputs[i]` until a buffer fills, elastic
    /// contexts advance their index build by the configured budget.
    ///
    /// Returns the total number of tuples still to be streamed; zero means
    /// every active stream is caught up. A structural error aborts the
    /// offending stream (its blocks are handed back) and is returned; the
    /// table itself remains usable.
    pub fn stream_more(
        &mut self,
        outputs: &mut [TupleOutputStream],
    ) -> ElastoreResult<usize> {
        let mut contexts = mem::take(&mut self.streams);
        let mut remaining = 0usize;
        let mut first_error: Option<ElastoreError> = None;
        for context in contexts.iter_mut() {
            let result = match context {
                StreamContext::Snapshot(ctx) => ctx.handle_stream_more(
                    &mut self.pool,
                    &self.schema,
                    self.serializer.as_ref(),
                    outputs,
                ),
                StreamContext::ElasticIndex(ctx) => Ok(ctx.handle_stream_more(
                    &self.pool,
                    &self.schema,
                    self.config.tuples_per_call,
                    self.active_tuples,
                )),
            };
            match result {
                Ok(n) => remaining += n,
                Err(error) => {
                    if let StreamContext::Snapshot(ctx) = context {
                        ctx.abort(&mut self.pool);
                    }
                    first_error.get_or_insert(error);
                }
            }
        }
        let mut deletes: Vec<Box<[u8]>> = Vec::new();
        self.streams = contexts
            .into_iter()
            .filter_map(|context| match context {
                StreamContext::Snapshot(mut ctx) if ctx.is_finished() => {
                    deletes.extend(ctx.take_delete_after());
                    None
                }
                other => Some(other),
            })
            .collect();
        for pk in deletes {
            self.delete_by_key(&pk)?;
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(remaining)
    }

    /// The index maintained by the active elastic stream, if one is active.
    pub fn elastic_index(&self) -> Option<&ElasticIndex> {
        self.streams.iter().find_map(|c| match c {
            StreamContext::ElasticIndex(ctx) => Some(ctx.index()),
            _ => None,
        })
    }

    pub(crate) fn snapshot_context(&self) -> Option<&SnapshotContext> {
        self.streams.iter().find_map(|c| match c {
            StreamContext::Snapshot(ctx) => Some(ctx),
            _ => None,
        })
    }
}

/// The small-vector type tables use to hold active stream contexts.
pub(crate) type ActiveStreams = SmallVec<[StreamContext; 2]>;
