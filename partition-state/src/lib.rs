//! In-memory partition table engine with copy-on-write snapshots and
//! elastic-rebalance streaming.
//!
//! A [`PersistentTable`] stores fixed-width rows in equal-size blocks and
//! keeps accepting inserts, updates, deletes and opportunistic compaction
//! while zero or more streams are active on it:
//!
//! * a **snapshot** stream ([`StreamType::Snapshot`]) produces a consistent
//!   point-in-time serialized image of the table, preserving pre-images of
//!   rows mutated underneath it;
//! * an **elastic index** stream ([`StreamType::ElasticIndex`]) builds and
//!   maintains a sorted `(hash, address)` index of surviving tuples so the
//!   rebalance plane can hand a hash range off to another partition.
//!
//! Everything is single-threaded per partition: the caller interleaves
//! mutation calls with [`PersistentTable::stream_more`], which is the
//! engine's only cooperative yield point. Rows matching activation
//! predicate `i` are framed into the `i`-th [`TupleOutputStream`].

mod block;
mod config;
mod cow;
mod elastic;
mod pool;
mod stream;
mod table;

pub use block::{BlockId, TupleAddr};
pub use config::{EngineConfig, DEFAULT_BLOCK_TARGET_BYTES};
pub use cow::CowIter;
pub use elastic::{ElasticIndex, HashRangeIter};
pub use stream::output::{
    TupleOutputStream, FRAME_HEADER_BYTES, FRAME_TERMINATOR_BYTES, ROW_PREFIX_BYTES,
};
pub use stream::StreamType;
pub use table::{PersistentTable, TableIter};
