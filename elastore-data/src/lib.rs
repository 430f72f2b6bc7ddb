//! Schema, fixed-width tuple layout and partition-column hashing.
//!
//! A tuple is a fixed-width byte record. Byte 0 holds the slot flags (owned
//! by the storage layer); the remaining bytes hold column data at fixed
//! offsets derived from the [`TableSchema`]. This crate owns the layout math
//! and the hash function that routes a row to a partition; it knows nothing
//! about blocks, indexes or streams.

mod schema;
mod serialize;

pub use schema::{ColumnType, TableSchema};
pub use serialize::{RawTupleSerializer, TupleSerializer};

/// The fixed 64-bit hash of a partition-column value.
///
/// The function is part of the wire contract with the rebalance plane: both
/// sides must agree on where a hash value falls within a handoff range, so it
/// must be deterministic across processes and releases. `fxhash` is seedless
/// and stable, unlike the randomly-keyed maps used elsewhere in the engine.
pub fn partition_hash(column_bytes: &[u8]) -> u64 {
    fxhash::hash64(column_bytes)
}
