use crate::TableSchema;

/// Service that turns a row into its streamed representation.
///
/// The output stream processor probes for room before writing, so a
/// serializer must be able to report the exact serialized length of a row
/// without producing it.
pub trait TupleSerializer {
    /// Exact number of bytes [`write_tuple`](Self::write_tuple) will append
    /// for `row`.
    fn serialized_len(&self, schema: &TableSchema, row: &[u8]) -> usize;

    /// Append the serialized form of `row` to `out`.
    fn write_tuple(&self, schema: &TableSchema, row: &[u8], out: &mut Vec<u8>);
}

/// The identity serializer: streams the raw column bytes of the row.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTupleSerializer;

impl TupleSerializer for RawTupleSerializer {
    fn serialized_len(&self, _schema: &TableSchema, row: &[u8]) -> usize {
        row.len()
    }

    fn write_tuple(&self, _schema: &TableSchema, row: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(row);
    }
}
