use std::ops::Range;

use elastore_errors::{ElastoreError, ElastoreResult};
use serde::{Deserialize, Serialize};

/// Flag byte prepended to every tuple slot. Bit assignments live in the
/// storage layer; the schema only accounts for the byte in layout math.
pub const FLAG_BYTES: usize = 1;

/// The type of a single column, which fully determines its on-slot width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit signed integer, big-endian on the slot.
    BigInt,
    /// Opaque fixed-width byte string.
    Bytes {
        /// Exact width in bytes.
        width: usize,
    },
    /// Variable-length string inlined into the tuple: a 2-byte big-endian
    /// length prefix followed by up to `max_len` bytes, padded to full width.
    /// Only usable when the engine is configured with `allow_inline_strings`.
    InlineString {
        /// Maximum string length in bytes.
        max_len: usize,
    },
}

impl ColumnType {
    /// On-slot width of this column in bytes.
    pub fn width(&self) -> usize {
        match self {
            ColumnType::BigInt => 8,
            ColumnType::Bytes { width } => *width,
            ColumnType::InlineString { max_len } => 2 + max_len,
        }
    }

    /// Whether this column inlines variable-width data.
    pub fn is_inline_string(&self) -> bool {
        matches!(self, ColumnType::InlineString { .. })
    }
}

/// Column layout of a table, plus the designated primary-key and
/// partition columns.
///
/// All offsets returned by this type are relative to the start of the *row*
/// (the column region of a slot, excluding the flag byte).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnType>,
    offsets: Vec<usize>,
    row_width: usize,
    primary_key: usize,
    partition_column: usize,
}

impl TableSchema {
    /// Build a schema from column types and the designated key columns.
    ///
    /// Fails with [`ElastoreError::SchemaMismatch`] when a column has zero
    /// width or either designated column index is out of bounds.
    pub fn new(
        columns: Vec<ColumnType>,
        primary_key: usize,
        partition_column: usize,
    ) -> ElastoreResult<Self> {
        if columns.is_empty() {
            return Err(ElastoreError::SchemaMismatch(
                "table must have at least one column".into(),
            ));
        }
        if columns.iter().any(|c| c.width() == 0) {
            return Err(ElastoreError::SchemaMismatch(
                "zero-width column".into(),
            ));
        }
        if primary_key >= columns.len() || partition_column >= columns.len() {
            return Err(ElastoreError::SchemaMismatch(format!(
                "key column out of range: pk {primary_key}, partition {partition_column}, \
                 {} columns",
                columns.len()
            )));
        }
        let mut offsets = Vec::with_capacity(columns.len());
        let mut at = 0;
        for c in &columns {
            offsets.push(at);
            at += c.width();
        }
        Ok(Self {
            columns,
            offsets,
            row_width: at,
            primary_key,
            partition_column,
        })
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Width of the column region of a tuple, excluding the flag byte.
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    /// Full slot width including the flag byte.
    pub fn tuple_width(&self) -> usize {
        FLAG_BYTES + self.row_width
    }

    /// The type of column `col`.
    ///
    /// # Panics
    ///
    /// Panics if `col` is out of bounds.
    pub fn column_type(&self, col: usize) -> ColumnType {
        self.columns[col]
    }

    /// Byte range of column `col` within a row.
    ///
    /// # Panics
    ///
    /// Panics if `col` is out of bounds.
    pub fn column_range(&self, col: usize) -> Range<usize> {
        let start = self.offsets[col];
        start..start + self.columns[col].width()
    }

    /// Index of the primary-key column.
    pub fn primary_key_column(&self) -> usize {
        self.primary_key
    }

    /// Index of the partition column.
    pub fn partition_column(&self) -> usize {
        self.partition_column
    }

    /// The primary-key bytes of `row`.
    pub fn primary_key_of<'a>(&self, row: &'a [u8]) -> &'a [u8] {
        &row[self.column_range(self.primary_key)]
    }

    /// The partition-column bytes of `row`.
    pub fn partition_column_of<'a>(&self, row: &'a [u8]) -> &'a [u8] {
        &row[self.column_range(self.partition_column)]
    }

    /// Whether any column inlines variable-width data.
    pub fn has_inline_strings(&self) -> bool {
        self.columns.iter().any(ColumnType::is_inline_string)
    }

    /// Validate one row against this schema: exact width, and inline-string
    /// length prefixes within bounds.
    pub fn validate_row(&self, row: &[u8]) -> ElastoreResult<()> {
        if row.len() != self.row_width {
            return Err(ElastoreError::SchemaMismatch(format!(
                "row is {} bytes, schema expects {}",
                row.len(),
                self.row_width
            )));
        }
        for (col, ty) in self.columns.iter().enumerate() {
            if let ColumnType::InlineString { max_len } = ty {
                let range = self.column_range(col);
                let len = u16::from_be_bytes([row[range.start], row[range.start + 1]]) as usize;
                if len > *max_len {
                    return Err(ElastoreError::ConstraintViolation(format!(
                        "inline string in column {col} is {len} bytes, max is {max_len}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::collection::vec;
    use proptest::prop_assert_eq;
    use test_strategy::proptest;

    use super::*;

    fn two_bigints() -> TableSchema {
        TableSchema::new(vec![ColumnType::BigInt, ColumnType::BigInt], 0, 0).unwrap()
    }

    #[proptest]
    fn column_ranges_tile_the_row(#[strategy(vec(1usize..64, 1..12))] widths: Vec<usize>) {
        let columns: Vec<ColumnType> = widths.iter().map(|&w| ColumnType::Bytes { width: w }).collect();
        let schema = TableSchema::new(columns, 0, 0).unwrap();
        let mut at = 0;
        for col in 0..schema.num_columns() {
            let range = schema.column_range(col);
            prop_assert_eq!(range.start, at);
            at = range.end;
        }
        prop_assert_eq!(at, schema.row_width());
        prop_assert_eq!(schema.tuple_width(), schema.row_width() + 1);
    }

    #[test]
    fn layout_math() {
        let schema = two_bigints();
        assert_eq!(schema.row_width(), 16);
        assert_eq!(schema.tuple_width(), 17);
        assert_eq!(schema.column_range(0), 0..8);
        assert_eq!(schema.column_range(1), 8..16);
    }

    #[test]
    fn rejects_out_of_range_key() {
        let err = TableSchema::new(vec![ColumnType::BigInt], 1, 0).unwrap_err();
        assert!(matches!(err, ElastoreError::SchemaMismatch(_)));
    }

    #[test]
    fn inline_string_width_includes_prefix() {
        let schema = TableSchema::new(
            vec![ColumnType::BigInt, ColumnType::InlineString { max_len: 14 }],
            0,
            0,
        )
        .unwrap();
        assert_eq!(schema.row_width(), 8 + 16);

        let mut row = vec![0u8; 24];
        row[8] = 0;
        row[9] = 14;
        schema.validate_row(&row).unwrap();
        row[9] = 15;
        assert!(matches!(
            schema.validate_row(&row),
            Err(ElastoreError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn validate_rejects_wrong_width() {
        let schema = two_bigints();
        assert!(matches!(
            schema.validate_row(&[0u8; 15]),
            Err(ElastoreError::SchemaMismatch(_))
        ));
    }
}
