use elastore_data::{partition_hash, TableSchema};
use elastore_errors::{ElastoreError, ElastoreResult};
use serde::Deserialize;

/// One activation predicate: a routing expression plus the flag that asks
/// the engine to delete matching tuples once the stream completes.
#[derive(Debug, Clone)]
pub(crate) struct StreamPredicate {
    triggers_delete: bool,
    expression: Option<PredicateExpression>,
}

/// The predicate expression forms the engine evaluates natively.
#[derive(Debug, Clone)]
pub(crate) enum PredicateExpression {
    /// Matches when the hash of the designated column falls in any of the
    /// half-open ranges.
    HashRange {
        column: usize,
        ranges: Vec<(i64, i64)>,
    },
}

impl StreamPredicate {
    /// Parse the opaque activation predicate JSON.
    pub(crate) fn parse(raw: &str) -> ElastoreResult<Self> {
        let parsed: RawPredicate = serde_json::from_str(raw)
            .map_err(|e| ElastoreError::PredicateParse(e.to_string()))?;
        let expression = parsed
            .predicate_expression
            .map(|expr| match expr {
                RawExpression::HashRange {
                    hash_column,
                    ranges,
                } => {
                    if ranges.is_empty() {
                        return Err(ElastoreError::PredicateParse(
                            "HASH_RANGE with no ranges".into(),
                        ));
                    }
                    Ok(PredicateExpression::HashRange {
                        column: hash_column,
                        ranges: ranges.iter().map(|r| (r.start, r.end)).collect(),
                    })
                }
            })
            .transpose()?;
        Ok(Self {
            triggers_delete: parsed.triggers_delete,
            expression,
        })
    }

    /// A predicate that matches every tuple and never triggers deletes.
    pub(crate) fn match_all() -> Self {
        Self {
            triggers_delete: false,
            expression: None,
        }
    }

    pub(crate) fn triggers_delete(&self) -> bool {
        self.triggers_delete
    }

    /// Evaluate against a row. `None` means the predicate does not apply to
    /// this row (e.g. the hashed column does not exist); callers treat that
    /// as a non-match.
    pub(crate) fn matches_row(&self, schema: &TableSchema, row: &[u8]) -> Option<bool> {
        match &self.expression {
            None => Some(true),
            Some(PredicateExpression::HashRange { column, ranges }) => {
                if *column >= schema.num_columns() {
                    return None;
                }
                let hash = partition_hash(&row[schema.column_range(*column)]) as i64;
                Some(ranges.iter().any(|&(start, end)| start <= hash && hash < end))
            }
        }
    }
}

#[derive(Deserialize)]
struct RawPredicate {
    #[serde(rename = "triggersDelete")]
    triggers_delete: bool,
    #[serde(rename = "predicateExpression", default)]
    predicate_expression: Option<RawExpression>,
}

#[derive(Deserialize)]
#[serde(tag = "TYPE")]
enum RawExpression {
    #[serde(rename = "HASH_RANGE")]
    HashRange {
        #[serde(rename = "HASH_COLUMN")]
        hash_column: usize,
        #[serde(rename = "RANGES")]
        ranges: Vec<RawRange>,
    },
}

#[derive(Deserialize)]
struct RawRange {
    #[serde(rename = "RANGE_START")]
    start: i64,
    #[serde(rename = "RANGE_END")]
    end: i64,
}

#[cfg(test)]
mod tests {
    use elastore_data::ColumnType;

    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec![ColumnType::BigInt, ColumnType::BigInt], 0, 0).unwrap()
    }

    fn row_for_pk(pk: i64) -> Vec<u8> {
        let mut row = vec![0u8; 16];
        row[..8].copy_from_slice(&pk.to_be_bytes());
        row
    }

    #[test]
    fn parses_hash_range() {
        let p = StreamPredicate::parse(
            r#"{"triggersDelete": true,
                "predicateExpression": {
                    "TYPE": "HASH_RANGE",
                    "HASH_COLUMN": 0,
                    "RANGES": [{"RANGE_START": -100, "RANGE_END": 100}]
                }}"#,
        )
        .unwrap();
        assert!(p.triggers_delete());
        let s = schema();
        let row = row_for_pk(42);
        let hash = partition_hash(&row[..8]) as i64;
        let expected = (-100..100).contains(&hash);
        assert_eq!(p.matches_row(&s, &row), Some(expected));
    }

    #[test]
    fn missing_expression_matches_everything() {
        let p = StreamPredicate::parse(r#"{"triggersDelete": false}"#).unwrap();
        assert_eq!(p.matches_row(&schema(), &row_for_pk(7)), Some(true));
        assert!(!p.triggers_delete());
    }

    #[test]
    fn range_is_half_open() {
        let s = schema();
        let row = row_for_pk(13);
        let hash = partition_hash(&row[..8]) as i64;
        let covering = format!(
            r#"{{"triggersDelete": false,
                 "predicateExpression": {{
                     "TYPE": "HASH_RANGE", "HASH_COLUMN": 0,
                     "RANGES": [{{"RANGE_START": {hash}, "RANGE_END": {}}}]}}}}"#,
            hash + 1
        );
        let p = StreamPredicate::parse(&covering).unwrap();
        assert_eq!(p.matches_row(&s, &row), Some(true));

        let excluded = format!(
            r#"{{"triggersDelete": false,
                 "predicateExpression": {{
                     "TYPE": "HASH_RANGE", "HASH_COLUMN": 0,
                     "RANGES": [{{"RANGE_START": {}, "RANGE_END": {hash}}}]}}}}"#,
            hash - 1
        );
        let p = StreamPredicate::parse(&excluded).unwrap();
        assert_eq!(p.matches_row(&s, &row), Some(false));
    }

    #[test]
    fn out_of_range_column_is_null() {
        let p = StreamPredicate::parse(
            r#"{"triggersDelete": false,
                "predicateExpression": {
                    "TYPE": "HASH_RANGE", "HASH_COLUMN": 9,
                    "RANGES": [{"RANGE_START": 0, "RANGE_END": 1}]}}"#,
        )
        .unwrap();
        assert_eq!(p.matches_row(&schema(), &row_for_pk(1)), None);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        for bad in [
            "not json",
            r#"{"predicateExpression": null}"#,
            r#"{"triggersDelete": false,
                "predicateExpression": {"TYPE": "HASH_RANGE", "HASH_COLUMN": 0, "RANGES": []}}"#,
        ] {
            assert!(matches!(
                StreamPredicate::parse(bad),
                Err(ElastoreError::PredicateParse(_))
            ));
        }
    }
}
