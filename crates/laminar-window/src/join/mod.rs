//! # Windowed Stream Joins
//!
//! Inner equi-joins of two inputs over the same windows.
//!
//! Both inputs write into the same slices: each worker keeps one
//! [`JoinBuildState`] per slice with a bucketed partition per side, where a
//! row goes to bucket `hash(key) mod num_buckets`. When a window is
//! triggered its slices are sealed, merging worker partitions and building a
//! membership filter per bucket, and then probed pairwise.
//!
//! Two join kinds share this build path:
//!
//! - [`JoinKind::Hash`]: `num_buckets` buckets with xor filters; bucket pairs
//!   the filter proves disjoint are skipped.
//! - [`JoinKind::NestedLoop`]: one bucket, no filters, every pair of rows is
//!   compared.
//!
//! ## Output
//!
//! `window_start`, `window_end`, every left column, then every right column.
//! A right column whose name is already taken gets a `right_` prefix.

mod build;
mod filter;
mod probe;

pub use build::{BuildEntry, JoinBuildState, SealedBucket, SealedJoinSlice, SealedSide, SideBuild};
pub use filter::{fingerprint_bits, MembershipFilter};
pub use probe::{probe_window, ProbeStats};

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::aggregation::{WINDOW_END_COLUMN, WINDOW_START_COLUMN};
use crate::key::KeyColumn;
use crate::time::TimeFunction;

/// Prefix given to right columns whose name collides.
pub const RIGHT_PREFIX: &str = "right_";

/// Errors raised while configuring a join.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// Key columns of the two inputs have different types
    #[error("Join key type mismatch: left {left}, right {right}")]
    KeyTypeMismatch {
        /// Left key type
        left: DataType,
        /// Right key type
        right: DataType,
    },
}

/// Identifies one input of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left input
    Left,
    /// Right input
    Right,
}

/// Probe strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Bucketed hash join with membership filters
    Hash,
    /// Pairwise comparison in a single bucket
    NestedLoop,
}

/// Schema, key and event time of one join input.
#[derive(Debug, Clone)]
pub struct JoinInput {
    /// Input schema
    pub schema: SchemaRef,
    /// Join key column
    pub key: String,
    /// Event time of the input's records
    pub time: TimeFunction,
}

impl JoinInput {
    /// Describes a join input.
    #[must_use]
    pub fn new(schema: SchemaRef, key: &str, time: TimeFunction) -> Self {
        Self {
            schema,
            key: key.to_string(),
            time,
        }
    }
}

/// Resolves both key columns and checks they can be compared.
///
/// # Errors
///
/// Returns [`crate::Error::Key`] if a key column is missing or unsupported,
/// and [`JoinError::KeyTypeMismatch`] if the types differ.
pub fn resolve_keys(left: &JoinInput, right: &JoinInput) -> crate::Result<(KeyColumn, KeyColumn)> {
    let left_key = KeyColumn::resolve(&left.schema, &left.key)?;
    let right_key = KeyColumn::resolve(&right.schema, &right.key)?;
    if left_key.data_type() != right_key.data_type() {
        return Err(JoinError::KeyTypeMismatch {
            left: left_key.data_type().clone(),
            right: right_key.data_type().clone(),
        }
        .into());
    }
    Ok((left_key, right_key))
}

/// Output layout of a join.
#[derive(Debug, Clone)]
pub struct JoinLayout {
    schema: SchemaRef,
    left_columns: usize,
}

impl JoinLayout {
    /// Builds the output schema of joining `left` with `right`.
    #[must_use]
    pub fn new(left: &Schema, right: &Schema) -> Self {
        let mut fields = vec![
            Field::new(WINDOW_START_COLUMN, DataType::Int64, false),
            Field::new(WINDOW_END_COLUMN, DataType::Int64, false),
        ];
        fields.extend(left.fields().iter().map(|f| f.as_ref().clone()));
        for field in right.fields() {
            let taken = fields.iter().any(|f| f.name() == field.name());
            let field = field.as_ref().clone();
            if taken {
                let name = format!("{RIGHT_PREFIX}{}", field.name());
                fields.push(field.with_name(name));
            } else {
                fields.push(field);
            }
        }
        Self {
            schema: Arc::new(Schema::new(fields)),
            left_columns: left.fields().len(),
        }
    }

    /// Output schema.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Number of left columns in the output.
    #[must_use]
    pub fn left_columns(&self) -> usize {
        self.left_columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::WindowInfo;
    use arrow::array::{AsArray, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow::datatypes::Int64Type;

    fn left_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]))
    }

    fn right_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("amount", DataType::Int64, false),
        ]))
    }

    fn sealed(left: &[(i64, &str)], right: &[(i64, i64)], kind: JoinKind) -> SealedJoinSlice {
        let buckets = if kind == JoinKind::Hash { 8 } else { 1 };
        let mut state = JoinBuildState::default();
        if !left.is_empty() {
            let batch = RecordBatch::try_new(
                left_schema(),
                vec![
                    Arc::new(Int64Array::from_iter_values(left.iter().map(|r| r.0))),
                    Arc::new(StringArray::from_iter_values(left.iter().map(|r| r.1))),
                ],
            )
            .unwrap();
            let keys = Arc::clone(batch.column(0));
            state.side_mut(JoinSide::Left).insert(batch, &keys, buckets);
        }
        if !right.is_empty() {
            let batch = RecordBatch::try_new(
                right_schema(),
                vec![
                    Arc::new(Int64Array::from_iter_values(right.iter().map(|r| r.0))),
                    Arc::new(Int64Array::from_iter_values(right.iter().map(|r| r.1))),
                ],
            )
            .unwrap();
            let keys = Arc::clone(batch.column(0));
            state.side_mut(JoinSide::Right).insert(batch, &keys, buckets);
        }
        let rate = (kind == JoinKind::Hash).then_some(0.01);
        SealedJoinSlice::seal(vec![state], buckets, rate)
    }

    #[test]
    fn test_layout_prefixes_colliding_names() {
        let layout = JoinLayout::new(&left_schema(), &right_schema());
        let names: Vec<_> = layout
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            vec!["window_start", "window_end", "id", "name", "right_id", "amount"]
        );
        assert_eq!(layout.left_columns(), 2);
    }

    #[test]
    fn test_probe_emits_one_row_per_pair() {
        let layout = JoinLayout::new(&left_schema(), &right_schema());
        for kind in [JoinKind::Hash, JoinKind::NestedLoop] {
            let slice = sealed(
                &[(1, "a"), (2, "b"), (1, "c")],
                &[(1, 10), (3, 30), (1, 11)],
                kind,
            );
            let (out, stats) =
                probe_window(WindowInfo::new(0, 10), &[&slice], kind, &layout).unwrap();
            assert_eq!(out.num_rows(), 4);
            assert_eq!(stats.matches, 4);
            let mut pairs: Vec<_> = (0..out.num_rows())
                .map(|i| {
                    (
                        out.column(3).as_string::<i32>().value(i).to_string(),
                        out.column(5).as_primitive::<Int64Type>().value(i),
                    )
                })
                .collect();
            pairs.sort();
            assert_eq!(
                pairs,
                vec![
                    ("a".to_string(), 10),
                    ("a".to_string(), 11),
                    ("c".to_string(), 10),
                    ("c".to_string(), 11)
                ]
            );
        }
    }

    #[test]
    fn test_probe_across_slices_of_window() {
        let layout = JoinLayout::new(&left_schema(), &right_schema());
        let first = sealed(&[(7, "x")], &[], JoinKind::Hash);
        let second = sealed(&[], &[(7, 70)], JoinKind::Hash);
        let (out, _) = probe_window(
            WindowInfo::new(0, 10),
            &[&first, &second],
            JoinKind::Hash,
            &layout,
        )
        .unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.column(0).as_primitive::<Int64Type>().value(0), 0);
        assert_eq!(out.column(1).as_primitive::<Int64Type>().value(0), 10);
    }

    #[test]
    fn test_no_matches_yields_empty_batch() {
        let layout = JoinLayout::new(&left_schema(), &right_schema());
        let slice = sealed(&[(1, "a")], &[(2, 20)], JoinKind::Hash);
        let (out, stats) =
            probe_window(WindowInfo::new(0, 10), &[&slice], JoinKind::Hash, &layout).unwrap();
        assert_eq!(out.num_rows(), 0);
        assert_eq!(out.num_columns(), 6);
        assert_eq!(stats.matches, 0);
    }

    #[test]
    fn test_mismatched_key_types_rejected() {
        let left = JoinInput::new(left_schema(), "name", TimeFunction::IngestionTime);
        let right = JoinInput::new(right_schema(), "id", TimeFunction::IngestionTime);
        assert!(matches!(
            resolve_keys(&left, &right),
            Err(crate::Error::Join(JoinError::KeyTypeMismatch { .. }))
        ));
    }
}
