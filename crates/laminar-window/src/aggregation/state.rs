//! Partial aggregation state kept per worker inside each slice.

use std::ops::Range;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, Int64Builder, ListBuilder};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::ArrowError;
use fxhash::FxHashMap;

use super::{window_columns, Accumulator, Aggregate, AggregateFunction, AggregateInputs};
use crate::key::{key_at, KeyColumn, KeyValue};
use crate::slice::{SliceState, WindowInfo};

/// Partial aggregate that can be built, merged and emitted.
///
/// The sealed form of a slice is the merge of its worker partials, so
/// `Sealed = Self`.
pub trait AggregationPartial: SliceState<Sealed = Self> + Clone + Sync {
    /// Whether the output carries a key column.
    const KEYED: bool;

    /// Adds `rows` of a batch.
    fn add_rows(
        &mut self,
        aggregates: &[Aggregate],
        inputs: &AggregateInputs,
        keys: Option<&ArrayRef>,
        rows: Range<usize>,
    );

    /// Merges `other` into `self`.
    fn merge(&mut self, other: &Self);

    /// Number of output rows.
    fn num_groups(&self) -> usize;

    /// Builds the output batch of a finalized window.
    ///
    /// # Errors
    ///
    /// Returns an error if the columns do not match `schema`.
    fn to_batch(
        &self,
        window: WindowInfo,
        aggregates: &[Aggregate],
        key: Option<&KeyColumn>,
        schema: &SchemaRef,
    ) -> Result<RecordBatch, ArrowError>;

    /// Merges worker blocks into one partial.
    #[must_use]
    fn seal(blocks: Vec<Self>) -> Self {
        let mut blocks = blocks.into_iter();
        let Some(mut merged) = blocks.next() else {
            return Self::default();
        };
        for block in blocks {
            merged.merge(&block);
        }
        merged
    }
}

fn new_row(aggregates: &[Aggregate]) -> Vec<Accumulator> {
    aggregates.iter().map(Aggregate::new_accumulator).collect()
}

fn add_to_row(row: &mut [Accumulator], inputs: &AggregateInputs, index: usize) {
    for (i, acc) in row.iter_mut().enumerate() {
        acc.add(inputs.value(i, index));
    }
}

fn merge_rows(into: &mut [Accumulator], from: &[Accumulator]) {
    for (a, b) in into.iter_mut().zip(from) {
        a.merge(b);
    }
}

fn aggregate_column<'a>(
    aggregate: &Aggregate,
    rows: impl Iterator<Item = &'a Accumulator>,
) -> ArrayRef {
    match aggregate.function {
        AggregateFunction::Avg => {
            let mut builder = Float64Builder::new();
            for acc in rows {
                builder.append_option(acc.avg_result());
            }
            Arc::new(builder.finish())
        }
        AggregateFunction::ReservoirSample(_) => {
            let mut builder = ListBuilder::new(Int64Builder::new());
            for acc in rows {
                match acc.sample_result() {
                    Some(sample) => {
                        builder.values().append_slice(sample);
                        builder.append(true);
                    }
                    None => builder.append(false),
                }
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = Int64Builder::new();
            for acc in rows {
                builder.append_option(acc.int_result());
            }
            Arc::new(builder.finish())
        }
    }
}

/// Non-keyed partial: one accumulator row, created on the first added row.
#[derive(Debug, Clone, Default)]
pub struct GlobalAggregationState {
    row: Option<Vec<Accumulator>>,
}

impl GlobalAggregationState {
    /// Accumulators of the partial, if any row was added.
    #[must_use]
    pub fn accumulators(&self) -> Option<&[Accumulator]> {
        self.row.as_deref()
    }
}

impl SliceState for GlobalAggregationState {
    type Sealed = Self;
}

impl AggregationPartial for GlobalAggregationState {
    const KEYED: bool = false;

    fn add_rows(
        &mut self,
        aggregates: &[Aggregate],
        inputs: &AggregateInputs,
        _keys: Option<&ArrayRef>,
        rows: Range<usize>,
    ) {
        let row = self.row.get_or_insert_with(|| new_row(aggregates));
        for index in rows {
            add_to_row(row, inputs, index);
        }
    }

    fn merge(&mut self, other: &Self) {
        let Some(theirs) = &other.row else {
            return;
        };
        match &mut self.row {
            Some(mine) => merge_rows(mine, theirs),
            None => self.row = Some(theirs.clone()),
        }
    }

    fn num_groups(&self) -> usize {
        usize::from(self.row.is_some())
    }

    fn to_batch(
        &self,
        window: WindowInfo,
        aggregates: &[Aggregate],
        _key: Option<&KeyColumn>,
        schema: &SchemaRef,
    ) -> Result<RecordBatch, ArrowError> {
        let rows = self.num_groups();
        let (start, end) = window_columns(window.start, window.end, rows);
        let mut columns = vec![start, end];
        for (i, aggregate) in aggregates.iter().enumerate() {
            columns.push(aggregate_column(
                aggregate,
                self.row.iter().map(|row| &row[i]),
            ));
        }
        RecordBatch::try_new(Arc::clone(schema), columns)
    }
}

/// Keyed partial: one accumulator row per group key.
#[derive(Debug, Clone, Default)]
pub struct KeyedAggregationState {
    groups: FxHashMap<KeyValue, Vec<Accumulator>>,
}

impl KeyedAggregationState {
    /// Accumulators of one group.
    #[must_use]
    pub fn group(&self, key: &KeyValue) -> Option<&[Accumulator]> {
        self.groups.get(key).map(Vec::as_slice)
    }
}

impl SliceState for KeyedAggregationState {
    type Sealed = Self;
}

impl AggregationPartial for KeyedAggregationState {
    const KEYED: bool = true;

    fn add_rows(
        &mut self,
        aggregates: &[Aggregate],
        inputs: &AggregateInputs,
        keys: Option<&ArrayRef>,
        rows: Range<usize>,
    ) {
        let Some(keys) = keys else {
            debug_assert!(false, "keyed aggregation without key column");
            return;
        };
        for index in rows {
            let row = self
                .groups
                .entry(key_at(keys, index))
                .or_insert_with(|| new_row(aggregates));
            add_to_row(row, inputs, index);
        }
    }

    fn merge(&mut self, other: &Self) {
        for (key, theirs) in &other.groups {
            match self.groups.get_mut(key) {
                Some(mine) => merge_rows(mine, theirs),
                None => {
                    self.groups.insert(key.clone(), theirs.clone());
                }
            }
        }
    }

    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn to_batch(
        &self,
        window: WindowInfo,
        aggregates: &[Aggregate],
        key: Option<&KeyColumn>,
        schema: &SchemaRef,
    ) -> Result<RecordBatch, ArrowError> {
        let key = key.ok_or_else(|| {
            ArrowError::InvalidArgumentError("keyed aggregation without key column".into())
        })?;
        let mut groups: Vec<_> = self.groups.iter().collect();
        groups.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let (start, end) = window_columns(window.start, window.end, groups.len());
        let mut columns = vec![start, end, key.build_array(groups.iter().map(|(k, _)| *k))];
        for (i, aggregate) in aggregates.iter().enumerate() {
            columns.push(aggregate_column(
                aggregate,
                groups.iter().map(|(_, row)| &row[i]),
            ));
        }
        RecordBatch::try_new(Arc::clone(schema), columns)
    }
}
