//! # Windowed Aggregation
//!
//! Per-worker partial aggregates built inside slices and combined when a
//! window is triggered.
//!
//! Every worker keeps one partial per slice: a single accumulator row for
//! non-keyed aggregation ([`GlobalAggregationState`]) or a map from group key
//! to accumulator row ([`KeyedAggregationState`]). Sealing a slice merges the
//! worker partials; finalizing a window merges the sealed partials of its
//! slices. All merges except [`AggregateFunction::ReservoirSample`] are
//! associative and commutative, so the result does not depend on worker or
//! slice order.
//!
//! ## Output
//!
//! One row per group: `window_start`, `window_end`, the key column (keyed
//! only) and one column per [`Aggregate`] named by its alias.

mod accumulator;
mod state;

pub use accumulator::{Accumulator, Reservoir};
pub use state::{AggregationPartial, GlobalAggregationState, KeyedAggregationState};

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int64Array};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::key::KeyColumn;

/// Name of the window start column in output batches.
pub const WINDOW_START_COLUMN: &str = "window_start";

/// Name of the window end column in output batches.
pub const WINDOW_END_COLUMN: &str = "window_end";

/// Errors raised while building aggregates.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// Input column not found
    #[error("Aggregate input column not found: {0}")]
    ColumnNotFound(String),

    /// Aggregate requires an input column but none was given
    #[error("Aggregate '{0}' requires an input column")]
    MissingInput(String),

    /// Input column is not an integer column
    #[error("Unsupported input type for column '{column}': {data_type}")]
    UnsupportedInputType {
        /// Column name
        column: String,
        /// Column type
        data_type: DataType,
    },

    /// Cast of an integer column to Int64 failed
    #[error("Failed to read column '{column}': {reason}")]
    Cast {
        /// Column name
        column: String,
        /// Arrow error message
        reason: String,
    },
}

/// Aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// Number of rows
    Count,
    /// Sum of non-null values
    Sum,
    /// Minimum non-null value
    Min,
    /// Maximum non-null value
    Max,
    /// Mean of non-null values
    Avg,
    /// Uniform sample of up to `k` non-null values
    ReservoirSample(usize),
}

/// One aggregate column of an aggregation operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Function to apply
    pub function: AggregateFunction,
    /// Input column, `None` for `COUNT(*)`
    pub input: Option<String>,
    /// Output column name
    pub alias: String,
}

impl Aggregate {
    fn with_input(function: AggregateFunction, column: &str, alias: &str) -> Self {
        Self {
            function,
            input: Some(column.to_string()),
            alias: alias.to_string(),
        }
    }

    /// `COUNT(*)`
    #[must_use]
    pub fn count(alias: &str) -> Self {
        Self {
            function: AggregateFunction::Count,
            input: None,
            alias: alias.to_string(),
        }
    }

    /// `SUM(column)`
    #[must_use]
    pub fn sum(column: &str, alias: &str) -> Self {
        Self::with_input(AggregateFunction::Sum, column, alias)
    }

    /// `MIN(column)`
    #[must_use]
    pub fn min(column: &str, alias: &str) -> Self {
        Self::with_input(AggregateFunction::Min, column, alias)
    }

    /// `MAX(column)`
    #[must_use]
    pub fn max(column: &str, alias: &str) -> Self {
        Self::with_input(AggregateFunction::Max, column, alias)
    }

    /// `AVG(column)`
    #[must_use]
    pub fn avg(column: &str, alias: &str) -> Self {
        Self::with_input(AggregateFunction::Avg, column, alias)
    }

    /// Uniform sample of up to `k` values of `column`.
    #[must_use]
    pub fn reservoir_sample(column: &str, k: usize, alias: &str) -> Self {
        Self::with_input(AggregateFunction::ReservoirSample(k), column, alias)
    }

    /// Creates an empty accumulator for this aggregate.
    #[must_use]
    pub fn new_accumulator(&self) -> Accumulator {
        Accumulator::new(self.function)
    }

    /// Output field of this aggregate.
    #[must_use]
    pub fn output_field(&self) -> Field {
        match self.function {
            AggregateFunction::Count => Field::new(&self.alias, DataType::Int64, false),
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
                Field::new(&self.alias, DataType::Int64, true)
            }
            AggregateFunction::Avg => Field::new(&self.alias, DataType::Float64, true),
            AggregateFunction::ReservoirSample(_) => Field::new(
                &self.alias,
                DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
                true,
            ),
        }
    }

    /// Checks that the input column exists and holds integers.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] describing the first problem.
    pub fn validate(&self, schema: &Schema) -> Result<(), AggregationError> {
        let Some(column) = &self.input else {
            return if self.function == AggregateFunction::Count {
                Ok(())
            } else {
                Err(AggregationError::MissingInput(self.alias.clone()))
            };
        };
        let field = schema
            .field_with_name(column)
            .map_err(|_| AggregationError::ColumnNotFound(column.clone()))?;
        if field.data_type().is_integer() {
            Ok(())
        } else {
            Err(AggregationError::UnsupportedInputType {
                column: column.clone(),
                data_type: field.data_type().clone(),
            })
        }
    }
}

/// Builds the output schema of an aggregation.
#[must_use]
pub fn output_schema(aggregates: &[Aggregate], key: Option<&KeyColumn>) -> SchemaRef {
    let mut fields = vec![
        Field::new(WINDOW_START_COLUMN, DataType::Int64, false),
        Field::new(WINDOW_END_COLUMN, DataType::Int64, false),
    ];
    if let Some(key) = key {
        fields.push(Field::new(key.name(), key.data_type().clone(), true));
    }
    fields.extend(aggregates.iter().map(Aggregate::output_field));
    Arc::new(Schema::new(fields))
}

/// Input values of every aggregate for one batch, widened to `Int64`.
#[derive(Debug)]
pub struct AggregateInputs {
    columns: Vec<Option<Int64Array>>,
}

impl AggregateInputs {
    /// Resolves the input column of each aggregate in `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if a column is missing or not integral.
    pub fn resolve(aggregates: &[Aggregate], batch: &RecordBatch) -> Result<Self, AggregationError> {
        let schema = batch.schema();
        let columns = aggregates
            .iter()
            .map(|aggregate| {
                aggregate.validate(schema.as_ref())?;
                let Some(name) = &aggregate.input else {
                    return Ok(None);
                };
                let index = schema
                    .index_of(name)
                    .map_err(|_| AggregationError::ColumnNotFound(name.clone()))?;
                let widened = arrow_cast::cast(batch.column(index), &DataType::Int64).map_err(
                    |e| AggregationError::Cast {
                        column: name.clone(),
                        reason: e.to_string(),
                    },
                )?;
                Ok(Some(widened.as_primitive::<Int64Type>().clone()))
            })
            .collect::<Result<Vec<_>, AggregationError>>()?;
        Ok(Self { columns })
    }

    /// Value of aggregate `aggregate` at `row`; `None` for null or `COUNT(*)`.
    #[inline]
    #[must_use]
    pub fn value(&self, aggregate: usize, row: usize) -> Option<i64> {
        self.columns[aggregate]
            .as_ref()
            .and_then(|array| (!array.is_null(row)).then(|| array.value(row)))
    }
}

/// Builds the `window_start`/`window_end` columns for `rows` rows.
pub(crate) fn window_columns(start: i64, end: i64, rows: usize) -> (ArrayRef, ArrayRef) {
    (
        Arc::new(Int64Array::from(vec![start; rows])),
        Arc::new(Int64Array::from(vec![end; rows])),
    )
}
