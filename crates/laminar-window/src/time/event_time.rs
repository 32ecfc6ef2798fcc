//! Event Time Extraction
//!
//! [`TimeFunction`] assigns a timestamp (milliseconds since the Unix epoch) to
//! every row of an incoming `RecordBatch`. Rows are routed into slices by this
//! timestamp.
//!
//! # Example
//!
//! ```ignore
//! use laminar_window::time::{TimeFunction, TimestampFormat};
//!
//! let time = TimeFunction::event_time_with_format("event_time", TimestampFormat::UnixSeconds);
//! let timestamps = time.extract(&batch, creation_ts)?;
//! ```

use std::fmt;

use arrow::array::{Array, ArrayRef, ArrowPrimitiveType, AsArray, PrimitiveArray};
use arrow::datatypes::{
    DataType, Int64Type, Schema, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType,
};
use arrow::record_batch::RecordBatch;
use arrow_cast::parse::string_to_datetime;
use chrono::Utc;

/// Timestamp format variants for extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Unix timestamp in milliseconds (i64)
    #[default]
    UnixMillis,
    /// Unix timestamp in seconds (i64) - converted to millis
    UnixSeconds,
    /// Unix timestamp in microseconds (i64) - converted to millis
    UnixMicros,
    /// Unix timestamp in nanoseconds (i64) - converted to millis
    UnixNanos,
    /// ISO 8601 string format (e.g., "2024-01-15T10:30:00Z")
    Iso8601,
    /// Arrow `Timestamp` column of any unit
    ArrowNative,
}

impl fmt::Display for TimestampFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampFormat::UnixMillis => write!(f, "UnixMillis"),
            TimestampFormat::UnixSeconds => write!(f, "UnixSeconds"),
            TimestampFormat::UnixMicros => write!(f, "UnixMicros"),
            TimestampFormat::UnixNanos => write!(f, "UnixNanos"),
            TimestampFormat::Iso8601 => write!(f, "ISO8601"),
            TimestampFormat::ArrowNative => write!(f, "ArrowNative"),
        }
    }
}

/// Errors that can occur during event time extraction.
#[derive(Debug, thiserror::Error)]
pub enum EventTimeError {
    /// Column not found in schema
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Incompatible column type for format
    #[error("Incompatible type for format {format}: expected {expected}, found {found}")]
    IncompatibleType {
        /// Requested format
        format: TimestampFormat,
        /// Expected type
        expected: &'static str,
        /// Actual type found
        found: String,
    },

    /// Failed to parse timestamp value
    #[error("Failed to parse timestamp '{value}': {reason}")]
    ParseError {
        /// The value that failed to parse
        value: String,
        /// Reason for failure
        reason: String,
    },

    /// Null timestamp encountered
    #[error("Null timestamp at row {row}")]
    NullTimestamp {
        /// Row index with null value
        row: usize,
    },
}

/// Assigns a timestamp to every row of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFunction {
    /// Read the timestamp from a column of the record.
    EventTime {
        /// Column name
        column: String,
        /// Encoding of the column
        format: TimestampFormat,
    },
    /// Stamp every row with the creation time of its buffer.
    IngestionTime,
}

impl TimeFunction {
    /// Event time from an `Int64` column holding Unix milliseconds.
    #[must_use]
    pub fn event_time(column: &str) -> Self {
        Self::event_time_with_format(column, TimestampFormat::UnixMillis)
    }

    /// Event time from a column in the given format.
    #[must_use]
    pub fn event_time_with_format(column: &str, format: TimestampFormat) -> Self {
        Self::EventTime {
            column: column.to_string(),
            format,
        }
    }

    /// Validates that the schema contains a compatible timestamp column.
    ///
    /// Ingestion time accepts any schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is not found or has an incompatible type.
    pub fn validate_schema(&self, schema: &Schema) -> Result<(), EventTimeError> {
        match self {
            Self::IngestionTime => Ok(()),
            Self::EventTime { column, format } => {
                let index = schema
                    .index_of(column)
                    .map_err(|_| EventTimeError::ColumnNotFound(column.clone()))?;
                validate_type(*format, schema.field(index).data_type())
            }
        }
    }

    /// Returns one timestamp in milliseconds per row of `batch`.
    ///
    /// `creation_ts` is the creation time of the buffer carrying the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing, has an incompatible type,
    /// contains a null, or holds an unparsable string.
    pub fn extract(&self, batch: &RecordBatch, creation_ts: i64) -> Result<Vec<i64>, EventTimeError> {
        match self {
            Self::IngestionTime => Ok(vec![creation_ts; batch.num_rows()]),
            Self::EventTime { column, format } => {
                let index = batch
                    .schema()
                    .index_of(column)
                    .map_err(|_| EventTimeError::ColumnNotFound(column.clone()))?;
                extract_column(*format, batch.column(index))
            }
        }
    }
}

fn incompatible(format: TimestampFormat, expected: &'static str, found: &DataType) -> EventTimeError {
    EventTimeError::IncompatibleType {
        format,
        expected,
        found: format!("{found:?}"),
    }
}

fn validate_type(format: TimestampFormat, data_type: &DataType) -> Result<(), EventTimeError> {
    let ok = match format {
        TimestampFormat::UnixMillis
        | TimestampFormat::UnixSeconds
        | TimestampFormat::UnixMicros
        | TimestampFormat::UnixNanos => matches!(data_type, DataType::Int64),
        TimestampFormat::Iso8601 => matches!(data_type, DataType::Utf8),
        TimestampFormat::ArrowNative => matches!(data_type, DataType::Timestamp(_, _)),
    };
    if ok {
        Ok(())
    } else {
        let expected = match format {
            TimestampFormat::Iso8601 => "Utf8",
            TimestampFormat::ArrowNative => "Timestamp",
            _ => "Int64",
        };
        Err(incompatible(format, expected, data_type))
    }
}

fn extract_column(format: TimestampFormat, column: &ArrayRef) -> Result<Vec<i64>, EventTimeError> {
    validate_type(format, column.data_type())?;
    match format {
        TimestampFormat::UnixMillis => collect_i64::<Int64Type>(format, column, |v| v),
        TimestampFormat::UnixSeconds => {
            collect_i64::<Int64Type>(format, column, |v| v.saturating_mul(1000))
        }
        TimestampFormat::UnixMicros => {
            collect_i64::<Int64Type>(format, column, |v| v.div_euclid(1000))
        }
        TimestampFormat::UnixNanos => {
            collect_i64::<Int64Type>(format, column, |v| v.div_euclid(1_000_000))
        }
        TimestampFormat::Iso8601 => extract_iso8601(column),
        TimestampFormat::ArrowNative => match column.data_type() {
            DataType::Timestamp(TimeUnit::Second, _) => {
                collect_i64::<TimestampSecondType>(format, column, |v| v.saturating_mul(1000))
            }
            DataType::Timestamp(TimeUnit::Millisecond, _) => {
                collect_i64::<TimestampMillisecondType>(format, column, |v| v)
            }
            DataType::Timestamp(TimeUnit::Microsecond, _) => {
                collect_i64::<TimestampMicrosecondType>(format, column, |v| v.div_euclid(1000))
            }
            DataType::Timestamp(TimeUnit::Nanosecond, _) => {
                collect_i64::<TimestampNanosecondType>(format, column, |v| {
                    v.div_euclid(1_000_000)
                })
            }
            other => Err(incompatible(format, "Timestamp", other)),
        },
    }
}

fn collect_i64<T>(
    format: TimestampFormat,
    column: &ArrayRef,
    convert: impl Fn(i64) -> i64,
) -> Result<Vec<i64>, EventTimeError>
where
    T: ArrowPrimitiveType<Native = i64>,
{
    let array: &PrimitiveArray<T> = column
        .as_primitive_opt::<T>()
        .ok_or_else(|| incompatible(format, "Int64", column.data_type()))?;
    if let Some(row) = first_null(array) {
        return Err(EventTimeError::NullTimestamp { row });
    }
    Ok(array.values().iter().map(|v| convert(*v)).collect())
}

fn first_null(array: &dyn Array) -> Option<usize> {
    if array.null_count() == 0 {
        return None;
    }
    (0..array.len()).find(|i| array.is_null(*i))
}

fn extract_iso8601(column: &ArrayRef) -> Result<Vec<i64>, EventTimeError> {
    let array = column
        .as_string_opt::<i32>()
        .ok_or_else(|| incompatible(TimestampFormat::Iso8601, "Utf8", column.data_type()))?;
    let mut out = Vec::with_capacity(array.len());
    for row in 0..array.len() {
        if array.is_null(row) {
            return Err(EventTimeError::NullTimestamp { row });
        }
        let s = array.value(row);
        let dt = string_to_datetime(&Utc, s).map_err(|e| EventTimeError::ParseError {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        out.push(dt.timestamp_millis());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Builder, StringBuilder, TimestampMicrosecondBuilder};
    use arrow::datatypes::Field;
    use std::sync::Arc;

    fn make_int64_batch(name: &str, values: &[Option<i64>]) -> RecordBatch {
        let mut builder = Int64Builder::new();
        for v in values {
            match v {
                Some(val) => builder.append_value(*val),
                None => builder.append_null(),
            }
        }
        let array: ArrayRef = Arc::new(builder.finish());
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![array]).unwrap()
    }

    fn make_string_batch(name: &str, values: &[&str]) -> RecordBatch {
        let mut builder = StringBuilder::new();
        for v in values {
            builder.append_value(*v);
        }
        let array: ArrayRef = Arc::new(builder.finish());
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Utf8, true)]));
        RecordBatch::try_new(schema, vec![array]).unwrap()
    }

    #[test]
    fn test_unix_millis_per_row() {
        let batch = make_int64_batch("ts", &[Some(1), Some(9), Some(10)]);
        let ts = TimeFunction::event_time("ts").extract(&batch, 0).unwrap();
        assert_eq!(ts, vec![1, 9, 10]);
    }

    #[test]
    fn test_unix_seconds_and_nanos_conversion() {
        let batch = make_int64_batch("ts", &[Some(2)]);
        let secs = TimeFunction::event_time_with_format("ts", TimestampFormat::UnixSeconds);
        assert_eq!(secs.extract(&batch, 0).unwrap(), vec![2000]);

        let batch = make_int64_batch("ts", &[Some(-1)]);
        let nanos = TimeFunction::event_time_with_format("ts", TimestampFormat::UnixNanos);
        // floors toward negative infinity
        assert_eq!(nanos.extract(&batch, 0).unwrap(), vec![-1]);
    }

    #[test]
    fn test_iso8601_extraction() {
        let batch = make_string_batch("ts", &["2024-01-15T10:30:00Z", "1970-01-01T00:00:01Z"]);
        let time = TimeFunction::event_time_with_format("ts", TimestampFormat::Iso8601);
        assert_eq!(time.extract(&batch, 0).unwrap(), vec![1_705_314_600_000, 1000]);
    }

    #[test]
    fn test_iso8601_parse_error() {
        let batch = make_string_batch("ts", &["not a timestamp"]);
        let time = TimeFunction::event_time_with_format("ts", TimestampFormat::Iso8601);
        assert!(matches!(
            time.extract(&batch, 0),
            Err(EventTimeError::ParseError { .. })
        ));
    }

    #[test]
    fn test_arrow_native_micros() {
        let mut builder = TimestampMicrosecondBuilder::new();
        builder.append_value(5_000);
        builder.append_value(12_999);
        let array: ArrayRef = Arc::new(builder.finish());
        let schema = Arc::new(Schema::new(vec![Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        )]));
        let batch = RecordBatch::try_new(schema, vec![array]).unwrap();
        let time = TimeFunction::event_time_with_format("ts", TimestampFormat::ArrowNative);
        assert_eq!(time.extract(&batch, 0).unwrap(), vec![5, 12]);
    }

    #[test]
    fn test_ingestion_time_uses_creation_ts() {
        let batch = make_int64_batch("value", &[Some(1), Some(2)]);
        let ts = TimeFunction::IngestionTime.extract(&batch, 777).unwrap();
        assert_eq!(ts, vec![777, 777]);
    }

    #[test]
    fn test_null_timestamp_reports_row() {
        let batch = make_int64_batch("ts", &[Some(1), None]);
        let err = TimeFunction::event_time("ts").extract(&batch, 0).unwrap_err();
        assert!(matches!(err, EventTimeError::NullTimestamp { row: 1 }));
    }

    #[test]
    fn test_column_not_found() {
        let batch = make_int64_batch("ts", &[Some(1)]);
        let err = TimeFunction::event_time("missing").extract(&batch, 0).unwrap_err();
        assert!(matches!(err, EventTimeError::ColumnNotFound(_)));
    }

    #[test]
    fn test_validate_schema_incompatible_type() {
        let batch = make_string_batch("ts", &["x"]);
        let err = TimeFunction::event_time("ts")
            .validate_schema(batch.schema().as_ref())
            .unwrap_err();
        assert!(matches!(err, EventTimeError::IncompatibleType { .. }));
        assert!(TimeFunction::IngestionTime
            .validate_schema(batch.schema().as_ref())
            .is_ok());
    }
}
