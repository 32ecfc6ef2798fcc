//! Group and join keys read from record columns.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Int64Type, Schema};
use arrow::record_batch::RecordBatch;

/// Errors raised while resolving key columns.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Column not found in schema
    #[error("Key column not found: {0}")]
    ColumnNotFound(String),

    /// Column type cannot be used as a key
    #[error("Unsupported key type for column '{column}': {data_type}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// Column type
        data_type: DataType,
    },
}

/// A single key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// SQL null
    Null,
    /// Integer key
    Int64(i64),
    /// String key
    Utf8(String),
}

impl KeyValue {
    /// Returns `true` for [`KeyValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }

    /// Hash used for join bucketing and membership filters.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        fxhash::hash64(self)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int64(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Utf8(v.to_string())
    }
}

/// A key column of a known type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    name: String,
    data_type: DataType,
}

impl KeyColumn {
    /// Resolves a key column against a schema.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the column is missing or not `Int64`/`Utf8`.
    pub fn resolve(schema: &Schema, name: &str) -> Result<Self, KeyError> {
        let field = schema
            .field_with_name(name)
            .map_err(|_| KeyError::ColumnNotFound(name.to_string()))?;
        match field.data_type() {
            DataType::Int64 | DataType::Utf8 => Ok(Self {
                name: name.to_string(),
                data_type: field.data_type().clone(),
            }),
            other => Err(KeyError::UnsupportedType {
                column: name.to_string(),
                data_type: other.clone(),
            }),
        }
    }

    /// Column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column type.
    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Returns the key column of `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the batch lacks the column or its type changed.
    pub fn column<'a>(&self, batch: &'a RecordBatch) -> Result<&'a ArrayRef, KeyError> {
        let index = batch
            .schema()
            .index_of(&self.name)
            .map_err(|_| KeyError::ColumnNotFound(self.name.clone()))?;
        let column = batch.column(index);
        if column.data_type() != &self.data_type {
            return Err(KeyError::UnsupportedType {
                column: self.name.clone(),
                data_type: column.data_type().clone(),
            });
        }
        Ok(column)
    }

    /// Builds an output column from key values.
    #[must_use]
    pub fn build_array<'a>(&self, keys: impl Iterator<Item = &'a KeyValue>) -> ArrayRef {
        match self.data_type {
            DataType::Utf8 => {
                let mut builder = StringBuilder::new();
                for key in keys {
                    match key {
                        KeyValue::Utf8(s) => builder.append_value(s),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            _ => {
                let mut builder = Int64Builder::new();
                for key in keys {
                    match key {
                        KeyValue::Int64(v) => builder.append_value(*v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
        }
    }
}

/// Reads the key at `row` of a key column.
#[must_use]
pub fn key_at(column: &ArrayRef, row: usize) -> KeyValue {
    if column.is_null(row) {
        return KeyValue::Null;
    }
    if let Some(ints) = column.as_primitive_opt::<Int64Type>() {
        return KeyValue::Int64(ints.value(row));
    }
    if let Some(strings) = column.as_string_opt::<i32>() {
        return KeyValue::Utf8(strings.value(row).to_string());
    }
    KeyValue::Null
}
