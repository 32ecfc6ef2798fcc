//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{AsArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use laminar_window::buffer::{BufferMetadata, FixedBufferPool, LocalPipelineContext, TupleBuffer};
use laminar_window::time::OriginId;
use laminar_window::WindowOperatorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const INPUT: OriginId = OriginId(1);
pub const OUTPUT: OriginId = OriginId(100);

/// `ts: Int64, key: Utf8, value: Int64`
pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Int64, false),
    ]))
}

pub fn batch(rows: &[(i64, &str, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.2))),
        ],
    )
    .unwrap()
}

/// Rows whose value equals their timestamp, all under key "k".
pub fn timestamps(ts: &[i64]) -> RecordBatch {
    let rows: Vec<_> = ts.iter().map(|t| (*t, "k", *t)).collect();
    batch(&rows)
}

pub fn buffer(origin: OriginId, sequence: u64, watermark: i64, batch: RecordBatch) -> TupleBuffer {
    TupleBuffer::new(BufferMetadata::new(origin, sequence, watermark), batch)
}

pub fn config(size: i64, slide: i64) -> WindowOperatorConfig {
    WindowOperatorConfig::builder()
        .window_size_ms(size)
        .window_slide_ms(slide)
        .input_origins(vec![INPUT])
        .output_origin(OUTPUT)
        .build()
        .unwrap()
}

/// Installs a test-writer subscriber filtered by `RUST_LOG`, once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laminar_window=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn context(workers: usize) -> LocalPipelineContext {
    init_tracing();
    LocalPipelineContext::new(workers, Arc::new(FixedBufferPool::new(1024, 1024)))
}

pub fn ints(batch: &RecordBatch, column: &str) -> Vec<i64> {
    let index = batch.schema().index_of(column).unwrap();
    batch
        .column(index)
        .as_primitive::<Int64Type>()
        .iter()
        .map(|v| v.unwrap())
        .collect()
}

pub fn strings(batch: &RecordBatch, column: &str) -> Vec<String> {
    let index = batch.schema().index_of(column).unwrap();
    batch
        .column(index)
        .as_string::<i32>()
        .iter()
        .map(|v| v.unwrap().to_string())
        .collect()
}

/// Deterministic xorshift generator.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i as u64 + 1) as usize;
            items.swap(i, j);
        }
    }
}
