//! Slice engine benchmarks
//!
//! - slice_assign: slice bounds and covering windows of a timestamp
//! - slice_cache: cache lookups for in-order and scattered timestamps
//! - process_buffer: end-to-end aggregation of one input buffer
//!
//! Run with: cargo bench --bench slice_bench

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use laminar_window::aggregation::Aggregate;
use laminar_window::buffer::{BufferMetadata, FixedBufferPool, LocalPipelineContext, TupleBuffer};
use laminar_window::slice::{CachePolicy, SliceAssigner, SliceCache, WorkerThreadId};
use laminar_window::time::{OriginId, TimeFunction};
use laminar_window::{InputSide, WindowOperatorConfig, WindowOperatorHandler};
use std::sync::Arc;

fn bench_slice_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_assign");
    group.throughput(Throughput::Elements(1));

    for (size, slide) in [(1000i64, 1000i64), (60_000, 10_000), (60_000, 7_000)] {
        let assigner = SliceAssigner::new(size, slide);
        group.bench_with_input(
            BenchmarkId::new("bounds", format!("{size}/{slide}")),
            &assigner,
            |b, assigner| {
                let mut ts = 0i64;
                b.iter(|| {
                    let bounds = assigner.slice_bounds(black_box(ts));
                    ts += 37;
                    black_box(bounds)
                })
            },
        );
        group.bench_with_input(
            BenchmarkId::new("windows_of", format!("{size}/{slide}")),
            &assigner,
            |b, assigner| {
                let mut ts = 0i64;
                b.iter(|| {
                    let windows = assigner.windows_of(black_box(ts));
                    ts += 37;
                    black_box(windows)
                })
            },
        );
    }

    group.finish();
}

fn bench_slice_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_cache");
    group.throughput(Throughput::Elements(1));

    for policy in [CachePolicy::Lru, CachePolicy::Lfu] {
        group.bench_function(BenchmarkId::new("in_order", format!("{policy:?}")), |b| {
            let mut cache: SliceCache<u64> = SliceCache::new(4, policy);
            let mut ts = 0i64;
            b.iter(|| {
                let v = cache.get_or_replace(black_box(ts), |t| {
                    let start = t - t.rem_euclid(1000);
                    Ok::<_, ()>((start, start + 1000, start as u64))
                });
                ts += 10;
                black_box(v)
            })
        });

        group.bench_function(BenchmarkId::new("scattered", format!("{policy:?}")), |b| {
            let mut cache: SliceCache<u64> = SliceCache::new(4, policy);
            let mut x = 0x2545_f491_4f6c_dd1du64;
            b.iter(|| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                let ts = (x % 16_000) as i64;
                let v = cache.get_or_replace(black_box(ts), |t| {
                    let start = t - t.rem_euclid(1000);
                    Ok::<_, ()>((start, start + 1000, start as u64))
                });
                black_box(v)
            })
        });
    }

    group.finish();
}

fn bench_process_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_buffer");
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("value", DataType::Int64, false),
    ]));

    for rows in [64usize, 1024, 8192] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("sliding_sum", rows), &rows, |b, &rows| {
            let config = WindowOperatorConfig::builder()
                .window_size_ms(10_000)
                .window_slide_ms(1_000)
                .input_origins(vec![OriginId(1)])
                .output_origin(OriginId(2))
                .build()
                .unwrap();
            let handler = WindowOperatorHandler::non_keyed_aggregation(
                config,
                Arc::clone(&schema),
                TimeFunction::event_time("ts"),
                vec![Aggregate::sum("value", "total"), Aggregate::count("n")],
            )
            .unwrap();
            let ctx = LocalPipelineContext::new(1, Arc::new(FixedBufferPool::new(1 << 16, 1024)));
            handler.setup(&ctx).unwrap();
            handler.start().unwrap();

            let mut seq = 0u64;
            let mut base = 0i64;
            b.iter(|| {
                seq += 1;
                let ts = Int64Array::from_iter_values((0..rows as i64).map(|i| base + i));
                let values = Int64Array::from_iter_values(0..rows as i64);
                let batch = RecordBatch::try_new(
                    Arc::clone(&schema),
                    vec![Arc::new(ts), Arc::new(values)],
                )
                .unwrap();
                let buffer = TupleBuffer::new(BufferMetadata::new(OriginId(1), seq, base), batch);
                handler
                    .process_buffer(&ctx, WorkerThreadId(0), InputSide::Single, &buffer)
                    .unwrap();
                base += rows as i64;
                // keep the output queue and the pool from filling up
                for out in ctx.take_emitted() {
                    handler.on_output_processed(&out.metadata).unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_slice_assign,
    bench_slice_cache,
    bench_process_buffer
);
criterion_main!(benches);
