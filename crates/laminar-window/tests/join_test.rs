//! End-to-end tests of windowed joins through the public handler API.

mod common;

use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::*;
use laminar_window::buffer::TupleBuffer;
use laminar_window::handler::{HandlerError, HandlerState};
use laminar_window::join::{JoinInput, JoinKind};
use laminar_window::slice::{SliceAssigner, WorkerThreadId};
use laminar_window::time::{OriginId, TimeFunction};
use laminar_window::{Error, InputSide, WindowOperatorConfig, WindowOperatorHandler};

const LEFT: OriginId = OriginId(1);
const RIGHT: OriginId = OriginId(2);
const W0: WorkerThreadId = WorkerThreadId(0);

type Row = (i64, i64, i64, String, i64, i64, i64);

fn left_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ]))
}

fn right_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("id", DataType::Int64, false),
        Field::new("amount", DataType::Int64, false),
    ]))
}

fn left_batch(rows: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        left_schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| format!("l{}", r.0)),
            )),
        ],
    )
    .unwrap()
}

fn right_batch(rows: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        right_schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0 * 100))),
        ],
    )
    .unwrap()
}

fn join_config(size: i64, slide: i64) -> WindowOperatorConfig {
    WindowOperatorConfig::builder()
        .window_size_ms(size)
        .window_slide_ms(slide)
        .input_origins(vec![LEFT, RIGHT])
        .output_origin(OUTPUT)
        .build()
        .unwrap()
}

fn inputs() -> (JoinInput, JoinInput) {
    (
        JoinInput::new(left_schema(), "id", TimeFunction::event_time("ts")),
        JoinInput::new(right_schema(), "id", TimeFunction::event_time("ts")),
    )
}

fn join(kind: JoinKind, config: WindowOperatorConfig) -> WindowOperatorHandler {
    let (left, right) = inputs();
    match kind {
        JoinKind::Hash => WindowOperatorHandler::hash_join(config, left, right),
        JoinKind::NestedLoop => WindowOperatorHandler::nested_loop_join(config, left, right),
    }
    .unwrap()
}

fn rows(out: &[TupleBuffer]) -> Vec<Row> {
    let mut rows: Vec<Row> = out
        .iter()
        .flat_map(|b| {
            let batch = &b.batch;
            let cols = (
                ints(batch, "window_start"),
                ints(batch, "window_end"),
                ints(batch, "ts"),
                strings(batch, "name"),
                ints(batch, "id"),
                ints(batch, "right_ts"),
                ints(batch, "amount"),
            );
            (0..batch.num_rows())
                .map(|i| {
                    (
                        cols.0[i],
                        cols.1[i],
                        cols.2[i],
                        cols.3[i].clone(),
                        cols.4[i],
                        cols.5[i],
                        cols.6[i],
                    )
                })
                .collect::<Vec<_>>()
        })
        .collect();
    rows.sort();
    rows
}

fn run(
    handler: &WindowOperatorHandler,
    left: &[(i64, i64)],
    right: &[(i64, i64)],
) -> Vec<Row> {
    let ctx = context(1);
    handler.setup(&ctx).unwrap();
    handler.start().unwrap();
    for (seq, chunk) in (1..).zip(left.chunks(50)) {
        let input = buffer(LEFT, seq, 0, left_batch(chunk));
        handler.process_buffer(&ctx, W0, InputSide::Left, &input).unwrap();
    }
    for (seq, chunk) in (1..).zip(right.chunks(50)) {
        let input = buffer(RIGHT, seq, 0, right_batch(chunk));
        handler.process_buffer(&ctx, W0, InputSide::Right, &input).unwrap();
    }
    handler.stop(&ctx, InputSide::Left).unwrap();
    handler.stop(&ctx, InputSide::Right).unwrap();
    rows(&ctx.take_emitted())
}

fn expected(size: i64, slide: i64, left: &[(i64, i64)], right: &[(i64, i64)]) -> Vec<Row> {
    let assigner = SliceAssigner::new(size, slide);
    let mut rows = Vec::new();
    for l in left {
        for window in assigner.windows_of(l.0) {
            for r in right.iter().filter(|r| r.1 == l.1 && window.contains(r.0)) {
                rows.push((
                    window.start,
                    window.end,
                    l.0,
                    format!("l{}", l.0),
                    l.1,
                    r.0,
                    r.0 * 100,
                ));
            }
        }
    }
    rows.sort();
    rows
}

fn random_side(seed: u64, n: usize) -> Vec<(i64, i64)> {
    let mut rng = XorShift::new(seed);
    // distinct timestamps keep rows distinguishable
    let mut ts: Vec<i64> = (0..n as i64).collect();
    rng.shuffle(&mut ts);
    ts.into_iter()
        .map(|t| (t, rng.below(20) as i64))
        .collect()
}

#[test]
fn test_hash_and_nested_loop_agree_with_reference() {
    let left = random_side(11, 200);
    let right = random_side(23, 200);
    let reference = expected(20, 10, &left, &right);
    assert!(!reference.is_empty());

    let hash = run(&join(JoinKind::Hash, join_config(20, 10)), &left, &right);
    let nested = run(&join(JoinKind::NestedLoop, join_config(20, 10)), &left, &right);
    assert_eq!(hash, reference);
    assert_eq!(nested, reference);
}

#[test]
fn test_window_waits_for_both_sides() {
    let ctx = context(1);
    let handler = join(JoinKind::Hash, join_config(10, 10));
    handler.setup(&ctx).unwrap();
    handler.start().unwrap();

    handler
        .process_buffer(&ctx, W0, InputSide::Left, &buffer(LEFT, 1, 100, left_batch(&[(5, 1)])))
        .unwrap();
    assert_eq!(ctx.emitted_count(), 0);
    assert_eq!(handler.build_watermark().timestamp(), i64::MIN);

    handler
        .process_buffer(&ctx, W0, InputSide::Right, &buffer(RIGHT, 1, 100, right_batch(&[(7, 1)])))
        .unwrap();
    let out = ctx.take_emitted();
    assert_eq!(
        rows(&out),
        vec![(0, 10, 5, "l5".to_string(), 1, 7, 700)]
    );
    assert_eq!(handler.metrics().late_records, 0);
}

#[test]
fn test_termination_requires_both_sides() {
    let ctx = context(1);
    let handler = join(JoinKind::NestedLoop, join_config(10, 10));
    handler.setup(&ctx).unwrap();
    handler.start().unwrap();

    handler
        .process_buffer(&ctx, W0, InputSide::Left, &buffer(LEFT, 1, 0, left_batch(&[(3, 4)])))
        .unwrap();
    handler
        .process_buffer(&ctx, W0, InputSide::Right, &buffer(RIGHT, 1, 0, right_batch(&[(8, 4)])))
        .unwrap();

    handler.stop(&ctx, InputSide::Left).unwrap();
    assert_eq!(ctx.emitted_count(), 0);
    assert_eq!(handler.state(), HandlerState::Running);

    // a stopped side accepts no more input
    let err = handler
        .process_buffer(&ctx, W0, InputSide::Left, &buffer(LEFT, 2, 0, left_batch(&[(4, 4)])))
        .unwrap_err();
    assert!(matches!(err, Error::Handler(HandlerError::InvalidState { .. })));

    handler.stop(&ctx, InputSide::Right).unwrap();
    assert_eq!(handler.state(), HandlerState::Stopped);
    assert_eq!(rows(&ctx.take_emitted()).len(), 1);
}

#[test]
fn test_disjoint_buckets_are_pruned() {
    let config = WindowOperatorConfig::builder()
        .window_size_ms(10)
        .input_origins(vec![LEFT, RIGHT])
        .output_origin(OUTPUT)
        .join_buckets(1)
        .false_positive_rate(1e-9)
        .build()
        .unwrap();
    let handler = join(JoinKind::Hash, config);
    let left: Vec<_> = (0..10).map(|i| (i, i)).collect();
    let right: Vec<_> = (0..10).map(|i| (i, i + 100)).collect();

    assert!(run(&handler, &left, &right).is_empty());
    let metrics = handler.metrics();
    assert_eq!(metrics.buckets_probed, 0);
    assert_eq!(metrics.buckets_pruned, 1);
}

#[test]
fn test_single_input_side_rejected() {
    let ctx = context(1);
    let handler = join(JoinKind::Hash, join_config(10, 10));
    handler.setup(&ctx).unwrap();
    handler.start().unwrap();
    let err = handler
        .process_buffer(&ctx, W0, InputSide::Single, &buffer(LEFT, 1, 0, left_batch(&[(1, 1)])))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Handler(HandlerError::InvalidSide(InputSide::Single))
    ));
}

#[test]
fn test_output_schema_prefixes_right_columns() {
    let handler = join(JoinKind::Hash, join_config(10, 10));
    let names: Vec<_> = handler
        .output_schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(
        names,
        vec!["window_start", "window_end", "ts", "id", "name", "right_ts", "right_id", "amount"]
    );
}
