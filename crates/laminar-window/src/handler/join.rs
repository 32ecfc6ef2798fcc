//! Windowed hash and nested-loop joins.

use std::sync::Arc;

use arrow::array::Array;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use super::core::WindowCore;
use super::{check_schema, HandlerError, InputSide};
use crate::buffer::{PipelineContext, TupleBuffer};
use crate::config::WindowOperatorConfig;
use crate::join::{
    probe_window, resolve_keys, JoinBuildState, JoinInput, JoinKind, JoinLayout, JoinSide,
    SealedJoinSlice,
};
use crate::key::KeyColumn;
use crate::slice::{SliceLifecycle, TriggeredWindow, WorkerThreadId};
use crate::Result;

/// Join operator of two inputs over the same windows.
#[derive(Debug)]
pub struct JoinHandler {
    core: WindowCore<JoinBuildState>,
    kind: JoinKind,
    left: JoinInput,
    right: JoinInput,
    left_key: KeyColumn,
    right_key: KeyColumn,
    layout: JoinLayout,
    num_buckets: usize,
    false_positive_rate: Option<f64>,
}

impl JoinHandler {
    pub(crate) fn new(
        config: WindowOperatorConfig,
        left: JoinInput,
        right: JoinInput,
        kind: JoinKind,
    ) -> Result<Self> {
        config.validate()?;
        left.time.validate_schema(&left.schema)?;
        right.time.validate_schema(&right.schema)?;
        let (left_key, right_key) = resolve_keys(&left, &right)?;
        let layout = JoinLayout::new(&left.schema, &right.schema);
        let (num_buckets, false_positive_rate) = match kind {
            JoinKind::Hash => (config.join_buckets, Some(config.false_positive_rate)),
            JoinKind::NestedLoop => (1, None),
        };

        Ok(Self {
            core: WindowCore::new(config, &[InputSide::Left, InputSide::Right]),
            kind,
            left,
            right,
            left_key,
            right_key,
            layout,
            num_buckets,
            false_positive_rate,
        })
    }

    pub(crate) fn core(&self) -> &WindowCore<JoinBuildState> {
        &self.core
    }

    pub(crate) fn output_schema(&self) -> SchemaRef {
        Arc::clone(self.layout.schema())
    }

    /// Probe strategy of this join.
    #[must_use]
    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub(crate) fn process_buffer(
        &self,
        worker: WorkerThreadId,
        side: InputSide,
        buffer: &TupleBuffer,
    ) -> Result<()> {
        self.core.check_input(side)?;
        let (join_side, input, key) = match side {
            InputSide::Left => (JoinSide::Left, &self.left, &self.left_key),
            InputSide::Right => (JoinSide::Right, &self.right, &self.right_key),
            InputSide::Single => return Err(HandlerError::InvalidSide(side).into()),
        };
        check_schema(side, &input.schema, buffer)?;

        let batch = &buffer.batch;
        let times = input.time.extract(batch, buffer.metadata.creation_ts)?;
        let keys = key.column(batch)?;
        let num_buckets = self.num_buckets;

        self.core
            .ingest(worker, &buffer.metadata, &times, |slice, rows| {
                let run = batch.slice(rows.start, rows.len());
                let run_keys = keys.slice(rows.start, rows.len());
                slice.update(worker, |state| {
                    state.side_mut(join_side).insert(run, &run_keys, num_buckets);
                })
            })
    }

    pub(crate) fn trigger_slices(&self, ctx: &dyn PipelineContext) -> Result<usize> {
        let windows = self.core.ready_windows();
        self.emit_windows(ctx, &windows)
    }

    pub(crate) fn stop(&self, ctx: &dyn PipelineContext, side: InputSide) -> Result<()> {
        let last = self.core.stop_side(side)?;
        let windows = self.core.terminate();
        let emitted = self.emit_windows(ctx, &windows);
        if last {
            self.core.release_state();
        }
        emitted.map(|_| ())
    }

    fn finalize(&self, triggered: &TriggeredWindow<JoinBuildState>) -> Result<RecordBatch> {
        debug_assert!(
            triggered
                .slices
                .iter()
                .all(|s| s.lifecycle() == SliceLifecycle::EmittedToProbe),
            "probing a window whose slices are still open"
        );
        let sealed: Vec<&SealedJoinSlice> = triggered
            .slices
            .iter()
            .map(|slice| {
                slice.seal_with(|blocks| {
                    SealedJoinSlice::seal(blocks, self.num_buckets, self.false_positive_rate)
                })
            })
            .collect();

        let (batch, stats) = probe_window(triggered.window, &sealed, self.kind, &self.layout)?;
        self.core
            .note_probe(stats.buckets_probed, stats.buckets_pruned);
        tracing::trace!(
            window = %triggered.window,
            matches = stats.matches,
            probed = stats.buckets_probed,
            pruned = stats.buckets_pruned,
            "probed join window"
        );
        Ok(batch)
    }

    fn emit_windows(
        &self,
        ctx: &dyn PipelineContext,
        windows: &[TriggeredWindow<JoinBuildState>],
    ) -> Result<usize> {
        self.core
            .finalize_and_emit(ctx, windows, |t| self.finalize(t))
    }
}
