//! Keyed and non-keyed windowed aggregation.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use super::core::WindowCore;
use super::{check_schema, InputSide};
use crate::aggregation::{output_schema, Aggregate, AggregateInputs, AggregationPartial};
use crate::buffer::{PipelineContext, TupleBuffer};
use crate::config::WindowOperatorConfig;
use crate::key::KeyColumn;
use crate::slice::{TriggeredWindow, WorkerThreadId};
use crate::time::TimeFunction;
use crate::Result;

/// Aggregation operator over partials of type `S`.
#[derive(Debug)]
pub struct AggregationHandler<S: AggregationPartial> {
    core: WindowCore<S>,
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    time: TimeFunction,
    key: Option<KeyColumn>,
    aggregates: Vec<Aggregate>,
}

impl<S: AggregationPartial> AggregationHandler<S> {
    pub(crate) fn new(
        config: WindowOperatorConfig,
        input_schema: SchemaRef,
        time: TimeFunction,
        key: Option<&str>,
        aggregates: Vec<Aggregate>,
    ) -> Result<Self> {
        config.validate()?;
        time.validate_schema(&input_schema)?;
        for aggregate in &aggregates {
            aggregate.validate(&input_schema)?;
        }
        let key = key
            .map(|name| KeyColumn::resolve(&input_schema, name))
            .transpose()?;
        debug_assert_eq!(key.is_some(), S::KEYED, "key column does not match partial type");
        let output_schema = output_schema(&aggregates, key.as_ref());

        Ok(Self {
            core: WindowCore::new(config, &[InputSide::Single]),
            input_schema,
            output_schema,
            time,
            key,
            aggregates,
        })
    }

    pub(crate) fn core(&self) -> &WindowCore<S> {
        &self.core
    }

    pub(crate) fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub(crate) fn process_buffer(
        &self,
        worker: WorkerThreadId,
        side: InputSide,
        buffer: &TupleBuffer,
    ) -> Result<()> {
        self.core.check_input(side)?;
        check_schema(side, &self.input_schema, buffer)?;

        let batch = &buffer.batch;
        let times = self.time.extract(batch, buffer.metadata.creation_ts)?;
        let inputs = AggregateInputs::resolve(&self.aggregates, batch)?;
        let keys = self.key.as_ref().map(|k| k.column(batch)).transpose()?;

        self.core
            .ingest(worker, &buffer.metadata, &times, |slice, rows| {
                slice.update(worker, |partial| {
                    partial.add_rows(&self.aggregates, &inputs, keys, rows);
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

    fn finalize(&self, triggered: &TriggeredWindow<S>) -> Result<RecordBatch> {
        let mut merged = S::default();
        for slice in &triggered.slices {
            merged.merge(slice.seal_with(S::seal));
        }
        tracing::trace!(
            window = %triggered.window,
            slices = triggered.slices.len(),
            groups = merged.num_groups(),
            "finalized aggregation window"
        );
        Ok(merged.to_batch(
            triggered.window,
            &self.aggregates,
            self.key.as_ref(),
            &self.output_schema,
        )?)
    }

    fn emit_windows(
        &self,
        ctx: &dyn PipelineContext,
        windows: &[TriggeredWindow<S>],
    ) -> Result<usize> {
        self.core
            .finalize_and_emit(ctx, windows, |t| self.finalize(t))
    }
}
