//! # Window Operator Handlers
//!
//! A handler is the shared state of one window operator. Worker threads call
//! [`WindowOperatorHandler::process_buffer`] concurrently; each call
//!
//! 1. computes every record's event time,
//! 2. routes runs of records into the per-worker block of their slice,
//! 3. reports the buffer to the build watermark,
//! 4. finalizes and emits every window the watermark made final.
//!
//! Triggering has no timer: whichever worker finishes a buffer does it, and
//! a compare-and-swap per window picks exactly one finalizer.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --setup--> Created --start--> Running --stop (every side)--> Stopped
//! ```
//!
//! `stop` is called once per input side. Joins have two sides and finalize
//! the remaining windows only after both stopped.
//!
//! ## Backpressure
//!
//! Finalized windows are queued until the context's buffer provider hands
//! out every buffer the window needs. A short provider makes the call return
//! [`HandlerError::AllocationFailure`]; the result stays queued and
//! [`WindowOperatorHandler::retry_pending_emissions`] (or any later trigger)
//! emits it, keeping window order.

mod aggregation;
mod core;
mod join;

pub use aggregation::AggregationHandler;
pub use join::JoinHandler;

use arrow::datatypes::SchemaRef;

use crate::aggregation::{Aggregate, GlobalAggregationState, KeyedAggregationState};
use crate::buffer::{BufferMetadata, PipelineContext, TupleBuffer};
use crate::config::WindowOperatorConfig;
use crate::join::{JoinInput, JoinKind};
use crate::slice::{CacheStats, WindowInfo, WorkerThreadId};
use crate::time::{TimeFunction, Watermark};
use crate::Result;

/// Input a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSide {
    /// The only input of an aggregation
    Single,
    /// Left input of a join
    Left,
    /// Right input of a join
    Right,
}

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Constructed, possibly set up, not yet started
    Created = 0,
    /// Accepting input
    Running = 1,
    /// Every input side stopped
    Stopped = 2,
}

impl HandlerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandlerState::Created,
            1 => HandlerState::Running,
            _ => HandlerState::Stopped,
        }
    }
}

/// Errors raised by handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Operation not allowed in the current lifecycle state
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current state
        state: HandlerState,
    },

    /// Input side does not belong to this handler
    #[error("Input side {0:?} is not an input of this operator")]
    InvalidSide(InputSide),

    /// Context runs a different number of workers than configured
    #[error("Configured for {configured} workers, context has {context}")]
    WorkerCountMismatch {
        /// Configured workers
        configured: usize,
        /// Context workers
        context: usize,
    },

    /// Buffer schema differs from the schema the operator was built for
    #[error("Schema mismatch on {side:?} input: {reason}")]
    SchemaMismatch {
        /// Input side
        side: InputSide,
        /// Description of the difference
        reason: String,
    },

    /// Not enough output buffers; the window stays queued
    #[error("Cannot emit window {window}: needs {required} buffers, {available} available")]
    AllocationFailure {
        /// Window waiting for emission
        window: WindowInfo,
        /// Buffers the window needs
        required: usize,
        /// Buffers that could be allocated
        available: usize,
    },
}

/// Snapshot of a handler's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerMetrics {
    /// Input records seen, including late ones
    pub records_processed: u64,
    /// Records dropped for arriving behind the watermark
    pub late_records: u64,
    /// Windows finalized
    pub windows_triggered: u64,
    /// Triggered windows dropped because building their output failed
    pub failed_windows: u64,
    /// Output buffers emitted
    pub buffers_emitted: u64,
    /// Finalized windows waiting for output buffers
    pub pending_emissions: usize,
    /// Slices freed by garbage collection or shutdown
    pub slices_freed: u64,
    /// Slices currently held
    pub active_slices: usize,
    /// Build-side watermark
    pub build_watermark: i64,
    /// Probe-side (output confirmation) watermark
    pub probe_watermark: i64,
    /// Whether an input origin has more out-of-order buffers than tolerated
    pub watermark_stalled: bool,
    /// Redelivered input buffers skipped
    pub duplicate_buffers: u64,
    /// Slice cache counters summed over workers
    pub cache: CacheStats,
    /// Join bucket pairs compared
    pub buckets_probed: u64,
    /// Join bucket pairs skipped by membership filters
    pub buckets_pruned: u64,
}

fn check_schema(side: InputSide, expected: &SchemaRef, buffer: &TupleBuffer) -> Result<()> {
    let found = buffer.batch.schema();
    if found.fields() == expected.fields() {
        return Ok(());
    }
    Err(HandlerError::SchemaMismatch {
        side,
        reason: format!("expected {expected:?}, found {found:?}"),
    }
    .into())
}

/// A window operator: aggregation or join over sliding or tumbling windows.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use arrow::array::Int64Array;
/// use arrow::datatypes::{DataType, Field, Schema};
/// use arrow::record_batch::RecordBatch;
/// use laminar_window::aggregation::Aggregate;
/// use laminar_window::buffer::{BufferMetadata, FixedBufferPool, LocalPipelineContext, TupleBuffer};
/// use laminar_window::slice::WorkerThreadId;
/// use laminar_window::time::{OriginId, TimeFunction};
/// use laminar_window::{InputSide, WindowOperatorConfig, WindowOperatorHandler};
///
/// let schema = Arc::new(Schema::new(vec![
///     Field::new("ts", DataType::Int64, false),
///     Field::new("value", DataType::Int64, false),
/// ]));
/// let config = WindowOperatorConfig::builder()
///     .window_size_ms(10)
///     .input_origins(vec![OriginId(1)])
///     .output_origin(OriginId(100))
///     .build()
///     .unwrap();
/// let handler = WindowOperatorHandler::non_keyed_aggregation(
///     config,
///     Arc::clone(&schema),
///     TimeFunction::event_time("ts"),
///     vec![Aggregate::sum("value", "total")],
/// )
/// .unwrap();
///
/// let ctx = LocalPipelineContext::new(1, Arc::new(FixedBufferPool::new(8, 1024)));
/// handler.setup(&ctx).unwrap();
/// handler.start().unwrap();
///
/// let batch = RecordBatch::try_new(
///     schema,
///     vec![
///         Arc::new(Int64Array::from(vec![1, 5, 12])),
///         Arc::new(Int64Array::from(vec![10, 20, 30])),
///     ],
/// )
/// .unwrap();
/// let buffer = TupleBuffer::new(BufferMetadata::new(OriginId(1), 1, 10), batch);
/// handler
///     .process_buffer(&ctx, WorkerThreadId(0), InputSide::Single, &buffer)
///     .unwrap();
///
/// // watermark 10 closed [0, 10)
/// let out = ctx.take_emitted();
/// assert_eq!(out.len(), 1);
/// assert_eq!(out[0].num_rows(), 1);
/// ```
#[derive(Debug)]
pub enum WindowOperatorHandler {
    /// Aggregation with a single group
    NonKeyedAggregation(AggregationHandler<GlobalAggregationState>),
    /// Aggregation grouped by a key column
    KeyedAggregation(AggregationHandler<KeyedAggregationState>),
    /// Bucketed hash join
    HashJoin(JoinHandler),
    /// Nested-loop join
    NestedLoopJoin(JoinHandler),
}

macro_rules! dispatch {
    ($self:ident, $h:ident => $body:expr) => {
        match $self {
            WindowOperatorHandler::NonKeyedAggregation($h) => $body,
            WindowOperatorHandler::KeyedAggregation($h) => $body,
            WindowOperatorHandler::HashJoin($h) | WindowOperatorHandler::NestedLoopJoin($h) => {
                $body
            }
        }
    };
}

impl WindowOperatorHandler {
    /// Creates a non-keyed aggregation over inputs of `schema`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a column named by
    /// `time` or `aggregates` is missing or has an unsupported type.
    pub fn non_keyed_aggregation(
        config: WindowOperatorConfig,
        schema: SchemaRef,
        time: TimeFunction,
        aggregates: Vec<Aggregate>,
    ) -> Result<Self> {
        AggregationHandler::new(config, schema, time, None, aggregates)
            .map(WindowOperatorHandler::NonKeyedAggregation)
    }

    /// Creates an aggregation grouped by the column `key`.
    ///
    /// # Errors
    ///
    /// As [`Self::non_keyed_aggregation`], plus key column errors.
    pub fn keyed_aggregation(
        config: WindowOperatorConfig,
        schema: SchemaRef,
        time: TimeFunction,
        key: &str,
        aggregates: Vec<Aggregate>,
    ) -> Result<Self> {
        AggregationHandler::new(config, schema, time, Some(key), aggregates)
            .map(WindowOperatorHandler::KeyedAggregation)
    }

    /// Creates a bucketed hash join.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a key or time
    /// column is missing, unsupported, or the key types differ.
    pub fn hash_join(config: WindowOperatorConfig, left: JoinInput, right: JoinInput) -> Result<Self> {
        JoinHandler::new(config, left, right, JoinKind::Hash).map(WindowOperatorHandler::HashJoin)
    }

    /// Creates a nested-loop join.
    ///
    /// # Errors
    ///
    /// As [`Self::hash_join`].
    pub fn nested_loop_join(
        config: WindowOperatorConfig,
        left: JoinInput,
        right: JoinInput,
    ) -> Result<Self> {
        JoinHandler::new(config, left, right, JoinKind::NestedLoop)
            .map(WindowOperatorHandler::NestedLoopJoin)
    }

    /// Binds the handler to its execution context.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::WorkerCountMismatch`] if the context runs a
    /// different number of workers than configured, and
    /// [`HandlerError::InvalidState`] when called twice or after start.
    pub fn setup(&self, ctx: &dyn PipelineContext) -> Result<()> {
        dispatch!(self, h => h.core().setup(ctx))?;
        Ok(())
    }

    /// Starts accepting input.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] unless set up and not started.
    pub fn start(&self) -> Result<()> {
        dispatch!(self, h => h.core().start())?;
        Ok(())
    }

    /// Processes one input buffer on `worker`.
    ///
    /// Late records are dropped and counted, never reported as errors.
    ///
    /// # Errors
    ///
    /// Returns an error for a buffer that does not fit the operator (wrong
    /// side, schema, worker, or lifecycle state), for a rejected sequence
    /// number, and [`HandlerError::AllocationFailure`] when a window the
    /// buffer finalized could not be emitted. In the last case the buffer
    /// itself was fully processed.
    pub fn process_buffer(
        &self,
        ctx: &dyn PipelineContext,
        worker: WorkerThreadId,
        side: InputSide,
        buffer: &TupleBuffer,
    ) -> Result<()> {
        dispatch!(self, h => h.process_buffer(worker, side, buffer))?;
        self.trigger_slices(ctx)?;
        Ok(())
    }

    /// Finalizes and emits every window the build watermark made final.
    ///
    /// Returns the number of windows emitted by this call, including
    /// previously queued ones.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::AllocationFailure`] if output buffers ran out.
    pub fn trigger_slices(&self, ctx: &dyn PipelineContext) -> Result<usize> {
        dispatch!(self, h => h.trigger_slices(ctx))
    }

    /// Signals the end of `side`'s input.
    ///
    /// Once every side stopped, every window still open is finalized and
    /// emitted, and the slice state is released.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidState`] if the side already stopped or
    /// the handler is not running, and [`HandlerError::AllocationFailure`] if
    /// the final windows could not all be emitted.
    pub fn stop(&self, ctx: &dyn PipelineContext, side: InputSide) -> Result<()> {
        dispatch!(self, h => h.stop(ctx, side))?;
        Ok(())
    }

    /// Emits windows queued by an earlier allocation failure.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::AllocationFailure`] if buffers are still short.
    pub fn retry_pending_emissions(&self, ctx: &dyn PipelineContext) -> Result<usize> {
        Ok(dispatch!(self, h => h.core().retry_pending(ctx))?)
    }

    /// Confirms that the consumer processed an emitted buffer.
    ///
    /// Advances the probe watermark and frees every slice no window needs
    /// any more. Returns the number of freed slices.
    ///
    /// # Errors
    ///
    /// Returns a watermark error if `metadata` was not emitted by this
    /// handler.
    pub fn on_output_processed(&self, metadata: &BufferMetadata) -> Result<usize> {
        dispatch!(self, h => h.core().output_processed(metadata))
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        dispatch!(self, h => h.core().state())
    }

    /// Current build-side watermark.
    #[must_use]
    pub fn build_watermark(&self) -> Watermark {
        dispatch!(self, h => h.core().build_watermark())
    }

    /// Current probe-side watermark.
    #[must_use]
    pub fn probe_watermark(&self) -> Watermark {
        dispatch!(self, h => h.core().probe_watermark())
    }

    /// Windows created but not yet finalized, in end order.
    #[must_use]
    pub fn pending_windows(&self) -> Vec<WindowInfo> {
        dispatch!(self, h => h.core().store().non_triggered_windows())
    }

    /// Output schema.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        dispatch!(self, h => h.output_schema())
    }

    /// Configuration the handler was built with.
    #[must_use]
    pub fn config(&self) -> &WindowOperatorConfig {
        dispatch!(self, h => h.core().config())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> HandlerMetrics {
        dispatch!(self, h => h.core().metrics())
    }
}
