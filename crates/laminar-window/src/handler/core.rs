//! State shared by every handler variant: slice store, watermarks, caches,
//! the emission queue and counters.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{HandlerError, HandlerMetrics, HandlerState, InputSide};
use crate::buffer::{chunk_batch, BufferMetadata, PipelineContext, TupleBuffer};
use crate::config::WindowOperatorConfig;
use crate::slice::{
    CacheStats, Slice, SliceAssigner, SliceCache, SliceId, SliceState, SliceStore,
    SliceStoreError, TriggeredWindow, WindowInfo, WorkerThreadId,
};
use crate::time::{now_millis, SequenceData, Watermark, WatermarkProcessor};

/// A finalized window waiting for output buffers.
#[derive(Debug)]
struct PendingWindow {
    window: WindowInfo,
    batch: RecordBatch,
}

#[derive(Debug, Default)]
struct Counters {
    records: AtomicU64,
    late: AtomicU64,
    windows: AtomicU64,
    failed_windows: AtomicU64,
    buffers: AtomicU64,
    slices_freed: AtomicU64,
    buckets_probed: AtomicU64,
    buckets_pruned: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct WindowCore<S: SliceState> {
    config: WindowOperatorConfig,
    store: SliceStore<S>,
    build_watermark: WatermarkProcessor,
    probe_watermark: WatermarkProcessor,
    caches: OnceLock<Box<[Mutex<SliceCache<SliceId>>]>>,
    state: AtomicU8,
    sides: SmallVec<[InputSide; 2]>,
    stopped: Mutex<SmallVec<[InputSide; 2]>>,
    next_sequence: AtomicU64,
    pending: Mutex<VecDeque<PendingWindow>>,
    counters: Counters,
}

impl<S: SliceState> WindowCore<S> {
    /// `sides` lists the inputs that must each be stopped once.
    pub(crate) fn new(config: WindowOperatorConfig, sides: &[InputSide]) -> Self {
        let assigner = SliceAssigner::new(config.window_size_ms, config.window_slide_ms);
        let store = SliceStore::new(
            assigner,
            config.worker_threads,
            sides.len(),
            config.allowed_lateness_ms,
        );
        let build_watermark =
            WatermarkProcessor::new(&config.input_origins, config.max_out_of_order);
        let probe_watermark =
            WatermarkProcessor::new(&[config.output_origin], config.max_out_of_order);
        Self {
            config,
            store,
            build_watermark,
            probe_watermark,
            caches: OnceLock::new(),
            state: AtomicU8::new(HandlerState::Created as u8),
            sides: sides.iter().copied().collect(),
            stopped: Mutex::new(SmallVec::new()),
            next_sequence: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    pub(crate) fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &SliceStore<S> {
        &self.store
    }

    pub(crate) fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn invalid_state(&self, operation: &'static str) -> HandlerError {
        HandlerError::InvalidState {
            operation,
            state: self.state(),
        }
    }

    pub(crate) fn setup(&self, ctx: &dyn PipelineContext) -> Result<(), HandlerError> {
        if self.state() != HandlerState::Created {
            return Err(self.invalid_state("setup"));
        }
        let workers = ctx.number_of_worker_threads();
        if workers != self.config.worker_threads {
            return Err(HandlerError::WorkerCountMismatch {
                configured: self.config.worker_threads,
                context: workers,
            });
        }
        let cache = self.config.slice_cache;
        let caches: Box<[_]> = if cache.capacity == 0 {
            Vec::new().into_boxed_slice()
        } else {
            (0..workers)
                .map(|_| Mutex::new(SliceCache::new(cache.capacity, cache.policy)))
                .collect()
        };
        self.caches
            .set(caches)
            .map_err(|_| self.invalid_state("setup"))?;
        tracing::debug!(
            workers,
            cache_capacity = cache.capacity,
            size = self.config.window_size_ms,
            slide = self.config.window_slide_ms,
            "window handler set up"
        );
        Ok(())
    }

    pub(crate) fn start(&self) -> Result<(), HandlerError> {
        if self.caches.get().is_none() {
            return Err(self.invalid_state("start"));
        }
        self.state
            .compare_exchange(
                HandlerState::Created as u8,
                HandlerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| self.invalid_state("start"))?;
        Ok(())
    }

    /// Checks that `side` may still deliver input.
    pub(crate) fn check_input(&self, side: InputSide) -> Result<(), HandlerError> {
        if !self.sides.contains(&side) {
            return Err(HandlerError::InvalidSide(side));
        }
        if self.state() != HandlerState::Running || self.stopped.lock().contains(&side) {
            return Err(self.invalid_state("process_buffer"));
        }
        Ok(())
    }

    /// Marks `side` as stopped. Returns `true` when it was the last one.
    pub(crate) fn stop_side(&self, side: InputSide) -> Result<bool, HandlerError> {
        self.check_input(side).map_err(|e| match e {
            HandlerError::InvalidState { state, .. } => HandlerError::InvalidState {
                operation: "stop",
                state,
            },
            other => other,
        })?;
        let mut stopped = self.stopped.lock();
        stopped.push(side);
        let last = stopped.len() == self.sides.len();
        if last {
            self.state
                .store(HandlerState::Stopped as u8, Ordering::Release);
        }
        tracing::debug!(?side, last, "input side stopped");
        Ok(last)
    }

    pub(crate) fn build_watermark(&self) -> Watermark {
        self.build_watermark.current()
    }

    pub(crate) fn probe_watermark(&self) -> Watermark {
        self.probe_watermark.current()
    }

    fn slice_for(
        &self,
        worker: WorkerThreadId,
        ts: i64,
        watermark: Watermark,
    ) -> Result<Arc<Slice<S>>, SliceStoreError> {
        let Some(cache) = self.caches.get().and_then(|c| c.get(worker.0)) else {
            return self.store.get_or_create_slice(ts, watermark);
        };
        let mut cache = cache.lock();
        let mut created = None;
        let id = cache.get_or_replace(ts, |ts| {
            let slice = self.store.get_or_create_slice(ts, watermark)?;
            let entry = (slice.start(), slice.end(), slice.id());
            created = Some(slice);
            Ok::<_, SliceStoreError>(entry)
        })?;
        if let Some(slice) = created {
            return Ok(slice);
        }
        if let Some(slice) = self.store.slice(id) {
            return Ok(slice);
        }
        // cached handle outlived its slice
        cache.invalidate(ts);
        drop(cache);
        self.store.get_or_create_slice(ts, watermark)
    }

    /// Applies one input buffer: reserves it in the build watermark, routes
    /// its rows and reports it processed.
    ///
    /// A redelivered buffer is skipped without touching any slice. If
    /// routing fails the reservation is handed back so the buffer can be
    /// delivered again.
    pub(crate) fn ingest(
        &self,
        worker: WorkerThreadId,
        metadata: &BufferMetadata,
        times: &[i64],
        apply: impl FnMut(&Slice<S>, Range<usize>) -> Result<(), SliceStoreError>,
    ) -> crate::Result<()> {
        if !self
            .build_watermark
            .claim(metadata.origin_id, metadata.sequence)?
        {
            tracing::debug!(
                origin = %metadata.origin_id,
                sequence = %metadata.sequence,
                "skipping redelivered buffer"
            );
            return Ok(());
        }
        if let Err(e) = self.route(worker, times, apply) {
            self.build_watermark
                .release(metadata.origin_id, metadata.sequence);
            return Err(e.into());
        }
        self.advance_build(metadata)?;
        Ok(())
    }

    /// Routes the rows of one buffer to their slices.
    ///
    /// `times` holds one event time per row. Consecutive rows of the same
    /// slice are handed to `apply` as one range. Rows below the build
    /// watermark, or whose slice stopped filling, are dropped and counted.
    fn route(
        &self,
        worker: WorkerThreadId,
        times: &[i64],
        mut apply: impl FnMut(&Slice<S>, Range<usize>) -> Result<(), SliceStoreError>,
    ) -> Result<(), SliceStoreError> {
        let watermark = self.build_watermark.current();
        let assigner = self.store.assigner();
        let mut late = 0u64;
        let mut row = 0;
        while row < times.len() {
            let ts = times[row];
            if watermark.is_late(ts) {
                tracing::trace!(ts, watermark = watermark.timestamp(), "dropping late record");
                late += 1;
                row += 1;
                continue;
            }
            let (start, end) = assigner.slice_bounds(ts);
            let floor = start.max(watermark.timestamp());
            let run_end = times[row..]
                .iter()
                .position(|t| *t < floor || *t >= end)
                .map_or(times.len(), |offset| row + offset);

            let result = self
                .slice_for(worker, ts, watermark)
                .and_then(|slice| apply(slice.as_ref(), row..run_end));
            match result {
                Ok(()) => {}
                Err(e) if e.is_late() => {
                    tracing::trace!(ts, rows = run_end - row, error = %e, "dropping late records");
                    late += (run_end - row) as u64;
                }
                Err(e) => return Err(e),
            }
            row = run_end;
        }

        self.counters
            .records
            .fetch_add(times.len() as u64, Ordering::Relaxed);
        if late > 0 {
            self.counters.late.fetch_add(late, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Marks the input buffer as processed in the build watermark.
    fn advance_build(&self, metadata: &BufferMetadata) -> crate::Result<Watermark> {
        Ok(self.build_watermark.update(
            metadata.origin_id,
            metadata.sequence,
            metadata.watermark_ts,
        )?)
    }

    /// Hands out windows the build watermark made final.
    pub(crate) fn ready_windows(&self) -> Vec<TriggeredWindow<S>> {
        let windows = self.store.trigger_ready_windows(self.build_watermark.current());
        self.note_triggered(windows.len());
        windows
    }

    /// Terminates one build side in the store.
    pub(crate) fn terminate(&self) -> Vec<TriggeredWindow<S>> {
        let windows = self.store.on_termination();
        self.note_triggered(windows.len());
        windows
    }

    fn note_triggered(&self, windows: usize) {
        if windows > 0 {
            self.counters
                .windows
                .fetch_add(windows as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_probe(&self, probed: u64, pruned: u64) {
        self.counters
            .buckets_probed
            .fetch_add(probed, Ordering::Relaxed);
        self.counters
            .buckets_pruned
            .fetch_add(pruned, Ordering::Relaxed);
    }

    /// Finalizes triggered windows one at a time and queues the results.
    ///
    /// A window whose finalization fails is counted and logged; every other
    /// window is still queued and emitted in order, then the first failure
    /// is returned.
    pub(crate) fn finalize_and_emit(
        &self,
        ctx: &dyn PipelineContext,
        windows: &[TriggeredWindow<S>],
        mut finalize: impl FnMut(&TriggeredWindow<S>) -> crate::Result<RecordBatch>,
    ) -> crate::Result<usize> {
        let mut results = Vec::with_capacity(windows.len());
        let mut failure = None;
        for triggered in windows {
            match finalize(triggered) {
                Ok(batch) => results.push((triggered.window, batch)),
                Err(e) => {
                    tracing::error!(window = %triggered.window, error = %e, "failed to finalize window");
                    self.counters.failed_windows.fetch_add(1, Ordering::Relaxed);
                    failure.get_or_insert(e);
                }
            }
        }
        let emitted = self.emit(ctx, results);
        match failure {
            Some(e) => Err(e),
            None => Ok(emitted?),
        }
    }

    /// Queues finalized windows and emits as many queued windows as the
    /// buffer provider allows, oldest first.
    ///
    /// Returns the number of windows emitted.
    fn emit(
        &self,
        ctx: &dyn PipelineContext,
        results: Vec<(WindowInfo, RecordBatch)>,
    ) -> Result<usize, HandlerError> {
        let mut pending = self.pending.lock();
        pending.extend(
            results
                .into_iter()
                .map(|(window, batch)| PendingWindow { window, batch }),
        );
        self.drain(ctx, &mut pending)
    }

    fn drain(
        &self,
        ctx: &dyn PipelineContext,
        pending: &mut VecDeque<PendingWindow>,
    ) -> Result<usize, HandlerError> {
        let provider = ctx.buffer_provider();
        let mut emitted = 0;
        while let Some(next) = pending.front() {
            let chunks = chunk_batch(&next.batch, provider.buffer_capacity());
            let mut leases = Vec::with_capacity(chunks.len());
            for _ in 0..chunks.len() {
                let Some(lease) = provider.try_allocate() else {
                    let available = leases.len();
                    tracing::warn!(
                        window = %next.window,
                        required = chunks.len(),
                        available,
                        queued = pending.len(),
                        "output buffers exhausted, window held for retry"
                    );
                    return Err(HandlerError::AllocationFailure {
                        window: next.window,
                        required: chunks.len(),
                        available,
                    });
                };
                leases.push(lease);
            }

            let window = next.window;
            pending.pop_front();
            let sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            let count = chunks.len() as u64;
            let creation_ts = now_millis();
            for ((chunk, lease), number) in chunks.into_iter().zip(leases).zip(1..) {
                let metadata = BufferMetadata {
                    watermark_ts: window.start,
                    sequence: SequenceData::new(sequence_number, number, number == count),
                    origin_id: self.config.output_origin,
                    creation_ts,
                };
                ctx.emit_buffer(TupleBuffer::with_lease(metadata, chunk, lease));
            }
            self.counters.buffers.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(%window, sequence_number, chunks = count, "emitted window");
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Emits queued windows.
    pub(crate) fn retry_pending(&self, ctx: &dyn PipelineContext) -> Result<usize, HandlerError> {
        let mut pending = self.pending.lock();
        self.drain(ctx, &mut pending)
    }

    /// Confirms an output buffer and frees state it made obsolete.
    pub(crate) fn output_processed(&self, metadata: &BufferMetadata) -> crate::Result<usize> {
        let watermark = self.probe_watermark.update(
            metadata.origin_id,
            metadata.sequence,
            metadata.watermark_ts,
        )?;
        let freed = self.store.garbage_collect(watermark);
        if freed > 0 {
            self.counters
                .slices_freed
                .fetch_add(freed as u64, Ordering::Relaxed);
        }
        Ok(freed)
    }

    /// Drops all remaining slice state after the last side stopped.
    pub(crate) fn release_state(&self) {
        let live = self.store.num_slices();
        self.store.delete_state();
        self.counters
            .slices_freed
            .fetch_add(live as u64, Ordering::Relaxed);
        if let Some(caches) = self.caches.get() {
            for cache in caches.iter() {
                cache.lock().clear();
            }
        }
    }

    pub(crate) fn metrics(&self) -> HandlerMetrics {
        let cache = self
            .caches
            .get()
            .map(|caches| {
                caches.iter().fold(CacheStats::default(), |acc, c| {
                    let stats = c.lock().stats();
                    CacheStats {
                        hits: acc.hits + stats.hits,
                        misses: acc.misses + stats.misses,
                    }
                })
            })
            .unwrap_or_default();
        HandlerMetrics {
            records_processed: self.counters.records.load(Ordering::Relaxed),
            late_records: self.counters.late.load(Ordering::Relaxed),
            windows_triggered: self.counters.windows.load(Ordering::Relaxed),
            failed_windows: self.counters.failed_windows.load(Ordering::Relaxed),
            buffers_emitted: self.counters.buffers.load(Ordering::Relaxed),
            pending_emissions: self.pending.lock().len(),
            slices_freed: self.counters.slices_freed.load(Ordering::Relaxed),
            active_slices: self.store.num_slices(),
            build_watermark: self.build_watermark.current().timestamp(),
            probe_watermark: self.probe_watermark.current().timestamp(),
            watermark_stalled: self.build_watermark.is_stalled(),
            duplicate_buffers: self.build_watermark.metrics().duplicates,
            cache,
            buckets_probed: self.counters.buckets_probed.load(Ordering::Relaxed),
            buckets_pruned: self.counters.buckets_pruned.load(Ordering::Relaxed),
        }
    }
}
