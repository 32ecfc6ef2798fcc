//! Tuple buffers and the execution context handlers run in.
//!
//! Input and output of every handler is a [`TupleBuffer`]: an Arrow
//! `RecordBatch` plus [`BufferMetadata`] describing where in its origin's
//! stream the buffer sits. Output buffers are backed by a [`BufferLease`]
//! from the context's [`BufferProvider`]; the lease returns to its pool when
//! the buffer is dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::time::{OriginId, SequenceData};

/// Metadata attached to every buffer crossing an operator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMetadata {
    /// Watermark carried by the buffer
    pub watermark_ts: i64,
    /// Position in the origin's stream
    pub sequence: SequenceData,
    /// Producer of the buffer
    pub origin_id: OriginId,
    /// Wall-clock creation time in milliseconds, used for ingestion time
    pub creation_ts: i64,
}

impl BufferMetadata {
    /// Metadata for an unchunked buffer.
    #[must_use]
    pub fn new(origin_id: OriginId, sequence_number: u64, watermark_ts: i64) -> Self {
        Self {
            watermark_ts,
            sequence: SequenceData::single(sequence_number),
            origin_id,
            creation_ts: crate::time::now_millis(),
        }
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub fn with_creation_ts(mut self, creation_ts: i64) -> Self {
        self.creation_ts = creation_ts;
        self
    }
}

/// A batch of records with its metadata.
#[derive(Debug)]
pub struct TupleBuffer {
    /// Buffer metadata
    pub metadata: BufferMetadata,
    /// Records
    pub batch: RecordBatch,
    lease: Option<BufferLease>,
}

impl TupleBuffer {
    /// Wraps an input batch. Input buffers hold no lease.
    #[must_use]
    pub fn new(metadata: BufferMetadata, batch: RecordBatch) -> Self {
        Self {
            metadata,
            batch,
            lease: None,
        }
    }

    /// Wraps a batch backed by a provider lease.
    #[must_use]
    pub fn with_lease(metadata: BufferMetadata, batch: RecordBatch, lease: BufferLease) -> Self {
        Self {
            metadata,
            batch,
            lease: Some(lease),
        }
    }

    /// Returns the number of records.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Returns `true` if the buffer occupies a provider slot.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }
}

#[derive(Debug)]
struct PoolShared {
    available: AtomicUsize,
    allocations: AtomicU64,
    failures: AtomicU64,
}

/// One slot of a [`FixedBufferPool`], returned to the pool on drop.
#[derive(Debug)]
pub struct BufferLease {
    pool: Arc<PoolShared>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.available.fetch_add(1, Ordering::AcqRel);
    }
}

/// Allocates output buffers.
pub trait BufferProvider: Send + Sync {
    /// Maximum number of records one buffer holds.
    fn buffer_capacity(&self) -> usize;

    /// Takes one buffer slot, or `None` when the provider is exhausted.
    fn try_allocate(&self) -> Option<BufferLease>;

    /// Number of slots currently free.
    fn available(&self) -> usize;
}

/// Fixed number of buffer slots shared across threads.
///
/// # Example
///
/// ```
/// use laminar_window::buffer::{BufferProvider, FixedBufferPool};
///
/// let pool = FixedBufferPool::new(2, 1024);
/// let a = pool.try_allocate().unwrap();
/// let _b = pool.try_allocate().unwrap();
/// assert!(pool.try_allocate().is_none());
///
/// drop(a);
/// assert_eq!(pool.available(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct FixedBufferPool {
    shared: Arc<PoolShared>,
    capacity_rows: usize,
    num_buffers: usize,
}

impl FixedBufferPool {
    /// Creates a pool of `num_buffers` buffers holding `capacity_rows` records each.
    #[must_use]
    pub fn new(num_buffers: usize, capacity_rows: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                available: AtomicUsize::new(num_buffers),
                allocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            capacity_rows: capacity_rows.max(1),
            num_buffers,
        }
    }

    /// Total number of buffers.
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Number of successful allocations.
    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.shared.allocations.load(Ordering::Relaxed)
    }

    /// Number of allocation attempts that found the pool empty.
    #[must_use]
    pub fn failed_allocations(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }
}

impl BufferProvider for FixedBufferPool {
    fn buffer_capacity(&self) -> usize {
        self.capacity_rows
    }

    fn try_allocate(&self) -> Option<BufferLease> {
        let taken = self
            .shared
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if taken.is_ok() {
            self.shared.allocations.fetch_add(1, Ordering::Relaxed);
            Some(BufferLease {
                pool: Arc::clone(&self.shared),
            })
        } else {
            self.shared.failures.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn available(&self) -> usize {
        self.shared.available.load(Ordering::Acquire)
    }
}

/// The execution context a handler runs in.
pub trait PipelineContext: Send + Sync {
    /// Number of worker threads that may call into the handler.
    fn number_of_worker_threads(&self) -> usize;

    /// Provider of output buffers.
    fn buffer_provider(&self) -> &dyn BufferProvider;

    /// Hands an output buffer to the downstream operator.
    fn emit_buffer(&self, buffer: TupleBuffer);
}

/// In-process context that collects emitted buffers.
///
/// Used when the handler is embedded directly, and by tests.
pub struct LocalPipelineContext {
    workers: usize,
    provider: Arc<dyn BufferProvider>,
    emitted: Mutex<Vec<TupleBuffer>>,
}

impl LocalPipelineContext {
    /// Creates a context with `workers` threads and the given provider.
    #[must_use]
    pub fn new(workers: usize, provider: Arc<dyn BufferProvider>) -> Self {
        Self {
            workers,
            provider,
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Removes and returns every buffer emitted so far.
    pub fn take_emitted(&self) -> Vec<TupleBuffer> {
        std::mem::take(&mut *self.emitted.lock())
    }

    /// Number of buffers emitted and not yet taken.
    #[must_use]
    pub fn emitted_count(&self) -> usize {
        self.emitted.lock().len()
    }
}

impl PipelineContext for LocalPipelineContext {
    fn number_of_worker_threads(&self) -> usize {
        self.workers
    }

    fn buffer_provider(&self) -> &dyn BufferProvider {
        self.provider.as_ref()
    }

    fn emit_buffer(&self, buffer: TupleBuffer) {
        self.emitted.lock().push(buffer);
    }
}

/// Splits `batch` into chunks of at most `capacity` rows.
///
/// Always returns at least one chunk; an empty batch yields one empty chunk
/// so that a window without results still carries progress downstream.
#[must_use]
pub fn chunk_batch(batch: &RecordBatch, capacity: usize) -> Vec<RecordBatch> {
    let capacity = capacity.max(1);
    let rows = batch.num_rows();
    if rows <= capacity {
        return vec![batch.clone()];
    }
    (0..rows)
        .step_by(capacity)
        .map(|offset| batch.slice(offset, capacity.min(rows - offset)))
        .collect()
}
