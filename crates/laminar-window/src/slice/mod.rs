//! # Slices
//!
//! A slice is the smallest time-bounded unit of windowed state. Windows of
//! size `size` sliding by `slide` are cut into slices of width
//! `gcd(size, slide)`, so every window is a contiguous run of slices and every
//! record updates exactly one slice.
//!
//! Each slice holds one state block per worker thread. Workers only touch
//! their own block while the slice is [`SliceLifecycle::Filling`]. Once the
//! slice leaves that state it is read-only: the blocks are taken out exactly
//! once and sealed into the slice's immutable form.
//!
//! ```text
//! size=10, slide=5 → width 5
//!
//! slices:   [0,5) [5,10) [10,15) [15,20)
//! windows:  [0,10)        [10,20)
//!                 [5,15)
//! ```

mod cache;
mod store;

pub use cache::{CachePolicy, CacheStats, SliceCache};
pub use store::{SliceStore, TriggeredWindow};

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Opaque handle of a slice inside its [`SliceStore`].
///
/// Handles are never reused: a handle whose slice was freed resolves to
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceId(pub(crate) u64);

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slice-{}", self.0)
    }
}

/// Index of a worker thread, in `0..number_of_worker_threads`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerThreadId(pub usize);

/// A window's time range `[start, end)`.
///
/// Windows order by end, then start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowInfo {
    /// Inclusive start
    pub start: i64,
    /// Exclusive end
    pub end: i64,
}

impl WindowInfo {
    /// Creates a window range.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Returns `true` if `ts` falls into the window.
    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl Ord for WindowInfo {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.end
            .cmp(&other.end)
            .then_with(|| self.start.cmp(&other.start))
    }
}

impl PartialOrd for WindowInfo {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Maps timestamps to slices and slices to the windows containing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size_ms: i64,
    slide_ms: i64,
    width_ms: i64,
}

impl SliceAssigner {
    /// Creates an assigner for windows of `size_ms` sliding by `slide_ms`.
    ///
    /// # Panics
    ///
    /// Panics if size or slide is not positive, or if slide > size.
    #[must_use]
    pub fn new(size_ms: i64, slide_ms: i64) -> Self {
        assert!(size_ms > 0, "Window size must be positive");
        assert!(slide_ms > 0, "Slide interval must be positive");
        assert!(slide_ms <= size_ms, "Slide must not exceed size");
        Self {
            size_ms,
            slide_ms,
            width_ms: gcd(size_ms, slide_ms),
        }
    }

    /// Window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Window slide in milliseconds.
    #[must_use]
    pub fn slide_ms(&self) -> i64 {
        self.slide_ms
    }

    /// Slice width in milliseconds.
    #[must_use]
    pub fn width_ms(&self) -> i64 {
        self.width_ms
    }

    /// Returns `(start, end)` of the slice containing `ts`.
    ///
    /// Negative timestamps floor towards negative infinity.
    #[inline]
    #[must_use]
    pub fn slice_bounds(&self, ts: i64) -> (i64, i64) {
        let start = ts.div_euclid(self.width_ms) * self.width_ms;
        (start, start + self.width_ms)
    }

    /// Returns every window containing the slice `[start, end)`, in
    /// increasing order.
    #[must_use]
    pub fn windows_of_slice(&self, start: i64, end: i64) -> SmallVec<[WindowInfo; 4]> {
        let mut windows = SmallVec::new();
        let mut window_start = start.div_euclid(self.slide_ms) * self.slide_ms;
        while window_start + self.size_ms >= end {
            windows.push(WindowInfo::new(window_start, window_start + self.size_ms));
            window_start -= self.slide_ms;
        }
        windows.reverse();
        windows
    }

    /// Returns every window containing `ts`, in increasing order.
    #[must_use]
    pub fn windows_of(&self, ts: i64) -> SmallVec<[WindowInfo; 4]> {
        let (start, end) = self.slice_bounds(ts);
        self.windows_of_slice(start, end)
    }
}

/// Lifecycle of a slice or window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceLifecycle {
    /// Accepting updates from worker threads
    Filling = 0,
    /// Closed by termination, waiting for every build side to terminate
    WaitingOnTermination = 1,
    /// Finalized and handed to the probe/emission path; read-only
    EmittedToProbe = 2,
}

impl SliceLifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SliceLifecycle::Filling,
            1 => SliceLifecycle::WaitingOnTermination,
            _ => SliceLifecycle::EmittedToProbe,
        }
    }
}

/// Lock-free lifecycle cell.
#[derive(Debug)]
pub(crate) struct AtomicLifecycle(AtomicU8);

impl AtomicLifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SliceLifecycle::Filling as u8))
    }

    pub(crate) fn load(&self) -> SliceLifecycle {
        SliceLifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from` → `to`; only one caller wins.
    pub(crate) fn transition(&self, from: SliceLifecycle, to: SliceLifecycle) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves any non-emitted state to `EmittedToProbe`. Returns `true` for
    /// the caller that performed the transition.
    pub(crate) fn emit(&self) -> bool {
        self.transition(SliceLifecycle::Filling, SliceLifecycle::EmittedToProbe)
            || self.transition(
                SliceLifecycle::WaitingOnTermination,
                SliceLifecycle::EmittedToProbe,
            )
    }
}

/// Per-worker state kept inside a slice.
pub trait SliceState: Default + Send + 'static {
    /// Immutable form of the merged worker blocks.
    type Sealed: Send + Sync + 'static;
}

/// Errors raised by slices and the slice store.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SliceStoreError {
    /// Record below the watermark
    #[error("Late arrival: ts={timestamp} < watermark={watermark}")]
    LateArrival {
        /// Record timestamp
        timestamp: i64,
        /// Watermark at the time of the request
        watermark: i64,
    },

    /// Slice no longer accepts updates
    #[error("Slice [{start}, {end}) is {state:?}")]
    NotFilling {
        /// Slice start
        start: i64,
        /// Slice end
        end: i64,
        /// Current lifecycle
        state: SliceLifecycle,
    },

    /// Store was terminated by every build side
    #[error("Slice store terminated")]
    Terminated,

    /// Worker index outside the configured pool
    #[error("Worker {worker} out of range (pool has {workers} workers)")]
    InvalidWorker {
        /// Requested worker
        worker: usize,
        /// Pool size
        workers: usize,
    },
}

impl SliceStoreError {
    /// Returns `true` for errors that mean "record is too late".
    #[must_use]
    pub fn is_late(&self) -> bool {
        matches!(
            self,
            SliceStoreError::LateArrival { .. } | SliceStoreError::NotFilling { .. }
        )
    }
}

/// A slice: per-worker state for `[start, end)`.
pub struct Slice<S: SliceState> {
    id: SliceId,
    start: i64,
    end: i64,
    lifecycle: AtomicLifecycle,
    blocks: Box<[Mutex<Option<S>>]>,
    sealed: OnceLock<S::Sealed>,
}

impl<S: SliceState> fmt::Debug for Slice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("lifecycle", &self.lifecycle.load())
            .field("sealed", &self.sealed.get().is_some())
            .finish_non_exhaustive()
    }
}

impl<S: SliceState> Slice<S> {
    pub(crate) fn new(id: SliceId, start: i64, end: i64, workers: usize) -> Self {
        Self {
            id,
            start,
            end,
            lifecycle: AtomicLifecycle::new(),
            blocks: (0..workers).map(|_| Mutex::new(None)).collect(),
            sealed: OnceLock::new(),
        }
    }

    /// Handle of this slice.
    #[must_use]
    pub fn id(&self) -> SliceId {
        self.id
    }

    /// Inclusive start.
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> SliceLifecycle {
        self.lifecycle.load()
    }

    pub(crate) fn lifecycle_cell(&self) -> &AtomicLifecycle {
        &self.lifecycle
    }

    /// Applies `f` to the calling worker's block.
    ///
    /// The lifecycle is checked while holding the block, so an update either
    /// lands before the slice is sealed or is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`SliceStoreError::NotFilling`] once the slice stopped
    /// accepting updates, and [`SliceStoreError::InvalidWorker`] for an
    /// out-of-range worker.
    pub fn update<R>(
        &self,
        worker: WorkerThreadId,
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R, SliceStoreError> {
        let block = self
            .blocks
            .get(worker.0)
            .ok_or(SliceStoreError::InvalidWorker {
                worker: worker.0,
                workers: self.blocks.len(),
            })?;
        let mut guard = block.lock();
        let state = self.lifecycle.load();
        if state != SliceLifecycle::Filling {
            return Err(SliceStoreError::NotFilling {
                start: self.start,
                end: self.end,
                state,
            });
        }
        Ok(f(guard.get_or_insert_with(S::default)))
    }

    /// Seals the slice on first call and returns the sealed state.
    ///
    /// Every worker block is taken out of the slice and handed to `seal`.
    /// Later calls return the same sealed state without invoking `seal`.
    pub fn seal_with(&self, seal: impl FnOnce(Vec<S>) -> S::Sealed) -> &S::Sealed {
        debug_assert_ne!(
            self.lifecycle.load(),
            SliceLifecycle::Filling,
            "sealing a slice that still accepts updates"
        );
        self.sealed.get_or_init(|| {
            let blocks = self
                .blocks
                .iter()
                .filter_map(|block| block.lock().take())
                .collect();
            seal(blocks)
        })
    }

    /// Returns the sealed state, if the slice was sealed.
    #[must_use]
    pub fn sealed(&self) -> Option<&S::Sealed> {
        self.sealed.get()
    }
}
