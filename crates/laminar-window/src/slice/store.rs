//! The slice store: owner of every live slice of one operator.
//!
//! The store keeps three indexes behind one `RwLock`: slices by start, slices
//! by handle, and windows by `(end, start)`. Lookups of existing slices take
//! the read lock; creation takes the write lock and re-checks, so at most one
//! slice exists per range. Window triggering runs under the read lock and is
//! decided per window by a compare-and-swap on the window's lifecycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::{
    AtomicLifecycle, Slice, SliceAssigner, SliceId, SliceLifecycle, SliceState, SliceStoreError,
    WindowInfo,
};
use crate::time::Watermark;

/// A window handed to exactly one caller for finalization.
#[derive(Debug)]
pub struct TriggeredWindow<S: SliceState> {
    /// Window range
    pub window: WindowInfo,
    /// Slices of the window, ordered by start; all `EmittedToProbe`
    pub slices: Vec<Arc<Slice<S>>>,
}

#[derive(Debug)]
struct WindowSlot {
    slices: SmallVec<[SliceId; 4]>,
    lifecycle: AtomicLifecycle,
}

struct StoreIndex<S: SliceState> {
    by_start: BTreeMap<i64, SliceId>,
    slices: FxHashMap<SliceId, Arc<Slice<S>>>,
    windows: BTreeMap<WindowInfo, WindowSlot>,
}

impl<S: SliceState> Default for StoreIndex<S> {
    fn default() -> Self {
        Self {
            by_start: BTreeMap::new(),
            slices: FxHashMap::default(),
            windows: BTreeMap::new(),
        }
    }
}

/// Owns the slices and windows of one window operator.
pub struct SliceStore<S: SliceState> {
    assigner: SliceAssigner,
    workers: usize,
    build_sides: usize,
    allowed_lateness_ms: i64,
    next_id: AtomicU64,
    triggered_watermark: AtomicI64,
    terminated_sides: AtomicUsize,
    slices_created: AtomicU64,
    slices_freed: AtomicU64,
    index: RwLock<StoreIndex<S>>,
}

impl<S: SliceState> std::fmt::Debug for SliceStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceStore")
            .field("assigner", &self.assigner)
            .field("workers", &self.workers)
            .field("build_sides", &self.build_sides)
            .field("num_slices", &self.num_slices())
            .field("num_windows", &self.num_windows())
            .finish_non_exhaustive()
    }
}

impl<S: SliceState> SliceStore<S> {
    /// Creates an empty store.
    ///
    /// `build_sides` is the number of inputs that must terminate before
    /// termination finalizes the remaining windows: 1 for aggregations, 2 for
    /// joins.
    #[must_use]
    pub fn new(
        assigner: SliceAssigner,
        workers: usize,
        build_sides: usize,
        allowed_lateness_ms: i64,
    ) -> Self {
        Self {
            assigner,
            workers,
            build_sides: build_sides.max(1),
            allowed_lateness_ms,
            next_id: AtomicU64::new(1),
            triggered_watermark: AtomicI64::new(i64::MIN),
            terminated_sides: AtomicUsize::new(0),
            slices_created: AtomicU64::new(0),
            slices_freed: AtomicU64::new(0),
            index: RwLock::new(StoreIndex::default()),
        }
    }

    /// The slice assigner of this store.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Returns the slice covering `ts`, creating it when absent.
    ///
    /// A new slice is registered in every window containing it.
    ///
    /// # Errors
    ///
    /// Returns [`SliceStoreError::LateArrival`] when `ts` is below `watermark`
    /// or below any watermark windows were already triggered at, and
    /// [`SliceStoreError::Terminated`] once every build side terminated.
    pub fn get_or_create_slice(
        &self,
        ts: i64,
        watermark: Watermark,
    ) -> Result<Arc<Slice<S>>, SliceStoreError> {
        let floor = watermark
            .timestamp()
            .max(self.triggered_watermark.load(Ordering::Acquire));
        if ts < floor {
            return Err(SliceStoreError::LateArrival {
                timestamp: ts,
                watermark: floor,
            });
        }
        if self.is_terminated() {
            return Err(SliceStoreError::Terminated);
        }

        let (start, end) = self.assigner.slice_bounds(ts);
        {
            let index = self.index.read();
            if let Some(slice) = index.by_start.get(&start).and_then(|id| index.slices.get(id)) {
                return Ok(Arc::clone(slice));
            }
        }

        let mut index = self.index.write();
        if let Some(slice) = index.by_start.get(&start).and_then(|id| index.slices.get(id)) {
            return Ok(Arc::clone(slice));
        }
        // on_termination sweeps under the index lock; a slice inserted after
        // the last side terminated would never leave Filling
        if self.is_terminated() {
            return Err(SliceStoreError::Terminated);
        }

        let triggered = self.triggered_watermark.load(Ordering::Acquire);
        let windows = self.assigner.windows_of_slice(start, end);
        let closed = windows.iter().any(|w| {
            index
                .windows
                .get(w)
                .is_some_and(|slot| slot.lifecycle.load() != SliceLifecycle::Filling)
        });
        if ts < triggered || closed {
            return Err(SliceStoreError::LateArrival {
                timestamp: ts,
                watermark: triggered.max(watermark.timestamp()),
            });
        }

        let id = SliceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slice = Arc::new(Slice::new(id, start, end, self.workers));
        for window in windows {
            index
                .windows
                .entry(window)
                .or_insert_with(|| WindowSlot {
                    slices: SmallVec::new(),
                    lifecycle: AtomicLifecycle::new(),
                })
                .slices
                .push(id);
        }
        index.by_start.insert(start, id);
        index.slices.insert(id, Arc::clone(&slice));
        self.slices_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%id, start, end, "created slice");
        Ok(slice)
    }

    /// Returns the slice behind `id`, or `None` once it was freed.
    #[must_use]
    pub fn slice(&self, id: SliceId) -> Option<Arc<Slice<S>>> {
        self.index.read().slices.get(&id).cloned()
    }

    /// Hands out every window that became final.
    ///
    /// A window is final when its end is at or below `watermark`, or when it
    /// is waiting on termination and every build side terminated. Windows are
    /// returned in increasing end order. Each window is returned to exactly
    /// one caller; concurrent callers receive disjoint sets.
    pub fn trigger_ready_windows(&self, watermark: Watermark) -> Vec<TriggeredWindow<S>> {
        let wm = watermark.timestamp();
        self.triggered_watermark.fetch_max(wm, Ordering::AcqRel);
        let terminated = self.is_terminated();

        let index = self.index.read();
        let mut triggered = Vec::new();
        for (window, slot) in &index.windows {
            let due = window.end <= wm;
            if !due && !terminated {
                break;
            }
            if !due && slot.lifecycle.load() != SliceLifecycle::WaitingOnTermination {
                continue;
            }
            if slot.lifecycle.emit() {
                triggered.push(Self::collect_window(&index, *window, slot));
            }
        }
        drop(index);

        if !triggered.is_empty() {
            tracing::debug!(
                watermark = wm,
                windows = triggered.len(),
                "triggered windows"
            );
        }
        triggered
    }

    fn collect_window(index: &StoreIndex<S>, window: WindowInfo, slot: &WindowSlot) -> TriggeredWindow<S> {
        let mut slices: Vec<_> = slot
            .slices
            .iter()
            .filter_map(|id| index.slices.get(id))
            .map(|slice| {
                slice.lifecycle_cell().emit();
                Arc::clone(slice)
            })
            .collect();
        slices.sort_by_key(|slice| slice.start());
        debug_assert_eq!(slices.len(), slot.slices.len(), "window references a freed slice");
        TriggeredWindow { window, slices }
    }

    /// Signals that one build side terminated.
    ///
    /// Once every build side terminated, all still-filling windows and slices
    /// move to `WaitingOnTermination` and then to `EmittedToProbe`; the
    /// windows this call moved are returned for emission in increasing end
    /// order. Calls before the last side terminated return nothing.
    pub fn on_termination(&self) -> Vec<TriggeredWindow<S>> {
        let sides = self.terminated_sides.fetch_add(1, Ordering::AcqRel) + 1;
        if sides < self.build_sides {
            tracing::debug!(
                terminated = sides,
                build_sides = self.build_sides,
                "build side terminated, waiting for others"
            );
            return Vec::new();
        }

        let index = self.index.read();
        for slot in index.windows.values() {
            slot.lifecycle.transition(
                SliceLifecycle::Filling,
                SliceLifecycle::WaitingOnTermination,
            );
        }
        for slice in index.slices.values() {
            slice.lifecycle_cell().transition(
                SliceLifecycle::Filling,
                SliceLifecycle::WaitingOnTermination,
            );
        }

        let mut triggered = Vec::new();
        for (window, slot) in &index.windows {
            if slot.lifecycle.transition(
                SliceLifecycle::WaitingOnTermination,
                SliceLifecycle::EmittedToProbe,
            ) {
                triggered.push(Self::collect_window(&index, *window, slot));
            }
        }
        tracing::debug!(windows = triggered.len(), "finalized windows on termination");
        triggered
    }

    /// Returns `true` once every build side terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated_sides.load(Ordering::Acquire) >= self.build_sides
    }

    /// Frees state the consumer confirmed.
    ///
    /// Drops every emitted window with `end + allowed_lateness <= watermark`,
    /// then every emitted slice no remaining window references. Returns the
    /// number of freed slices.
    pub fn garbage_collect(&self, watermark: Watermark) -> usize {
        let wm = watermark.timestamp();
        let lateness = self.allowed_lateness_ms;

        let mut guard = self.index.write();
        let StoreIndex {
            by_start,
            slices,
            windows,
        } = &mut *guard;

        let windows_before = windows.len();
        windows.retain(|window, slot| {
            slot.lifecycle.load() != SliceLifecycle::EmittedToProbe
                || window.end.saturating_add(lateness) > wm
        });
        if windows.len() == windows_before {
            return 0;
        }

        let referenced: FxHashSet<SliceId> = windows
            .values()
            .flat_map(|slot| slot.slices.iter().copied())
            .collect();
        let slices_before = slices.len();
        slices.retain(|id, slice| {
            referenced.contains(id) || slice.lifecycle() != SliceLifecycle::EmittedToProbe
        });
        by_start.retain(|_, id| slices.contains_key(id));
        let freed = slices_before - slices.len();
        drop(guard);

        self.slices_freed.fetch_add(freed as u64, Ordering::Relaxed);
        tracing::debug!(
            watermark = wm,
            windows = windows_before,
            freed,
            "garbage collected slices"
        );
        freed
    }

    /// Drops all state regardless of lifecycle.
    pub fn delete_state(&self) {
        let mut index = self.index.write();
        let freed = index.slices.len();
        *index = StoreIndex::default();
        self.slices_freed.fetch_add(freed as u64, Ordering::Relaxed);
    }

    /// Number of live slices.
    #[must_use]
    pub fn num_slices(&self) -> usize {
        self.index.read().slices.len()
    }

    /// Number of tracked windows.
    #[must_use]
    pub fn num_windows(&self) -> usize {
        self.index.read().windows.len()
    }

    /// Windows not yet handed out, in increasing end order.
    #[must_use]
    pub fn non_triggered_windows(&self) -> Vec<WindowInfo> {
        self.index
            .read()
            .windows
            .iter()
            .filter(|(_, slot)| slot.lifecycle.load() != SliceLifecycle::EmittedToProbe)
            .map(|(window, _)| *window)
            .collect()
    }

    /// Total slices created and freed over the store's lifetime.
    #[must_use]
    pub fn slice_counts(&self) -> (u64, u64) {
        (
            self.slices_created.load(Ordering::Relaxed),
            self.slices_freed.load(Ordering::Relaxed),
        )
    }
}
