//! Multi-origin watermark processing.
//!
//! Every upstream origin stamps its buffers with a [`SequenceData`]. Buffers
//! may be processed by different worker threads, so their watermark updates
//! arrive in any order. An origin's watermark only moves over the gap-free
//! prefix of completed sequence numbers; the processor's value is the minimum
//! over all origins and never decreases.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::Watermark;

/// Identifies one upstream producer feeding an operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OriginId(pub u64);

impl From<u64> for OriginId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// Position of a buffer in its origin's stream.
///
/// Sequence numbers start at 1. A logical buffer that was split into chunks
/// repeats its sequence number with chunk numbers `1..=n`, the last chunk
/// carrying `last_chunk = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceData {
    /// Per-origin sequence number, starting at 1
    pub sequence_number: u64,
    /// Chunk number within the sequence number, starting at 1
    pub chunk_number: u64,
    /// Whether this is the final chunk of the sequence number
    pub last_chunk: bool,
}

impl SequenceData {
    /// Creates sequence data for one chunk.
    #[must_use]
    pub fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Sequence data for an unchunked buffer.
    #[must_use]
    pub fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, 1, true)
    }
}

impl fmt::Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} chunk={}{}",
            self.sequence_number,
            self.chunk_number,
            if self.last_chunk { " (last)" } else { "" }
        )
    }
}

/// Errors that can occur when updating a watermark processor.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    /// Update for an origin this processor was not created with
    #[error("Unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// Sequence or chunk number zero
    #[error("Invalid sequence data: {0}")]
    InvalidSequence(SequenceData),

    /// Claim beyond the out-of-order tolerance of an origin
    #[error("{origin} holds {pending} unfinished sequence numbers, seq={sequence} must wait")]
    BacklogFull {
        /// Origin of the rejected claim
        origin: OriginId,
        /// Rejected sequence number
        sequence: u64,
        /// Unfinished sequence numbers held for the origin
        pending: usize,
    },
}

/// Snapshot of watermark processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatermarkMetrics {
    /// Current global watermark
    pub current_watermark: i64,
    /// Accepted updates
    pub updates: u64,
    /// Redelivered sequence data ignored as no-ops
    pub duplicates: u64,
    /// Sequence numbers buffered behind a gap, over all origins
    pub pending_sequences: u64,
    /// Origins whose buffered backlog exceeds the out-of-order tolerance
    pub stalled_origins: u64,
}

#[derive(Debug, Default)]
struct PendingSequence {
    max_ts: i64,
    chunks: SmallVec<[u64; 4]>,
    /// Chunks reserved by a claim and not yet reported.
    claimed: SmallVec<[u64; 4]>,
    last_chunk: Option<u64>,
}

impl PendingSequence {
    fn is_complete(&self) -> bool {
        self.last_chunk
            .is_some_and(|last| self.chunks.len() as u64 == last)
    }
}

#[derive(Debug, Default)]
struct OriginState {
    applied_sequence: u64,
    applied_ts: i64,
    pending: BTreeMap<u64, PendingSequence>,
    stalled: bool,
}

#[derive(Debug)]
struct OriginSlot {
    state: Mutex<OriginState>,
    exposed: AtomicI64,
}

/// Merges per-origin, per-sequence progress into one monotonic watermark.
///
/// Safe to update concurrently from any thread. Updates for one origin are
/// serialized on that origin's lock; the global value is maintained with an
/// atomic `fetch_max`.
///
/// Buffers whose records change state go through [`Self::claim`] before
/// processing and [`Self::update`] after it. Claims make redelivery a no-op
/// and bound each origin to `max_out_of_order` unfinished sequence numbers
/// (gap-filling sequence numbers are always admitted). [`Self::update`] on
/// its own does not bound the backlog; it only raises the stalled flag.
#[derive(Debug)]
pub struct WatermarkProcessor {
    origins: FxHashMap<OriginId, OriginSlot>,
    global: AtomicI64,
    max_out_of_order: usize,
    updates: AtomicU64,
    duplicates: AtomicU64,
}

impl WatermarkProcessor {
    /// Creates a processor tracking the given origins.
    ///
    /// `max_out_of_order` bounds how many sequence numbers an origin may
    /// buffer behind a gap before it is reported as stalled.
    #[must_use]
    pub fn new(origins: &[OriginId], max_out_of_order: usize) -> Self {
        let origins = origins
            .iter()
            .map(|id| {
                let slot = OriginSlot {
                    state: Mutex::new(OriginState {
                        applied_ts: i64::MIN,
                        ..OriginState::default()
                    }),
                    exposed: AtomicI64::new(i64::MIN),
                };
                (*id, slot)
            })
            .collect();
        Self {
            origins,
            global: AtomicI64::new(i64::MIN),
            max_out_of_order,
            updates: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Reserves chunk `sequence` of `origin` for processing.
    ///
    /// Returns `Ok(false)` if the chunk was already reported or reserved; the
    /// caller must skip the buffer. A reserved chunk is completed with
    /// [`Self::update`] or handed back with [`Self::release`].
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] and
    /// [`WatermarkError::InvalidSequence`] as [`Self::update`] does, and
    /// [`WatermarkError::BacklogFull`] when the origin already holds
    /// `max_out_of_order` unfinished sequence numbers and `sequence` lies
    /// beyond all of them.
    pub fn claim(&self, origin: OriginId, sequence: SequenceData) -> Result<bool, WatermarkError> {
        if sequence.sequence_number == 0 || sequence.chunk_number == 0 {
            return Err(WatermarkError::InvalidSequence(sequence));
        }
        let slot = self
            .origins
            .get(&origin)
            .ok_or(WatermarkError::UnknownOrigin(origin))?;

        let seq = sequence.sequence_number;
        let chunk = sequence.chunk_number;
        let mut state = slot.state.lock();
        let duplicate = seq <= state.applied_sequence
            || match state.pending.get_mut(&seq) {
                Some(entry) if entry.chunks.contains(&chunk) || entry.claimed.contains(&chunk) => {
                    true
                }
                Some(entry) => {
                    entry.claimed.push(chunk);
                    return Ok(true);
                }
                None => false,
            };
        if duplicate {
            drop(state);
            self.record_duplicate(origin, sequence);
            return Ok(false);
        }

        let pending = state.pending.len();
        let beyond = state
            .pending
            .last_key_value()
            .is_some_and(|(last, _)| seq > *last);
        if pending >= self.max_out_of_order && beyond {
            tracing::debug!(%origin, seq, pending, "claim rejected, backlog full");
            return Err(WatermarkError::BacklogFull {
                origin,
                sequence: seq,
                pending,
            });
        }
        state.pending.entry(seq).or_default().claimed.push(chunk);
        Ok(true)
    }

    /// Hands back a chunk reserved by [`Self::claim`] that was not processed.
    pub fn release(&self, origin: OriginId, sequence: SequenceData) {
        let Some(slot) = self.origins.get(&origin) else {
            return;
        };
        let seq = sequence.sequence_number;
        let mut state = slot.state.lock();
        let Some(entry) = state.pending.get_mut(&seq) else {
            return;
        };
        entry.claimed.retain(|c| *c != sequence.chunk_number);
        if entry.claimed.is_empty() && entry.chunks.is_empty() {
            state.pending.remove(&seq);
        }
    }

    /// Records that the buffer `sequence` of `origin` with watermark `ts`
    /// has been fully processed, and returns the global watermark.
    ///
    /// Redelivered sequence data is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] for an origin the processor
    /// does not track, and [`WatermarkError::InvalidSequence`] for sequence or
    /// chunk number zero.
    pub fn update(
        &self,
        origin: OriginId,
        sequence: SequenceData,
        ts: i64,
    ) -> Result<Watermark, WatermarkError> {
        if sequence.sequence_number == 0 || sequence.chunk_number == 0 {
            return Err(WatermarkError::InvalidSequence(sequence));
        }
        let slot = self
            .origins
            .get(&origin)
            .ok_or(WatermarkError::UnknownOrigin(origin))?;

        {
            let mut state = slot.state.lock();
            if sequence.sequence_number <= state.applied_sequence {
                drop(state);
                return Ok(self.record_duplicate(origin, sequence));
            }

            let entry = state.pending.entry(sequence.sequence_number).or_default();
            if entry.chunks.contains(&sequence.chunk_number) {
                drop(state);
                return Ok(self.record_duplicate(origin, sequence));
            }
            if entry.chunks.is_empty() {
                entry.max_ts = ts;
            } else {
                entry.max_ts = entry.max_ts.max(ts);
            }
            entry.chunks.push(sequence.chunk_number);
            if sequence.last_chunk {
                entry.last_chunk = Some(sequence.chunk_number);
            }

            Self::apply_contiguous(&mut state);
            self.check_backlog(origin, &mut state);
            slot.exposed.store(state.applied_ts, Ordering::Release);
        }
        self.updates.fetch_add(1, Ordering::Relaxed);

        let min = self
            .origins
            .values()
            .map(|s| s.exposed.load(Ordering::Acquire))
            .min()
            .unwrap_or(i64::MIN);
        let previous = self.global.fetch_max(min, Ordering::AcqRel);
        Ok(Watermark(previous.max(min)))
    }

    fn apply_contiguous(state: &mut OriginState) {
        while let Some(entry) = state.pending.first_entry() {
            if *entry.key() != state.applied_sequence + 1 || !entry.get().is_complete() {
                break;
            }
            let done = entry.remove();
            state.applied_sequence += 1;
            state.applied_ts = state.applied_ts.max(done.max_ts);
        }
    }

    fn check_backlog(&self, origin: OriginId, state: &mut OriginState) {
        let backlog = state.pending.len();
        if backlog > self.max_out_of_order && !state.stalled {
            state.stalled = true;
            tracing::warn!(
                %origin,
                backlog,
                waiting_for = state.applied_sequence + 1,
                "watermark stalled behind sequence gap"
            );
        } else if backlog <= self.max_out_of_order && state.stalled {
            state.stalled = false;
            tracing::debug!(%origin, "watermark sequence gap resolved");
        }
    }

    fn record_duplicate(&self, origin: OriginId, sequence: SequenceData) -> Watermark {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%origin, %sequence, "ignoring redelivered sequence data");
        self.current()
    }

    /// Returns the global watermark.
    #[must_use]
    pub fn current(&self) -> Watermark {
        Watermark(self.global.load(Ordering::Acquire))
    }

    /// Returns the watermark exposed by one origin.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] for an untracked origin.
    pub fn origin_watermark(&self, origin: OriginId) -> Result<Watermark, WatermarkError> {
        self.origins
            .get(&origin)
            .map(|slot| Watermark(slot.exposed.load(Ordering::Acquire)))
            .ok_or(WatermarkError::UnknownOrigin(origin))
    }

    /// Returns `true` if any origin buffered more out-of-order sequence
    /// numbers than the configured tolerance.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.origins.values().any(|slot| slot.state.lock().stalled)
    }

    /// Returns the number of tracked origins.
    #[must_use]
    pub fn num_origins(&self) -> usize {
        self.origins.len()
    }

    /// Returns a snapshot of the processor counters.
    #[must_use]
    pub fn metrics(&self) -> WatermarkMetrics {
        let mut pending = 0u64;
        let mut stalled = 0u64;
        for slot in self.origins.values() {
            let state = slot.state.lock();
            pending += state.pending.len() as u64;
            stalled += u64::from(state.stalled);
        }
        WatermarkMetrics {
            current_watermark: self.current().timestamp(),
            updates: self.updates.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            pending_sequences: pending,
            stalled_origins: stalled,
        }
    }
}
