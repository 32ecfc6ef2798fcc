//! Probing the sealed slices of a window.
//!
//! Every pair of (left slice, right slice) of the window is probed bucket by
//! bucket. A bucket pair is pruned when either side is empty or when no left
//! hash passes the right bucket's filter; otherwise keys are compared
//! exactly. Since filters have no false negatives, pruning never drops a
//! match.

use std::sync::Arc;

use arrow::array::{new_empty_array, Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use arrow_schema::ArrowError;
use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::build::{BuildEntry, SealedBucket, SealedJoinSlice};
use super::{JoinKind, JoinLayout};
use crate::aggregation::window_columns;
use crate::key::KeyValue;
use crate::slice::WindowInfo;

/// Counters of one or more probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    /// Bucket pairs compared key by key
    pub buckets_probed: u64,
    /// Bucket pairs skipped by a membership filter
    pub buckets_pruned: u64,
    /// Output rows produced
    pub matches: u64,
}

impl ProbeStats {
    /// Adds `other` into `self`.
    pub fn add(&mut self, other: &ProbeStats) {
        self.buckets_probed += other.buckets_probed;
        self.buckets_pruned += other.buckets_pruned;
        self.matches += other.matches;
    }
}

type RowRef = (usize, usize);

#[derive(Default)]
struct Matches {
    left: Vec<RowRef>,
    right: Vec<RowRef>,
}

impl Matches {
    fn push(&mut self, left: RowRef, right: RowRef) {
        self.left.push(left);
        self.right.push(right);
    }
}

/// Joins the sealed slices of `window`.
///
/// Output rows are grouped by (left slice, right slice, bucket) and, inside
/// a bucket, follow left insertion order.
///
/// # Errors
///
/// Returns an Arrow error if the input batches do not match `layout`.
pub fn probe_window(
    window: WindowInfo,
    slices: &[&SealedJoinSlice],
    kind: JoinKind,
    layout: &JoinLayout,
) -> Result<(RecordBatch, ProbeStats), ArrowError> {
    let mut stats = ProbeStats::default();
    let mut matches = Matches::default();

    let left_batches: Vec<&RecordBatch> =
        slices.iter().flat_map(|s| s.left.batches.iter()).collect();
    let right_batches: Vec<&RecordBatch> =
        slices.iter().flat_map(|s| s.right.batches.iter()).collect();
    let left_offsets = batch_offsets(slices.iter().map(|s| s.left.batches.len()));
    let right_offsets = batch_offsets(slices.iter().map(|s| s.right.batches.len()));

    for (li, left_slice) in slices.iter().enumerate() {
        if left_slice.left.is_empty() {
            continue;
        }
        for (ri, right_slice) in slices.iter().enumerate() {
            if right_slice.right.is_empty() {
                continue;
            }
            let pairs = left_slice
                .left
                .buckets
                .iter()
                .zip(&right_slice.right.buckets);
            for (left, right) in pairs {
                if left.entries.is_empty() || right.entries.is_empty() {
                    continue;
                }
                if kind == JoinKind::Hash && is_disjoint(left, right) {
                    stats.buckets_pruned += 1;
                    continue;
                }
                stats.buckets_probed += 1;
                let offsets = (left_offsets[li], right_offsets[ri]);
                match kind {
                    JoinKind::Hash => hash_probe(left, right, offsets, &mut matches),
                    JoinKind::NestedLoop => nested_loop_probe(left, right, offsets, &mut matches),
                }
            }
        }
    }

    stats.matches = matches.left.len() as u64;
    let batch = build_output(window, &left_batches, &right_batches, &matches, layout)?;
    Ok((batch, stats))
}

fn batch_offsets(lengths: impl Iterator<Item = usize>) -> Vec<usize> {
    lengths
        .scan(0, |next, len| {
            let offset = *next;
            *next += len;
            Some(offset)
        })
        .collect()
}

fn is_disjoint(left: &SealedBucket, right: &SealedBucket) -> bool {
    match &right.filter {
        Some(filter) => !left.entries.iter().any(|e| filter.contains(e.hash)),
        None => false,
    }
}

fn hash_probe(
    left: &SealedBucket,
    right: &SealedBucket,
    (left_offset, right_offset): (usize, usize),
    matches: &mut Matches,
) {
    let mut table: FxHashMap<&KeyValue, SmallVec<[&BuildEntry; 2]>> =
        FxHashMap::default();
    for entry in &right.entries {
        table.entry(&entry.key).or_default().push(entry);
    }
    for l in &left.entries {
        if let Some(rights) = table.get(&l.key) {
            for r in rights {
                matches.push(
                    (left_offset + l.batch, l.row),
                    (right_offset + r.batch, r.row),
                );
            }
        }
    }
}

fn nested_loop_probe(
    left: &SealedBucket,
    right: &SealedBucket,
    (left_offset, right_offset): (usize, usize),
    matches: &mut Matches,
) {
    for l in &left.entries {
        for r in &right.entries {
            if l.key == r.key {
                matches.push(
                    (left_offset + l.batch, l.row),
                    (right_offset + r.batch, r.row),
                );
            }
        }
    }
}

fn gather(
    batches: &[&RecordBatch],
    column: usize,
    indices: &[RowRef],
    empty: impl FnOnce() -> ArrayRef,
) -> Result<ArrayRef, ArrowError> {
    if indices.is_empty() {
        return Ok(empty());
    }
    let arrays: Vec<&dyn Array> = batches.iter().map(|b| b.column(column).as_ref()).collect();
    arrow::compute::interleave(&arrays, indices)
}

fn build_output(
    window: WindowInfo,
    left_batches: &[&RecordBatch],
    right_batches: &[&RecordBatch],
    matches: &Matches,
    layout: &JoinLayout,
) -> Result<RecordBatch, ArrowError> {
    let (start, end) = window_columns(window.start, window.end, matches.left.len());
    let mut columns = vec![start, end];

    let left_width = layout.left_columns();
    for (i, field) in layout.schema().fields().iter().enumerate().skip(2) {
        let empty = || new_empty_array(field.data_type());
        let column = if i < 2 + left_width {
            gather(left_batches, i - 2, &matches.left, empty)?
        } else {
            gather(right_batches, i - 2 - left_width, &matches.right, empty)?
        };
        columns.push(column);
    }
    RecordBatch::try_new(Arc::clone(layout.schema()), columns)
}
