//! Join build state: per-worker bucketed partitions of both inputs.

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;

use super::filter::MembershipFilter;
use super::JoinSide;
use crate::key::{key_at, KeyValue};
use crate::slice::SliceState;

/// One build-side row: where it lives and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEntry {
    /// Key hash, used for bucketing and filters
    pub hash: u64,
    /// Exact key
    pub key: KeyValue,
    /// Index of the batch holding the row
    pub batch: usize,
    /// Row within that batch
    pub row: usize,
}

#[allow(clippy::cast_possible_truncation)]
fn bucket_of(hash: u64, buckets: usize) -> usize {
    (hash % buckets as u64) as usize
}

/// Rows of one join input written by one worker into one slice.
#[derive(Debug, Default)]
pub struct SideBuild {
    batches: Vec<RecordBatch>,
    buckets: Vec<Vec<BuildEntry>>,
    rows: usize,
    null_keys: usize,
}

impl SideBuild {
    /// Adds a run of rows. `keys` is the key column of `batch`.
    ///
    /// Rows with a null key can never match and are not indexed.
    pub fn insert(&mut self, batch: RecordBatch, keys: &ArrayRef, num_buckets: usize) {
        let num_buckets = num_buckets.max(1);
        if self.buckets.is_empty() {
            self.buckets = vec![Vec::new(); num_buckets];
        }
        debug_assert_eq!(self.buckets.len(), num_buckets, "bucket count changed");

        let batch_index = self.batches.len();
        for row in 0..batch.num_rows() {
            let key = key_at(keys, row);
            if key.is_null() {
                self.null_keys += 1;
                continue;
            }
            let hash = key.hash64();
            let bucket = bucket_of(hash, self.buckets.len());
            self.buckets[bucket].push(BuildEntry {
                hash,
                key,
                batch: batch_index,
                row,
            });
        }
        self.rows += batch.num_rows();
        self.batches.push(batch);
    }

    /// Rows added, including rows with null keys.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Rows skipped for a null key.
    #[must_use]
    pub fn null_keys(&self) -> usize {
        self.null_keys
    }
}

/// Per-worker join state of a slice: one partition per input.
#[derive(Debug, Default)]
pub struct JoinBuildState {
    left: SideBuild,
    right: SideBuild,
}

impl JoinBuildState {
    /// The partition of `side`.
    pub fn side_mut(&mut self, side: JoinSide) -> &mut SideBuild {
        match side {
            JoinSide::Left => &mut self.left,
            JoinSide::Right => &mut self.right,
        }
    }

    /// The partition of `side`.
    #[must_use]
    pub fn side(&self, side: JoinSide) -> &SideBuild {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }
}

impl SliceState for JoinBuildState {
    type Sealed = SealedJoinSlice;
}

/// One bucket of a sealed side.
#[derive(Debug, Default)]
pub struct SealedBucket {
    /// Rows hashed into this bucket, in insertion order per worker
    pub entries: Vec<BuildEntry>,
    /// Filter over the entries' hashes, when filters are enabled
    pub filter: Option<MembershipFilter>,
}

/// Immutable merge of every worker's partition of one input.
#[derive(Debug, Default)]
pub struct SealedSide {
    /// Record batches referenced by [`BuildEntry::batch`]
    pub batches: Vec<RecordBatch>,
    /// Buckets, `num_buckets` of them or none when the side saw no rows
    pub buckets: Vec<SealedBucket>,
    /// Rows of the side, including null keys
    pub rows: usize,
}

impl SealedSide {
    fn merge(parts: Vec<SideBuild>, num_buckets: usize, false_positive_rate: Option<f64>) -> Self {
        let rows: usize = parts.iter().map(|p| p.rows).sum();
        if rows == 0 {
            return Self::default();
        }

        let mut batches = Vec::new();
        let mut buckets: Vec<Vec<BuildEntry>> = vec![Vec::new(); num_buckets.max(1)];
        for part in parts {
            let offset = batches.len();
            batches.extend(part.batches);
            for (bucket, entries) in part.buckets.into_iter().enumerate() {
                if let Some(target) = buckets.get_mut(bucket) {
                    target.extend(entries.into_iter().map(|mut e| {
                        e.batch += offset;
                        e
                    }));
                }
            }
        }

        let buckets = buckets
            .into_iter()
            .map(|entries| {
                let filter = false_positive_rate.and_then(|rate| {
                    MembershipFilter::build(entries.iter().map(|e| e.hash).collect(), rate)
                });
                SealedBucket { entries, filter }
            })
            .collect();
        Self {
            batches,
            buckets,
            rows,
        }
    }

    /// Returns `true` if no key was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }
}

/// Sealed join state of one slice.
#[derive(Debug, Default)]
pub struct SealedJoinSlice {
    /// Left input
    pub left: SealedSide,
    /// Right input
    pub right: SealedSide,
}

impl SealedJoinSlice {
    /// Merges the worker blocks of a slice.
    ///
    /// `false_positive_rate` enables per-bucket filters; `None` skips them.
    #[must_use]
    pub fn seal(
        blocks: Vec<JoinBuildState>,
        num_buckets: usize,
        false_positive_rate: Option<f64>,
    ) -> Self {
        let (lefts, rights): (Vec<_>, Vec<_>) =
            blocks.into_iter().map(|b| (b.left, b.right)).unzip();
        Self {
            left: SealedSide::merge(lefts, num_buckets, false_positive_rate),
            right: SealedSide::merge(rights, num_buckets, false_positive_rate),
        }
    }

    /// The sealed side.
    #[must_use]
    pub fn side(&self, side: JoinSide) -> &SealedSide {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch(keys: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(keys))]).unwrap()
    }

    fn insert(state: &mut JoinBuildState, side: JoinSide, keys: Vec<Option<i64>>, buckets: usize) {
        let batch = batch(keys);
        let column = Arc::clone(batch.column(0));
        state.side_mut(side).insert(batch, &column, buckets);
    }

    #[test]
    fn test_null_keys_not_indexed() {
        let mut state = JoinBuildState::default();
        insert(&mut state, JoinSide::Left, vec![Some(1), None, Some(2)], 4);
        assert_eq!(state.side(JoinSide::Left).num_rows(), 3);
        assert_eq!(state.side(JoinSide::Left).null_keys(), 1);
        assert_eq!(state.side(JoinSide::Right).num_rows(), 0);
    }

    #[test]
    fn test_seal_offsets_batches_across_workers() {
        let mut a = JoinBuildState::default();
        insert(&mut a, JoinSide::Left, vec![Some(1)], 1);
        let mut b = JoinBuildState::default();
        insert(&mut b, JoinSide::Left, vec![Some(2)], 1);
        insert(&mut b, JoinSide::Left, vec![Some(3)], 1);

        let sealed = SealedJoinSlice::seal(vec![a, b], 1, None);
        assert_eq!(sealed.left.batches.len(), 3);
        let batches: Vec<_> = sealed.left.buckets[0].entries.iter().map(|e| e.batch).collect();
        assert_eq!(batches, vec![0, 1, 2]);
        assert_eq!(sealed.left.rows, 3);
        assert!(sealed.right.is_empty());
        assert!(sealed.right.buckets.is_empty());
    }

    #[test]
    fn test_seal_builds_filters_when_requested() {
        let mut state = JoinBuildState::default();
        insert(&mut state, JoinSide::Right, (0..32).map(Some).collect(), 4);
        let sealed = SealedJoinSlice::seal(vec![state], 4, Some(0.01));
        let indexed: usize = sealed.right.buckets.iter().map(|b| b.entries.len()).sum();
        assert_eq!(indexed, 32);
        for bucket in &sealed.right.buckets {
            match &bucket.filter {
                Some(filter) => assert!(bucket.entries.iter().all(|e| filter.contains(e.hash))),
                None => assert!(bucket.entries.is_empty()),
            }
        }
    }
}
