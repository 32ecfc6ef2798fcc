//! Accumulators for the built-in aggregate functions.

use rand::Rng;

use super::AggregateFunction;

/// Fixed-size uniform sample over a stream of values.
///
/// Merging two reservoirs yields a valid reservoir of the combined stream,
/// but which elements survive depends on merge order and randomness; only the
/// sample size is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    sample: Vec<i64>,
}

impl Reservoir {
    /// Creates an empty reservoir holding up to `capacity` values.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            sample: Vec::with_capacity(capacity.min(64)),
        }
    }

    /// Offers one value to the sample.
    pub fn add(&mut self, value: i64) {
        self.seen += 1;
        if self.sample.len() < self.capacity {
            self.sample.push(value);
            return;
        }
        let slot = rand::thread_rng().gen_range(0..self.seen);
        if let Ok(slot) = usize::try_from(slot) {
            if slot < self.capacity {
                self.sample[slot] = value;
            }
        }
    }

    /// Merges `other` into this reservoir.
    ///
    /// Each output element is drawn from one side with probability
    /// proportional to the number of values that side has seen.
    pub fn merge(&mut self, other: &Self) {
        let target = self.capacity.min(self.sample.len() + other.sample.len());
        let mut left = std::mem::take(&mut self.sample);
        let mut right = other.sample.clone();
        let total = self.seen + other.seen;
        let mut rng = rand::thread_rng();

        let mut merged = Vec::with_capacity(target);
        while merged.len() < target {
            let from_left = if left.is_empty() {
                false
            } else if right.is_empty() {
                true
            } else {
                rng.gen_range(0..total.max(1)) < self.seen
            };
            let source = if from_left { &mut left } else { &mut right };
            let index = rng.gen_range(0..source.len());
            merged.push(source.swap_remove(index));
        }

        self.sample = merged;
        self.seen = total;
    }

    /// Number of values offered so far.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Current sample.
    #[must_use]
    pub fn sample(&self) -> &[i64] {
        &self.sample
    }
}

/// Running state of one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Row count
    Count(i64),
    /// Wrapping sum and number of values
    Sum {
        /// Running sum
        sum: i64,
        /// Values added
        count: u64,
    },
    /// Running minimum
    Min(Option<i64>),
    /// Running maximum
    Max(Option<i64>),
    /// Running sum and count for the mean
    Avg {
        /// Running sum
        sum: i128,
        /// Values added
        count: u64,
    },
    /// Reservoir sample
    Reservoir(Reservoir),
}

impl Accumulator {
    /// Creates an empty accumulator for `function`.
    #[must_use]
    pub fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum { sum: 0, count: 0 },
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
            AggregateFunction::Avg => Accumulator::Avg { sum: 0, count: 0 },
            AggregateFunction::ReservoirSample(k) => Accumulator::Reservoir(Reservoir::new(k)),
        }
    }

    /// Adds one row. `value` is `None` for nulls and for `COUNT(*)`.
    #[inline]
    pub fn add(&mut self, value: Option<i64>) {
        match (self, value) {
            (Accumulator::Count(n), _) => *n = n.wrapping_add(1),
            (_, None) => {}
            (Accumulator::Sum { sum, count }, Some(v)) => {
                *sum = sum.wrapping_add(v);
                *count += 1;
            }
            (Accumulator::Min(min), Some(v)) => *min = Some(min.map_or(v, |m| m.min(v))),
            (Accumulator::Max(max), Some(v)) => *max = Some(max.map_or(v, |m| m.max(v))),
            (Accumulator::Avg { sum, count }, Some(v)) => {
                *sum += i128::from(v);
                *count += 1;
            }
            (Accumulator::Reservoir(r), Some(v)) => r.add(v),
        }
    }

    /// Merges another accumulator of the same function into this one.
    pub fn merge(&mut self, other: &Self) {
        match (self, other) {
            (Accumulator::Count(a), Accumulator::Count(b)) => *a = a.wrapping_add(*b),
            (
                Accumulator::Sum { sum, count },
                Accumulator::Sum {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum = sum.wrapping_add(*other_sum);
                *count += other_count;
            }
            (Accumulator::Min(a), Accumulator::Min(b)) => *a = min_opt(*a, *b),
            (Accumulator::Max(a), Accumulator::Max(b)) => *a = max_opt(*a, *b),
            (
                Accumulator::Avg { sum, count },
                Accumulator::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (Accumulator::Reservoir(a), Accumulator::Reservoir(b)) => a.merge(b),
            (this, other) => {
                debug_assert!(false, "merging {this:?} with {other:?}");
            }
        }
    }

    /// Integer result for count, sum, min and max.
    #[must_use]
    pub fn int_result(&self) -> Option<i64> {
        match self {
            Accumulator::Count(n) => Some(*n),
            Accumulator::Sum { sum, count } => (*count > 0).then_some(*sum),
            Accumulator::Min(v) | Accumulator::Max(v) => *v,
            Accumulator::Avg { .. } | Accumulator::Reservoir(_) => None,
        }
    }

    /// Mean for avg.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_result(&self) -> Option<f64> {
        match self {
            Accumulator::Avg { sum, count } if *count > 0 => Some(*sum as f64 / *count as f64),
            _ => None,
        }
    }

    /// Sample for reservoir sampling.
    #[must_use]
    pub fn sample_result(&self) -> Option<&[i64]> {
        match self {
            Accumulator::Reservoir(r) => Some(r.sample()),
            _ => None,
        }
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
