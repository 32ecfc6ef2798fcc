//! Window operator configuration.
//!
//! [`WindowOperatorConfig`] is deserializable so outer layers can load it from
//! their own configuration files; [`WindowOperatorConfig::builder`] is the
//! programmatic entry point.

use serde::{Deserialize, Serialize};

use crate::slice::CachePolicy;
use crate::time::OriginId;

/// Default number of worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 1;

/// Default number of slice cache entries per worker.
pub const DEFAULT_SLICE_CACHE_CAPACITY: usize = 4;

/// Default false-positive target for join bucket filters.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Default number of hash buckets per join side.
pub const DEFAULT_JOIN_BUCKETS: usize = 64;

/// Default number of out-of-order sequence numbers tolerated per origin.
pub const DEFAULT_MAX_OUT_OF_ORDER: usize = 1024;

/// Errors raised by [`WindowOperatorConfig::validate`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// Window size or slide is not positive, or slide exceeds size
    #[error("Invalid window: size={size}ms slide={slide}ms")]
    InvalidWindow {
        /// Window size
        size: i64,
        /// Window slide
        slide: i64,
    },

    /// Negative allowed lateness
    #[error("Allowed lateness must not be negative: {0}ms")]
    NegativeLateness(i64),

    /// No input origins configured
    #[error("At least one input origin is required")]
    NoInputOrigins,

    /// The output origin is also listed as an input
    #[error("Output origin {0} is also an input origin")]
    OutputOriginIsInput(OriginId),

    /// Zero worker threads
    #[error("Worker thread count must be positive")]
    NoWorkerThreads,

    /// False-positive target outside (0, 1)
    #[error("False-positive rate must be in (0, 1): {0}")]
    InvalidFalsePositiveRate(f64),

    /// Zero join buckets
    #[error("Join bucket count must be positive")]
    NoJoinBuckets,
}

/// Per-worker slice cache settings. A capacity of zero disables the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceCacheConfig {
    /// Entries per worker
    pub capacity: usize,
    /// Eviction policy
    pub policy: CachePolicy,
}

impl Default for SliceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SLICE_CACHE_CAPACITY,
            policy: CachePolicy::Lru,
        }
    }
}

/// Configuration consumed by every window operator handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowOperatorConfig {
    /// Window size in milliseconds
    pub window_size_ms: i64,
    /// Window slide in milliseconds; equal to the size for tumbling windows
    pub window_slide_ms: i64,
    /// Grace period after a window's end before its state may be freed
    pub allowed_lateness_ms: i64,
    /// Upstream origins feeding the operator (both sides for joins)
    pub input_origins: Vec<OriginId>,
    /// Origin stamped on emitted buffers
    pub output_origin: OriginId,
    /// Number of worker threads processing input buffers
    pub worker_threads: usize,
    /// Per-worker slice cache
    pub slice_cache: SliceCacheConfig,
    /// False-positive target of join bucket filters
    pub false_positive_rate: f64,
    /// Hash buckets per join side
    pub join_buckets: usize,
    /// Out-of-order sequence numbers buffered per origin before the
    /// watermark is reported as stalled
    pub max_out_of_order: usize,
}

impl Default for WindowOperatorConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 1000,
            window_slide_ms: 1000,
            allowed_lateness_ms: 0,
            input_origins: Vec::new(),
            output_origin: OriginId::default(),
            worker_threads: DEFAULT_WORKER_THREADS,
            slice_cache: SliceCacheConfig::default(),
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            join_buckets: DEFAULT_JOIN_BUCKETS,
            max_out_of_order: DEFAULT_MAX_OUT_OF_ORDER,
        }
    }
}

impl WindowOperatorConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> WindowOperatorConfigBuilder {
        WindowOperatorConfigBuilder::default()
    }

    /// Returns `true` when windows do not overlap.
    #[must_use]
    pub fn is_tumbling(&self) -> bool {
        self.window_size_ms == self.window_slide_ms
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_ms <= 0
            || self.window_slide_ms <= 0
            || self.window_slide_ms > self.window_size_ms
        {
            return Err(ConfigError::InvalidWindow {
                size: self.window_size_ms,
                slide: self.window_slide_ms,
            });
        }
        if self.allowed_lateness_ms < 0 {
            return Err(ConfigError::NegativeLateness(self.allowed_lateness_ms));
        }
        if self.input_origins.is_empty() {
            return Err(ConfigError::NoInputOrigins);
        }
        if self.input_origins.contains(&self.output_origin) {
            return Err(ConfigError::OutputOriginIsInput(self.output_origin));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkerThreads);
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(ConfigError::InvalidFalsePositiveRate(
                self.false_positive_rate,
            ));
        }
        if self.join_buckets == 0 {
            return Err(ConfigError::NoJoinBuckets);
        }
        Ok(())
    }
}

/// Builder for [`WindowOperatorConfig`].
#[derive(Debug, Default)]
pub struct WindowOperatorConfigBuilder {
    window_size_ms: Option<i64>,
    window_slide_ms: Option<i64>,
    allowed_lateness_ms: Option<i64>,
    input_origins: Option<Vec<OriginId>>,
    output_origin: Option<OriginId>,
    worker_threads: Option<usize>,
    slice_cache: Option<SliceCacheConfig>,
    false_positive_rate: Option<f64>,
    join_buckets: Option<usize>,
    max_out_of_order: Option<usize>,
}

impl WindowOperatorConfigBuilder {
    /// Sets the window size. The slide defaults to the size.
    #[must_use]
    pub fn window_size_ms(mut self, size: i64) -> Self {
        self.window_size_ms = Some(size);
        self
    }

    /// Sets the window slide.
    #[must_use]
    pub fn window_slide_ms(mut self, slide: i64) -> Self {
        self.window_slide_ms = Some(slide);
        self
    }

    /// Sets the allowed lateness.
    #[must_use]
    pub fn allowed_lateness_ms(mut self, lateness: i64) -> Self {
        self.allowed_lateness_ms = Some(lateness);
        self
    }

    /// Sets the input origins.
    #[must_use]
    pub fn input_origins(mut self, origins: Vec<OriginId>) -> Self {
        self.input_origins = Some(origins);
        self
    }

    /// Sets the output origin.
    #[must_use]
    pub fn output_origin(mut self, origin: OriginId) -> Self {
        self.output_origin = Some(origin);
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Sets the per-worker slice cache.
    #[must_use]
    pub fn slice_cache(mut self, capacity: usize, policy: CachePolicy) -> Self {
        self.slice_cache = Some(SliceCacheConfig { capacity, policy });
        self
    }

    /// Sets the false-positive target of join bucket filters.
    #[must_use]
    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = Some(rate);
        self
    }

    /// Sets the number of join buckets per side.
    #[must_use]
    pub fn join_buckets(mut self, buckets: usize) -> Self {
        self.join_buckets = Some(buckets);
        self
    }

    /// Sets the out-of-order tolerance per origin.
    #[must_use]
    pub fn max_out_of_order(mut self, tolerance: usize) -> Self {
        self.max_out_of_order = Some(tolerance);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the result is inconsistent.
    pub fn build(self) -> Result<WindowOperatorConfig, ConfigError> {
        let defaults = WindowOperatorConfig::default();
        let window_size_ms = self.window_size_ms.unwrap_or(defaults.window_size_ms);
        let config = WindowOperatorConfig {
            window_size_ms,
            window_slide_ms: self.window_slide_ms.unwrap_or(window_size_ms),
            allowed_lateness_ms: self
                .allowed_lateness_ms
                .unwrap_or(defaults.allowed_lateness_ms),
            input_origins: self.input_origins.unwrap_or(defaults.input_origins),
            output_origin: self.output_origin.unwrap_or(defaults.output_origin),
            worker_threads: self.worker_threads.unwrap_or(defaults.worker_threads),
            slice_cache: self.slice_cache.unwrap_or(defaults.slice_cache),
            false_positive_rate: self
                .false_positive_rate
                .unwrap_or(defaults.false_positive_rate),
            join_buckets: self.join_buckets.unwrap_or(defaults.join_buckets),
            max_out_of_order: self.max_out_of_order.unwrap_or(defaults.max_out_of_order),
        };
        config.validate()?;
        Ok(config)
    }
}
