//! # Time Module
//!
//! Event time extraction and watermark tracking.
//!
//! ## Concepts
//!
//! - **Event Time**: timestamp carried by the record itself
//! - **Ingestion Time**: creation timestamp of the buffer a record arrived in
//! - **Watermark**: assertion that no record with timestamp < watermark will arrive
//!
//! ## Multi-Origin Watermarks
//!
//! A window operator is fed by several upstream origins, each numbering its
//! buffers with a sequence number. [`WatermarkProcessor`] only lets an origin's
//! watermark advance over a gap-free prefix of sequence numbers, and exposes
//! the minimum over all origins:
//!
//! ```rust
//! use laminar_window::time::{OriginId, SequenceData, Watermark, WatermarkProcessor};
//!
//! let processor = WatermarkProcessor::new(&[OriginId(1), OriginId(2)], 16);
//! processor.update(OriginId(1), SequenceData::single(1), 500).unwrap();
//! processor.update(OriginId(2), SequenceData::single(2), 900).unwrap();
//!
//! // Origin 2 is still missing sequence 1
//! assert_eq!(processor.current(), Watermark::default());
//!
//! processor.update(OriginId(2), SequenceData::single(1), 700).unwrap();
//! assert_eq!(processor.current(), Watermark::new(500));
//! ```

mod event_time;
mod watermark;

pub use event_time::{EventTimeError, TimeFunction, TimestampFormat};
pub use watermark::{
    OriginId, SequenceData, WatermarkError, WatermarkMetrics, WatermarkProcessor,
};

/// A watermark indicating event time progress.
///
/// Watermarks only move forward. Records with a timestamp strictly below the
/// watermark are late.
///
/// # Example
///
/// ```rust
/// use laminar_window::time::Watermark;
///
/// let watermark = Watermark::new(1000);
///
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if a record is late relative to this watermark.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns `true` once any progress has been observed.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0 != i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self(i64::MIN)
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_late_detection() {
        let watermark = Watermark::new(1000);
        assert!(watermark.is_late(999));
        assert!(!watermark.is_late(1000));
        assert!(!watermark.is_late(1001));
    }

    #[test]
    fn test_watermark_default_is_uninitialized() {
        let wm = Watermark::default();
        assert_eq!(wm.timestamp(), i64::MIN);
        assert!(!wm.is_initialized());
        assert!(Watermark::new(0).is_initialized());
    }

    #[test]
    fn test_watermark_conversions() {
        let wm = Watermark::from(1000i64);
        let ts: i64 = wm.into();
        assert_eq!(ts, 1000);
        assert!(Watermark::new(5) < Watermark::new(6));
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01
        assert!(now_millis() > 1_577_836_800_000);
    }
}
