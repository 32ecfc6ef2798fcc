//! # `LaminarDB` Window Engine
//!
//! Slice-based windowed state and watermark tracking for continuous windowed
//! aggregations and streaming joins.
//!
//! This crate provides:
//! - **Slices**: time-bounded units of per-worker state, mutable while filling
//!   and immutable once emitted
//! - **Slice Store**: owns every active slice, decides trigger readiness and
//!   frees state once downstream confirmed it
//! - **Watermarks**: multi-origin, sequence-number aware progress tracking
//! - **Handlers**: window operators for keyed and non-keyed aggregation and
//!   for hash and nested-loop joins
//!
//! ## Design Principles
//!
//! 1. **Exactly-once emission** - every window is finalized by exactly one
//!    compare-and-swap winner, on watermark progress or on termination
//! 2. **No cross-worker locking on the write path** - each worker owns its
//!    own partial state inside a slice
//! 3. **Handles, not references** - the store owns slices, everything else
//!    holds [`slice::SliceId`] handles
//!
//! ## Example
//!
//! ```rust,ignore
//! use laminar_window::aggregation::Aggregate;
//! use laminar_window::time::TimeFunction;
//! use laminar_window::{InputSide, WindowOperatorConfig, WindowOperatorHandler};
//!
//! let config = WindowOperatorConfig::builder()
//!     .window_size_ms(10)
//!     .input_origins(vec![1.into()])
//!     .output_origin(100.into())
//!     .build()?;
//!
//! let handler = WindowOperatorHandler::non_keyed_aggregation(
//!     config,
//!     schema,
//!     TimeFunction::event_time("ts"),
//!     vec![Aggregate::sum("value", "total")],
//! )?;
//! handler.setup(&ctx)?;
//! handler.start()?;
//! handler.process_buffer(&ctx, worker, InputSide::Single, &buffer)?;
//! handler.stop(&ctx, InputSide::Single)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregation;
pub mod buffer;
pub mod config;
pub mod handler;
pub mod join;
pub mod key;
pub mod slice;
pub mod time;

pub use config::WindowOperatorConfig;
pub use handler::{InputSide, WindowOperatorHandler};

/// Result type for laminar-window operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for laminar-window
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid operator configuration
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Watermark processor errors
    #[error("Watermark error: {0}")]
    Watermark(#[from] time::WatermarkError),

    /// Event time extraction errors
    #[error("Event time error: {0}")]
    EventTime(#[from] time::EventTimeError),

    /// Slice store errors
    #[error("Slice store error: {0}")]
    SliceStore(#[from] slice::SliceStoreError),

    /// Aggregation errors
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] aggregation::AggregationError),

    /// Join errors
    #[error("Join error: {0}")]
    Join(#[from] join::JoinError),

    /// Record key errors
    #[error("Key error: {0}")]
    Key(#[from] key::KeyError),

    /// Handler lifecycle and emission errors
    #[error("Handler error: {0}")]
    Handler(#[from] handler::HandlerError),

    /// Arrow compute errors
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}
