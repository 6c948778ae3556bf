//! Stateful per-frame pipeline stages.
//!
//! - `MotionDetector`: sliding-window grayscale difference, tags `motion_detected`.
//! - `MotionGate`: drops frames that carry no motion tag.
//! - `TemporalSampler`: admits one motion frame per interval, tags `motion_end`.
//! - `GridAggregator`: buffers admitted frames into a composite grid image.
//!
//! Each stage owns its history. Stages are built once per worker and never
//! shared, so a chain of these must run in a single-worker pool to keep
//! temporal continuity.

mod grid;
mod label;
mod motion;
mod sampling;

pub use grid::{GridAggregator, GridConfig, MIN_COMPOSITE_FRAMES};
pub use motion::{MotionConfig, MotionDetector, MotionGate};
pub use sampling::{SamplingConfig, TemporalSampler};
