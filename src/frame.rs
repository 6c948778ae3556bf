//! Frame record passed between pipeline stages.
//!
//! - `Frame`: one RGB image plus capture metadata (timestamp, index, fps).
//! - `FrameMetadata`: open string-keyed map carrying cross-stage signals.
//!
//! Stages add metadata keys; they never remove keys set by earlier stages.
//! The recognised keys are listed below as constants.

use image::RgbImage;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Set by `MotionDetector` when the frame differs from its window reference.
pub const MOTION_DETECTED: &str = "motion_detected";
/// Set by `TemporalSampler` when the quiet threshold has elapsed.
pub const MOTION_END: &str = "motion_end";
/// `[rows, columns]` of a composite produced by `GridAggregator`.
pub const GRID_SHAPE: &str = "grid_shape";
/// Object store key written by `StorageSink`.
pub const STORAGE_KEY: &str = "storage_key";
/// Acknowledgement returned by the analysis trigger.
pub const ANALYSIS_RESULT: &str = "analysis_result";

// ----------------------------------------------------------------------------
// FrameMetadata
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameMetadata {
    entries: BTreeMap<String, Value>,
}

impl FrameMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a key. There is deliberately no `remove`.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// True only when the key holds boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn grid_shape(&self) -> Option<(u32, u32)> {
        let shape = self.entries.get(GRID_SHAPE)?.as_array()?;
        match shape.as_slice() {
            [rows, cols] => Some((rows.as_u64()? as u32, cols.as_u64()? as u32)),
            _ => None,
        }
    }

    pub fn set_grid_shape(&mut self, rows: u32, columns: u32) {
        self.insert(GRID_SHAPE, Value::from(vec![rows, columns]));
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.entries.get(STORAGE_KEY).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One image and its capture (or aggregation) metadata.
///
/// A frame is moved from stage to stage; a stage that needs history keeps its
/// own copy of whatever it derives from the frame, never the frame itself.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Capture time in milliseconds (source position, or wall clock fallback).
    pub timestamp: u64,
    /// Strictly increasing within one stream session.
    pub index: u64,
    /// Source frame rate at capture, 0 for composites.
    pub fps: f64,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: u64, index: u64, fps: f64) -> Self {
        Self {
            image,
            timestamp,
            index,
            fps,
            metadata: FrameMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn motion_detected(&self) -> bool {
        self.metadata.flag(MOTION_DETECTED)
    }

    pub fn motion_end(&self) -> bool {
        self.metadata.flag(MOTION_END)
    }

    /// Short human-readable label used in logs and grid overlays.
    pub fn describe(&self) -> String {
        format!(
            "#{}, timestamp: {}, fps: {}",
            self.index,
            self.timestamp,
            format_fps(self.fps)
        )
    }
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{:.0}", fps)
    } else {
        format!("{:.2}", fps)
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
