use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::frame::{Frame, MOTION_END};
use crate::processor::FrameProcessor;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Minimum time between two admitted motion frames.
    pub interval: Duration,
    /// Time without an admitted frame after which the segment is closed.
    pub quiet: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            quiet: Duration::from_secs(2),
        }
    }
}

/// Rate-limits motion frames and signals the end of a motion segment.
///
/// All arithmetic uses `Frame::timestamp` (milliseconds), never the wall
/// clock, so a recorded stream replays identically.
pub struct TemporalSampler {
    interval_ms: u64,
    quiet_ms: u64,
    last_admitted: Option<u64>,
}

impl TemporalSampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            interval_ms: config.interval.as_millis() as u64,
            quiet_ms: config.quiet.as_millis() as u64,
            last_admitted: None,
        }
    }

    /// Timestamp of the last admitted frame in the open segment, if any.
    pub fn last_admitted(&self) -> Option<u64> {
        self.last_admitted
    }
}

impl FrameProcessor for TemporalSampler {
    fn name(&self) -> &str {
        "temporal_sampler"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Option<Frame>> {
        let now = frame.timestamp;

        if frame.motion_detected() {
            let due = self
                .last_admitted
                .map_or(true, |last| now.saturating_sub(last) >= self.interval_ms);
            if due {
                self.last_admitted = Some(now);
                log::debug!(
                    "sampler: admitted frame #{} timestamp={} fps={}",
                    frame.index,
                    frame.timestamp,
                    frame.fps
                );
                return Ok(Some(frame));
            }
        }

        if let Some(last) = self.last_admitted {
            let quiet_for = now.saturating_sub(last);
            if quiet_for > self.quiet_ms {
                log::debug!(
                    "sampler: quiet for {}ms > {}ms at frame #{}, closing segment",
                    quiet_for,
                    self.quiet_ms,
                    frame.index
                );
                // One flush signal per segment; the next motion frame opens a new one.
                self.last_admitted = None;
                frame.metadata.insert(MOTION_END, true);
                return Ok(Some(frame));
            }
        }

        Ok(None)
    }
}
