use anyhow::{bail, Result};
use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::frame::{Frame, MOTION_DETECTED};
use crate::processor::FrameProcessor;

/// Motion detection thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Per-pixel absolute difference above which a pixel counts as changed.
    pub binary_threshold: u8,
    /// Motion is declared when more than this many pixels changed.
    pub pixel_threshold: u32,
    /// How many frames back the reference frame is taken from.
    pub window: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            binary_threshold: 25,
            pixel_threshold: 30_000,
            window: 3,
        }
    }
}

/// Sliding-window frame differencing.
///
/// The current frame is compared against the grayscale frame seen `window`
/// frames earlier. Until the window is full no motion is ever declared.
pub struct MotionDetector {
    config: MotionConfig,
    prev_grays: VecDeque<GrayImage>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        let window = config.window.max(1);
        Self {
            config: MotionConfig { window, ..config },
            prev_grays: VecDeque::with_capacity(window),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Number of grayscale frames currently held as history.
    pub fn history_len(&self) -> usize {
        self.prev_grays.len()
    }

    fn detect(&mut self, frame: &Frame) -> Result<bool> {
        let current = imageops::grayscale(&frame.image);

        let result = if self.prev_grays.len() >= self.config.window {
            match self.prev_grays.pop_front() {
                Some(prev) => {
                    let changed = changed_pixels(&prev, &current, self.config.binary_threshold)?;
                    log::trace!(
                        "motion: frame #{} changed_pixels={} threshold={}",
                        frame.index,
                        changed,
                        self.config.pixel_threshold
                    );
                    changed > self.config.pixel_threshold as u64
                }
                None => false,
            }
        } else {
            false
        };

        while self.prev_grays.len() >= self.config.window {
            self.prev_grays.pop_front();
        }
        self.prev_grays.push_back(current);

        Ok(result)
    }
}

impl FrameProcessor for MotionDetector {
    fn name(&self) -> &str {
        "motion_detector"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Option<Frame>> {
        if self.detect(&frame)? {
            frame.metadata.insert(MOTION_DETECTED, true);
        }
        Ok(Some(frame))
    }
}

/// Count pixels whose absolute difference exceeds `threshold`.
fn changed_pixels(prev: &GrayImage, current: &GrayImage, threshold: u8) -> Result<u64> {
    if prev.dimensions() != current.dimensions() {
        bail!(
            "frame size changed mid-stream: {:?} != {:?}",
            prev.dimensions(),
            current.dimensions()
        );
    }
    let count = prev
        .as_raw()
        .iter()
        .zip(current.as_raw().iter())
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count();
    Ok(count as u64)
}

/// Drops every frame without a `motion_detected` tag.
#[derive(Default)]
pub struct MotionGate;

impl MotionGate {
    pub fn new() -> Self {
        Self
    }
}

impl FrameProcessor for MotionGate {
    fn name(&self) -> &str {
        "motion_gate"
    }

    fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
        Ok(frame.motion_detected().then_some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn black(index: u64) -> Frame {
        Frame::new(RgbImage::new(640, 480), index * 40, index, 25.0)
    }

    fn with_white_block(index: u64, size: u32) -> Frame {
        let mut frame = black(index);
        for y in 0..size {
            for x in 0..size {
                frame.image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        frame
    }

    fn detector(window: usize, pixel_threshold: u32) -> MotionDetector {
        MotionDetector::new(MotionConfig {
            binary_threshold: 25,
            pixel_threshold,
            window,
        })
    }

    #[test]
    fn identical_frames_have_no_motion() -> Result<()> {
        let mut det = detector(1, 10);
        let a = det.process(black(0))?.expect("never drops");
        let b = det.process(black(1))?.expect("never drops");
        assert!(!a.motion_detected());
        assert!(!b.motion_detected());
        Ok(())
    }

    #[test]
    fn white_block_is_motion() -> Result<()> {
        let mut det = detector(1, 100);
        det.process(black(0))?;
        let out = det.process(with_white_block(1, 200))?.expect("never drops");
        assert!(out.motion_detected());
        Ok(())
    }

    #[test]
    fn changed_pixels_must_exceed_threshold() -> Result<()> {
        // 10x10 block = exactly 100 changed pixels, not more than 100
        let mut det = detector(1, 100);
        det.process(black(0))?;
        let out = det.process(with_white_block(1, 10))?.expect("never drops");
        assert!(!out.motion_detected());
        Ok(())
    }

    #[test]
    fn no_motion_until_window_is_full() -> Result<()> {
        let mut det = detector(3, 100);
        // every frame differs from the previous one, but history is too short
        for i in 0..3 {
            let frame = if i % 2 == 0 {
                with_white_block(i, 200)
            } else {
                black(i)
            };
            let out = det.process(frame)?.expect("never drops");
            assert!(!out.motion_detected(), "frame {i} declared motion early");
        }
        assert_eq!(det.history_len(), 3);

        // frame 3 is compared with frame 0 (white block) -> black differs
        let out = det.process(black(3))?.expect("never drops");
        assert!(out.motion_detected());
        assert_eq!(det.history_len(), 3);
        Ok(())
    }

    #[test]
    fn window_compares_against_oldest_frame() -> Result<()> {
        let mut det = detector(2, 100);
        det.process(black(0))?;
        det.process(with_white_block(1, 200))?;
        // compared with frame 0: both black
        let out = det.process(black(2))?.expect("never drops");
        assert!(!out.motion_detected());
        Ok(())
    }

    #[test]
    fn existing_motion_tag_is_never_cleared() -> Result<()> {
        let mut det = detector(1, 100);
        let mut frame = black(0);
        frame.metadata.insert(MOTION_DETECTED, true);
        let out = det.process(frame)?.expect("never drops");
        assert!(out.motion_detected());
        Ok(())
    }

    #[test]
    fn size_change_is_an_error() -> Result<()> {
        let mut det = detector(1, 100);
        det.process(black(0))?;
        let small = Frame::new(RgbImage::new(320, 240), 40, 1, 25.0);
        assert!(det.process(small).is_err());
        Ok(())
    }

    #[test]
    fn gate_drops_frames_without_motion() -> Result<()> {
        let mut gate = MotionGate::new();
        assert!(gate.process(black(0))?.is_none());
        let mut tagged = black(1);
        tagged.metadata.insert(MOTION_DETECTED, true);
        assert!(gate.process(tagged)?.is_some());
        Ok(())
    }
}
