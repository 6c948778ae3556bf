//! Synthetic capture (`stub://`) for tests and demos.
//!
//! Produces a black scene with periodic motion bursts: during a burst a white
//! block alternates between the left and right side of the frame, which is a
//! large enough change to trip the default motion thresholds.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use url::Url;

use super::{CaptureOptions, VideoCapture};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Stop after this many frames; `None` runs forever.
    pub frame_limit: Option<u64>,
    /// Frames per scene cycle.
    pub period: u64,
    /// Frames at the start of each cycle that contain motion.
    pub burst: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: 640,
            height: 480,
            fps: 10,
            frame_limit: None,
            period: 50,
            burst: 20,
        }
    }
}

pub struct SyntheticCapture {
    config: SyntheticConfig,
    frame_count: u64,
}

impl SyntheticCapture {
    /// Zero `fps` or `period` are raised to 1.
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: SyntheticConfig {
                fps: config.fps.max(1),
                period: config.period.max(1),
                ..config
            },
            frame_count: 0,
        }
    }

    /// Parse `stub://<name>?frames=..&width=..&height=..&fps=..&period=..&burst=..`.
    pub fn from_uri(uri: &str, options: &CaptureOptions) -> Result<Self> {
        let parsed = Url::parse(uri).with_context(|| format!("invalid stub source {}", uri))?;
        let mut config = SyntheticConfig {
            name: parsed.host_str().unwrap_or("synthetic").to_string(),
            width: options.width,
            height: options.height,
            fps: options.target_fps.max(1),
            ..SyntheticConfig::default()
        };
        for (key, value) in parsed.query_pairs() {
            let parse = |v: &str| -> Result<u64> {
                v.parse::<u64>()
                    .map_err(|_| anyhow!("stub source parameter {}={} is not a number", key, v))
            };
            let parse_u32 = |v: &str| -> Result<u32> {
                u32::try_from(parse(v)?)
                    .map_err(|_| anyhow!("stub source parameter {}={} is out of range", key, v))
            };
            match key.as_ref() {
                "frames" => config.frame_limit = Some(parse(&value)?),
                "width" => config.width = parse_u32(&value)?,
                "height" => config.height = parse_u32(&value)?,
                "fps" => config.fps = parse_u32(&value)?.max(1),
                "period" => config.period = parse(&value)?.max(1),
                "burst" => config.burst = parse(&value)?,
                other => log::warn!("SyntheticCapture: ignoring unknown parameter {}", other),
            }
        }
        if config.width == 0 || config.height == 0 {
            anyhow::bail!("stub source dimensions must be non-zero");
        }
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn render(&self, position: u64) -> RgbImage {
        let (w, h) = (self.config.width, self.config.height);
        let mut image = RgbImage::new(w, h);
        let phase = position % self.config.period;
        if phase >= self.config.burst {
            return image;
        }

        let block = (w.min(h) / 3).max(1);
        let x0 = if phase % 2 == 0 { 0 } else { w - block };
        let y0 = (h - block) / 2;
        for y in y0..y0 + block {
            for x in x0..x0 + block {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        image
    }
}

impl VideoCapture for SyntheticCapture {
    fn describe(&self) -> String {
        format!("stub://{} (synthetic)", self.config.name)
    }

    fn fps(&self) -> f64 {
        self.config.fps as f64
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        let position = self.frame_count;
        self.frame_count += 1;

        let timestamp = position * 1000 / self.config.fps as u64;
        Ok(Some(Frame::new(
            self.render(position),
            timestamp,
            position,
            self.fps(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_parameters() -> Result<()> {
        let capture = SyntheticCapture::from_uri(
            "stub://porch?frames=5&width=64&height=48&fps=25&period=10&burst=4",
            &CaptureOptions::default(),
        )?;
        let cfg = capture.config();
        assert_eq!(cfg.name, "porch");
        assert_eq!(cfg.frame_limit, Some(5));
        assert_eq!((cfg.width, cfg.height, cfg.fps), (64, 48, 25));
        assert_eq!((cfg.period, cfg.burst), (10, 4));
        Ok(())
    }

    #[test]
    fn bad_parameter_is_rejected() {
        assert!(SyntheticCapture::from_uri("stub://x?frames=lots", &CaptureOptions::default())
            .is_err());
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let err = SyntheticCapture::from_uri(
            "stub://x?width=4294967297&height=48",
            &CaptureOptions::default(),
        )
        .err()
        .expect("width does not fit u32");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn zero_fps_and_period_are_clamped() -> Result<()> {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            width: 8,
            height: 8,
            fps: 0,
            period: 0,
            frame_limit: Some(2),
            ..SyntheticConfig::default()
        });
        assert_eq!(capture.fps(), 1.0);
        let first = capture.read()?.expect("frame 0");
        let second = capture.read()?.expect("frame 1");
        assert_eq!((first.timestamp, second.timestamp), (0, 1000));
        assert!(capture.read()?.is_none());
        Ok(())
    }

    #[test]
    fn positions_and_timestamps_increase() -> Result<()> {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            width: 30,
            height: 30,
            fps: 20,
            frame_limit: Some(4),
            ..SyntheticConfig::default()
        });
        let mut seen = Vec::new();
        while let Some(frame) = capture.read()? {
            assert_eq!(frame.fps, 20.0);
            seen.push((frame.index, frame.timestamp));
        }
        assert_eq!(seen, vec![(0, 0), (1, 50), (2, 100), (3, 150)]);
        Ok(())
    }

    #[test]
    fn scene_is_static_outside_bursts() -> Result<()> {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            width: 30,
            height: 30,
            period: 6,
            burst: 2,
            ..SyntheticConfig::default()
        });
        let frames: Vec<Frame> = (0..6).filter_map(|_| capture.read().ok().flatten()).collect();
        assert_ne!(frames[0].image, frames[1].image);
        assert_eq!(frames[2].image, frames[3].image);
        assert_eq!(frames[4].image, frames[5].image);
        assert!(frames[3].image.pixels().all(|p| *p == Rgb([0, 0, 0])));
        Ok(())
    }
}
