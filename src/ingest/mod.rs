//! Video capture backends.
//!
//! This module turns a source identifier into a `VideoCapture`:
//! - `stub://<name>[?frames=N&width=W&height=H&fps=F&period=P&burst=B]`: synthetic scene
//! - numeric device ids (`0`) and `/dev/videoN` (feature: ingest-v4l2)
//! - local files and stream URLs (feature: ingest-ffmpeg)
//!
//! Captures are opened on the capture thread itself, so backends holding
//! thread-bound decoder state never cross threads.
//!
//! Every backend reports:
//! - `timestamp`: source position in milliseconds, wall clock when the source has none
//! - `index`: strictly increasing frame position
//! - `fps`: reported frame rate, or the configured target when unknown

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::Result;

use crate::frame::Frame;

#[cfg(feature = "ingest-ffmpeg")]
pub use self::ffmpeg::FfmpegCapture;
pub use synthetic::{SyntheticCapture, SyntheticConfig};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Capture;

/// A pull-based frame reader.
pub trait VideoCapture {
    /// Human-readable source description for logs.
    fn describe(&self) -> String;

    /// Frame rate reported by the source.
    fn fps(&self) -> f64;

    /// Read the next frame. `Ok(None)` marks the end of the stream.
    fn read(&mut self) -> Result<Option<Frame>>;
}

/// Hints for backends that negotiate a capture format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Open the backend matching `uri`.
pub fn open_capture(uri: &str, options: &CaptureOptions) -> Result<Box<dyn VideoCapture>> {
    let uri = uri.trim();
    if uri.is_empty() {
        anyhow::bail!("video source must not be empty");
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticCapture::from_uri(uri, options)?));
    }
    if let Some(device) = device_path(uri) {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Capture::open(&device, options)?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            anyhow::bail!(
                "capture device {} requires the ingest-v4l2 feature",
                device
            );
        }
    }
    #[cfg(feature = "ingest-ffmpeg")]
    {
        Ok(Box::new(FfmpegCapture::open(uri, options)?))
    }
    #[cfg(not(feature = "ingest-ffmpeg"))]
    {
        anyhow::bail!("video source {} requires the ingest-ffmpeg feature", uri)
    }
}

/// Map a device identifier to its device node, if `uri` names one.
pub(crate) fn device_path(uri: &str) -> Option<String> {
    if !uri.is_empty() && uri.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("/dev/video{}", uri));
    }
    if uri.starts_with("/dev/video") {
        return Some(uri.to_string());
    }
    None
}
