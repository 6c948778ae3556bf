//! V4L2 capture for local camera devices.
//!
//! Negotiates an RGB3 (packed RGB24) format and streams through mmap buffers.
//! Devices that refuse RGB3 are rejected instead of being decoded.

use anyhow::{Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use super::{CaptureOptions, VideoCapture};
use crate::frame::{now_millis, Frame};

pub struct V4l2Capture {
    device_path: String,
    state: V4l2State,
    width: u32,
    height: u32,
    fps: f64,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Capture {
    pub fn open(device_path: &str, options: &CaptureOptions) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = options.width;
        format.height = options.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Capture: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            anyhow::bail!(
                "v4l2 device {} does not support RGB3 capture (offers {})",
                device_path,
                format.fourcc
            );
        }

        let mut fps = options.target_fps as f64;
        if options.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(options.target_fps);
            match device.set_params(&params) {
                Ok(applied) => {
                    let interval = applied.interval;
                    if interval.numerator > 0 {
                        fps = interval.denominator as f64 / interval.numerator as f64;
                    }
                }
                Err(err) => log::warn!(
                    "V4l2Capture: failed to set fps on {}: {}",
                    device_path,
                    err
                ),
            }
        }

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Capture: opened {} ({}x{} @ {:.2} fps)",
            device_path,
            format.width,
            format.height,
            fps
        );

        Ok(Self {
            device_path: device_path.to_string(),
            state,
            width: format.width,
            height: format.height,
            fps,
            frame_count: 0,
        })
    }
}

impl VideoCapture for V4l2Capture {
    fn describe(&self) -> String {
        format!("{} (v4l2 {}x{})", self.device_path, self.width, self.height)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let expected = (self.width * self.height * 3) as usize;
        let pixels = self
            .state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map(|(buf, _meta)| buf.get(..expected).map(<[u8]>::to_vec))
            })
            .context("capture v4l2 frame")?
            .with_context(|| {
                format!(
                    "v4l2 buffer from {} is shorter than {} bytes",
                    self.device_path, expected
                )
            })?;

        let image = RgbImage::from_raw(self.width, self.height, pixels)
            .context("v4l2 frame does not match its dimensions")?;
        let index = self.frame_count;
        self.frame_count += 1;
        Ok(Some(Frame::new(image, now_millis(), index, self.fps)))
    }
}
