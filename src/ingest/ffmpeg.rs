//! File and network stream capture using FFmpeg.
//!
//! Decodes the best video track of any input FFmpeg can open (local files,
//! RTSP/HTTP URLs) and converts frames to RGB24 in memory.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{CaptureOptions, VideoCapture};
use crate::frame::{now_millis, Frame};

pub struct FfmpegCapture {
    uri: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    /// Seconds per pts tick as (numerator, denominator).
    time_base: (i64, i64),
    fps: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    input_drained: bool,
}

impl FfmpegCapture {
    pub fn open(uri: &str, options: &CaptureOptions) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&uri)
            .with_context(|| format!("failed to open video source '{}' with ffmpeg", uri))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("video source '{}' has no video track", uri))?;
        let stream_index = input_stream.index();
        let time_base = input_stream.time_base();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            f64::from(rate)
        } else {
            options.target_fps as f64
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegCapture: opened {} ({}x{} @ {:.2} fps)",
            uri,
            decoder.width(),
            decoder.height(),
            fps
        );

        Ok(Self {
            uri: uri.to_string(),
            input,
            stream_index,
            time_base: (time_base.numerator() as i64, time_base.denominator() as i64),
            fps,
            decoder,
            scaler,
            frame_count: 0,
            input_drained: false,
        })
    }

    fn timestamp_ms(&self, pts: Option<i64>) -> u64 {
        let (num, den) = self.time_base;
        match pts {
            Some(pts) if pts >= 0 && den > 0 => (pts * num * 1000 / den) as u64,
            _ => now_millis(),
        }
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let image = RgbImage::from_raw(width, height, pixels)
            .context("decoded frame does not match its dimensions")?;

        let index = self.frame_count;
        self.frame_count += 1;
        Ok(Frame::new(
            image,
            self.timestamp_ms(decoded.timestamp()),
            index,
            self.fps,
        ))
    }
}

impl VideoCapture for FfmpegCapture {
    fn describe(&self) -> String {
        format!("{} (ffmpeg)", self.uri)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.input_drained {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    // flush frames still buffered in the decoder
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.input_drained = true;
                }
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
