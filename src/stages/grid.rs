use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use super::label::{draw_text, text_size};
use crate::frame::{Frame, FrameMetadata};
use crate::processor::FrameProcessor;

/// Segments with fewer buffered frames than this are discarded on motion end.
pub const MIN_COMPOSITE_FRAMES: usize = 3;

/// Grid shape and cell styling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub rows: u32,
    pub columns: u32,
    /// Border around each cell, in pixels. The caption sits in the bottom border.
    pub border: u32,
    pub border_color: [u8; 3],
    pub text_color: [u8; 3],
    /// Integer scale of the 5x7 caption font.
    pub text_scale: u32,
    pub max_cell_width: u32,
    pub max_cell_height: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            rows: 13,
            columns: 3,
            border: 10,
            border_color: [0, 0, 0],
            text_color: [255, 255, 255],
            text_scale: 2,
            max_cell_width: 900,
            max_cell_height: 600,
        }
    }
}

impl GridConfig {
    pub fn capacity(&self) -> usize {
        (self.rows as usize) * (self.columns as usize)
    }
}

/// Buffers sampled frames and emits one composite per full buffer or per
/// closed motion segment.
///
/// Composites get their own index sequence (starting at 0), fps 0, the
/// timestamp of the newest buffered frame, and only a `grid_shape` tag.
pub struct GridAggregator {
    config: GridConfig,
    buffer: Vec<Frame>,
    sequence: u64,
}

impl GridAggregator {
    pub fn new(config: GridConfig) -> Self {
        let capacity = config.capacity().max(1);
        Self {
            config,
            buffer: Vec::with_capacity(capacity),
            sequence: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Index the next composite will carry.
    pub fn next_index(&self) -> u64 {
        self.sequence
    }

    fn flush(&mut self, rows: u32) -> Result<Frame> {
        let frames = std::mem::take(&mut self.buffer);
        log::info!(
            "grid: compositing {} frames into {}x{} (composite #{})",
            frames.len(),
            rows,
            self.config.columns,
            self.sequence
        );
        let image = compose(&frames, rows, &self.config)?;
        let timestamp = frames.last().map(|f| f.timestamp).unwrap_or(0);

        let mut metadata = FrameMetadata::new();
        metadata.set_grid_shape(rows, self.config.columns);
        let composite = Frame::new(image, timestamp, self.sequence, 0.0).with_metadata(metadata);
        self.sequence += 1;
        Ok(composite)
    }
}

impl FrameProcessor for GridAggregator {
    fn name(&self) -> &str {
        "grid_aggregator"
    }

    fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
        if frame.motion_end() {
            let count = self.buffer.len();
            if count < MIN_COMPOSITE_FRAMES {
                log::debug!(
                    "grid: motion end at frame #{} with {} buffered frames, discarding",
                    frame.index,
                    count
                );
                self.buffer.clear();
                return Ok(None);
            }
            log::info!("grid: motion end, buffer size {}", count);
            let columns = self.config.columns.max(1) as usize;
            let rows = count.div_ceil(columns) as u32;
            return self.flush(rows).map(Some);
        }

        self.buffer.push(frame);
        if self.buffer.len() < self.config.capacity() {
            return Ok(None);
        }
        self.flush(self.config.rows).map(Some)
    }
}

// ----------------------------------------------------------------------------
// Compositing
// ----------------------------------------------------------------------------

/// Lay out `frames` row-major on a `rows` x `columns` canvas.
///
/// Every cell must end up with the same dimensions; a mismatch means the
/// source changed resolution mid-segment and is reported as an error.
fn compose(frames: &[Frame], rows: u32, config: &GridConfig) -> Result<RgbImage> {
    let columns = config.columns.max(1);
    if frames.len() > (rows * columns) as usize {
        bail!(
            "{} frames do not fit a {}x{} grid",
            frames.len(),
            rows,
            columns
        );
    }

    let cells = frames
        .iter()
        .map(|frame| fit_cell(annotate(frame, config), config))
        .collect::<Vec<_>>();

    let Some(first) = cells.first() else {
        bail!("cannot composite an empty buffer");
    };
    let (cell_w, cell_h) = first.dimensions();
    for (cell, frame) in cells.iter().zip(frames) {
        if cell.dimensions() != (cell_w, cell_h) {
            bail!(
                "grid cell shape mismatch: frame #{} is {:?}, expected {:?}",
                frame.index,
                cell.dimensions(),
                (cell_w, cell_h)
            );
        }
    }

    // Unfilled cells stay zero (black).
    let mut canvas = RgbImage::new(cell_w * columns, cell_h * rows);
    for (i, cell) in cells.iter().enumerate() {
        let i = i as u32;
        let x = (i % columns) * cell_w;
        let y = (i / columns) * cell_h;
        imageops::replace(&mut canvas, cell, x as i64, y as i64);
    }
    Ok(canvas)
}

/// Pad the frame with a border and caption it in the bottom band.
fn annotate(frame: &Frame, config: &GridConfig) -> RgbImage {
    let caption = frame.describe();
    let (text_w, text_h) = text_size(&caption, config.text_scale.max(1));
    let border = config.border;
    let (w, h) = frame.image.dimensions();

    let out_w = w + 2 * border;
    let out_h = h + 2 * border + text_h;
    let mut out = RgbImage::from_pixel(out_w, out_h, Rgb(config.border_color));
    imageops::replace(&mut out, &frame.image, border as i64, border as i64);

    let text_x = out_w.saturating_sub(text_w) / 2;
    let text_y = h + border + border / 2;
    draw_text(
        &mut out,
        &caption,
        text_x,
        text_y,
        config.text_scale,
        Rgb(config.text_color),
    );
    out
}

/// Downscale (never upscale) to fit within the configured cell bounds.
fn fit_cell(image: RgbImage, config: &GridConfig) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image;
    }
    let scale = f64::min(
        config.max_cell_height as f64 / h as f64,
        config.max_cell_width as f64 / w as f64,
    );
    if scale >= 1.0 {
        return image;
    }
    let new_w = ((w as f64 * scale) as u32).max(1);
    let new_h = ((h as f64 * scale) as u32).max(1);
    imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}
