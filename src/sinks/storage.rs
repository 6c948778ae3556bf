use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::frame::{Frame, STORAGE_KEY};
use crate::processor::FrameProcessor;
use crate::storage::ObjectStore;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Encodes each frame as JPEG and writes it to `<bucket>/<prefix>/<index>.jpg`.
///
/// Encode and store failures are returned to the caller; there is no retry.
pub struct StorageSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    jpeg_quality: u8,
}

impl StorageSink {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, prefix: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn key_for(&self, index: u64) -> String {
        if self.prefix.is_empty() {
            format!("{}.jpg", index)
        } else {
            format!("{}/{}.jpg", self.prefix, index)
        }
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality)
            .encode_image(&frame.image)
            .with_context(|| format!("encode frame #{} as jpeg", frame.index))?;
        Ok(bytes)
    }
}

impl FrameProcessor for StorageSink {
    fn name(&self) -> &str {
        "storage_sink"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Option<Frame>> {
        let body = self.encode(&frame)?;
        let key = self.key_for(frame.index);
        let metadata = BTreeMap::from([
            ("frame_index".to_string(), frame.index.to_string()),
            ("timestamp".to_string(), frame.timestamp.to_string()),
            ("fps".to_string(), frame.fps.to_string()),
        ]);
        self.store
            .put(&self.bucket, &key, &body, "image/jpeg", &metadata)
            .with_context(|| format!("store frame #{} at {}/{}", frame.index, self.bucket, key))?;

        log::info!(
            "saved frame {} to {}/{} ({} bytes)",
            frame.describe(),
            self.bucket,
            key,
            body.len()
        );
        frame.metadata.insert(STORAGE_KEY, key);
        Ok(Some(frame))
    }
}
