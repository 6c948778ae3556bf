use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::ingest::CaptureOptions;
use crate::sinks::{DEFAULT_JPEG_QUALITY, NOTIFY_FUNCTION_DEFAULT};
use crate::stages::{GridConfig, MotionConfig, SamplingConfig};

const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_SOURCE_QUEUE: usize = 250;
const DEFAULT_CAPTURE_FPS: u32 = 10;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_BINARY_THRESHOLD: u8 = 25;
const DEFAULT_PIXEL_THRESHOLD: u32 = 10_000;
const DEFAULT_MOTION_WINDOW: usize = 1;
const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 250;
const DEFAULT_QUIET_MS: u64 = 2_000;
const DEFAULT_COMPOSITE_QUEUE: usize = 16;
pub const DEFAULT_BUCKET: &str = "motion-grid";
const DEFAULT_PREFIX: &str = "grids";
const DEFAULT_SINK_WORKERS: usize = 8;
const DEFAULT_SINK_QUEUE: usize = 16;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1_000;

const PREFIX_PATTERN: &str = r"^[A-Za-z0-9_\-./]+$";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    source: Option<SourceConfigFile>,
    motion: Option<MotionConfigFile>,
    sampling: Option<SamplingConfigFile>,
    grid: Option<GridConfigFile>,
    sink: Option<SinkConfigFile>,
    endpoints: Option<EndpointConfigFile>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    queue_capacity: Option<usize>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    binary_threshold: Option<u8>,
    pixel_threshold: Option<u32>,
    window: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval_ms: Option<u64>,
    quiet_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GridConfigFile {
    rows: Option<u32>,
    columns: Option<u32>,
    border: Option<u32>,
    border_color: Option<[u8; 3]>,
    text_color: Option<[u8; 3]>,
    text_scale: Option<u32>,
    max_cell_width: Option<u32>,
    max_cell_height: Option<u32>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    bucket: Option<String>,
    prefix: Option<String>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    jpeg_quality: Option<u8>,
    function: Option<String>,
    monitoring_instructions: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EndpointConfigFile {
    store: Option<String>,
    trigger: Option<String>,
    timeout_secs: Option<u64>,
}

/// Everything needed to build a `Pipeline`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceSettings,
    pub motion: MotionConfig,
    pub sampling: SamplingConfig,
    pub grid: GridConfig,
    /// Capacity of the queue between the motion pool and the sink pool.
    pub composite_queue: usize,
    pub sink: SinkSettings,
    pub endpoints: EndpointSettings,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub uri: String,
    pub queue_capacity: usize,
    pub capture: CaptureOptions,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub bucket: String,
    pub prefix: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
    pub function: String,
    pub monitoring_instructions: String,
}

#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// S3-compatible object store; local files when unset.
    pub store: Option<String>,
    /// Analysis trigger; invocations are only logged when unset.
    pub trigger: Option<String>,
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty file yields every default.
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// File named by `MOTION_GRID_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MOTION_GRID_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let source_file = file.source.unwrap_or_default();
        let motion_file = file.motion.unwrap_or_default();
        let sampling_file = file.sampling.unwrap_or_default();
        let grid_file = file.grid.unwrap_or_default();
        let sink_file = file.sink.unwrap_or_default();
        let endpoint_file = file.endpoints.unwrap_or_default();
        let grid_defaults = GridConfig::default();

        Self {
            source: SourceSettings {
                uri: source_file
                    .uri
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                queue_capacity: source_file.queue_capacity.unwrap_or(DEFAULT_SOURCE_QUEUE),
                capture: CaptureOptions {
                    width: source_file.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                    height: source_file.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                    target_fps: source_file.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                },
            },
            motion: MotionConfig {
                binary_threshold: motion_file
                    .binary_threshold
                    .unwrap_or(DEFAULT_BINARY_THRESHOLD),
                pixel_threshold: motion_file
                    .pixel_threshold
                    .unwrap_or(DEFAULT_PIXEL_THRESHOLD),
                window: motion_file.window.unwrap_or(DEFAULT_MOTION_WINDOW),
            },
            sampling: SamplingConfig {
                interval: Duration::from_millis(
                    sampling_file
                        .interval_ms
                        .unwrap_or(DEFAULT_SAMPLING_INTERVAL_MS),
                ),
                quiet: Duration::from_millis(sampling_file.quiet_ms.unwrap_or(DEFAULT_QUIET_MS)),
            },
            grid: GridConfig {
                rows: grid_file.rows.unwrap_or(grid_defaults.rows),
                columns: grid_file.columns.unwrap_or(grid_defaults.columns),
                border: grid_file.border.unwrap_or(grid_defaults.border),
                border_color: grid_file.border_color.unwrap_or(grid_defaults.border_color),
                text_color: grid_file.text_color.unwrap_or(grid_defaults.text_color),
                text_scale: grid_file.text_scale.unwrap_or(grid_defaults.text_scale),
                max_cell_width: grid_file
                    .max_cell_width
                    .unwrap_or(grid_defaults.max_cell_width),
                max_cell_height: grid_file
                    .max_cell_height
                    .unwrap_or(grid_defaults.max_cell_height),
            },
            composite_queue: grid_file.queue_capacity.unwrap_or(DEFAULT_COMPOSITE_QUEUE),
            sink: SinkSettings {
                bucket: sink_file
                    .bucket
                    .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                prefix: sink_file
                    .prefix
                    .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
                workers: sink_file.workers.unwrap_or(DEFAULT_SINK_WORKERS),
                queue_capacity: sink_file.queue_capacity.unwrap_or(DEFAULT_SINK_QUEUE),
                jpeg_quality: sink_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                function: sink_file
                    .function
                    .unwrap_or_else(|| NOTIFY_FUNCTION_DEFAULT.to_string()),
                monitoring_instructions: sink_file.monitoring_instructions.unwrap_or_default(),
            },
            endpoints: EndpointSettings {
                store: endpoint_file.store,
                trigger: endpoint_file.trigger,
                timeout: Duration::from_secs(
                    endpoint_file
                        .timeout_secs
                        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                ),
            },
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_value("MOTION_GRID_SOURCE") {
            self.source.uri = source;
        }
        if let Some(bucket) = env_value("MOTION_GRID_BUCKET") {
            self.sink.bucket = bucket;
        }
        if let Some(prefix) = env_value("MOTION_GRID_PREFIX") {
            self.sink.prefix = prefix;
        }
        if let Some(workers) = env_value("MOTION_GRID_SINK_WORKERS") {
            self.sink.workers = workers
                .parse()
                .map_err(|_| anyhow!("MOTION_GRID_SINK_WORKERS must be a positive integer"))?;
        }
        if let Ok(instructions) = std::env::var("MOTION_GRID_INSTRUCTIONS") {
            self.sink.monitoring_instructions = instructions;
        }
        if let Some(endpoint) = env_value("MOTION_GRID_STORE_ENDPOINT") {
            self.endpoints.store = Some(endpoint);
        }
        if let Some(endpoint) = env_value("MOTION_GRID_TRIGGER_ENDPOINT") {
            self.endpoints.trigger = Some(endpoint);
        }
        if let Some(function) = env_value("MOTION_GRID_FUNCTION") {
            self.sink.function = function;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        if self.source.queue_capacity == 0 {
            return Err(anyhow!("source queue capacity must be greater than zero"));
        }
        if self.source.capture.width == 0 || self.source.capture.height == 0 {
            return Err(anyhow!("capture dimensions must be non-zero"));
        }
        if self.motion.window == 0 {
            return Err(anyhow!("motion window must be at least 1"));
        }
        if self.sampling.quiet.is_zero() {
            return Err(anyhow!("quiet threshold must be greater than zero"));
        }
        if self.grid.rows == 0 || self.grid.columns == 0 {
            return Err(anyhow!(
                "grid must be at least 1x1, got {}x{}",
                self.grid.rows,
                self.grid.columns
            ));
        }
        if self.grid.max_cell_width == 0 || self.grid.max_cell_height == 0 {
            return Err(anyhow!("maximum cell size must be non-zero"));
        }
        if self.composite_queue == 0 || self.sink.queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be greater than zero"));
        }
        if self.sink.workers == 0 {
            return Err(anyhow!("sink workers must be greater than zero"));
        }
        if !(1..=100).contains(&self.sink.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.sink.bucket.trim().is_empty() {
            return Err(anyhow!("bucket must not be empty"));
        }
        validate_prefix(&self.sink.prefix)?;
        if self.sink.function.trim().is_empty() {
            return Err(anyhow!("trigger function must not be empty"));
        }
        for (name, endpoint) in [
            ("store", &self.endpoints.store),
            ("trigger", &self.endpoints.trigger),
        ] {
            if let Some(endpoint) = endpoint {
                Url::parse(endpoint)
                    .map_err(|e| anyhow!("invalid {} endpoint '{}': {}", name, endpoint, e))?;
            }
        }
        Ok(())
    }
}

/// Storage key prefixes are limited to path-safe characters.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let pattern = Regex::new(PREFIX_PATTERN)?;
    if !pattern.is_match(prefix) {
        return Err(anyhow!(
            "storage prefix '{}' must match {}",
            prefix,
            PREFIX_PATTERN
        ));
    }
    if prefix.split('/').any(|part| part == "..") {
        return Err(anyhow!("storage prefix '{}' must not contain '..'", prefix));
    }
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.source.uri, DEFAULT_SOURCE);
        assert_eq!(cfg.source.queue_capacity, 250);
        assert_eq!(cfg.motion.window, 1);
        assert_eq!(cfg.motion.pixel_threshold, 10_000);
        assert_eq!(cfg.motion.binary_threshold, 25);
        assert_eq!(cfg.sampling.interval, Duration::from_millis(250));
        assert_eq!(cfg.sampling.quiet, Duration::from_secs(2));
        assert_eq!((cfg.grid.rows, cfg.grid.columns), (13, 3));
        assert_eq!(cfg.sink.workers, 8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn prefix_must_be_path_safe() {
        assert!(validate_prefix("camera-1/grids").is_ok());
        assert!(validate_prefix("a_b.c").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("with space").is_err());
        assert!(validate_prefix("../escape").is_err());
    }

    #[test]
    fn zero_grid_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.grid.columns = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.endpoints.trigger = Some("::nope".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_and_json_files_parse() -> Result<()> {
        let toml_file: PipelineConfigFile = toml::from_str(
            "[grid]\nrows = 2\ncolumns = 4\n[sampling]\nquiet_ms = 500\n",
        )?;
        let cfg = PipelineConfig::from_file(toml_file);
        assert_eq!((cfg.grid.rows, cfg.grid.columns), (2, 4));
        assert_eq!(cfg.sampling.quiet, Duration::from_millis(500));

        let json_file: PipelineConfigFile =
            serde_json::from_str(r#"{"sink": {"workers": 3, "prefix": "p"}}"#)?;
        let cfg = PipelineConfig::from_file(json_file);
        assert_eq!(cfg.sink.workers, 3);
        assert_eq!(cfg.sink.prefix, "p");
        Ok(())
    }
}
