//! End-to-end pipeline and operator surface.
//!
//! ```text
//! StreamSource -> [queue] -> pool "motion" (1 worker):
//!     MotionDetector -> TemporalSampler -> GridAggregator
//! -> [queue] -> pool "sink" (N workers):
//!     StorageSink -> NotificationSink
//! -> collector
//! ```
//!
//! The motion pool is pinned to one worker: its stages keep per-stream
//! history and must see frames in arrival order. Sink frames are
//! independent, so that pool fans out.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::frame::Frame;
use crate::lifecycle::{join_with_grace, RunState};
use crate::pool::{PoolConfig, ProcessorPool};
use crate::processor::{factory, FrameProcessor, FrameProcessorChain, ProcessorFactory};
use crate::sinks::{NotificationSink, StorageSink};
use crate::source::{SourceConfig, StreamSource};
use crate::stages::{GridAggregator, MotionDetector, TemporalSampler};
use crate::storage::ObjectStore;
use crate::trigger::AnalysisTrigger;

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    /// Stopped by the operator, or the stream ended and every frame was delivered.
    Stopped,
    /// The capture failed or at least one worker ended on a processing error.
    Error,
}

/// Snapshot for status displays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub source_running: bool,
    pub capture_failed: bool,
    pub last_frame_index: Option<u64>,
    pub frames_captured: u64,
    pub composites_emitted: u64,
    pub composites_delivered: u64,
    pub failed_workers: usize,
    pub last_storage_key: Option<String>,
}

/// Requests `Pipeline::wait` to return; safe to use from a signal handler.
#[derive(Clone, Debug)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Delivered {
    count: AtomicU64,
    last_key: Mutex<Option<String>>,
}

pub struct Pipeline {
    source: StreamSource,
    motion: ProcessorPool,
    sink: ProcessorPool,
    results: Receiver<Frame>,
    collector: Option<JoinHandle<()>>,
    collecting: Arc<AtomicBool>,
    delivered: Arc<Delivered>,
    shutdown: StopHandle,
    grace: Duration,
    state: RunState,
}

impl Pipeline {
    pub fn build(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        trigger: Arc<dyn AnalysisTrigger>,
    ) -> Result<Self> {
        config.validate()?;

        let source = StreamSource::new(
            &config.source.uri,
            SourceConfig {
                queue_capacity: config.source.queue_capacity,
                capture: config.source.capture.clone(),
                grace: config.shutdown_grace,
                ..SourceConfig::default()
            },
        );

        let motion = ProcessorPool::new(
            "motion",
            source.output(),
            motion_chain(&config),
            PoolConfig {
                workers: Some(1),
                output_capacity: config.composite_queue,
                grace: config.shutdown_grace,
                ..PoolConfig::default()
            },
        );

        let sink = ProcessorPool::new(
            "sink",
            motion.output(),
            sink_chain(&config, store, trigger),
            PoolConfig {
                workers: Some(config.sink.workers),
                output_capacity: config.sink.queue_capacity,
                grace: config.shutdown_grace,
                ..PoolConfig::default()
            },
        );
        let results = sink.output();

        Ok(Self {
            source,
            motion,
            sink,
            results,
            collector: None,
            collecting: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(Delivered::default()),
            shutdown: StopHandle {
                requested: Arc::new(AtomicBool::new(false)),
            },
            grace: config.shutdown_grace,
            state: RunState::Idle,
        })
    }

    /// Start consumers before producers: sink, motion, then source.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RunState::Running => return Ok(()),
            RunState::Stopped => return Err(anyhow!("pipeline was stopped; build a new one")),
            RunState::Idle => {}
        }
        self.collecting.store(true, Ordering::SeqCst);
        let results = self.results.clone();
        let collecting = self.collecting.clone();
        let delivered = self.delivered.clone();
        let collector = std::thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collect(results, &collecting, &delivered))
            .map_err(|err| anyhow!("spawn collector thread: {}", err))?;
        self.collector = Some(collector);
        self.state = RunState::Running;

        let started = self
            .sink
            .start()
            .and_then(|_| self.motion.start())
            .and_then(|_| self.source.start());
        if let Err(err) = started {
            log::error!("pipeline failed to start: {:#}", err);
            self.stop();
            return Err(err);
        }
        log::info!("pipeline started");
        Ok(())
    }

    /// Stop producers before consumers: source, motion, sink.
    /// A no-op unless running.
    pub fn stop(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        self.shutdown.request_stop();
        self.source.stop();
        self.motion.stop();
        self.sink.stop();
        self.collecting.store(false, Ordering::SeqCst);
        if let Some(collector) = self.collector.take() {
            join_with_grace(collector, self.grace, "collector");
        }
        self.state = RunState::Stopped;
        log::info!("pipeline stopped: {:?}", self.status());
    }

    /// Block until a stop is requested or the stream has ended and every
    /// in-flight frame has left the pools.
    pub fn wait(&self) {
        while !self.wait_timeout(Duration::from_secs(1)) {}
    }

    /// `wait` bounded by `timeout`. Returns true when the pipeline is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    fn is_done(&self) -> bool {
        self.state != RunState::Running || self.shutdown.is_requested() || self.is_drained()
    }

    /// Capture has ended and nothing is left in flight.
    fn is_drained(&self) -> bool {
        let collected = self
            .collector
            .as_ref()
            .map_or(true, |collector| collector.is_finished());
        !self.source.running()
            && self.motion.stats().live_workers == 0
            && self.sink.stats().live_workers == 0
            && collected
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.shutdown.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let source = self.source.stats();
        let motion = self.motion.stats();
        let sink = self.sink.stats();
        let failed_workers = motion.failed_workers + sink.failed_workers;
        let state = match self.state {
            RunState::Idle => PipelineState::Idle,
            _ if failed_workers > 0 || source.capture_failed => PipelineState::Error,
            RunState::Running if self.is_drained() => PipelineState::Stopped,
            RunState::Running => PipelineState::Running,
            RunState::Stopped => PipelineState::Stopped,
        };
        PipelineStatus {
            state,
            source_running: self.source.running(),
            capture_failed: source.capture_failed,
            last_frame_index: source.last_index,
            frames_captured: source.frames_captured,
            composites_emitted: motion.emitted,
            composites_delivered: self.delivered.count.load(Ordering::SeqCst),
            failed_workers,
            last_storage_key: self
                .delivered
                .last_key
                .lock()
                .ok()
                .and_then(|key| key.clone()),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Motion detection, sampling and aggregation for one worker.
pub fn motion_chain(config: &PipelineConfig) -> ProcessorFactory {
    let motion = config.motion.clone();
    let sampling = config.sampling.clone();
    let grid = config.grid.clone();
    factory(move || {
        let stages: Vec<Box<dyn FrameProcessor>> = vec![
            Box::new(MotionDetector::new(motion.clone())),
            Box::new(TemporalSampler::new(sampling.clone())),
            Box::new(GridAggregator::new(grid.clone())),
        ];
        Ok(Box::new(FrameProcessorChain::new(stages)))
    })
}

/// Storage then notification; every worker gets its own notification session.
pub fn sink_chain(
    config: &PipelineConfig,
    store: Arc<dyn ObjectStore>,
    trigger: Arc<dyn AnalysisTrigger>,
) -> ProcessorFactory {
    let sink = config.sink.clone();
    factory(move || {
        let stages: Vec<Box<dyn FrameProcessor>> = vec![
            Box::new(
                StorageSink::new(store.clone(), &sink.bucket, &sink.prefix)
                    .with_quality(sink.jpeg_quality),
            ),
            Box::new(NotificationSink::new(
                trigger.clone(),
                &sink.function,
                &sink.monitoring_instructions,
            )),
        ];
        Ok(Box::new(FrameProcessorChain::new(stages)))
    })
}

fn collect(results: Receiver<Frame>, collecting: &AtomicBool, delivered: &Delivered) {
    while collecting.load(Ordering::SeqCst) {
        let frame = match results.recv_timeout(WAIT_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        delivered.count.fetch_add(1, Ordering::SeqCst);
        let key = frame.metadata.storage_key().map(str::to_string);
        log::info!(
            "composite #{} delivered (grid {:?}, key {:?})",
            frame.index,
            frame.metadata.grid_shape(),
            key
        );
        if let Ok(mut last) = delivered.last_key.lock() {
            *last = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::trigger::LogTrigger;

    fn pipeline() -> Result<Pipeline> {
        let mut config = PipelineConfig::default();
        config.source.uri = "stub://unit?frames=5&width=32&height=32".to_string();
        config.sink.workers = 2;
        Pipeline::build(
            config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(LogTrigger::new()),
        )
    }

    #[test]
    fn idle_status_before_start() -> Result<()> {
        let pipeline = pipeline()?;
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Idle);
        assert_eq!(status.frames_captured, 0);
        assert_eq!(status.last_frame_index, None);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.grid.rows = 0;
        let built = Pipeline::build(
            config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(LogTrigger::new()),
        );
        assert!(built.is_err());
    }

    #[test]
    fn status_serializes_for_display() -> Result<()> {
        let pipeline = pipeline()?;
        let json = serde_json::to_value(pipeline.status())?;
        assert_eq!(json["state"], "idle");
        assert_eq!(json["composites_emitted"], 0);
        Ok(())
    }

    #[test]
    fn capture_failure_is_reported_as_error() -> Result<()> {
        let mut config = PipelineConfig::default();
        config.source.uri = "stub://cam?frames=lots".to_string();
        let mut pipeline = Pipeline::build(
            config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(LogTrigger::new()),
        )?;
        pipeline.start()?;
        assert!(pipeline.wait_timeout(Duration::from_secs(5)));

        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Error);
        assert!(status.capture_failed);
        assert!(!status.source_running);
        assert_eq!(status.frames_captured, 0);
        assert_eq!(status.failed_workers, 0);

        pipeline.stop();
        assert_eq!(pipeline.status().state, PipelineState::Error);
        Ok(())
    }

    #[test]
    fn stop_handle_ends_wait() -> Result<()> {
        let mut pipeline = pipeline()?;
        pipeline.start()?;
        pipeline.stop_handle().request_stop();
        pipeline.wait();
        pipeline.stop();
        assert_eq!(pipeline.status().state, PipelineState::Stopped);
        Ok(())
    }
}
