//! Stream capture on a dedicated thread.
//!
//! `StreamSource` reads frames from a `VideoCapture` and publishes them on a
//! bounded channel. When the channel is full the capture thread waits and
//! retries; it never drops a frame to relieve pressure.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::ingest::{open_capture, CaptureOptions, VideoCapture};
use crate::lifecycle::{drain, join_with_grace, RunState};

/// Opens the capture on the capture thread.
pub type CaptureFactory = Box<dyn FnOnce() -> Result<Box<dyn VideoCapture>> + Send>;

#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub queue_capacity: usize,
    pub capture: CaptureOptions,
    /// How long `stop()` waits for the capture thread.
    pub grace: Duration,
    /// Wait per attempt while the output queue is full.
    pub retry_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 250,
            capture: CaptureOptions::default(),
            grace: Duration::from_secs(1),
            retry_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Frames published to the output queue.
    pub frames_captured: u64,
    /// Index of the most recently published frame.
    pub last_index: Option<u64>,
    /// Capture ended because the source failed to open or to read.
    pub capture_failed: bool,
}

#[derive(Default)]
struct SourceCounters {
    frames_captured: AtomicU64,
    // index + 1 of the last published frame, 0 before the first
    last_index: AtomicU64,
    failed: AtomicBool,
}

pub struct StreamSource {
    label: String,
    config: SourceConfig,
    factory: Option<CaptureFactory>,
    sender: Option<Sender<Frame>>,
    receiver: Receiver<Frame>,
    running: Arc<AtomicBool>,
    counters: Arc<SourceCounters>,
    state: RunState,
    join: Option<JoinHandle<()>>,
}

impl StreamSource {
    /// Source reading from `uri` (see `ingest::open_capture`).
    pub fn new(uri: &str, config: SourceConfig) -> Self {
        let uri = uri.to_string();
        let options = config.capture.clone();
        let label = uri.clone();
        let factory: CaptureFactory = Box::new(move || open_capture(&uri, &options));
        Self::build(label, factory, config)
    }

    /// Source reading from a caller-supplied capture.
    pub fn with_capture(factory: CaptureFactory, config: SourceConfig) -> Self {
        Self::build("custom capture".to_string(), factory, config)
    }

    fn build(label: String, factory: CaptureFactory, config: SourceConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        Self {
            label,
            config,
            factory: Some(factory),
            sender: Some(sender),
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SourceCounters::default()),
            state: RunState::Idle,
            join: None,
        }
    }

    /// Launch the capture thread. A no-op while running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RunState::Running => return Ok(()),
            RunState::Stopped => {
                return Err(anyhow!(
                    "stream source {} was stopped; build a new source to restart",
                    self.label
                ))
            }
            RunState::Idle => {}
        }
        let factory = self
            .factory
            .take()
            .ok_or_else(|| anyhow!("stream source {} has no capture", self.label))?;
        let sender = self
            .sender
            .take()
            .ok_or_else(|| anyhow!("stream source {} output already taken", self.label))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let counters = self.counters.clone();
        let retry = self.config.retry_interval;
        let label = self.label.clone();
        let join = std::thread::Builder::new()
            .name("stream-source".to_string())
            .spawn(move || capture_loop(&label, factory, sender, &running, &counters, retry));
        let join = match join {
            Ok(join) => join,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(anyhow!("spawn capture thread: {}", err));
            }
        };
        self.join = Some(join);
        self.state = RunState::Running;
        log::info!("StreamSource: started {}", self.label);
        Ok(())
    }

    /// Stop capture, wait for the thread, and drain the output queue.
    /// A no-op unless running.
    pub fn stop(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join_with_grace(join, self.config.grace, "stream source");
        }
        let drained = drain(&self.receiver);
        self.state = RunState::Stopped;
        log::info!(
            "StreamSource: stopped {} after {} frames ({} unconsumed frames drained)",
            self.label,
            self.counters.frames_captured.load(Ordering::SeqCst),
            drained
        );
    }

    /// Receiving end of the output queue.
    pub fn output(&self) -> Receiver<Frame> {
        self.receiver.clone()
    }

    /// False once capture has ended, on its own or through `stop()`.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> SourceStats {
        let last = self.counters.last_index.load(Ordering::SeqCst);
        SourceStats {
            frames_captured: self.counters.frames_captured.load(Ordering::SeqCst),
            last_index: last.checked_sub(1),
            capture_failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    label: &str,
    factory: CaptureFactory,
    sender: Sender<Frame>,
    running: &AtomicBool,
    counters: &SourceCounters,
    retry: Duration,
) {
    let mut capture = match factory() {
        Ok(capture) => capture,
        Err(err) => {
            log::error!("StreamSource: failed to open {}: {:#}", label, err);
            counters.failed.store(true, Ordering::SeqCst);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };
    log::info!(
        "StreamSource: capturing from {} at {:.2} fps",
        capture.describe(),
        capture.fps()
    );

    'capture: while running.load(Ordering::SeqCst) {
        let frame = match capture.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("StreamSource: end of stream on {}", capture.describe());
                break;
            }
            Err(err) => {
                log::error!(
                    "StreamSource: capture error on {} after frame {:?}: {:#}",
                    capture.describe(),
                    counters.last_index.load(Ordering::SeqCst).checked_sub(1),
                    err
                );
                counters.failed.store(true, Ordering::SeqCst);
                break;
            }
        };

        let index = frame.index;
        let mut pending = frame;
        loop {
            match sender.send_timeout(pending, retry) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(frame)) => {
                    if !running.load(Ordering::SeqCst) {
                        break 'capture;
                    }
                    pending = frame;
                }
                Err(SendTimeoutError::Disconnected(_)) => break 'capture,
            }
        }
        counters.frames_captured.fetch_add(1, Ordering::SeqCst);
        counters.last_index.store(index + 1, Ordering::SeqCst);
    }

    running.store(false, Ordering::SeqCst);
}
