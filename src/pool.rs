//! Worker pool running one processor chain per thread.
//!
//! Each worker builds its own chain from the pool's `ProcessorFactory`, pulls
//! frames from the shared input queue and publishes results to the pool's
//! bounded output queue. Stage state never crosses workers, so a stateful
//! chain (motion, sampling, aggregation) must run with exactly one worker to
//! see frames in arrival order.
//!
//! A stage error terminates the worker that hit it. The pool keeps running
//! on the remaining workers and never restarts a failed one.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::lifecycle::{drain, join_with_grace, JoinOutcome, RunState};
use crate::processor::ProcessorFactory;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Worker threads; `None` uses the available parallelism.
    pub workers: Option<usize>,
    pub output_capacity: usize,
    /// How long `stop()` waits for each worker.
    pub grace: Duration,
    /// Receive/send wait per attempt; bounds how fast workers notice `stop()`.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            output_capacity: 64,
            grace: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames taken from the input queue.
    pub processed: u64,
    /// Frames the chain produced.
    pub emitted: u64,
    /// Workers that ended on a stage error or panic.
    pub failed_workers: usize,
    pub live_workers: usize,
}

#[derive(Default)]
struct PoolCounters {
    processed: AtomicU64,
    emitted: AtomicU64,
    failed_workers: AtomicUsize,
    live_workers: AtomicUsize,
}

pub struct ProcessorPool {
    name: String,
    input: Receiver<Frame>,
    factory: ProcessorFactory,
    config: PoolConfig,
    sender: Option<Sender<Frame>>,
    receiver: Receiver<Frame>,
    running: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    state: RunState,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    pub fn new(
        name: impl Into<String>,
        input: Receiver<Frame>,
        factory: ProcessorFactory,
        config: PoolConfig,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(config.output_capacity.max(1));
        Self {
            name: name.into(),
            input,
            factory,
            config,
            sender: Some(sender),
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PoolCounters::default()),
            state: RunState::Idle,
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers `start()` launches.
    pub fn worker_count(&self) -> usize {
        self.config
            .workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    /// Launch the workers. A no-op while running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RunState::Running => return Ok(()),
            RunState::Stopped => {
                return Err(anyhow!(
                    "pool {} was stopped; build a new pool to restart",
                    self.name
                ))
            }
            RunState::Idle => {}
        }
        let sender = self
            .sender
            .take()
            .ok_or_else(|| anyhow!("pool {} output already taken", self.name))?;

        let count = self.worker_count();
        self.running.store(true, Ordering::SeqCst);
        for id in 0..count {
            let worker = Worker {
                pool: self.name.clone(),
                id,
                input: self.input.clone(),
                output: sender.clone(),
                factory: self.factory.clone(),
                running: self.running.clone(),
                counters: self.counters.clone(),
                poll: self.config.poll_interval,
            };
            self.counters.live_workers.fetch_add(1, Ordering::SeqCst);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    self.counters.live_workers.fetch_sub(1, Ordering::SeqCst);
                    self.state = RunState::Running;
                    self.stop();
                    return Err(anyhow!("pool {}: spawn worker {}: {}", self.name, id, err));
                }
            }
        }
        self.state = RunState::Running;
        log::info!("pool {}: started {} workers", self.name, count);
        Ok(())
    }

    /// Stop the workers, wait for them, and drain the output queue.
    /// A no-op unless running.
    pub fn stop(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        let label = format!("pool {}", self.name);
        let mut detached = 0;
        for handle in self.workers.drain(..) {
            if join_with_grace(handle, self.config.grace, &label) == JoinOutcome::Detached {
                detached += 1;
            }
        }
        let drained = drain(&self.receiver);
        self.state = RunState::Stopped;
        let stats = self.stats();
        log::info!(
            "pool {}: stopped (processed={}, emitted={}, failed_workers={}, detached={}, drained={})",
            self.name,
            stats.processed,
            stats.emitted,
            stats.failed_workers,
            detached,
            drained
        );
    }

    /// Receiving end of the output queue.
    pub fn output(&self) -> Receiver<Frame> {
        self.receiver.clone()
    }

    /// True between `start()` and `stop()`.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            processed: self.counters.processed.load(Ordering::SeqCst),
            emitted: self.counters.emitted.load(Ordering::SeqCst),
            failed_workers: self.counters.failed_workers.load(Ordering::SeqCst),
            live_workers: self.counters.live_workers.load(Ordering::SeqCst),
        }
    }
}

impl Drop for ProcessorPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    pool: String,
    id: usize,
    input: Receiver<Frame>,
    output: Sender<Frame>,
    factory: ProcessorFactory,
    running: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    poll: Duration,
}

/// Keeps the live/failed counters right however the worker exits,
/// including by panic.
struct WorkerGuard {
    counters: Arc<PoolCounters>,
    clean_exit: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.counters.live_workers.fetch_sub(1, Ordering::SeqCst);
        if !self.clean_exit {
            self.counters.failed_workers.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Worker {
    fn run(self) {
        let mut guard = WorkerGuard {
            counters: self.counters.clone(),
            clean_exit: false,
        };
        match self.process_frames() {
            Ok(()) => {
                guard.clean_exit = true;
                log::debug!("pool {}: worker {} exited", self.pool, self.id);
            }
            Err(err) => {
                log::error!(
                    "pool {}: worker {} terminated: {:#}",
                    self.pool,
                    self.id,
                    err
                );
            }
        }
    }

    fn process_frames(&self) -> Result<()> {
        let mut chain = (self.factory)()?;
        log::debug!(
            "pool {}: worker {} running {}",
            self.pool,
            self.id,
            chain.name()
        );

        while self.running.load(Ordering::SeqCst) {
            let frame = match self.input.recv_timeout(self.poll) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.counters.processed.fetch_add(1, Ordering::SeqCst);

            // FrameProcessorChain already names the stage and frame index.
            let Some(out) = chain.process(frame)? else {
                continue;
            };
            self.counters.emitted.fetch_add(1, Ordering::SeqCst);
            if !self.publish(out) {
                break;
            }
        }
        Ok(())
    }

    /// Blocks while the output queue is full. False when the pool is
    /// stopping or the output has no receiver left.
    fn publish(&self, frame: Frame) -> bool {
        let mut pending = frame;
        loop {
            match self.output.send_timeout(pending, self.poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(frame)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return false;
                    }
                    pending = frame;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{factory, FrameProcessor};
    use image::RgbImage;
    use std::time::Instant;

    struct KeepEven;

    impl FrameProcessor for KeepEven {
        fn name(&self) -> &str {
            "keep_even"
        }

        fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
            Ok((frame.index % 2 == 0).then_some(frame))
        }
    }

    struct FailOn(u64);

    impl FrameProcessor for FailOn {
        fn name(&self) -> &str {
            "fail_on"
        }

        fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
            if frame.index == self.0 {
                anyhow::bail!("bad frame");
            }
            Ok(Some(frame))
        }
    }

    struct Explode;

    impl FrameProcessor for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn process(&mut self, _frame: Frame) -> Result<Option<Frame>> {
            panic!("stage panicked")
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(RgbImage::new(2, 2), index * 100, index, 10.0)
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers: Some(workers),
            output_capacity: 16,
            ..PoolConfig::default()
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn single_worker_preserves_order_and_filters() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let mut pool = ProcessorPool::new("even", rx, factory(|| Ok(Box::new(KeepEven))), config(1));
        let out = pool.output();
        pool.start()?;
        for i in 0..6 {
            tx.send(frame(i))?;
        }
        let got: Vec<u64> = (0..3)
            .map(|_| out.recv_timeout(Duration::from_secs(2)).map(|f| f.index))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(got, vec![0, 2, 4]);
        assert!(wait_until(Duration::from_secs(2), || pool.stats().processed == 6));
        assert_eq!(pool.stats().emitted, 3);
        pool.stop();
        Ok(())
    }

    #[test]
    fn several_workers_process_every_frame() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let mut pool = ProcessorPool::new(
            "fanout",
            rx,
            factory(|| Ok(Box::new(crate::processor::FrameProcessorChain::new(Vec::new())))),
            config(4),
        );
        let out = pool.output();
        pool.start()?;
        for i in 0..40 {
            tx.send(frame(i))?;
        }
        let mut got: Vec<u64> = (0..40)
            .map(|_| out.recv_timeout(Duration::from_secs(2)).map(|f| f.index))
            .collect::<std::result::Result<_, _>>()?;
        got.sort_unstable();
        assert_eq!(got, (0..40).collect::<Vec<_>>());
        assert_eq!(pool.stats().live_workers, 4);
        pool.stop();
        assert_eq!(pool.stats().live_workers, 0);
        Ok(())
    }

    #[test]
    fn stage_error_terminates_only_that_worker() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let mut pool = ProcessorPool::new("fragile", rx, factory(|| Ok(Box::new(FailOn(1)))), config(1));
        pool.start()?;
        tx.send(frame(0))?;
        tx.send(frame(1))?;
        tx.send(frame(2))?;
        assert!(wait_until(Duration::from_secs(2), || pool.stats().failed_workers == 1));
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.processed, 2);
        assert!(pool.running());
        pool.stop();
        Ok(())
    }

    #[test]
    fn worker_error_names_frame_once() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let (out_tx, _out_rx) = crossbeam_channel::bounded(4);
        let worker = Worker {
            pool: "fragile".to_string(),
            id: 0,
            input: rx,
            output: out_tx,
            factory: factory(|| {
                Ok(Box::new(crate::processor::FrameProcessorChain::new(vec![
                    Box::new(FailOn(3)) as Box<dyn FrameProcessor>,
                ])))
            }),
            running: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(PoolCounters::default()),
            poll: Duration::from_millis(10),
        };
        tx.send(frame(3))?;
        let err = worker.process_frames().expect_err("stage fails");
        let msg = format!("{:#}", err);
        assert_eq!(msg.matches("#3").count(), 1, "{msg}");
        assert!(msg.contains("fail_on"), "{msg}");
        assert!(msg.contains("bad frame"), "{msg}");
        Ok(())
    }

    #[test]
    fn panicking_stage_counts_as_failed_worker() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let mut pool = ProcessorPool::new("panicky", rx, factory(|| Ok(Box::new(Explode))), config(2));
        pool.start()?;
        tx.send(frame(0))?;
        assert!(wait_until(Duration::from_secs(2), || pool.stats().failed_workers == 1));
        assert_eq!(pool.stats().live_workers, 1);
        pool.stop();
        Ok(())
    }

    #[test]
    fn disconnected_input_ends_workers_cleanly() -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut pool = ProcessorPool::new("short", rx, factory(|| Ok(Box::new(KeepEven))), config(2));
        pool.start()?;
        drop(tx);
        assert!(wait_until(Duration::from_secs(2), || pool.stats().live_workers == 0));
        assert_eq!(pool.stats().failed_workers, 0);
        pool.stop();
        Ok(())
    }

    #[test]
    fn stop_is_idempotent_and_safe_before_start() {
        let (_tx, rx) = crossbeam_channel::bounded(4);
        let mut pool = ProcessorPool::new("idle", rx, factory(|| Ok(Box::new(KeepEven))), config(1));
        pool.stop();
        pool.stop();
        assert_eq!(pool.state(), RunState::Idle);
    }
}
