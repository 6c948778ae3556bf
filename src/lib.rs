//! Motion Grid
//!
//! Turns a continuous video stream into discrete motion events: composite
//! grid images bundling the frames sampled during a period of motion, stored
//! in an object store and announced to an external analysis service.
//!
//! # Architecture
//!
//! The pipeline is a chain of stateful frame processors run by thread pools
//! connected through bounded queues:
//!
//! 1. **Capture**: a dedicated thread reads frames and blocks (never drops)
//!    when the downstream queue is full.
//! 2. **Motion**: a single worker runs motion detection, temporal sampling
//!    and grid aggregation. Stage state never leaves that worker.
//! 3. **Sink**: a fan-out pool encodes and stores each composite, then fires
//!    a notification. Losing a notification never stalls the stream.
//!
//! Shutdown is cooperative: a shared running flag, a bounded grace period
//! per thread, then queue drain.
//!
//! # Module Structure
//!
//! - `frame`: the `Frame` record and its metadata keys
//! - `processor`: `FrameProcessor` trait and `FrameProcessorChain`
//! - `stages`: motion detection, temporal sampling, grid aggregation
//! - `ingest`: video capture backends
//! - `source`, `pool`: the capture thread and worker pools
//! - `storage`, `trigger`, `sinks`: persistence and notification
//! - `pipeline`, `config`: wiring and the operator surface

pub mod config;
pub mod frame;
#[cfg(test)]
mod http_stub;
pub mod ingest;
mod lifecycle;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod sinks;
pub mod source;
pub mod stages;
pub mod storage;
pub mod trigger;

pub use config::PipelineConfig;
pub use frame::{Frame, FrameMetadata};
pub use ingest::{open_capture, CaptureOptions, VideoCapture};
pub use lifecycle::RunState;
pub use pipeline::{Pipeline, PipelineState, PipelineStatus, StopHandle};
pub use pool::{PoolConfig, PoolStats, ProcessorPool};
pub use processor::{FrameProcessor, FrameProcessorChain, ProcessorFactory};
pub use source::{CaptureFactory, SourceConfig, SourceStats, StreamSource};
pub use storage::{FsObjectStore, HttpObjectStore, MemoryObjectStore, ObjectStore};
pub use trigger::{AnalysisTrigger, HttpTrigger, InvocationMode, LogTrigger};
