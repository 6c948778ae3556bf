//! Frame processor trait and chain composition.
//!
//! Every pipeline stage implements `FrameProcessor`. Returning `Ok(None)`
//! ends the frame's path through the chain (filtering or buffering stages);
//! returning `Err` is a processing error and is fatal to the worker running it.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::frame::Frame;

/// A single-input, single-or-no-output frame transformation.
///
/// Implementations keep their history in `self`, never in the frame. A stage
/// must not touch a frame's image after handing the frame back.
pub trait FrameProcessor: Send {
    /// Stage identifier used in logs and error context.
    fn name(&self) -> &str;

    /// Process one frame. `Ok(None)` drops the frame.
    fn process(&mut self, frame: Frame) -> Result<Option<Frame>>;
}

/// Builds one independent processor instance per worker.
///
/// Stateful chains (sliding window, sampler clock, grid buffer) must never be
/// shared between workers, so pools take a factory rather than an instance.
pub type ProcessorFactory = Arc<dyn Fn() -> Result<Box<dyn FrameProcessor>> + Send + Sync>;

/// Wrap a closure as a `ProcessorFactory`.
pub fn factory<F>(build: F) -> ProcessorFactory
where
    F: Fn() -> Result<Box<dyn FrameProcessor>> + Send + Sync + 'static,
{
    Arc::new(build)
}

/// Ordered composition of stages. Itself a `FrameProcessor`, so chains nest.
pub struct FrameProcessorChain {
    name: String,
    stages: Vec<Box<dyn FrameProcessor>>,
}

impl FrameProcessorChain {
    pub fn new(stages: Vec<Box<dyn FrameProcessor>>) -> Self {
        let name = stages
            .iter()
            .map(|stage| stage.name())
            .collect::<Vec<_>>()
            .join(" -> ");
        Self { name, stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl FrameProcessor for FrameProcessorChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let mut current = frame;
        for stage in self.stages.iter_mut() {
            let index = current.index;
            match stage
                .process(current)
                .with_context(|| format!("stage {} failed on frame #{}", stage.name(), index))?
            {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
