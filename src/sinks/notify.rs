use anyhow::Result;
use rand::RngCore;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::frame::{Frame, ANALYSIS_RESULT};
use crate::processor::FrameProcessor;
use crate::trigger::{AnalysisTrigger, InvocationMode};

pub const NOTIFY_FUNCTION_DEFAULT: &str = "motion-grid-agent";

/// Tells the analysis service about every stored composite.
///
/// Frames without a storage key pass through untouched. Trigger failures
/// are logged and swallowed so one lost notification never stalls the
/// stream.
pub struct NotificationSink {
    trigger: Arc<dyn AnalysisTrigger>,
    function: String,
    monitoring_instructions: String,
    session_id: String,
}

impl NotificationSink {
    pub fn new(
        trigger: Arc<dyn AnalysisTrigger>,
        function: &str,
        monitoring_instructions: &str,
    ) -> Self {
        Self {
            trigger,
            function: function.to_string(),
            monitoring_instructions: monitoring_instructions.to_string(),
            session_id: new_session_id(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn describe(&self, storage_key: &str) -> String {
        format!(
            "Motion detected - the following image grid was captured: {}. \
             <additional_monitoring_instructions>{}</additional_monitoring_instructions>",
            storage_key, self.monitoring_instructions
        )
    }

    pub fn payload(&self, description: &str) -> Value {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let query = format!(
            "Timestamp: {}. \ninput:{}\nRespond with the final answer to the input:",
            stamp, description
        );
        json!({
            "body": {
                "query": query,
                "session_id": self.session_id,
            }
        })
    }
}

/// `motion_` followed by 32 random hex characters.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("motion_{}", hex::encode(bytes))
}

impl FrameProcessor for NotificationSink {
    fn name(&self) -> &str {
        "notification_sink"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Option<Frame>> {
        let Some(key) = frame.metadata.storage_key().map(str::to_string) else {
            log::info!(
                "frame #{} has no storage key, skipping notification",
                frame.index
            );
            return Ok(Some(frame));
        };

        let payload = self.payload(&self.describe(&key));
        match self
            .trigger
            .invoke(&self.function, &payload, InvocationMode::Event)
        {
            Ok(ack) => {
                log::debug!("frame #{}: trigger acknowledged: {}", frame.index, ack);
                frame.metadata.insert(ANALYSIS_RESULT, ack);
            }
            Err(err) => {
                log::error!(
                    "frame #{}: notifying {} failed: {:#}",
                    frame.index,
                    self.function,
                    err
                );
            }
        }
        Ok(Some(frame))
    }
}
