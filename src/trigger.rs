//! Analysis trigger: hands a composite description to the external
//! reasoning service.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// Acknowledgement text returned for fire-and-forget invocations.
pub const EVENT_ACK: &str = "Invoke agent triggered.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationMode {
    /// Wait for the function's answer.
    RequestResponse,
    /// Queue the invocation and return immediately.
    Event,
}

impl InvocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationMode::RequestResponse => "RequestResponse",
            InvocationMode::Event => "Event",
        }
    }
}

pub trait AnalysisTrigger: Send + Sync {
    /// Invoke `function` with `payload`. Returns the parsed answer for
    /// `RequestResponse`, or the acknowledgement from `event_ack()` for `Event`.
    fn invoke(&self, function: &str, payload: &Value, mode: InvocationMode) -> Result<Value>;
}

/// The acknowledgement recorded for `InvocationMode::Event`.
pub fn event_ack() -> Value {
    json!({ "answer": EVENT_ACK, "source": "" })
}

/// Invokes functions over HTTP:
/// `POST <endpoint>/functions/<function>/invocations` with `X-Invocation-Type`.
pub struct HttpTrigger {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpTrigger {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid trigger endpoint {}", endpoint))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { endpoint, agent })
    }

    pub fn invocation_url(&self, function: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("trigger endpoint {} cannot be a base", self.endpoint))?
            .pop_if_empty()
            .extend(["functions", function, "invocations"]);
        Ok(url)
    }
}

impl AnalysisTrigger for HttpTrigger {
    fn invoke(&self, function: &str, payload: &Value, mode: InvocationMode) -> Result<Value> {
        let url = self.invocation_url(function)?;
        let body = serde_json::to_string(payload)?;
        let response = self
            .agent
            .post(url.as_str())
            .set("Content-Type", "application/json")
            .set("X-Invocation-Type", mode.as_str())
            .send_string(&body)
            .with_context(|| format!("invoke {} ({})", function, mode.as_str()))?;
        let text = response
            .into_string()
            .with_context(|| format!("read response from {}", function))?;
        log::debug!("trigger {} responded: {}", function, text);

        match mode {
            InvocationMode::Event => Ok(event_ack()),
            InvocationMode::RequestResponse => serde_json::from_str(&text)
                .with_context(|| format!("decode response from {}", function)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub function: String,
    pub payload: Value,
    pub mode: InvocationMode,
}

/// Logs invocations instead of calling a service.
///
/// `new()` keeps every invocation for inspection, which suits tests and
/// bounded demo runs. Long-running processes use `with_history` so memory
/// stays flat on an unbounded stream.
#[derive(Default)]
pub struct LogTrigger {
    invocations: Mutex<VecDeque<Invocation>>,
    /// Most recent invocations kept; `None` keeps all of them.
    history: Option<usize>,
}

impl LogTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the `limit` most recent invocations (0 keeps none).
    pub fn with_history(limit: usize) -> Self {
        Self {
            invocations: Mutex::new(VecDeque::with_capacity(limit)),
            history: Some(limit),
        }
    }

    /// Recorded invocations, oldest first.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|calls| calls.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl AnalysisTrigger for LogTrigger {
    fn invoke(&self, function: &str, payload: &Value, mode: InvocationMode) -> Result<Value> {
        log::info!("trigger {} ({}): {}", function, mode.as_str(), payload);
        if self.history != Some(0) {
            let mut calls = self
                .invocations
                .lock()
                .map_err(|_| anyhow!("log trigger lock poisoned"))?;
            calls.push_back(Invocation {
                function: function.to_string(),
                payload: payload.clone(),
                mode,
            });
            if let Some(limit) = self.history {
                while calls.len() > limit {
                    calls.pop_front();
                }
            }
        }
        Ok(match mode {
            InvocationMode::Event => event_ack(),
            InvocationMode::RequestResponse => json!({ "answer": "", "source": "" }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_url_appends_function_path() -> Result<()> {
        let trigger = HttpTrigger::new("http://127.0.0.1:9001/", Duration::from_secs(1))?;
        assert_eq!(
            trigger.invocation_url("agent-invoke")?.as_str(),
            "http://127.0.0.1:9001/functions/agent-invoke/invocations"
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_endpoint() {
        assert!(HttpTrigger::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn http_event_invocation_posts_payload_and_acks() -> Result<()> {
        let server = crate::http_stub::serve_once(202, "")?;
        let trigger = HttpTrigger::new(&server.base_url, Duration::from_secs(5))?;
        let payload = json!({"body": {"query": "q", "session_id": "motion_1"}});
        let ack = trigger.invoke("agent", &payload, InvocationMode::Event)?;
        assert_eq!(ack, event_ack());

        let request = server.request()?;
        assert_eq!(
            request.request_line,
            "POST /functions/agent/invocations HTTP/1.1"
        );
        assert_eq!(
            request.headers.get("x-invocation-type").map(String::as_str),
            Some("Event")
        );
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let sent: Value = serde_json::from_slice(&request.body)?;
        assert_eq!(sent, payload);
        Ok(())
    }

    #[test]
    fn http_request_response_returns_parsed_body() -> Result<()> {
        let server =
            crate::http_stub::serve_once(200, r#"{"answer":"a person at the door","source":"cam"}"#)?;
        let trigger = HttpTrigger::new(&server.base_url, Duration::from_secs(5))?;
        let answer = trigger.invoke("agent", &json!({}), InvocationMode::RequestResponse)?;
        assert_eq!(answer["answer"], "a person at the door");

        let request = server.request()?;
        assert_eq!(
            request.headers.get("x-invocation-type").map(String::as_str),
            Some("RequestResponse")
        );
        Ok(())
    }

    #[test]
    fn http_error_status_is_an_error() -> Result<()> {
        let server = crate::http_stub::serve_once(500, r#"{"message":"boom"}"#)?;
        let trigger = HttpTrigger::new(&server.base_url, Duration::from_secs(5))?;
        assert!(trigger
            .invoke("agent", &json!({}), InvocationMode::Event)
            .is_err());
        server.request()?;
        Ok(())
    }

    #[test]
    fn bounded_history_keeps_most_recent_invocations() -> Result<()> {
        let trigger = LogTrigger::with_history(3);
        for i in 0..10 {
            trigger.invoke("agent", &json!({ "n": i }), InvocationMode::Event)?;
        }
        let kept: Vec<Value> = trigger
            .invocations()
            .into_iter()
            .map(|call| call.payload["n"].clone())
            .collect();
        assert_eq!(kept, vec![json!(7), json!(8), json!(9)]);

        let silent = LogTrigger::with_history(0);
        for i in 0..100 {
            let ack = silent.invoke("agent", &json!({ "n": i }), InvocationMode::Event)?;
            assert_eq!(ack, event_ack());
        }
        assert!(silent.invocations().is_empty());
        Ok(())
    }

    #[test]
    fn log_trigger_records_and_acks_events() -> Result<()> {
        let trigger = LogTrigger::new();
        let ack = trigger.invoke("agent", &json!({"body": {}}), InvocationMode::Event)?;
        assert_eq!(ack["answer"], EVENT_ACK);
        let calls = trigger.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function, "agent");
        assert_eq!(calls[0].mode, InvocationMode::Event);
        Ok(())
    }
}
