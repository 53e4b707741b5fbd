mod inbound;
mod memory;
mod publisher;
mod redis_bus;

pub use inbound::{InputSubscription, route_inbound};
pub use memory::MemoryBus;
pub use publisher::{EventPublisher, JobEvents};
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code reported with every TERMINATION event
pub const TERMINATION_EXIT_CODE: i32 = 2;

pub const SESSION_CLOSED_REASON: &str = "session closed by client";

/// Channel carrying outbound events of a job
pub fn job_channel(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Channel carrying inbound control events of a job
pub fn input_channel(job_id: &str) -> String {
    format!("input:{job_id}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publish/subscribe transport between workers and the gateway
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscription is active once this returns; dropping the stream unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Stdout,
    Stderr,
    Completion,
    Termination,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metrics {
    /// Wall-clock milliseconds since the stage process was spawned
    #[serde(rename = "executionTime")]
    pub execution_time: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    pub metrics: Metrics,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum EventContent {
    Output(String),
    Outcome(Outcome),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub content: EventContent,
}

impl OutboundEvent {
    pub fn output(job_id: &str, kind: EventType, content: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            content: EventContent::Output(content),
        }
    }

    pub fn completion(job_id: &str, exit_code: i32, execution_time: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: EventType::Completion,
            content: EventContent::Outcome(Outcome {
                exit_code,
                reason: None,
                metrics: Metrics { execution_time },
            }),
        }
    }

    pub fn termination(job_id: &str, reason: String, execution_time: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: EventType::Termination,
            content: EventContent::Outcome(Outcome {
                exit_code: TERMINATION_EXIT_CODE,
                reason: Some(reason),
                metrics: Metrics { execution_time },
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventType::Completion | EventType::Termination)
    }

    /// Text of a STDOUT/STDERR event
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            EventContent::Output(text) => Some(text),
            EventContent::Outcome(_) => None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.content {
            EventContent::Outcome(outcome) => Some(outcome),
            EventContent::Output(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundEvent {
    InputEvent { content: String },
    SessionClosedEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_format() {
        let stdout = OutboundEvent::output("j1", EventType::Stdout, "hi\n".to_string());
        assert_json_eq!(
            serde_json::to_value(&stdout).unwrap(),
            json!({ "job_id": "j1", "type": "STDOUT", "content": "hi\n" })
        );

        let completion = OutboundEvent::completion("j1", 0, 42);
        assert_json_eq!(
            serde_json::to_value(&completion).unwrap(),
            json!({
                "job_id": "j1",
                "type": "COMPLETION",
                "content": { "exitCode": 0, "metrics": { "executionTime": 42 } }
            })
        );

        let termination = OutboundEvent::termination("j1", "memory limit exceeded".into(), 7);
        assert_json_eq!(
            serde_json::to_value(&termination).unwrap(),
            json!({
                "job_id": "j1",
                "type": "TERMINATION",
                "content": {
                    "exitCode": 2,
                    "reason": "memory limit exceeded",
                    "metrics": { "executionTime": 7 }
                }
            })
        );
        assert!(termination.is_terminal());
        assert!(!stdout.is_terminal());
    }

    #[test]
    fn test_outbound_decoding() {
        let payload = r#"{"job_id":"j1","type":"TERMINATION","content":{"exitCode":2,"reason":"x","metrics":{"executionTime":3}}}"#;
        let event: OutboundEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event, OutboundEvent::termination("j1", "x".into(), 3));

        let payload = r#"{"job_id":"j1","type":"STDERR","content":"oops"}"#;
        let event: OutboundEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.text(), Some("oops"));
    }

    #[test]
    fn test_inbound_decoding() {
        let input: InboundEvent =
            serde_json::from_str(r#"{"event_type":"INPUT_EVENT","content":"42\n"}"#).unwrap();
        assert_eq!(
            input,
            InboundEvent::InputEvent {
                content: "42\n".to_string()
            }
        );

        let closed: InboundEvent =
            serde_json::from_str(r#"{"event_type":"SESSION_CLOSED_EVENT"}"#).unwrap();
        assert_eq!(closed, InboundEvent::SessionClosedEvent);

        assert!(serde_json::from_str::<InboundEvent>(r#"{"event_type":"RESIZE"}"#).is_err());
    }

    #[test]
    fn test_channel_naming() {
        assert_eq!(job_channel("abc"), "job:abc");
        assert_eq!(input_channel("abc"), "input:abc");
    }
}
