use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{BusError, EventBus, OutboundEvent, job_channel};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus that also keeps every publication for inspection
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    log: Mutex<Vec<(String, String)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Payloads published on `channel`, oldest first
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Decoded outbound events of `job_id`, oldest first
    pub fn events(&self, job_id: &str) -> Vec<OutboundEvent> {
        self.published(&job_channel(job_id))
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("Undecodable payload on job:{job_id}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Polls until `channel` has a subscriber or `timeout` elapses
    pub async fn wait_for_subscriber(&self, channel: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.subscriber_count(channel) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.log
            .lock()
            .push((channel.to_string(), payload.clone()));
        // No subscribers is fine, same as PUBLISH to an empty channel
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let rx = self.sender(channel).subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Memory bus subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
