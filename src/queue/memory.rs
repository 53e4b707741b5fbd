use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{QueueError, QueueMessage, WorkQueue};

/// In-process queue with receive/delete semantics
#[derive(Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<QueueMessage>>,
    in_flight: Mutex<HashMap<String, QueueMessage>>,
    next_receipt: AtomicU64,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, body: impl Into<String>) {
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        self.queue.lock().await.push_back(QueueMessage {
            receipt,
            body: body.into(),
        });
        self.notify.notify_one();
    }

    /// Messages waiting to be received
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages received but not deleted yet
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn pop(&self) -> QueueMessage {
        loop {
            if let Some(message) = self.queue.lock().await.pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let Ok(message) = tokio::time::timeout(wait, self.pop()).await else {
            return Ok(None);
        };
        self.in_flight
            .lock()
            .await
            .insert(message.receipt.clone(), message.clone());
        Ok(Some(message))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        if self.in_flight.lock().await.remove(&message.receipt).is_none() {
            log::debug!("Message {} was not in flight", message.receipt);
        }
        Ok(())
    }

    async fn requeue_unacknowledged(&self) -> Result<usize, QueueError> {
        let mut parked: Vec<QueueMessage> =
            self.in_flight.lock().await.drain().map(|(_, m)| m).collect();
        parked.sort_by_key(|m| m.receipt.parse::<u64>().unwrap_or(u64::MAX));

        let count = parked.len();
        let mut queue = self.queue.lock().await;
        for message in parked.into_iter().rev() {
            queue.push_front(message);
        }
        if count > 0 {
            self.notify.notify_one();
        }
        Ok(count)
    }
}
