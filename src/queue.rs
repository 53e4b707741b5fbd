mod memory;
mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

/// A message taken off the queue but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque token that identifies the message for [`WorkQueue::delete`]
    pub receipt: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Source of job submissions
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Waits up to `wait` for one message
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledges a received message so it is never delivered again
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Puts every received but unacknowledged message back at the head of
    /// the queue and returns how many were moved
    async fn requeue_unacknowledged(&self) -> Result<usize, QueueError>;
}
