use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};

use super::{QueueError, QueueMessage, WorkQueue};

/// Reliable list queue: received bodies are parked in `<name>:processing`
/// until deleted
pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
    processing: String,
}

impl RedisQueue {
    pub async fn connect(client: redis::Client, name: &str) -> Result<Self, QueueError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            name: name.to_string(),
            processing: format!("{name}:processing"),
        })
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .blmove(
                &self.name,
                &self.processing,
                Direction::Right,
                Direction::Left,
                wait.as_secs_f64(),
            )
            .await?;

        Ok(body.map(|body| QueueMessage {
            receipt: body.clone(),
            body,
        }))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing, 1, &message.receipt).await?;
        if removed == 0 {
            log::warn!("Message was not found in {}", self.processing);
        }
        Ok(())
    }

    async fn requeue_unacknowledged(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut count = 0;
        // Newest first onto the consuming end, so the oldest is received next
        loop {
            let moved: Option<String> = conn
                .lmove(
                    &self.processing,
                    &self.name,
                    Direction::Left,
                    Direction::Right,
                )
                .await?;
            if moved.is_none() {
                return Ok(count);
            }
            count += 1;
        }
    }
}
