use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{BusError, EventBus};

/// Redis pub/sub transport
///
/// Publications share one reconnecting connection. Every subscription opens a
/// dedicated pub/sub connection which is closed when its stream is dropped.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(client: redis::Client) -> Result<Self, BusError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        log::debug!("Connected event bus publisher");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        log::trace!("Published on {channel} to {receivers} receiver(s)");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        log::debug!("Subscribed to {channel}");

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    log::warn!("Ignoring non-text message on {channel}: {e}");
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }
}
