use std::future::Future;
use std::time::Duration;

use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Serialize;

use crate::types::Event;

const EXCHANGE_NAME: &str = "scholaris.events";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("broker refused the event")]
    Nacked,
    #[error("no broker confirmation within {0:?}")]
    TimedOut(Duration),
}

/// Topic exchange publisher with broker confirms.
///
/// Every publish waits for the broker's ack, bounded by `publish_timeout`, so
/// a stalled broker costs callers at most that long.
#[derive(Clone)]
pub struct RabbitMQClient {
    channel: Channel,
    publish_timeout: Duration,
}

impl RabbitMQClient {
    pub async fn connect(url: &str, publish_timeout: Duration) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(exchange = EXCHANGE_NAME, ?publish_timeout, "connected to RabbitMQ");
        Ok(Self { channel, publish_timeout })
    }

    pub async fn publish<T: Serialize>(&self, routing_key: &str, event: &Event<T>) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;

        with_deadline(self.publish_timeout, async {
            let confirmation = self
                .channel
                .basic_publish(
                    EXCHANGE_NAME,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(2),
                )
                .await?
                .await?;
            if confirmation.is_nack() {
                return Err(PublishError::Nacked);
            }
            Ok(())
        })
        .await?;

        tracing::debug!(routing_key = %routing_key, event_id = %event.id, "event published");
        Ok(())
    }
}

async fn with_deadline<F>(limit: Duration, publish: F) -> Result<(), PublishError>
where
    F: Future<Output = Result<(), PublishError>>,
{
    tokio::time::timeout(limit, publish)
        .await
        .map_err(|_| PublishError::TimedOut(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_broker_times_out() {
        let limit = Duration::from_millis(20);
        let err = with_deadline(limit, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, PublishError::TimedOut(d) if d == limit));
    }

    #[tokio::test]
    async fn broker_outcome_passes_through() {
        let limit = Duration::from_secs(1);
        assert!(with_deadline(limit, async { Ok(()) }).await.is_ok());

        let err = with_deadline(limit, async { Err(PublishError::Nacked) }).await.unwrap_err();
        assert!(matches!(err, PublishError::Nacked));
        assert_eq!(err.to_string(), "broker refused the event");
    }
}
