use scholaris_shared::clients::rabbitmq::RabbitMQClient;
use scholaris_shared::types::event::{payloads, routing_keys, Event};

use crate::models::Message;
use crate::notify::NotificationSink;
use crate::BoxFuture;

pub const SOURCE: &str = "scholaris-messaging";

/// Domain events for downstream consumers (search, analytics, push).
pub trait EventPublisher: Send + Sync {
    fn message_sent(&self, event: Event<payloads::MessageSent>) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub fn message_sent_event(message: &Message) -> Event<payloads::MessageSent> {
    Event::new(
        SOURCE,
        routing_keys::MESSAGING_MESSAGE_SENT,
        payloads::MessageSent {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content_preview: message.preview(),
        },
    )
    .with_tenant(message.tenant_id)
    .with_user(message.sender_id)
}

/// Best effort: a failed publish is logged and otherwise ignored.
pub async fn publish_message_sent(publisher: &dyn EventPublisher, message: &Message) {
    if let Err(e) = publisher.message_sent(message_sent_event(message)).await {
        tracing::error!(error = %e, message_id = %message.id, "failed to publish message.sent event");
    }
}

/// Publishes to the `scholaris.events` topic exchange.
#[derive(Clone)]
pub struct RabbitEventPublisher {
    rabbitmq: RabbitMQClient,
}

impl RabbitEventPublisher {
    pub fn new(rabbitmq: RabbitMQClient) -> Self {
        Self { rabbitmq }
    }
}

impl EventPublisher for RabbitEventPublisher {
    fn message_sent(&self, event: Event<payloads::MessageSent>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.rabbitmq
                .publish(routing_keys::MESSAGING_MESSAGE_SENT, &event)
                .await?;
            Ok(())
        })
    }
}

impl NotificationSink for RabbitEventPublisher {
    fn deliver(&self, notification: payloads::NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let event = Event::new(SOURCE, routing_keys::MESSAGING_CHAT_REQUESTED, notification.clone())
                .with_tenant(notification.tenant_id)
                .with_user(notification.recipient_id);
            self.rabbitmq
                .publish(routing_keys::MESSAGING_CHAT_REQUESTED, &event)
                .await?;
            Ok(())
        })
    }
}

/// Used when no broker is configured: events only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyPublisher;

impl EventPublisher for LogOnlyPublisher {
    fn message_sent(&self, event: Event<payloads::MessageSent>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            tracing::debug!(event_id = %event.id, message_id = %event.data.message_id, "message.sent (not published)");
            Ok(())
        })
    }
}

impl NotificationSink for LogOnlyPublisher {
    fn deliver(&self, notification: payloads::NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            tracing::info!(
                recipient = %notification.recipient_id,
                kind = %notification.notification_type,
                "notification (not published)"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::models::MessageType;

    #[test]
    fn message_sent_carries_tenant_and_preview() {
        let sender = Uuid::new_v4();
        let message = Message {
            id: Uuid::now_v7(),
            conversation_id: Uuid::now_v7(),
            tenant_id: Uuid::new_v4(),
            sender_id: sender,
            message_type: MessageType::Text,
            content: Some("Can we talk about grades?".into()),
            attachment: None,
            reply_to: None,
            created_at: Utc::now(),
            read: false,
            read_by: BTreeSet::from([sender]),
        };

        let event = message_sent_event(&message);
        assert_eq!(event.event_type, routing_keys::MESSAGING_MESSAGE_SENT);
        assert_eq!(event.tenant_id, Some(message.tenant_id));
        assert_eq!(event.user_id, Some(sender));
        assert_eq!(event.data.content_preview, "Can we talk about grades?");
    }
}
