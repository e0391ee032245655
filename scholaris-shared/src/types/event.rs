use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RabbitMQ Event envelope wrapping all domain events.
///
/// Routing key format: `scholaris.{domain}.{entity}.{action}`
/// Example: `scholaris.messaging.chat.requested`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            tenant_id: None,
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

/// RabbitMQ routing keys
pub mod routing_keys {
    pub const MESSAGING_MESSAGE_SENT: &str = "scholaris.messaging.message.sent";
    pub const MESSAGING_CHAT_REQUESTED: &str = "scholaris.messaging.chat.requested";
}

/// Common event data payloads
pub mod payloads {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageSent {
        pub message_id: Uuid,
        pub conversation_id: Uuid,
        pub sender_id: Uuid,
        pub content_preview: String,
    }

    /// A notification for the notification service to persist and push.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct NotificationRequested {
        pub recipient_id: Uuid,
        pub tenant_id: Uuid,
        pub title: String,
        pub message: String,
        pub notification_type: String,
        pub metadata: serde_json::Value,
    }
}
