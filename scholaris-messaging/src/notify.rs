//! Chat-request notifications.
//!
//! Delivery is best effort: the conversation write has already committed, so a
//! failing sink is logged and never surfaces to the caller.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use scholaris_shared::types::event::payloads::NotificationRequested;

use crate::models::{Conversation, Message};
use crate::BoxFuture;

pub const CHAT_REQUEST_TYPE: &str = "chat_request";

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Clone)]
pub struct NotificationEmitter {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationEmitter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// One notification to the counterpart of `requester_id`.
    pub async fn chat_requested(&self, conversation: &Conversation, requester_id: Uuid, message: Option<&Message>) {
        let Some(notification) = chat_request_notification(conversation, requester_id, message) else {
            tracing::warn!(conversation_id = %conversation.id, "chat request without a counterpart, not notifying");
            return;
        };

        let recipient = notification.recipient_id;
        match self.sink.deliver(notification).await {
            Ok(()) => tracing::debug!(conversation_id = %conversation.id, recipient = %recipient, "chat request notification sent"),
            Err(e) => tracing::warn!(
                error = %e,
                conversation_id = %conversation.id,
                recipient = %recipient,
                "chat request notification failed"
            ),
        }
    }
}

pub fn chat_request_notification(
    conversation: &Conversation,
    requester_id: Uuid,
    message: Option<&Message>,
) -> Option<NotificationRequested> {
    let recipient_id = conversation.counterpart_of(requester_id)?;
    let body = message
        .map(|m| m.preview())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "Someone would like to start a conversation with you".to_string());

    Some(NotificationRequested {
        recipient_id,
        tenant_id: conversation.tenant_id,
        title: "New chat request".to_string(),
        message: body,
        notification_type: CHAT_REQUEST_TYPE.to_string(),
        metadata: json!({
            "conversation_id": conversation.id,
            "requester_id": requester_id,
            "message_id": message.map(|m| m.id),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::models::{ApprovalStatus, ConversationType};

    #[derive(Default)]
    struct Recording(Mutex<Vec<NotificationRequested>>);

    impl NotificationSink for Recording {
        fn deliver(&self, notification: NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
            self.0.lock().unwrap().push(notification);
            Box::pin(async { Ok(()) })
        }
    }

    struct Failing;

    impl NotificationSink for Failing {
        fn deliver(&self, _: NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("broker down")) })
        }
    }

    fn pending(requester: Uuid, counterpart: Uuid) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::now_v7(),
            tenant_id: Uuid::new_v4(),
            conversation_type: ConversationType::Private,
            participants: vec![requester, counterpart],
            name: None,
            status: ApprovalStatus::Pending,
            created_by: requester,
            requested_by: Some(requester),
            request_message_id: None,
            last_message_at: now,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn notifies_the_counterpart() {
        let sink = Arc::new(Recording::default());
        let emitter = NotificationEmitter::new(sink.clone());
        let parent = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let conversation = pending(parent, teacher);

        emitter.chat_requested(&conversation, parent, None).await;

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, teacher);
        assert_eq!(sent[0].tenant_id, conversation.tenant_id);
        assert_eq!(sent[0].notification_type, CHAT_REQUEST_TYPE);
        assert_eq!(sent[0].metadata["requester_id"], parent.to_string());
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let emitter = NotificationEmitter::new(Arc::new(Failing));
        let parent = Uuid::new_v4();
        emitter
            .chat_requested(&pending(parent, Uuid::new_v4()), parent, None)
            .await;
    }
}
