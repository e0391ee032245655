use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, ReadReceipt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversationEvent {
    pub conversation: Conversation,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: Uuid,
    pub identity_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingStopped {
    pub conversation_id: Uuid,
    pub identity_id: Uuid,
}

/// Everything the server pushes down a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    ConversationUpdated(Conversation),
    NewConversation(NewConversationEvent),
    MessagesRead(ReadReceipt),
    UserTyping(TypingSignal),
    UserStoppedTyping(TypingStopped),
}

impl ServerEvent {
    /// Wire name, also used as the Socket.IO event name.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::ConversationUpdated(_) => "conversation_updated",
            ServerEvent::NewConversation(_) => "new_conversation",
            ServerEvent::MessagesRead(_) => "messages_read",
            ServerEvent::UserTyping(_) => "user_typing",
            ServerEvent::UserStoppedTyping(_) => "user_stopped_typing",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            ServerEvent::NewMessage(m) => m.conversation_id,
            ServerEvent::ConversationUpdated(c) => c.id,
            ServerEvent::NewConversation(e) => e.conversation.id,
            ServerEvent::MessagesRead(r) => r.conversation_id,
            ServerEvent::UserTyping(t) => t.conversation_id,
            ServerEvent::UserStoppedTyping(t) => t.conversation_id,
        }
    }

    /// The event body without the tag, as emitted over Socket.IO.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ServerEvent::NewMessage(m) => serde_json::to_value(m),
            ServerEvent::ConversationUpdated(c) => serde_json::to_value(c),
            ServerEvent::NewConversation(e) => serde_json::to_value(e),
            ServerEvent::MessagesRead(r) => serde_json::to_value(r),
            ServerEvent::UserTyping(t) => serde_json::to_value(t),
            ServerEvent::UserStoppedTyping(t) => serde_json::to_value(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization() {
        let conversation_id = Uuid::new_v4();
        let event = ServerEvent::UserStoppedTyping(TypingStopped {
            conversation_id,
            identity_id: Uuid::new_v4(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "user_stopped_typing");
        assert_eq!(json["data"]["conversation_id"], conversation_id.to_string());
        assert_eq!(event.name(), "user_stopped_typing");
        assert_eq!(event.conversation_id(), conversation_id);

        let body = event.payload().unwrap();
        assert!(body.get("event").is_none());

        let back: ServerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
