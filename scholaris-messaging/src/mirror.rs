//! Client-side copy of one conversation.
//!
//! The store is authoritative; the mirror folds live events on top of the
//! last plain read. Read receipts are merged by union so duplicated or
//! reordered broadcasts can never un-read a message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::gateway::ServerEvent;
use crate::models::{Conversation, Message};
use crate::typing::TypingBoard;

#[derive(Debug, Clone)]
pub struct ConversationMirror {
    conversation: Conversation,
    messages: Vec<Message>,
    typing: TypingBoard,
}

impl ConversationMirror {
    pub fn new(conversation: Conversation, messages: Vec<Message>, typing_timeout: Duration) -> Self {
        let mut mirror = Self {
            conversation,
            messages,
            typing: TypingBoard::new(typing_timeout),
        };
        mirror.sort();
        mirror
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn typers(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.typing.typers(self.conversation.id, now)
    }

    pub fn unread_for(&self, identity_id: Uuid) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_id != identity_id && !m.is_read_by(identity_id))
            .count()
    }

    /// Replaces local state with a fresh read, keeping receipts already seen.
    pub fn resync(&mut self, conversation: Conversation, mut messages: Vec<Message>) {
        for message in &mut messages {
            if let Some(known) = self.messages.iter().find(|m| m.id == message.id) {
                message.merge_read_by(known.read_by.iter().copied());
            }
        }
        self.conversation = conversation;
        self.messages = messages;
        self.sort();
    }

    /// Folds one live event in. Returns true when visible state changed.
    pub fn apply(&mut self, event: &ServerEvent, received_at: DateTime<Utc>) -> bool {
        if event.conversation_id() != self.conversation.id {
            return false;
        }

        match event {
            ServerEvent::NewMessage(message) => {
                self.typing.observe(event, received_at);
                if message.created_at > self.conversation.last_message_at {
                    self.conversation.last_message_at = message.created_at;
                }
                match self.messages.iter_mut().find(|m| m.id == message.id) {
                    Some(known) => known.merge_read_by(message.read_by.iter().copied()),
                    None => {
                        self.messages.push(message.clone());
                        self.sort();
                        true
                    }
                }
            }
            ServerEvent::ConversationUpdated(conversation) => self.update_conversation(conversation),
            ServerEvent::NewConversation(created) => self.update_conversation(&created.conversation),
            ServerEvent::MessagesRead(receipt) => {
                let mut changed = false;
                for message in self
                    .messages
                    .iter_mut()
                    .filter(|m| receipt.message_ids.contains(&m.id))
                {
                    changed |= message.merge_read_by([receipt.reader_id]);
                }
                changed
            }
            ServerEvent::UserTyping(_) | ServerEvent::UserStoppedTyping(_) => {
                self.typing.observe(event, received_at)
            }
        }
    }

    fn update_conversation(&mut self, conversation: &Conversation) -> bool {
        if conversation.updated_at < self.conversation.updated_at || *conversation == self.conversation {
            return false;
        }
        self.conversation = conversation.clone();
        true
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
}
