//! Durable conversation and message storage.
//!
//! `ChatStore` is the port; `PgChatStore` is the production implementation and
//! `InMemoryChatStore` backs tests and database-less local runs. Both evaluate
//! the admission write gate inside the same critical section as the write.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use uuid::Uuid;

use scholaris_shared::errors::AppResult;
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use crate::admission::WriteIntent;
use crate::models::{
    Conversation, ConversationPreview, Decision, Message, MessagePayload, NewConversation, ReadReceipt,
};
use crate::scope::TenantScope;

mod memory;
mod pg;

pub use memory::InMemoryChatStore;
pub use pg::PgChatStore;

/// A record plus whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Created<T> {
    pub value: T,
    pub created: bool,
}

/// A stored message together with the conversation state after the write.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    pub conversation: Conversation,
}

pub trait ChatStore: Send + Sync {
    /// Cheap liveness check for /health.
    fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    /// Idempotent for private conversations: an existing record for the same
    /// pair is returned unchanged with `created == false`.
    fn create_conversation(
        &self,
        scope: &TenantScope,
        new: NewConversation,
    ) -> AppResult<Created<Conversation>>;

    fn get_conversation(&self, scope: &TenantScope, conversation_id: Uuid) -> AppResult<Conversation>;

    fn find_private_conversation(
        &self,
        scope: &TenantScope,
        a: Uuid,
        b: Uuid,
    ) -> AppResult<Option<Conversation>>;

    /// Conversations of `identity_id`, most recent `last_message_at` first.
    fn list_conversations(
        &self,
        scope: &TenantScope,
        identity_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<ConversationPreview>>;

    fn append_message(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: MessagePayload,
        intent: WriteIntent,
    ) -> AppResult<Appended>;

    /// Messages oldest first.
    fn list_messages(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<Message>>;

    /// Adds `identity_id` to `read_by` of every message it has not read yet.
    fn mark_read(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        identity_id: Uuid,
    ) -> AppResult<ReadReceipt>;

    /// Applies an approval decision. The response rules are checked under the
    /// same lock as appends.
    fn set_status(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        responder_id: Uuid,
        decision: Decision,
    ) -> AppResult<Conversation>;

    /// Puts a rejected private conversation back to pending for `requester_id`.
    fn reopen_request(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Conversation>;

    /// Messages from others in one conversation not yet read by `identity_id`.
    fn unread_count(&self, scope: &TenantScope, conversation_id: Uuid, identity_id: Uuid) -> AppResult<u64>;

    /// `unread_count` summed over every conversation of `identity_id`.
    fn total_unread(&self, scope: &TenantScope, identity_id: Uuid) -> AppResult<u64>;
}

/// Postgres keeps microseconds, so timestamps are truncated before use.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Strictly increasing per conversation, even when the wall clock is not.
pub(crate) fn next_message_timestamp(last: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = last + Duration::microseconds(1);
    if now >= floor { now } else { floor }
}
