use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use super::{next_message_timestamp, now_micros, Appended, ChatStore, Created};
use crate::admission::{self, WriteIntent};
use crate::models::{
    pair_key, ApprovalStatus, Conversation, ConversationPreview, Decision, Message, MessagePayload,
    NewConversation, ReadReceipt,
};
use crate::scope::TenantScope;

struct Slot {
    conversation: Conversation,
    messages: Vec<Message>,
}

impl Slot {
    fn unread_for(&self, identity_id: Uuid) -> u64 {
        self.messages
            .iter()
            .filter(|m| m.sender_id != identity_id && !m.is_read_by(identity_id))
            .count() as u64
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Process-local store. Each conversation sits behind its own mutex, which is
/// the critical section for admission checks and timestamp assignment.
#[derive(Default)]
pub struct InMemoryChatStore {
    conversations: RwLock<HashMap<Uuid, SlotRef>>,
    pairs: Mutex<HashMap<(Uuid, String), Uuid>>,
}

fn poisoned<T>(_: PoisonError<T>) -> AppError {
    AppError::internal("chat store lock poisoned")
}

fn lock(slot: &SlotRef) -> AppResult<MutexGuard<'_, Slot>> {
    slot.lock().map_err(poisoned)
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, conversation_id: Uuid) -> AppResult<SlotRef> {
        let map = self.conversations.read().map_err(poisoned)?;
        map.get(&conversation_id)
            .cloned()
            .ok_or_else(AppError::conversation_not_found)
    }

    fn all_slots(&self) -> AppResult<Vec<SlotRef>> {
        let map = self.conversations.read().map_err(poisoned)?;
        Ok(map.values().cloned().collect())
    }

    fn insert(&self, new: NewConversation, tenant_id: Uuid) -> AppResult<Conversation> {
        let conversation = new.into_conversation(Uuid::now_v7(), tenant_id, now_micros());

        let slot = Arc::new(Mutex::new(Slot {
            conversation: conversation.clone(),
            messages: Vec::new(),
        }));
        self.conversations
            .write()
            .map_err(poisoned)?
            .insert(conversation.id, slot);
        Ok(conversation)
    }
}

impl ChatStore for InMemoryChatStore {
    fn create_conversation(
        &self,
        scope: &TenantScope,
        new: NewConversation,
    ) -> AppResult<Created<Conversation>> {
        let Some(key) = new.pair_key() else {
            let conversation = self.insert(new, scope.tenant_id())?;
            return Ok(Created { value: conversation, created: true });
        };

        // Held across lookup and insert so two racing creates see one record.
        let mut pairs = self.pairs.lock().map_err(poisoned)?;
        let pair = (scope.tenant_id(), key);
        if let Some(existing) = pairs.get(&pair) {
            let slot = self.slot(*existing)?;
            let conversation = lock(&slot)?.conversation.clone();
            return Ok(Created { value: conversation, created: false });
        }

        let conversation = self.insert(new, scope.tenant_id())?;
        pairs.insert(pair, conversation.id);
        Ok(Created { value: conversation, created: true })
    }

    fn get_conversation(&self, scope: &TenantScope, conversation_id: Uuid) -> AppResult<Conversation> {
        let slot = self.slot(conversation_id)?;
        let guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        Ok(guard.conversation.clone())
    }

    fn find_private_conversation(
        &self,
        scope: &TenantScope,
        a: Uuid,
        b: Uuid,
    ) -> AppResult<Option<Conversation>> {
        let id = {
            let pairs = self.pairs.lock().map_err(poisoned)?;
            pairs.get(&(scope.tenant_id(), pair_key(a, b))).copied()
        };
        id.map(|id| self.get_conversation(scope, id)).transpose()
    }

    fn list_conversations(
        &self,
        scope: &TenantScope,
        identity_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<ConversationPreview>> {
        let mut previews = Vec::new();
        for slot in self.all_slots()? {
            let guard = lock(&slot)?;
            let conversation = &guard.conversation;
            if conversation.tenant_id != scope.tenant_id() || !conversation.is_participant(identity_id) {
                continue;
            }
            previews.push(ConversationPreview {
                counterpart_id: conversation.counterpart_of(identity_id),
                last_message: guard.messages.last().cloned(),
                unread_count: guard.unread_for(identity_id),
                conversation: conversation.clone(),
            });
        }

        previews.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
                .then_with(|| b.conversation.id.cmp(&a.conversation.id))
        });
        Ok(Paginated::from_all(previews, page))
    }

    fn append_message(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: MessagePayload,
        intent: WriteIntent,
    ) -> AppResult<Appended> {
        let slot = self.slot(conversation_id)?;
        let mut guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        admission::authorize_write(&guard.conversation, sender_id, intent)?;

        if let Some(reply_to) = payload.reply_to {
            if !guard.messages.iter().any(|m| m.id == reply_to) {
                return Err(AppError::new(ErrorCode::MessageNotFound, "replied-to message not found"));
            }
        }

        let created_at = next_message_timestamp(guard.conversation.last_message_at, now_micros());
        let message = Message {
            id: Uuid::now_v7(),
            conversation_id,
            tenant_id: guard.conversation.tenant_id,
            sender_id,
            message_type: payload.message_type,
            content: payload.content,
            attachment: payload.attachment,
            reply_to: payload.reply_to,
            created_at,
            read: false,
            read_by: BTreeSet::from([sender_id]),
        };
        guard.messages.push(message.clone());

        let conversation = &mut guard.conversation;
        conversation.last_message_at = created_at;
        conversation.updated_at = created_at;
        if intent == WriteIntent::Request && conversation.status == ApprovalStatus::Pending {
            conversation.request_message_id = Some(message.id);
        }

        Ok(Appended {
            message,
            conversation: conversation.clone(),
        })
    }

    fn list_messages(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<Message>> {
        let slot = self.slot(conversation_id)?;
        let guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        Ok(Paginated::from_all(guard.messages.clone(), page))
    }

    fn mark_read(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        identity_id: Uuid,
    ) -> AppResult<ReadReceipt> {
        let slot = self.slot(conversation_id)?;
        let mut guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        if !guard.conversation.is_participant(identity_id) {
            return Err(AppError::not_participant());
        }

        let message_ids = guard
            .messages
            .iter_mut()
            .filter_map(|m| m.merge_read_by([identity_id]).then_some(m.id))
            .collect();

        Ok(ReadReceipt {
            conversation_id,
            reader_id: identity_id,
            message_ids,
            read_at: now_micros(),
        })
    }

    fn set_status(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        responder_id: Uuid,
        decision: Decision,
    ) -> AppResult<Conversation> {
        let slot = self.slot(conversation_id)?;
        let mut guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        admission::authorize_response(&guard.conversation, responder_id)?;

        let now = now_micros();
        let conversation = &mut guard.conversation;
        conversation.status = decision.resulting_status();
        conversation.responded_at = Some(now);
        conversation.updated_at = now;
        Ok(conversation.clone())
    }

    fn reopen_request(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Conversation> {
        let slot = self.slot(conversation_id)?;
        let mut guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        admission::authorize_reopen(&guard.conversation, requester_id)?;

        let conversation = &mut guard.conversation;
        conversation.status = ApprovalStatus::Pending;
        conversation.requested_by = Some(requester_id);
        conversation.request_message_id = None;
        conversation.responded_at = None;
        conversation.updated_at = now_micros();
        Ok(conversation.clone())
    }

    fn unread_count(&self, scope: &TenantScope, conversation_id: Uuid, identity_id: Uuid) -> AppResult<u64> {
        let slot = self.slot(conversation_id)?;
        let guard = lock(&slot)?;
        scope.ensure_tenant(guard.conversation.tenant_id, "conversation")?;
        Ok(guard.unread_for(identity_id))
    }

    fn total_unread(&self, scope: &TenantScope, identity_id: Uuid) -> AppResult<u64> {
        let mut total = 0;
        for slot in self.all_slots()? {
            let guard = lock(&slot)?;
            if guard.conversation.tenant_id == scope.tenant_id()
                && guard.conversation.is_participant(identity_id)
            {
                total += guard.unread_for(identity_id);
            }
        }
        Ok(total)
    }
}
