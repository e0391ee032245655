use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::auth::AuthUser;
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use crate::admission::{authorize_write, AdmissionControl, WriteIntent};
use crate::events::publisher::{publish_message_sent, EventPublisher};
use crate::gateway::events::NewConversationEvent;
use crate::gateway::{Audience, Disconnected, Gateway, Liveness, ServerEvent, Session, SessionId};
use crate::models::{
    ApprovalStatus, Conversation, ConversationPreview, ConversationType, Decision, Message, MessagePayload,
    ReadReceipt,
};
use crate::notify::NotificationEmitter;
use crate::presence::PresenceRecord;
use crate::reconciler::ConversationSequencer;
use crate::scope::TenantScope;
use crate::store::{Appended, ChatStore};
use crate::typing::TypingCoordinator;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversation {
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    /// For a private chat this is the request message.
    #[serde(default)]
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationCreated {
    pub conversation: Conversation,
    pub message: Option<Message>,
    /// False when an existing private conversation was returned.
    pub created: bool,
}

/// The single write path: admission, store, notification, live fan-out.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    admission: AdmissionControl,
    gateway: Arc<Gateway>,
    typing: TypingCoordinator,
    sequencer: ConversationSequencer,
    notifier: NotificationEmitter,
    events: Arc<dyn EventPublisher>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        admission: AdmissionControl,
        gateway: Arc<Gateway>,
        typing: TypingCoordinator,
        notifier: NotificationEmitter,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            admission,
            gateway,
            typing,
            sequencer: ConversationSequencer::new(),
            notifier,
            events,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    // --- Conversations ---

    pub async fn create_conversation(
        &self,
        caller: &AuthUser,
        request: CreateConversation,
    ) -> AppResult<ConversationCreated> {
        match request.conversation_type {
            ConversationType::Private => {
                let others: HashSet<Uuid> = request
                    .participants
                    .iter()
                    .copied()
                    .filter(|id| *id != caller.id)
                    .collect();
                let mut others = others.into_iter();
                match (others.next(), others.next()) {
                    (Some(counterpart), None) => self.start_chat(caller, counterpart, request.message).await,
                    _ => Err(AppError::new(
                        ErrorCode::InvalidParticipants,
                        "a private conversation needs exactly one other participant",
                    )),
                }
            }
            ConversationType::Group => {
                self.create_group(caller, &request.participants, request.name.as_deref(), request.message)
                    .await
            }
        }
    }

    /// Opens (or finds) the private conversation with `counterpart`, attaching
    /// `message` as the request message while approval is pending. A rejected
    /// conversation is reopened only when a new message comes with the request.
    pub async fn start_chat(
        &self,
        caller: &AuthUser,
        counterpart: Uuid,
        message: Option<MessagePayload>,
    ) -> AppResult<ConversationCreated> {
        let scope = TenantScope::for_caller(caller);
        if let Some(payload) = &message {
            payload.validate()?;
        }

        let new = self.admission.admit_private(&scope, counterpart)?;
        let created = self.store.create_conversation(&scope, new)?;
        let mut conversation = created.value;

        let guard = self.sequencer.lock(conversation.id).await;

        let mut reopened = false;
        if !created.created && message.is_some() {
            match conversation.status {
                ApprovalStatus::Rejected => {
                    conversation = self.store.reopen_request(&scope, conversation.id, caller.id)?;
                    reopened = true;
                }
                ApprovalStatus::Pending if conversation.requested_by != Some(caller.id) => {
                    return Err(AppError::new(
                        ErrorCode::NotApproved,
                        "this contact already sent you a chat request, respond to it instead",
                    ));
                }
                _ => {}
            }
        }

        let intent = match conversation.status {
            ApprovalStatus::Pending => WriteIntent::Request,
            _ => WriteIntent::Regular,
        };
        let appended = match message {
            Some(payload) => Some(self.store.append_message(&scope, conversation.id, caller.id, payload, intent)?),
            None => None,
        };
        let message = appended.as_ref().map(|a| a.message.clone());
        if let Some(appended) = &appended {
            conversation = appended.conversation.clone();
        }

        if created.created {
            self.broadcast(
                Audience::Identities(conversation.participants.clone()),
                None,
                ServerEvent::NewConversation(NewConversationEvent {
                    conversation: conversation.clone(),
                    message: message.clone(),
                }),
            );
        } else {
            if let Some(message) = &message {
                self.broadcast(Audience::Room(conversation.id), None, ServerEvent::NewMessage(message.clone()));
            }
            if reopened || message.is_some() {
                self.broadcast(
                    Audience::RoomAndIdentities(conversation.id, conversation.participants.clone()),
                    None,
                    ServerEvent::ConversationUpdated(conversation.clone()),
                );
            }
        }
        drop(guard);

        if created.created {
            counter!("chat_conversations_created_total", "type" => conversation.conversation_type.as_str())
                .increment(1);
            tracing::info!(
                conversation_id = %conversation.id,
                requester = %caller.id,
                counterpart = %counterpart,
                status = conversation.status.as_str(),
                "private conversation created"
            );
        }
        if reopened {
            tracing::info!(conversation_id = %conversation.id, requester = %caller.id, "rejected chat requested again");
        }

        let new_request = (created.created && conversation.status == ApprovalStatus::Pending) || reopened;
        if new_request {
            self.notifier
                .chat_requested(&conversation, caller.id, message.as_ref())
                .await;
        }
        if let Some(message) = &message {
            counter!("chat_messages_sent_total").increment(1);
            publish_message_sent(&*self.events, message).await;
        }

        Ok(ConversationCreated {
            conversation,
            message,
            created: created.created,
        })
    }

    pub async fn create_group(
        &self,
        caller: &AuthUser,
        participants: &[Uuid],
        name: Option<&str>,
        message: Option<MessagePayload>,
    ) -> AppResult<ConversationCreated> {
        let scope = TenantScope::for_caller(caller);
        let new = self.admission.admit_group(&scope, participants, name)?;
        if let Some(payload) = &message {
            payload.validate()?;
        }

        let mut conversation = self.store.create_conversation(&scope, new)?.value;

        let guard = self.sequencer.lock(conversation.id).await;
        let message = match message {
            Some(payload) => {
                let appended =
                    self.store
                        .append_message(&scope, conversation.id, caller.id, payload, WriteIntent::Regular)?;
                conversation = appended.conversation;
                Some(appended.message)
            }
            None => None,
        };
        self.broadcast(
            Audience::Identities(conversation.participants.clone()),
            None,
            ServerEvent::NewConversation(NewConversationEvent {
                conversation: conversation.clone(),
                message: message.clone(),
            }),
        );
        drop(guard);

        counter!("chat_conversations_created_total", "type" => conversation.conversation_type.as_str()).increment(1);
        tracing::info!(
            conversation_id = %conversation.id,
            creator = %caller.id,
            participants = conversation.participants.len(),
            "group created"
        );

        if let Some(message) = &message {
            counter!("chat_messages_sent_total").increment(1);
            publish_message_sent(&*self.events, message).await;
        }

        Ok(ConversationCreated {
            conversation,
            message,
            created: true,
        })
    }

    pub fn get_conversation(&self, caller: &AuthUser, conversation_id: Uuid) -> AppResult<Conversation> {
        let scope = TenantScope::for_caller(caller);
        let conversation = self.store.get_conversation(&scope, conversation_id)?;
        if !conversation.is_participant(caller.id) {
            return Err(AppError::not_participant());
        }
        Ok(conversation)
    }

    pub fn list_conversations(
        &self,
        caller: &AuthUser,
        page: &PaginationParams,
    ) -> AppResult<Paginated<ConversationPreview>> {
        let scope = TenantScope::for_caller(caller);
        self.store.list_conversations(&scope, caller.id, page)
    }

    pub async fn respond(&self, caller: &AuthUser, conversation_id: Uuid, decision: Decision) -> AppResult<Conversation> {
        let scope = TenantScope::for_caller(caller);

        let guard = self.sequencer.lock(conversation_id).await;
        let conversation = self.store.set_status(&scope, conversation_id, caller.id, decision)?;
        self.broadcast(
            Audience::RoomAndIdentities(conversation.id, conversation.participants.clone()),
            None,
            ServerEvent::ConversationUpdated(conversation.clone()),
        );
        drop(guard);

        tracing::info!(
            conversation_id = %conversation_id,
            responder = %caller.id,
            status = conversation.status.as_str(),
            "chat request answered"
        );
        Ok(conversation)
    }

    // --- Messages ---

    pub async fn send_message(
        &self,
        caller: &AuthUser,
        conversation_id: Uuid,
        payload: MessagePayload,
    ) -> AppResult<Message> {
        payload.validate()?;
        let scope = TenantScope::for_caller(caller);

        let guard = self.sequencer.lock(conversation_id).await;
        let appended = self
            .store
            .append_message(&scope, conversation_id, caller.id, payload, WriteIntent::Regular)?;
        self.fan_out_message(&appended);
        drop(guard);

        counter!("chat_messages_sent_total").increment(1);
        tracing::debug!(conversation_id = %conversation_id, message_id = %appended.message.id, "message sent");

        publish_message_sent(&*self.events, &appended.message).await;
        Ok(appended.message)
    }

    /// Runs the write gate without writing, for sends that stage work first.
    pub fn ensure_can_send(&self, caller: &AuthUser, conversation_id: Uuid) -> AppResult<Conversation> {
        let conversation = self.get_conversation(caller, conversation_id)?;
        authorize_write(&conversation, caller.id, WriteIntent::Regular)?;
        Ok(conversation)
    }

    pub fn list_messages(
        &self,
        caller: &AuthUser,
        conversation_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<Message>> {
        self.get_conversation(caller, conversation_id)?;
        let scope = TenantScope::for_caller(caller);
        self.store.list_messages(&scope, conversation_id, page)
    }

    pub async fn mark_read(&self, caller: &AuthUser, conversation_id: Uuid) -> AppResult<ReadReceipt> {
        let scope = TenantScope::for_caller(caller);

        let guard = self.sequencer.lock(conversation_id).await;
        let receipt = self.store.mark_read(&scope, conversation_id, caller.id)?;
        if receipt.changed() {
            self.broadcast(
                Audience::Room(conversation_id),
                None,
                ServerEvent::MessagesRead(receipt.clone()),
            );
        }
        drop(guard);

        Ok(receipt)
    }

    pub fn unread_count(&self, caller: &AuthUser) -> AppResult<u64> {
        let scope = TenantScope::for_caller(caller);
        self.store.total_unread(&scope, caller.id)
    }

    pub fn presence(&self, caller: &AuthUser, identity_id: Uuid) -> AppResult<PresenceRecord> {
        let scope = TenantScope::for_caller(caller);
        self.admission.resolve(&scope, identity_id)?;
        Ok(self.gateway.presence().snapshot(identity_id))
    }

    // --- Live sessions ---

    pub fn connect(&self, caller: &AuthUser) -> Session {
        self.gateway.connect(caller)
    }

    /// Session whose liveness the transport tracks; the reaper skips it.
    pub fn connect_transport(&self, caller: &AuthUser) -> Session {
        self.gateway.connect_with(caller, Liveness::Transport)
    }

    pub fn disconnect(&self, session_id: SessionId) {
        if let Some(gone) = self.gateway.disconnect(session_id) {
            self.after_disconnect(gone);
        }
    }

    /// Joins the room and marks the conversation read for the joiner.
    pub async fn join_conversation(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<Conversation> {
        let caller = self.gateway.caller(session_id)?;
        self.gateway.touch(session_id);
        let scope = TenantScope::for_caller(&caller);

        let conversation = self.store.get_conversation(&scope, conversation_id)?;
        let grant = self.admission.grant_join(&scope, session_id, &conversation)?;
        self.gateway.join_room(grant)?;

        self.mark_read(&caller, conversation_id).await?;
        Ok(conversation)
    }

    pub fn leave_conversation(&self, session_id: SessionId, conversation_id: Uuid) {
        self.gateway.touch(session_id);
        self.gateway.leave_room(session_id, conversation_id);
    }

    pub async fn send_from_session(
        &self,
        session_id: SessionId,
        conversation_id: Uuid,
        payload: MessagePayload,
    ) -> AppResult<Message> {
        let caller = self.gateway.caller(session_id)?;
        self.gateway.touch(session_id);
        self.send_message(&caller, conversation_id, payload).await
    }

    pub async fn mark_read_from_session(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<ReadReceipt> {
        let caller = self.gateway.caller(session_id)?;
        self.gateway.touch(session_id);
        self.mark_read(&caller, conversation_id).await
    }

    pub fn start_typing(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<()> {
        let caller = self.typing_caller(session_id, conversation_id)?;
        let event = self.typing.start(conversation_id, caller.id);
        self.broadcast(Audience::Room(conversation_id), Some(caller.id), event);
        Ok(())
    }

    pub fn stop_typing(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<()> {
        let caller = self.typing_caller(session_id, conversation_id)?;
        let event = self.typing.stop(conversation_id, caller.id);
        self.broadcast(Audience::Room(conversation_id), Some(caller.id), event);
        Ok(())
    }

    pub fn heartbeat(&self, session_id: SessionId) -> bool {
        self.gateway.touch(session_id)
    }

    /// Disconnects silent sessions and drops expired bookkeeping.
    pub fn reap_stale_sessions(&self, timeout: Duration) -> usize {
        let reaped = self.gateway.reap_stale(timeout);
        let count = reaped.len();
        for gone in reaped {
            self.after_disconnect(gone);
        }
        self.typing.prune(Utc::now());
        self.sequencer.prune();
        count
    }

    // --- Internals ---

    fn typing_caller(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<AuthUser> {
        let caller = self.gateway.caller(session_id)?;
        self.gateway.touch(session_id);
        self.gateway.ensure_in_room(session_id, conversation_id)?;
        Ok(caller)
    }

    fn fan_out_message(&self, appended: &Appended) {
        let conversation = &appended.conversation;
        self.broadcast(
            Audience::Room(conversation.id),
            None,
            ServerEvent::NewMessage(appended.message.clone()),
        );
        self.broadcast(
            Audience::Identities(conversation.participants.clone()),
            None,
            ServerEvent::ConversationUpdated(conversation.clone()),
        );
    }

    fn broadcast(&self, audience: Audience, exclude: Option<Uuid>, event: ServerEvent) {
        let delivery = self.gateway.broadcast(audience, exclude, event);
        for gone in delivery.evicted {
            self.after_disconnect(gone);
        }
    }

    fn after_disconnect(&self, gone: Disconnected) {
        if !gone.went_offline {
            return;
        }
        for stop in self.typing.clear_identity(gone.identity_id, Utc::now()) {
            let conversation_id = stop.conversation_id();
            self.broadcast(Audience::Room(conversation_id), Some(gone.identity_id), stop);
        }
    }
}
