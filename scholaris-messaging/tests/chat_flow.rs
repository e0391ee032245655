use std::sync::{Arc, Mutex};

use uuid::Uuid;

use scholaris_messaging::admission::{AdmissionConfig, AdmissionControl};
use scholaris_messaging::directory::{DirectoryEntry, InMemoryDirectory};
use scholaris_messaging::events::publisher::LogOnlyPublisher;
use scholaris_messaging::gateway::{Gateway, ServerEvent, Session};
use scholaris_messaging::models::{ApprovalStatus, Decision, MessagePayload};
use scholaris_messaging::notify::{NotificationEmitter, NotificationSink};
use scholaris_messaging::presence::PresenceTracker;
use scholaris_messaging::services::ChatService;
use scholaris_messaging::store::InMemoryChatStore;
use scholaris_messaging::typing::{TypingCoordinator, DEFAULT_TYPING_TIMEOUT};
use scholaris_messaging::BoxFuture;
use scholaris_shared::errors::ErrorCode;
use scholaris_shared::types::auth::{AuthUser, Role};
use scholaris_shared::types::event::payloads::NotificationRequested;
use scholaris_shared::types::pagination::PaginationParams;

#[derive(Default)]
struct Recording(Mutex<Vec<NotificationRequested>>);

impl Recording {
    fn recipients(&self) -> Vec<Uuid> {
        self.0.lock().unwrap().iter().map(|n| n.recipient_id).collect()
    }
}

impl NotificationSink for Recording {
    fn deliver(&self, notification: NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
        self.0.lock().unwrap().push(notification);
        Box::pin(async { Ok(()) })
    }
}

struct Failing;

impl NotificationSink for Failing {
    fn deliver(&self, _: NotificationRequested) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Err(anyhow::anyhow!("broker unreachable")) })
    }
}

struct Harness {
    chat: Arc<ChatService>,
    directory: Arc<InMemoryDirectory>,
    notifications: Arc<Recording>,
    tenant: Uuid,
}

impl Harness {
    fn new() -> Self {
        let notifications = Arc::new(Recording::default());
        Self::build(notifications.clone(), notifications, 256)
    }

    fn build(notifications: Arc<Recording>, sink: Arc<dyn NotificationSink>, queue_capacity: usize) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let gateway = Arc::new(Gateway::new(Arc::new(PresenceTracker::new()), queue_capacity));
        let chat = ChatService::new(
            Arc::new(InMemoryChatStore::new()),
            AdmissionControl::new(AdmissionConfig::default(), directory.clone()),
            gateway,
            TypingCoordinator::new(DEFAULT_TYPING_TIMEOUT),
            NotificationEmitter::new(sink),
            Arc::new(LogOnlyPublisher),
        );
        Self {
            chat: Arc::new(chat),
            directory,
            notifications,
            tenant: Uuid::new_v4(),
        }
    }

    fn user(&self, role: Role) -> AuthUser {
        self.user_in(self.tenant, role)
    }

    fn user_in(&self, tenant_id: Uuid, role: Role) -> AuthUser {
        let id = Uuid::new_v4();
        self.directory.insert(DirectoryEntry { identity_id: id, tenant_id, role });
        AuthUser {
            id,
            role,
            tenant_id,
            token_id: Uuid::new_v4(),
        }
    }
}

fn drain(session: &mut Session) -> Vec<ServerEvent> {
    std::iter::from_fn(|| session.try_recv()).collect()
}

fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

#[tokio::test]
async fn parent_request_approved_by_teacher() {
    let h = Harness::new();
    let parent = h.user(Role::Parent);
    let teacher = h.user(Role::Teacher);
    let mut teacher_session = h.chat.connect(&teacher);

    let created = h
        .chat
        .start_chat(&parent, teacher.id, Some(MessagePayload::text("Hello, about Emma's homework")))
        .await
        .unwrap();
    let conversation = created.conversation;
    let request = created.message.unwrap();
    assert!(created.created);
    assert_eq!(conversation.status, ApprovalStatus::Pending);
    assert_eq!(conversation.requested_by, Some(parent.id));
    assert_eq!(conversation.request_message_id, Some(request.id));

    let events = drain(&mut teacher_session);
    assert_eq!(names(&events), ["new_conversation"]);
    match &events[0] {
        ServerEvent::NewConversation(e) => assert_eq!(e.message.as_ref().map(|m| m.id), Some(request.id)),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.notifications.recipients(), [teacher.id]);

    // Nothing else goes through until the teacher answers.
    let err = h.chat.send_message(&parent, conversation.id, MessagePayload::text("again")).await.unwrap_err();
    assert!(err.is(ErrorCode::NotApproved));
    let err = h.chat.send_message(&teacher, conversation.id, MessagePayload::text("hi")).await.unwrap_err();
    assert!(err.is(ErrorCode::NotApproved));
    let err = h.chat.respond(&parent, conversation.id, Decision::Approve).await.unwrap_err();
    assert!(err.is(ErrorCode::Forbidden));

    let approved = h.chat.respond(&teacher, conversation.id, Decision::Approve).await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert!(approved.responded_at.is_some());
    assert!(names(&drain(&mut teacher_session)).contains(&"conversation_updated"));

    let err = h.chat.respond(&teacher, conversation.id, Decision::Reject).await.unwrap_err();
    assert!(err.is(ErrorCode::AlreadyResponded));

    // Joining marks the request read; afterwards the parent writes freely and
    // the teacher's open session gets the message live.
    h.chat.join_conversation(teacher_session.id(), conversation.id).await.unwrap();
    assert_eq!(h.chat.unread_count(&teacher).unwrap(), 0);
    drain(&mut teacher_session);

    let sent = h
        .chat
        .send_message(&parent, conversation.id, MessagePayload::text("She is stuck on fractions"))
        .await
        .unwrap();
    let events = drain(&mut teacher_session);
    assert_eq!(names(&events), ["new_message", "conversation_updated"]);
    match &events[0] {
        ServerEvent::NewMessage(m) => {
            assert_eq!(m.id, sent.id);
            assert_eq!(m.sender_id, parent.id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let page = h.chat.list_messages(&teacher, conversation.id, &PaginationParams::default()).unwrap();
    assert_eq!(page.items.len(), 2);
    assert!(page.items[0].created_at < page.items[1].created_at);

    assert_eq!(h.chat.unread_count(&teacher).unwrap(), 1);
    let receipt = h.chat.mark_read(&teacher, conversation.id).await.unwrap();
    assert_eq!(receipt.message_ids.len(), 1);
    assert_eq!(h.chat.unread_count(&teacher).unwrap(), 0);
    assert!(!h.chat.mark_read(&teacher, conversation.id).await.unwrap().changed());

    assert_eq!(h.notifications.recipients().len(), 1);
}

#[tokio::test]
async fn rejected_request_can_be_sent_again() {
    let h = Harness::new();
    let parent = h.user(Role::Parent);
    let teacher = h.user(Role::Teacher);

    let first = h.chat.start_chat(&parent, teacher.id, Some(MessagePayload::text("hello"))).await.unwrap();
    let rejected = h.chat.respond(&teacher, first.conversation.id, Decision::Reject).await.unwrap();
    assert_eq!(rejected.status, ApprovalStatus::Rejected);

    let err = h.chat.send_message(&parent, rejected.id, MessagePayload::text("please")).await.unwrap_err();
    assert!(err.is(ErrorCode::NotApproved));

    // Opening without a message returns the rejected record untouched.
    let again = h.chat.start_chat(&parent, teacher.id, None).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.conversation.status, ApprovalStatus::Rejected);

    let reopened = h.chat.start_chat(&parent, teacher.id, Some(MessagePayload::text("one more try"))).await.unwrap();
    assert!(!reopened.created);
    assert_eq!(reopened.conversation.id, first.conversation.id);
    assert_eq!(reopened.conversation.status, ApprovalStatus::Pending);
    assert_eq!(reopened.conversation.request_message_id, reopened.message.map(|m| m.id));
    assert_eq!(h.notifications.recipients(), [teacher.id, teacher.id]);
}

#[tokio::test]
async fn counterpart_cannot_request_over_a_pending_request() {
    let h = Harness::new();
    let parent = h.user(Role::Parent);
    let teacher = h.user(Role::Teacher);

    h.chat.start_chat(&parent, teacher.id, Some(MessagePayload::text("hello"))).await.unwrap();
    let err = h
        .chat
        .start_chat(&teacher, parent.id, Some(MessagePayload::text("hi")))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::NotApproved));
}

#[tokio::test]
async fn private_pair_is_created_once() {
    let h = Harness::new();
    let teacher = h.user(Role::Teacher);
    let colleague = h.user(Role::Teacher);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let chat = h.chat.clone();
            let (a, b) = if i % 2 == 0 {
                (teacher.clone(), colleague.id)
            } else {
                (colleague.clone(), teacher.id)
            };
            tokio::spawn(async move { chat.start_chat(&a, b, None).await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    let mut created = 0;
    for task in tasks {
        let result = task.await.unwrap();
        ids.push(result.conversation.id);
        created += usize::from(result.created);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);

    let list = h.chat.list_conversations(&teacher, &PaginationParams::default()).unwrap();
    assert_eq!(list.total, 1);
    assert_eq!(list.items[0].counterpart_id, Some(colleague.id));
}

#[tokio::test]
async fn disallowed_roles_and_self_chats_are_refused() {
    let h = Harness::new();
    let parent = h.user(Role::Parent);
    let other_parent = h.user(Role::Parent);

    let err = h.chat.start_chat(&parent, other_parent.id, None).await.unwrap_err();
    assert!(err.is(ErrorCode::CorrespondentNotAllowed));
    let err = h.chat.start_chat(&parent, parent.id, None).await.unwrap_err();
    assert!(err.is(ErrorCode::ValidationError));
    let err = h.chat.start_chat(&parent, Uuid::new_v4(), None).await.unwrap_err();
    assert!(err.is(ErrorCode::NotFound));
}

#[tokio::test]
async fn admin_group_reaches_every_member() {
    let h = Harness::new();
    let admin = h.user(Role::SchoolAdmin);
    let members: Vec<AuthUser> = (0..4).map(|_| h.user(Role::Teacher)).collect();
    let mut sessions: Vec<Session> = members.iter().map(|m| h.chat.connect(m)).collect();

    let ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
    let created = h
        .chat
        .create_group(&admin, &ids, Some("  Year 5 staff  "), Some(MessagePayload::text("Welcome")))
        .await
        .unwrap();
    let group = created.conversation;
    assert_eq!(group.name.as_deref(), Some("Year 5 staff"));
    assert_eq!(group.status, ApprovalStatus::Approved);
    assert_eq!(group.participants.len(), 5);
    assert_eq!(group.participants[0], admin.id);

    for session in &mut sessions {
        assert_eq!(names(&drain(session)), ["new_conversation"]);
    }
    assert!(h.notifications.recipients().is_empty());

    // Any member may write straight away.
    h.chat.send_message(&members[2], group.id, MessagePayload::text("Thanks")).await.unwrap();

    let err = h.chat.create_group(&members[0], &[admin.id], Some("Rogue"), None).await.unwrap_err();
    assert!(err.is(ErrorCode::Forbidden));
    let err = h.chat.create_group(&admin, &ids, Some("   "), None).await.unwrap_err();
    assert!(err.is(ErrorCode::GroupNameRequired));
    let err = h.chat.create_group(&admin, &[admin.id], Some("Alone"), None).await.unwrap_err();
    assert!(err.is(ErrorCode::InvalidParticipants));
}

#[tokio::test]
async fn presence_follows_the_last_session() {
    let h = Harness::new();
    let teacher = h.user(Role::Teacher);
    let parent = h.user(Role::Parent);

    let first = h.chat.connect(&teacher);
    let second = h.chat.connect(&teacher);
    assert!(h.chat.presence(&parent, teacher.id).unwrap().is_online);

    h.chat.disconnect(first.id());
    assert!(h.chat.presence(&parent, teacher.id).unwrap().is_online);

    h.chat.disconnect(second.id());
    h.chat.disconnect(second.id());
    let record = h.chat.presence(&parent, teacher.id).unwrap();
    assert!(!record.is_online);
    assert!(record.last_seen_at.is_some());
}

#[tokio::test]
async fn typing_reaches_the_room_and_stops_on_disconnect() {
    let h = Harness::new();
    let teacher = h.user(Role::Teacher);
    let colleague = h.user(Role::Teacher);
    let created = h.chat.start_chat(&teacher, colleague.id, None).await.unwrap();
    let conversation_id = created.conversation.id;
    h.chat.respond(&colleague, conversation_id, Decision::Approve).await.unwrap();

    let mut typer = h.chat.connect(&teacher);
    let mut watcher = h.chat.connect(&colleague);

    let err = h.chat.start_typing(typer.id(), conversation_id).unwrap_err();
    assert!(err.is(ErrorCode::NotInRoom));

    h.chat.join_conversation(typer.id(), conversation_id).await.unwrap();
    h.chat.join_conversation(watcher.id(), conversation_id).await.unwrap();
    drain(&mut typer);
    drain(&mut watcher);

    h.chat.start_typing(typer.id(), conversation_id).unwrap();
    let events = drain(&mut watcher);
    match events.as_slice() {
        [ServerEvent::UserTyping(signal)] => {
            assert_eq!(signal.identity_id, teacher.id);
            assert!(signal.expires_at > chrono::Utc::now());
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(drain(&mut typer).is_empty());

    h.chat.disconnect(typer.id());
    assert_eq!(names(&drain(&mut watcher)), ["user_stopped_typing"]);
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let h = Harness::new();
    let teacher = h.user(Role::Teacher);
    let colleague = h.user(Role::Teacher);
    let conversation = h.chat.start_chat(&teacher, colleague.id, None).await.unwrap().conversation;

    let other_tenant = Uuid::new_v4();
    let outsider = h.user_in(other_tenant, Role::Teacher);

    let err = h.chat.get_conversation(&outsider, conversation.id).unwrap_err();
    assert!(err.is(ErrorCode::ScopeViolation));
    let err = h
        .chat
        .send_message(&outsider, conversation.id, MessagePayload::text("hi"))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::ScopeViolation));
    let err = h.chat.start_chat(&outsider, teacher.id, None).await.unwrap_err();
    assert!(err.is(ErrorCode::ScopeViolation));
    let err = h.chat.presence(&outsider, teacher.id).unwrap_err();
    assert!(err.is(ErrorCode::ScopeViolation));

    let session = h.chat.connect(&outsider);
    let err = h.chat.join_conversation(session.id(), conversation.id).await.unwrap_err();
    assert!(err.is(ErrorCode::ScopeViolation));

    let list = h.chat.list_conversations(&outsider, &PaginationParams::default()).unwrap();
    assert_eq!(list.total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_arrive_in_commit_order() {
    let h = Harness::new();
    let admin = h.user(Role::SchoolAdmin);
    let a = h.user(Role::Teacher);
    let b = h.user(Role::Teacher);
    let group = h
        .chat
        .create_group(&admin, &[a.id, b.id], Some("Staff"), None)
        .await
        .unwrap()
        .conversation;

    let mut watcher = h.chat.connect(&admin);
    h.chat.join_conversation(watcher.id(), group.id).await.unwrap();
    drain(&mut watcher);

    let senders: Vec<_> = [a, b]
        .into_iter()
        .map(|sender| {
            let chat = h.chat.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    chat.send_message(&sender, group.id, MessagePayload::text(format!("msg {i}")))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in senders {
        task.await.unwrap();
    }

    let delivered: Vec<_> = drain(&mut watcher)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 50);
    assert!(delivered.windows(2).all(|w| w[0].created_at < w[1].created_at));

    let stored = h
        .chat
        .list_messages(&admin, group.id, &PaginationParams::new(100, 0))
        .unwrap();
    let stored_ids: Vec<Uuid> = stored.items.iter().map(|m| m.id).collect();
    let delivered_ids: Vec<Uuid> = delivered.iter().map(|m| m.id).collect();
    assert_eq!(stored_ids, delivered_ids);
}

#[tokio::test]
async fn slow_session_is_evicted_without_blocking_writers() {
    let notifications = Arc::new(Recording::default());
    let h = Harness::build(notifications.clone(), notifications, 2);
    let admin = h.user(Role::SchoolAdmin);
    let teacher = h.user(Role::Teacher);
    let group = h
        .chat
        .create_group(&admin, &[teacher.id], Some("Office"), None)
        .await
        .unwrap()
        .conversation;

    let slow = h.chat.connect(&teacher);
    let mut fast = h.chat.connect(&admin);
    h.chat.join_conversation(slow.id(), group.id).await.unwrap();
    h.chat.join_conversation(fast.id(), group.id).await.unwrap();

    for i in 0..5 {
        drain(&mut fast);
        h.chat.send_message(&admin, group.id, MessagePayload::text(format!("{i}"))).await.unwrap();
    }

    assert_eq!(h.chat.gateway().session_count(), 1);
    assert!(!h.chat.gateway().presence().is_online(teacher.id));
    assert!(h.chat.gateway().presence().is_online(admin.id));

    let mut slow = slow;
    let mut received = 0;
    while slow.recv().await.is_some() {
        received += 1;
    }
    assert!(received <= 2);
}

#[tokio::test]
async fn failing_notification_sink_does_not_fail_the_request() {
    let h = Harness::build(Arc::new(Recording::default()), Arc::new(Failing), 16);
    let parent = h.user(Role::Parent);
    let teacher = h.user(Role::Teacher);

    let created = h.chat.start_chat(&parent, teacher.id, Some(MessagePayload::text("hello"))).await.unwrap();
    assert!(created.created);
    assert_eq!(created.conversation.status, ApprovalStatus::Pending);
}
