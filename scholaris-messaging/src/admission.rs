//! Who may talk to whom, and when.
//!
//! Creation checks (role adjacency, group capability) run before the store is
//! touched. The write, response and reopen gates are plain functions over a
//! `Conversation` so the stores can evaluate them while holding the
//! conversation lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::auth::{Capability, Role};

use crate::directory::{DirectoryEntry, DirectoryLookup};
use crate::gateway::SessionId;
use crate::models::{validate_group_name, ApprovalStatus, Conversation, NewConversation};
use crate::scope::TenantScope;

/// Whether a write is an ordinary message or the one attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    Regular,
    Request,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionPolicy {
    #[serde(default = "default_require_approval")]
    pub require_approval: bool,
    /// Caller role -> roles it may open a private chat with.
    #[serde(default = "default_adjacency")]
    pub adjacency: HashMap<Role, Vec<Role>>,
}

fn default_require_approval() -> bool { true }

fn default_adjacency() -> HashMap<Role, Vec<Role>> {
    HashMap::from([
        (Role::Parent, vec![Role::Teacher, Role::SchoolAdmin]),
        (Role::Teacher, vec![Role::Parent, Role::Teacher, Role::SchoolAdmin]),
        (Role::SchoolAdmin, vec![Role::Teacher, Role::Parent, Role::SchoolAdmin]),
        (Role::Student, vec![Role::Teacher]),
    ])
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            require_approval: default_require_approval(),
            adjacency: default_adjacency(),
        }
    }
}

impl AdmissionPolicy {
    pub fn allows(&self, from: Role, to: Role) -> bool {
        self.adjacency
            .get(&from)
            .map_or(false, |targets| targets.contains(&to))
    }

    pub fn initial_status(&self) -> ApprovalStatus {
        if self.require_approval {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::Approved
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub default: AdmissionPolicy,
    /// Per-tenant overrides.
    #[serde(default)]
    pub tenants: HashMap<Uuid, AdmissionPolicy>,
}

impl AdmissionConfig {
    pub fn policy_for(&self, tenant_id: Uuid) -> &AdmissionPolicy {
        self.tenants.get(&tenant_id).unwrap_or(&self.default)
    }
}

/// Proof that a session was allowed into a conversation room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomGrant {
    session_id: SessionId,
    conversation_id: Uuid,
}

impl RoomGrant {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

pub struct AdmissionControl {
    config: AdmissionConfig,
    directory: Arc<dyn DirectoryLookup>,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig, directory: Arc<dyn DirectoryLookup>) -> Self {
        Self { config, directory }
    }

    pub fn policy_for(&self, tenant_id: Uuid) -> &AdmissionPolicy {
        self.config.policy_for(tenant_id)
    }

    /// Looks up an identity that must live in the caller's tenant.
    pub fn resolve(&self, scope: &TenantScope, identity_id: Uuid) -> AppResult<DirectoryEntry> {
        let entry = self
            .directory
            .lookup(identity_id)?
            .ok_or_else(|| AppError::not_found(format!("unknown identity {identity_id}")))?;
        scope.ensure_tenant(entry.tenant_id, "identity")?;
        Ok(entry)
    }

    pub fn admit_private(&self, scope: &TenantScope, counterpart: Uuid) -> AppResult<NewConversation> {
        if counterpart == scope.identity_id() {
            return Err(AppError::Validation("cannot start a chat with yourself".into()));
        }

        let entry = self.resolve(scope, counterpart)?;
        let policy = self.policy_for(scope.tenant_id());
        if !policy.allows(scope.role(), entry.role) {
            return Err(AppError::new(
                ErrorCode::CorrespondentNotAllowed,
                format!("a {} cannot start a chat with a {}", scope.role(), entry.role),
            ));
        }

        Ok(NewConversation::private(scope.identity_id(), counterpart, policy.initial_status()))
    }

    /// Creator first, duplicates dropped, every member checked against the tenant.
    pub fn admit_group(
        &self,
        scope: &TenantScope,
        participants: &[Uuid],
        name: Option<&str>,
    ) -> AppResult<NewConversation> {
        if !scope.role().has_capability(Capability::CreateGroup) {
            return Err(AppError::forbidden("only school administrators can create groups"));
        }

        let name = validate_group_name(name.unwrap_or_default())?;

        let mut seen = HashSet::new();
        let members: Vec<Uuid> = std::iter::once(scope.identity_id())
            .chain(participants.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect();

        if members.len() < 2 {
            return Err(AppError::new(
                ErrorCode::InvalidParticipants,
                "a group needs at least one other participant",
            ));
        }

        for member in members.iter().skip(1) {
            self.resolve(scope, *member)?;
        }

        Ok(NewConversation::group(scope.identity_id(), members, name))
    }

    /// Pending and rejected private chats stay joinable so both sides see the decision.
    pub fn grant_join(
        &self,
        scope: &TenantScope,
        session_id: SessionId,
        conversation: &Conversation,
    ) -> AppResult<RoomGrant> {
        scope.ensure_tenant(conversation.tenant_id, "conversation")?;
        if !conversation.is_participant(scope.identity_id()) {
            return Err(AppError::not_participant());
        }
        Ok(RoomGrant {
            session_id,
            conversation_id: conversation.id,
        })
    }
}

/// Write gate. A pending private chat accepts exactly one message: the
/// requester's request message.
pub fn authorize_write(conversation: &Conversation, sender_id: Uuid, intent: WriteIntent) -> AppResult<()> {
    if !conversation.is_participant(sender_id) {
        return Err(AppError::not_participant());
    }

    if !conversation.is_private() || conversation.status == ApprovalStatus::Approved {
        return Ok(());
    }

    let is_request_message = intent == WriteIntent::Request
        && conversation.status == ApprovalStatus::Pending
        && conversation.requested_by == Some(sender_id)
        && conversation.request_message_id.is_none();

    if is_request_message {
        Ok(())
    } else {
        Err(AppError::not_approved())
    }
}

pub fn authorize_response(conversation: &Conversation, responder_id: Uuid) -> AppResult<()> {
    if !conversation.is_private() {
        return Err(AppError::bad_request("only private conversations need approval"));
    }
    if !conversation.is_participant(responder_id) {
        return Err(AppError::not_participant());
    }
    if conversation.status != ApprovalStatus::Pending {
        return Err(AppError::new(
            ErrorCode::AlreadyResponded,
            format!("this request was already {}", conversation.status.as_str()),
        ));
    }
    if conversation.requested_by == Some(responder_id) {
        return Err(AppError::forbidden("you cannot respond to your own request"));
    }
    Ok(())
}

/// Only a rejected private chat can be requested again.
pub fn authorize_reopen(conversation: &Conversation, requester_id: Uuid) -> AppResult<()> {
    if !conversation.is_private() {
        return Err(AppError::bad_request("only private conversations need approval"));
    }
    if !conversation.is_participant(requester_id) {
        return Err(AppError::not_participant());
    }
    if conversation.status != ApprovalStatus::Rejected {
        return Err(AppError::bad_request(format!(
            "cannot re-request a conversation that is {}",
            conversation.status.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scholaris_shared::types::auth::AuthUser;

    use crate::directory::InMemoryDirectory;
    use crate::models::ConversationType;

    struct Fixture {
        tenant: Uuid,
        admission: AdmissionControl,
        directory: Arc<InMemoryDirectory>,
    }

    fn fixture(config: AdmissionConfig) -> Fixture {
        fixture_for(Uuid::new_v4(), config)
    }

    fn fixture_for(tenant: Uuid, config: AdmissionConfig) -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        Fixture {
            tenant,
            admission: AdmissionControl::new(config, directory.clone()),
            directory,
        }
    }

    impl Fixture {
        fn identity(&self, role: Role) -> Uuid {
            self.identity_in(self.tenant, role)
        }

        fn identity_in(&self, tenant_id: Uuid, role: Role) -> Uuid {
            let identity_id = Uuid::new_v4();
            self.directory.insert(DirectoryEntry { identity_id, tenant_id, role });
            identity_id
        }

        fn scope(&self, identity_id: Uuid, role: Role) -> TenantScope {
            TenantScope::for_caller(&AuthUser {
                id: identity_id,
                role,
                tenant_id: self.tenant,
                token_id: Uuid::new_v4(),
            })
        }
    }

    fn private(requester: Uuid, counterpart: Uuid, status: ApprovalStatus) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::now_v7(),
            tenant_id: Uuid::new_v4(),
            conversation_type: ConversationType::Private,
            participants: vec![requester, counterpart],
            name: None,
            status,
            created_by: requester,
            requested_by: Some(requester),
            request_message_id: None,
            last_message_at: now,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn parent_may_request_teacher_but_not_parent() {
        let f = fixture(AdmissionConfig::default());
        let parent = f.identity(Role::Parent);
        let teacher = f.identity(Role::Teacher);
        let other_parent = f.identity(Role::Parent);
        let scope = f.scope(parent, Role::Parent);

        let new = f.admission.admit_private(&scope, teacher).unwrap();
        assert_eq!(new.status, ApprovalStatus::Pending);

        let err = f.admission.admit_private(&scope, other_parent).unwrap_err();
        assert!(err.is(ErrorCode::CorrespondentNotAllowed));
    }

    #[test]
    fn tenant_policy_can_skip_approval() {
        let tenant = Uuid::new_v4();
        let mut config = AdmissionConfig::default();
        config.tenants.insert(
            tenant,
            AdmissionPolicy {
                require_approval: false,
                ..Default::default()
            },
        );
        let f = fixture_for(tenant, config);
        assert!(f.admission.policy_for(Uuid::new_v4()).require_approval);

        let teacher = f.identity(Role::Teacher);
        let parent = f.identity(Role::Parent);
        let new = f.admission.admit_private(&f.scope(teacher, Role::Teacher), parent).unwrap();
        assert_eq!(new.status, ApprovalStatus::Approved);
    }

    #[test]
    fn self_chat_and_foreign_counterpart_are_rejected() {
        let f = fixture(AdmissionConfig::default());
        let teacher = f.identity(Role::Teacher);
        let scope = f.scope(teacher, Role::Teacher);

        let err = f.admission.admit_private(&scope, teacher).unwrap_err();
        assert!(err.is(ErrorCode::ValidationError));

        let outsider = f.identity_in(Uuid::new_v4(), Role::Parent);
        let err = f.admission.admit_private(&scope, outsider).unwrap_err();
        assert!(err.is(ErrorCode::ScopeViolation));

        let err = f.admission.admit_private(&scope, Uuid::new_v4()).unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[test]
    fn group_requires_capability_and_dedups() {
        let f = fixture(AdmissionConfig::default());
        let admin = f.identity(Role::SchoolAdmin);
        let teacher = f.identity(Role::Teacher);
        let parent = f.identity(Role::Parent);

        let err = f
            .admission
            .admit_group(&f.scope(teacher, Role::Teacher), &[parent], Some("Class"))
            .unwrap_err();
        assert!(err.is(ErrorCode::Forbidden));

        let scope = f.scope(admin, Role::SchoolAdmin);
        let new = f
            .admission
            .admit_group(&scope, &[teacher, parent, teacher, admin], Some(" Class 4B "))
            .unwrap();
        assert_eq!(new.participants, vec![admin, teacher, parent]);
        assert_eq!(new.name.as_deref(), Some("Class 4B"));

        let err = f.admission.admit_group(&scope, &[admin], Some("Solo")).unwrap_err();
        assert!(err.is(ErrorCode::InvalidParticipants));

        let err = f.admission.admit_group(&scope, &[teacher], None).unwrap_err();
        assert!(err.is(ErrorCode::GroupNameRequired));
    }

    #[test]
    fn pending_chat_accepts_only_the_request_message() {
        let requester = Uuid::new_v4();
        let counterpart = Uuid::new_v4();
        let mut conv = private(requester, counterpart, ApprovalStatus::Pending);

        assert!(authorize_write(&conv, requester, WriteIntent::Request).is_ok());
        assert!(authorize_write(&conv, requester, WriteIntent::Regular)
            .unwrap_err()
            .is(ErrorCode::NotApproved));
        assert!(authorize_write(&conv, counterpart, WriteIntent::Request)
            .unwrap_err()
            .is(ErrorCode::NotApproved));

        conv.request_message_id = Some(Uuid::now_v7());
        assert!(authorize_write(&conv, requester, WriteIntent::Request)
            .unwrap_err()
            .is(ErrorCode::NotApproved));

        assert!(authorize_write(&conv, Uuid::new_v4(), WriteIntent::Regular)
            .unwrap_err()
            .is(ErrorCode::NotParticipant));

        conv.status = ApprovalStatus::Approved;
        assert!(authorize_write(&conv, counterpart, WriteIntent::Regular).is_ok());
    }

    #[test]
    fn response_rules() {
        let requester = Uuid::new_v4();
        let counterpart = Uuid::new_v4();
        let mut conv = private(requester, counterpart, ApprovalStatus::Pending);

        assert!(authorize_response(&conv, requester).unwrap_err().is(ErrorCode::Forbidden));
        assert!(authorize_response(&conv, counterpart).is_ok());

        conv.status = ApprovalStatus::Rejected;
        assert!(authorize_response(&conv, counterpart)
            .unwrap_err()
            .is(ErrorCode::AlreadyResponded));
        assert!(authorize_reopen(&conv, requester).is_ok());

        conv.status = ApprovalStatus::Approved;
        assert!(authorize_reopen(&conv, requester).is_err());
    }

    #[test]
    fn join_requires_participancy() {
        let f = fixture(AdmissionConfig::default());
        let parent = f.identity(Role::Parent);
        let teacher = f.identity(Role::Teacher);
        let mut conv = private(parent, teacher, ApprovalStatus::Rejected);
        conv.tenant_id = f.tenant;

        let session = Uuid::new_v4();
        let grant = f.admission.grant_join(&f.scope(parent, Role::Parent), session, &conv).unwrap();
        assert_eq!(grant.conversation_id(), conv.id);
        assert_eq!(grant.session_id(), session);

        let stranger = f.identity(Role::Teacher);
        let err = f
            .admission
            .grant_join(&f.scope(stranger, Role::Teacher), session, &conv)
            .unwrap_err();
        assert!(err.is(ErrorCode::NotParticipant));
    }
}
