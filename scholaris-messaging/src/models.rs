use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};

const MAX_CONTENT_CHARS: usize = 4_000;
const MAX_GROUP_NAME_CHARS: usize = 100;

// --- Enumerations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Private,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn resulting_status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        }
    }
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(AppError::internal(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

str_enum!(ConversationType { Private => "private", Group => "group" });
str_enum!(ApprovalStatus { Pending => "pending", Approved => "approved", Rejected => "rejected" });
str_enum!(MessageType { Text => "text", Image => "image", File => "file" });

// --- Conversation ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<Uuid>,
    pub name: Option<String>,
    pub status: ApprovalStatus,
    pub created_by: Uuid,
    /// Identity whose approval request is outstanding or was last decided.
    pub requested_by: Option<Uuid>,
    /// The one message allowed in before approval.
    pub request_message_id: Option<Uuid>,
    pub last_message_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_private(&self) -> bool {
        self.conversation_type == ConversationType::Private
    }

    pub fn is_participant(&self, identity_id: Uuid) -> bool {
        self.participants.contains(&identity_id)
    }

    /// The other participant of a private conversation.
    pub fn counterpart_of(&self, identity_id: Uuid) -> Option<Uuid> {
        if !self.is_private() || !self.is_participant(identity_id) {
            return None;
        }
        self.participants.iter().copied().find(|p| *p != identity_id)
    }
}

/// Unordered-pair key for a private conversation. Unique per tenant.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Input to `ChatStore::create_conversation`, already vetted by admission control.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation_type: ConversationType,
    pub participants: Vec<Uuid>,
    pub name: Option<String>,
    pub status: ApprovalStatus,
    pub created_by: Uuid,
}

impl NewConversation {
    pub fn private(created_by: Uuid, counterpart: Uuid, status: ApprovalStatus) -> Self {
        Self {
            conversation_type: ConversationType::Private,
            participants: vec![created_by, counterpart],
            name: None,
            status,
            created_by,
        }
    }

    pub fn group(created_by: Uuid, participants: Vec<Uuid>, name: String) -> Self {
        Self {
            conversation_type: ConversationType::Group,
            participants,
            name: Some(name),
            status: ApprovalStatus::Approved,
            created_by,
        }
    }

    pub fn pair_key(&self) -> Option<String> {
        match (self.conversation_type, self.participants.as_slice()) {
            (ConversationType::Private, [a, b]) => Some(pair_key(*a, *b)),
            _ => None,
        }
    }

    /// The identity whose request is outstanding, if this starts out pending.
    pub fn requested_by(&self) -> Option<Uuid> {
        (self.status == ApprovalStatus::Pending).then_some(self.created_by)
    }

    pub fn into_conversation(self, id: Uuid, tenant_id: Uuid, now: DateTime<Utc>) -> Conversation {
        Conversation {
            id,
            tenant_id,
            conversation_type: self.conversation_type,
            requested_by: self.requested_by(),
            participants: self.participants,
            name: self.name,
            status: self.status,
            created_by: self.created_by,
            request_message_id: None,
            last_message_at: now,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// --- Message ---

/// Opaque upload reference; the core never looks inside the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub reference: String,
    pub storage_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub read_by: BTreeSet<Uuid>,
}

impl Message {
    /// Union `readers` into `read_by`. Returns true when anything was added.
    pub fn merge_read_by<I: IntoIterator<Item = Uuid>>(&mut self, readers: I) -> bool {
        let before = self.read_by.len();
        self.read_by.extend(readers);
        self.read = self.read_by.iter().any(|r| *r != self.sender_id);
        self.read_by.len() != before
    }

    pub fn is_read_by(&self, identity_id: Uuid) -> bool {
        self.read_by.contains(&identity_id)
    }

    pub fn preview(&self) -> String {
        match self.message_type {
            MessageType::Text => self
                .content
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(100)
                .collect(),
            MessageType::Image => "[image]".to_string(),
            MessageType::File => "[file]".to_string(),
        }
    }
}

/// What a sender supplies for a new message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, alias = "messageType")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default, alias = "replyTo")]
    pub reply_to: Option<Uuid>,
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(content) = &self.content {
            if content.chars().count() > MAX_CONTENT_CHARS {
                return Err(AppError::Validation(format!(
                    "message content exceeds {MAX_CONTENT_CHARS} characters"
                )));
            }
        }

        match self.message_type {
            MessageType::Text => {
                if self.content.as_ref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(AppError::new(ErrorCode::ValidationError, "text message must have content"));
                }
                if self.attachment.is_some() {
                    return Err(AppError::new(ErrorCode::ValidationError, "text message cannot carry an attachment"));
                }
            }
            MessageType::Image | MessageType::File => {
                let has_reference = self
                    .attachment
                    .as_ref()
                    .map_or(false, |a| !a.reference.trim().is_empty());
                if !has_reference {
                    return Err(AppError::new(
                        ErrorCode::ValidationError,
                        "image and file messages require an upload reference",
                    ));
                }
            }
        }

        Ok(())
    }
}

pub fn validate_group_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::new(ErrorCode::GroupNameRequired, "group name is required"));
    }
    if trimmed.chars().count() > MAX_GROUP_NAME_CHARS {
        return Err(AppError::Validation(format!(
            "group name exceeds {MAX_GROUP_NAME_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

// --- Reads ---

/// Result of a `mark_read` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub reader_id: Uuid,
    pub message_ids: Vec<Uuid>,
    pub read_at: DateTime<Utc>,
}

impl ReadReceipt {
    pub fn changed(&self) -> bool {
        !self.message_ids.is_empty()
    }
}

/// Conversation list entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationPreview {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub counterpart_id: Option<Uuid>,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: Uuid) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sender_id: sender,
            message_type: MessageType::Text,
            content: Some("hello".into()),
            attachment: None,
            reply_to: None,
            created_at: Utc::now(),
            read: false,
            read_by: BTreeSet::from([sender]),
        }
    }

    #[test]
    fn pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
        assert_ne!(pair_key(a, b), pair_key(a, Uuid::new_v4()));
    }

    #[test]
    fn group_has_no_pair_key() {
        let creator = Uuid::new_v4();
        let conv = NewConversation::group(creator, vec![creator, Uuid::new_v4()], "Staff".into());
        assert!(conv.pair_key().is_none());
        assert_eq!(conv.status, ApprovalStatus::Approved);
    }

    #[test]
    fn read_flag_follows_other_readers() {
        let sender = Uuid::new_v4();
        let mut msg = message(sender);
        assert!(!msg.merge_read_by([sender]));
        assert!(!msg.read);

        let reader = Uuid::new_v4();
        assert!(msg.merge_read_by([reader]));
        assert!(msg.read);
        assert!(!msg.merge_read_by([reader]));
    }

    #[test]
    fn payload_validation() {
        assert!(MessagePayload::text("hi").validate().is_ok());
        assert!(MessagePayload::text("   ").validate().is_err());

        let image = MessagePayload {
            message_type: MessageType::Image,
            ..Default::default()
        };
        assert!(image.validate().is_err());

        let image = MessagePayload {
            message_type: MessageType::Image,
            attachment: Some(Attachment {
                reference: "uploads/abc.png".into(),
                storage_tag: "minio:scholaris".into(),
                file_name: None,
                content_type: Some("image/png".into()),
                size_bytes: Some(12),
            }),
            ..Default::default()
        };
        assert!(image.validate().is_ok());
    }

    #[test]
    fn conversation_type_serializes_as_type() {
        let json = serde_json::to_value(ConversationType::Private).unwrap();
        assert_eq!(json, "private");
        assert_eq!("rejected".parse::<ApprovalStatus>().unwrap(), ApprovalStatus::Rejected);
    }

    #[test]
    fn group_name_is_trimmed_and_required() {
        assert_eq!(validate_group_name("  Year 5 ").unwrap(), "Year 5");
        assert!(validate_group_name("  ").unwrap_err().is(ErrorCode::GroupNameRequired));
    }
}
