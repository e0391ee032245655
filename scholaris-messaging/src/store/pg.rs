use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use diesel::dsl::{exists, not};
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use uuid::Uuid;

use scholaris_shared::clients::db::DbPool;
use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use super::{next_message_timestamp, now_micros, Appended, ChatStore, Created};
use crate::admission::{self, WriteIntent};
use crate::models::{
    pair_key, ApprovalStatus, Attachment, Conversation, ConversationPreview, Decision, Message,
    MessagePayload, NewConversation, ReadReceipt,
};
use crate::schema::{conversation_participants, conversations, message_reads, messages};
use crate::scope::TenantScope;

// --- Rows ---

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ConversationRow {
    id: Uuid,
    tenant_id: Uuid,
    conversation_type: String,
    name: Option<String>,
    status: String,
    created_by: Uuid,
    requested_by: Option<Uuid>,
    request_message_id: Option<Uuid>,
    last_message_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationRow {
    fn into_conversation(self, participants: Vec<Uuid>) -> AppResult<Conversation> {
        Ok(Conversation {
            id: self.id,
            tenant_id: self.tenant_id,
            conversation_type: self.conversation_type.parse()?,
            participants,
            name: self.name,
            status: self.status.parse()?,
            created_by: self.created_by,
            requested_by: self.requested_by,
            request_message_id: self.request_message_id,
            last_message_at: self.last_message_at,
            responded_at: self.responded_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = conversations)]
struct NewConversationRow<'a> {
    id: Uuid,
    tenant_id: Uuid,
    conversation_type: &'a str,
    name: Option<&'a str>,
    status: &'a str,
    pair_key: Option<&'a str>,
    created_by: Uuid,
    requested_by: Option<Uuid>,
    last_message_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = conversation_participants)]
struct ParticipantRow {
    conversation_id: Uuid,
    identity_id: Uuid,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    tenant_id: Uuid,
    sender_id: Uuid,
    message_type: String,
    content: Option<String>,
    attachment: Option<serde_json::Value>,
    reply_to: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self, readers: Vec<Uuid>) -> AppResult<Message> {
        let attachment = self
            .attachment
            .map(serde_json::from_value::<Attachment>)
            .transpose()
            .map_err(|e| AppError::Internal(e.into()))?;

        let mut message = Message {
            id: self.id,
            conversation_id: self.conversation_id,
            tenant_id: self.tenant_id,
            sender_id: self.sender_id,
            message_type: self.message_type.parse()?,
            content: self.content,
            attachment,
            reply_to: self.reply_to,
            created_at: self.created_at,
            read: false,
            read_by: BTreeSet::new(),
        };
        message.merge_read_by(readers);
        Ok(message)
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    id: Uuid,
    conversation_id: Uuid,
    tenant_id: Uuid,
    sender_id: Uuid,
    message_type: &'a str,
    content: Option<&'a str>,
    attachment: Option<serde_json::Value>,
    reply_to: Option<Uuid>,
    created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = message_reads)]
struct ReadRow {
    message_id: Uuid,
    identity_id: Uuid,
    read_at: DateTime<Utc>,
}

// --- Queries ---

fn load_conversation(conn: &mut PgConnection, id: Uuid, for_update: bool) -> AppResult<Conversation> {
    let query = conversations::table.find(id).select(ConversationRow::as_select());
    let row = if for_update {
        query.for_update().first(conn).optional()?
    } else {
        query.first(conn).optional()?
    };
    let row = row.ok_or_else(AppError::conversation_not_found)?;
    let participants = load_participants(conn, row.id)?;
    row.into_conversation(participants)
}

fn load_participants(conn: &mut PgConnection, conversation_id: Uuid) -> QueryResult<Vec<Uuid>> {
    conversation_participants::table
        .filter(conversation_participants::conversation_id.eq(conversation_id))
        .order((conversation_participants::joined_at.asc(), conversation_participants::identity_id.asc()))
        .select(conversation_participants::identity_id)
        .load(conn)
}

fn with_readers(conn: &mut PgConnection, rows: Vec<MessageRow>) -> AppResult<Vec<Message>> {
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let reads: Vec<(Uuid, Uuid)> = message_reads::table
        .filter(message_reads::message_id.eq_any(&ids))
        .select((message_reads::message_id, message_reads::identity_id))
        .load(conn)?;

    let mut by_message: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (message_id, identity_id) in reads {
        by_message.entry(message_id).or_default().push(identity_id);
    }

    rows.into_iter()
        .map(|row| {
            let readers = by_message.remove(&row.id).unwrap_or_default();
            row.into_message(readers)
        })
        .collect()
}

fn unread_in(conn: &mut PgConnection, conversation_id: Uuid, identity_id: Uuid) -> QueryResult<i64> {
    messages::table
        .filter(messages::conversation_id.eq(conversation_id))
        .filter(messages::sender_id.ne(identity_id))
        .filter(not(exists(
            message_reads::table
                .filter(message_reads::message_id.eq(messages::id))
                .filter(message_reads::identity_id.eq(identity_id)),
        )))
        .count()
        .get_result(conn)
}

fn conversations_of(tenant_id: Uuid, identity_id: Uuid) -> conversations::BoxedQuery<'static, Pg> {
    conversations::table
        .filter(conversations::tenant_id.eq(tenant_id))
        .filter(
            conversations::id.eq_any(
                conversation_participants::table
                    .filter(conversation_participants::identity_id.eq(identity_id))
                    .select(conversation_participants::conversation_id),
            ),
        )
        .into_boxed()
}

type PgPooled = PooledConnection<ConnectionManager<PgConnection>>;

/// Postgres-backed store. Writes that depend on approval state lock the
/// conversation row with `SELECT ... FOR UPDATE` for the whole transaction.
pub struct PgChatStore {
    pool: DbPool,
}

impl PgChatStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> AppResult<PgPooled> {
        self.pool.get().map_err(|e| AppError::Internal(e.into()))
    }
}

impl ChatStore for PgChatStore {
    fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok(())
    }

    fn create_conversation(
        &self,
        scope: &TenantScope,
        new: NewConversation,
    ) -> AppResult<Created<Conversation>> {
        let mut conn = self.conn()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let id = Uuid::now_v7();
            let now = now_micros();
            let key = new.pair_key();

            let inserted = diesel::insert_into(conversations::table)
                .values(&NewConversationRow {
                    id,
                    tenant_id: scope.tenant_id(),
                    conversation_type: new.conversation_type.as_str(),
                    name: new.name.as_deref(),
                    status: new.status.as_str(),
                    pair_key: key.as_deref(),
                    created_by: new.created_by,
                    requested_by: new.requested_by(),
                    last_message_at: now,
                    created_at: now,
                    updated_at: now,
                })
                .on_conflict_do_nothing()
                .execute(conn)?;

            if inserted == 0 {
                // Only the per-tenant pair index can conflict here.
                let key = key.ok_or_else(|| AppError::internal("conversation insert conflicted without a pair key"))?;
                let row = conversations::table
                    .filter(conversations::tenant_id.eq(scope.tenant_id()))
                    .filter(conversations::pair_key.eq(&key))
                    .select(ConversationRow::as_select())
                    .first(conn)?;
                let participants = load_participants(conn, row.id)?;
                return Ok(Created {
                    value: row.into_conversation(participants)?,
                    created: false,
                });
            }

            let members: Vec<ParticipantRow> = new
                .participants
                .iter()
                .map(|identity_id| ParticipantRow {
                    conversation_id: id,
                    identity_id: *identity_id,
                    joined_at: now,
                })
                .collect();
            diesel::insert_into(conversation_participants::table)
                .values(&members)
                .execute(conn)?;

            tracing::debug!(conversation_id = %id, kind = new.conversation_type.as_str(), "conversation stored");

            Ok(Created {
                value: new.into_conversation(id, scope.tenant_id(), now),
                created: true,
            })
        })
    }

    fn get_conversation(&self, scope: &TenantScope, conversation_id: Uuid) -> AppResult<Conversation> {
        let mut conn = self.conn()?;
        let conversation = load_conversation(&mut conn, conversation_id, false)?;
        scope.ensure_tenant(conversation.tenant_id, "conversation")?;
        Ok(conversation)
    }

    fn find_private_conversation(
        &self,
        scope: &TenantScope,
        a: Uuid,
        b: Uuid,
    ) -> AppResult<Option<Conversation>> {
        let mut conn = self.conn()?;
        let row = conversations::table
            .filter(conversations::tenant_id.eq(scope.tenant_id()))
            .filter(conversations::pair_key.eq(pair_key(a, b)))
            .select(ConversationRow::as_select())
            .first(&mut conn)
            .optional()?;

        row.map(|row| {
            let participants = load_participants(&mut conn, row.id)?;
            row.into_conversation(participants)
        })
        .transpose()
    }

    fn list_conversations(
        &self,
        scope: &TenantScope,
        identity_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<ConversationPreview>> {
        let mut conn = self.conn()?;

        let total: i64 = conversations_of(scope.tenant_id(), identity_id)
            .count()
            .get_result(&mut conn)?;

        let (offset, limit) = page.sql_window();
        let rows: Vec<ConversationRow> = conversations_of(scope.tenant_id(), identity_id)
            .order((conversations::last_message_at.desc(), conversations::id.desc()))
            .offset(offset)
            .limit(limit)
            .select(ConversationRow::as_select())
            .load(&mut conn)?;

        let mut previews = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = load_participants(&mut conn, row.id)?;
            let conversation = row.into_conversation(participants)?;

            let last_row: Option<MessageRow> = messages::table
                .filter(messages::conversation_id.eq(conversation.id))
                .order(messages::created_at.desc())
                .select(MessageRow::as_select())
                .first(&mut conn)
                .optional()?;
            let last_message = match last_row {
                Some(row) => with_readers(&mut conn, vec![row])?.pop(),
                None => None,
            };

            let unread = unread_in(&mut conn, conversation.id, identity_id)?;

            previews.push(ConversationPreview {
                counterpart_id: conversation.counterpart_of(identity_id),
                last_message,
                unread_count: unread as u64,
                conversation,
            });
        }

        Ok(Paginated::new(previews, total as u64, page))
    }

    fn append_message(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: MessagePayload,
        intent: WriteIntent,
    ) -> AppResult<Appended> {
        let mut conn = self.conn()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let mut conversation = load_conversation(conn, conversation_id, true)?;
            scope.ensure_tenant(conversation.tenant_id, "conversation")?;
            admission::authorize_write(&conversation, sender_id, intent)?;

            if let Some(reply_to) = payload.reply_to {
                let found: i64 = messages::table
                    .filter(messages::id.eq(reply_to))
                    .filter(messages::conversation_id.eq(conversation_id))
                    .count()
                    .get_result(conn)?;
                if found == 0 {
                    return Err(AppError::new(ErrorCode::MessageNotFound, "replied-to message not found"));
                }
            }

            let id = Uuid::now_v7();
            let created_at = next_message_timestamp(conversation.last_message_at, now_micros());
            let attachment = payload
                .attachment
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| AppError::Internal(e.into()))?;

            diesel::insert_into(messages::table)
                .values(&NewMessageRow {
                    id,
                    conversation_id,
                    tenant_id: conversation.tenant_id,
                    sender_id,
                    message_type: payload.message_type.as_str(),
                    content: payload.content.as_deref(),
                    attachment,
                    reply_to: payload.reply_to,
                    created_at,
                })
                .execute(conn)?;

            diesel::insert_into(message_reads::table)
                .values(&ReadRow {
                    message_id: id,
                    identity_id: sender_id,
                    read_at: created_at,
                })
                .execute(conn)?;

            if intent == WriteIntent::Request && conversation.status == ApprovalStatus::Pending {
                conversation.request_message_id = Some(id);
            }
            conversation.last_message_at = created_at;
            conversation.updated_at = created_at;

            diesel::update(conversations::table.find(conversation_id))
                .set((
                    conversations::last_message_at.eq(created_at),
                    conversations::updated_at.eq(created_at),
                    conversations::request_message_id.eq(conversation.request_message_id),
                ))
                .execute(conn)?;

            let message = Message {
                id,
                conversation_id,
                tenant_id: conversation.tenant_id,
                sender_id,
                message_type: payload.message_type,
                content: payload.content,
                attachment: payload.attachment,
                reply_to: payload.reply_to,
                created_at,
                read: false,
                read_by: BTreeSet::from([sender_id]),
            };

            Ok(Appended { message, conversation })
        })
    }

    fn list_messages(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        page: &PaginationParams,
    ) -> AppResult<Paginated<Message>> {
        let mut conn = self.conn()?;
        let conversation = load_conversation(&mut conn, conversation_id, false)?;
        scope.ensure_tenant(conversation.tenant_id, "conversation")?;

        let total: i64 = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .count()
            .get_result(&mut conn)?;

        let (offset, limit) = page.sql_window();
        let rows: Vec<MessageRow> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order(messages::created_at.asc())
            .offset(offset)
            .limit(limit)
            .select(MessageRow::as_select())
            .load(&mut conn)?;

        let items = with_readers(&mut conn, rows)?;
        Ok(Paginated::new(items, total as u64, page))
    }

    fn mark_read(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        identity_id: Uuid,
    ) -> AppResult<ReadReceipt> {
        let mut conn = self.conn()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let conversation = load_conversation(conn, conversation_id, false)?;
            scope.ensure_tenant(conversation.tenant_id, "conversation")?;
            if !conversation.is_participant(identity_id) {
                return Err(AppError::not_participant());
            }

            let read_at = now_micros();
            let unread: Vec<Uuid> = messages::table
                .filter(messages::conversation_id.eq(conversation_id))
                .filter(not(exists(
                    message_reads::table
                        .filter(message_reads::message_id.eq(messages::id))
                        .filter(message_reads::identity_id.eq(identity_id)),
                )))
                .order(messages::created_at.asc())
                .select(messages::id)
                .load(conn)?;

            if unread.is_empty() {
                return Ok(ReadReceipt {
                    conversation_id,
                    reader_id: identity_id,
                    message_ids: Vec::new(),
                    read_at,
                });
            }

            let rows: Vec<ReadRow> = unread
                .iter()
                .map(|message_id| ReadRow {
                    message_id: *message_id,
                    identity_id,
                    read_at,
                })
                .collect();

            // A concurrent mark_read may have inserted some of these already.
            let message_ids: Vec<Uuid> = diesel::insert_into(message_reads::table)
                .values(&rows)
                .on_conflict_do_nothing()
                .returning(message_reads::message_id)
                .get_results(conn)?;

            Ok(ReadReceipt {
                conversation_id,
                reader_id: identity_id,
                message_ids,
                read_at,
            })
        })
    }

    fn set_status(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        responder_id: Uuid,
        decision: Decision,
    ) -> AppResult<Conversation> {
        let mut conn = self.conn()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let mut conversation = load_conversation(conn, conversation_id, true)?;
            scope.ensure_tenant(conversation.tenant_id, "conversation")?;
            admission::authorize_response(&conversation, responder_id)?;

            let now = now_micros();
            conversation.status = decision.resulting_status();
            conversation.responded_at = Some(now);
            conversation.updated_at = now;

            diesel::update(conversations::table.find(conversation_id))
                .set((
                    conversations::status.eq(conversation.status.as_str()),
                    conversations::responded_at.eq(now),
                    conversations::updated_at.eq(now),
                ))
                .execute(conn)?;

            Ok(conversation)
        })
    }

    fn reopen_request(
        &self,
        scope: &TenantScope,
        conversation_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Conversation> {
        let mut conn = self.conn()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let mut conversation = load_conversation(conn, conversation_id, true)?;
            scope.ensure_tenant(conversation.tenant_id, "conversation")?;
            admission::authorize_reopen(&conversation, requester_id)?;

            let now = now_micros();
            conversation.status = ApprovalStatus::Pending;
            conversation.requested_by = Some(requester_id);
            conversation.request_message_id = None;
            conversation.responded_at = None;
            conversation.updated_at = now;

            diesel::update(conversations::table.find(conversation_id))
                .set((
                    conversations::status.eq(ApprovalStatus::Pending.as_str()),
                    conversations::requested_by.eq(Some(requester_id)),
                    conversations::request_message_id.eq(None::<Uuid>),
                    conversations::responded_at.eq(None::<DateTime<Utc>>),
                    conversations::updated_at.eq(now),
                ))
                .execute(conn)?;

            Ok(conversation)
        })
    }

    fn unread_count(&self, scope: &TenantScope, conversation_id: Uuid, identity_id: Uuid) -> AppResult<u64> {
        let mut conn = self.conn()?;
        let conversation = load_conversation(&mut conn, conversation_id, false)?;
        scope.ensure_tenant(conversation.tenant_id, "conversation")?;
        Ok(unread_in(&mut conn, conversation_id, identity_id)? as u64)
    }

    fn total_unread(&self, scope: &TenantScope, identity_id: Uuid) -> AppResult<u64> {
        let mut conn = self.conn()?;
        let count: i64 = messages::table
            .filter(messages::tenant_id.eq(scope.tenant_id()))
            .filter(messages::sender_id.ne(identity_id))
            .filter(
                messages::conversation_id.eq_any(
                    conversation_participants::table
                        .filter(conversation_participants::identity_id.eq(identity_id))
                        .select(conversation_participants::conversation_id),
                ),
            )
            .filter(not(exists(
                message_reads::table
                    .filter(message_reads::message_id.eq(messages::id))
                    .filter(message_reads::identity_id.eq(identity_id)),
            )))
            .count()
            .get_result(&mut conn)?;
        Ok(count as u64)
    }
}
