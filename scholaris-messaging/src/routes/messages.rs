use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::api::ApiResponse;
use scholaris_shared::types::auth::AuthUser;
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{Message, MessagePayload, ReadReceipt};
use crate::uploads::Upload;
use crate::AppState;

// --- Response DTOs ---

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub total_unread: u64,
}

// --- Handlers ---

/// GET /conversations/:id/messages - paginated messages, oldest first
pub async fn list_messages(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
) -> AppResult<Json<ApiResponse<Paginated<Message>>>> {
    let page = state.chat.list_messages(&auth_user, conversation_id, &params)?;
    Ok(Json(ApiResponse::ok(page)))
}

/// POST /conversations/:id/messages - send a message in a conversation
pub async fn send_message(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<MessagePayload>,
) -> AppResult<(StatusCode, Json<ApiResponse<Message>>)> {
    let message = state.chat.send_message(&auth_user, conversation_id, req).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

/// POST /conversations/:id/media - upload a file and send it as an image or file message
pub async fn send_media(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<ApiResponse<Message>>)> {
    let uploads = state
        .uploads
        .clone()
        .ok_or_else(|| AppError::new(ErrorCode::ServiceUnavailable, "uploads are disabled"))?;

    // Nothing reaches the upload store unless the message could be written.
    state.chat.ensure_can_send(&auth_user, conversation_id)?;

    let mut upload: Option<Upload> = None;
    let mut caption: Option<String> = None;
    let mut reply_to: Option<Uuid> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("failed to read file: {e}")))?;
                upload = Some(Upload {
                    file_name,
                    content_type,
                    bytes: data.to_vec(),
                });
            }
            "content" => {
                let val = field_text(field).await?;
                caption = Some(val).filter(|c| !c.trim().is_empty());
            }
            "reply_to" | "replyTo" => {
                let val = field_text(field).await?;
                let val = val.trim();
                if !val.is_empty() {
                    let id = Uuid::parse_str(val)
                        .map_err(|_| AppError::Validation(format!("replyTo is not a valid id: {val}")))?;
                    reply_to = Some(id);
                }
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| AppError::new(ErrorCode::ValidationError, "no file provided"))?;
    let message_type = upload.message_type();
    let attachment = uploads.store(auth_user.tenant_id, conversation_id, upload).await?;

    let payload = MessagePayload {
        message_type,
        content: caption,
        attachment: Some(attachment),
        reply_to,
    };
    let message = state.chat.send_message(&auth_user, conversation_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

async fn field_text(field: Field<'_>) -> AppResult<String> {
    let name = field.name().unwrap_or("field").to_string();
    field
        .text()
        .await
        .map_err(|e| AppError::Validation(format!("failed to read {name}: {e}")))
}

/// POST /conversations/:id/read - mark every message from others as read
pub async fn mark_read(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ReadReceipt>>> {
    let receipt = state.chat.mark_read(&auth_user, conversation_id).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

/// GET /unread-count - total unread messages across the caller's conversations
pub async fn unread_count(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<UnreadCountResponse>>> {
    let total_unread = state.chat.unread_count(&auth_user)?;
    Ok(Json(ApiResponse::ok(UnreadCountResponse { total_unread })))
}
