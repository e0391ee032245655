use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use scholaris_shared::errors::AppResult;
use scholaris_shared::types::api::ApiResponse;
use scholaris_shared::types::auth::AuthUser;
use scholaris_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{Conversation, ConversationPreview, Decision};
use crate::services::{ConversationCreated, CreateConversation};
use crate::AppState;

// --- Request DTOs ---

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub decision: Decision,
}

// --- Handlers ---

/// GET /conversations - previews of the caller's conversations, most recent first
pub async fn list_conversations(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> AppResult<Json<ApiResponse<Paginated<ConversationPreview>>>> {
    let page = state.chat.list_conversations(&auth_user, &params)?;
    Ok(Json(ApiResponse::ok(page)))
}

/// POST /conversations - start a private chat or create a group.
///
/// Answers 201 when a conversation was created and 200 when an existing
/// private conversation with the same pair was returned.
pub async fn create_conversation(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversation>,
) -> AppResult<(StatusCode, Json<ApiResponse<ConversationCreated>>)> {
    let result = state.chat.create_conversation(&auth_user, req).await?;
    let status = if result.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(ApiResponse::ok(result))))
}

/// GET /conversations/:id
pub async fn get_conversation(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Conversation>>> {
    let conversation = state.chat.get_conversation(&auth_user, conversation_id)?;
    Ok(Json(ApiResponse::ok(conversation)))
}

/// POST /conversations/:id/respond - approve or reject a pending chat request
pub async fn respond(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<RespondRequest>,
) -> AppResult<Json<ApiResponse<Conversation>>> {
    let conversation = state.chat.respond(&auth_user, conversation_id, req.decision).await?;
    Ok(Json(ApiResponse::ok(conversation)))
}
