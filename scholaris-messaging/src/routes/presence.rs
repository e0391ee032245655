use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use scholaris_shared::errors::AppResult;
use scholaris_shared::types::api::ApiResponse;
use scholaris_shared::types::auth::AuthUser;

use crate::presence::PresenceRecord;
use crate::AppState;

/// GET /presence/:identity_id - online flag and last-seen time of a same-tenant identity
pub async fn get_presence(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(identity_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<PresenceRecord>>> {
    let record = state.chat.presence(&auth_user, identity_id)?;
    Ok(Json(ApiResponse::ok(record)))
}
