use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use socketioxide::extract::{AckSender, SocketRef, TryData};
use uuid::Uuid;

use scholaris_shared::errors::AppError;
use scholaris_shared::types::auth::AuthUser;

use crate::gateway::SessionId;
use crate::models::MessagePayload;
use crate::AppState;

/// Gateway session bound to a socket, kept in the socket extensions.
#[derive(Debug, Clone, Copy)]
struct BoundSession(SessionId);

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorPayload {
    fn from(err: &AppError) -> Self {
        match err.code() {
            Some(code) => Self {
                code: code.code().to_string(),
                message: err.to_string(),
            },
            None => Self {
                code: "E0001".into(),
                message: "internal server error".into(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoomRequest {
    #[serde(alias = "conversationId")]
    conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(alias = "conversationId")]
    conversation_id: Uuid,
    #[serde(flatten)]
    message: MessagePayload,
}

fn bound_session(socket: &SocketRef) -> Option<SessionId> {
    socket.extensions.get::<BoundSession>().map(|s| s.0)
}

fn emit_error(socket: &SocketRef, err: &AppError) {
    let _ = socket.emit("error", &ErrorPayload::from(err));
}

/// Bearer token from the handshake `auth.token`, falling back to `?token=`.
pub fn handshake_token(auth: Option<&Value>, query: Option<&str>) -> Option<String> {
    let from_auth = auth
        .and_then(|a| a.get("token"))
        .and_then(Value::as_str)
        .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).to_string());

    from_auth.or_else(|| {
        query.unwrap_or_default().split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    })
}

fn authenticate_socket(socket: &SocketRef, auth: Option<&Value>, state: &AppState) -> Result<AuthUser, AppError> {
    let token = handshake_token(auth, socket.req_parts().uri.query())
        .ok_or_else(|| AppError::unauthorized("missing token"))?;
    state.verifier.verify(&token)
}

pub async fn on_connect_with_state(socket: SocketRef, auth: Option<Value>, state: Arc<AppState>) {
    let caller = match authenticate_socket(&socket, auth.as_ref(), &state) {
        Ok(caller) => caller,
        Err(err) => {
            tracing::warn!(error = %err, sid = %socket.id, "messaging socket auth failed");
            emit_error(&socket, &err);
            socket.disconnect().ok();
            return;
        }
    };

    let session = state.chat.connect_transport(&caller);
    let session_id = session.id();
    socket.extensions.insert(BoundSession(session_id));

    tracing::info!(
        identity_id = %caller.id,
        tenant_id = %caller.tenant_id,
        session_id = %session_id,
        sid = %socket.id,
        "messaging socket connected"
    );

    // Pump gateway events into the socket. The queue closes when the gateway
    // drops the session (disconnect or eviction), which ends the socket too.
    let mut events = session.into_receiver();
    let forward = socket.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.payload() {
                Ok(payload) => {
                    if let Err(e) = forward.emit(event.name(), &payload) {
                        tracing::debug!(error = %e, session_id = %session_id, "socket emit failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, event = event.name(), "failed to encode server event"),
            }
        }
        forward.disconnect().ok();
    });

    let _ = socket.emit(
        "connected",
        &serde_json::json!({ "identity_id": caller.id, "session_id": session_id }),
    );

    socket.on("join_conversation", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<RoomRequest>(req)| {
            let state = state.clone();
            async move { on_join(socket, req, &state).await; }
        }
    });

    socket.on("leave_conversation", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<RoomRequest>(req)| {
            let state = state.clone();
            async move {
                let Some(session_id) = bound_session(&socket) else { return };
                match req {
                    Ok(req) => state.chat.leave_conversation(session_id, req.conversation_id),
                    Err(e) => emit_error(&socket, &AppError::Validation(e.to_string())),
                }
            }
        }
    });

    socket.on("send_message", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<SendRequest>(req), ack: AckSender| {
            let state = state.clone();
            async move { on_send_message(socket, req, ack, &state).await; }
        }
    });

    socket.on("mark_read", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<RoomRequest>(req), ack: AckSender| {
            let state = state.clone();
            async move { on_mark_read(socket, req, ack, &state).await; }
        }
    });

    socket.on("typing_start", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<RoomRequest>(req)| {
            let state = state.clone();
            async move { on_typing(socket, req, true, &state); }
        }
    });

    socket.on("typing_stop", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<RoomRequest>(req)| {
            let state = state.clone();
            async move { on_typing(socket, req, false, &state); }
        }
    });

    socket.on("heartbeat", {
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                if let Some(session_id) = bound_session(&socket) {
                    state.chat.heartbeat(session_id);
                }
            }
        }
    });

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                if let Some(session_id) = bound_session(&socket) {
                    tracing::info!(session_id = %session_id, sid = %socket.id, "messaging socket disconnected");
                    state.chat.disconnect(session_id);
                }
            }
        }
    });
}

async fn on_join(socket: SocketRef, req: Result<RoomRequest, serde_json::Error>, state: &Arc<AppState>) {
    let Some(session_id) = bound_session(&socket) else { return };
    let req = match req {
        Ok(req) => req,
        Err(e) => return emit_error(&socket, &AppError::Validation(e.to_string())),
    };

    match state.chat.join_conversation(session_id, req.conversation_id).await {
        Ok(conversation) => {
            let _ = socket.emit("joined_conversation", &conversation);
        }
        Err(err) => {
            tracing::debug!(error = %err, session_id = %session_id, "join_conversation refused");
            emit_error(&socket, &err);
        }
    }
}

async fn on_send_message(
    socket: SocketRef,
    req: Result<SendRequest, serde_json::Error>,
    ack: AckSender,
    state: &Arc<AppState>,
) {
    let Some(session_id) = bound_session(&socket) else { return };
    let req = match req {
        Ok(req) => req,
        Err(e) => return emit_error(&socket, &AppError::Validation(e.to_string())),
    };

    match state
        .chat
        .send_from_session(session_id, req.conversation_id, req.message)
        .await
    {
        Ok(message) => {
            ack.send(&message).ok();
        }
        Err(err) => emit_error(&socket, &err),
    }
}

async fn on_mark_read(
    socket: SocketRef,
    req: Result<RoomRequest, serde_json::Error>,
    ack: AckSender,
    state: &Arc<AppState>,
) {
    let Some(session_id) = bound_session(&socket) else { return };
    let req = match req {
        Ok(req) => req,
        Err(e) => return emit_error(&socket, &AppError::Validation(e.to_string())),
    };

    match state.chat.mark_read_from_session(session_id, req.conversation_id).await {
        Ok(receipt) => {
            ack.send(&receipt).ok();
        }
        Err(err) => emit_error(&socket, &err),
    }
}

fn on_typing(socket: SocketRef, req: Result<RoomRequest, serde_json::Error>, started: bool, state: &AppState) {
    let Some(session_id) = bound_session(&socket) else { return };
    let result = req
        .map_err(|e| AppError::Validation(e.to_string()))
        .and_then(|req| {
            if started {
                state.chat.start_typing(session_id, req.conversation_id)
            } else {
                state.chat.stop_typing(session_id, req.conversation_id)
            }
        });
    if let Err(err) = result {
        emit_error(&socket, &err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scholaris_shared::errors::ErrorCode;

    #[test]
    fn token_prefers_auth_payload() {
        let auth = serde_json::json!({ "token": "from-auth" });
        assert_eq!(
            handshake_token(Some(&auth), Some("token=from-query")).as_deref(),
            Some("from-auth")
        );

        let bearer = serde_json::json!({ "token": "Bearer abc" });
        assert_eq!(handshake_token(Some(&bearer), None).as_deref(), Some("abc"));
    }

    #[test]
    fn token_falls_back_to_query() {
        assert_eq!(
            handshake_token(None, Some("EIO=4&transport=websocket&token=q")).as_deref(),
            Some("q")
        );
        assert_eq!(handshake_token(None, Some("EIO=4&token=")), None);
        assert_eq!(handshake_token(Some(&serde_json::json!({})), None), None);
    }

    #[test]
    fn send_request_accepts_camel_case() {
        let conversation_id = Uuid::new_v4();
        let req: SendRequest = serde_json::from_value(serde_json::json!({
            "conversationId": conversation_id,
            "content": "hello",
        }))
        .unwrap();
        assert_eq!(req.conversation_id, conversation_id);
        assert_eq!(req.message.content.as_deref(), Some("hello"));
    }

    #[test]
    fn error_payload_hides_internal_details() {
        let payload = ErrorPayload::from(&AppError::Internal(anyhow::anyhow!("db password leaked")));
        assert_eq!(payload.code, "E0001");
        assert!(!payload.message.contains("password"));

        let payload = ErrorPayload::from(&AppError::new(ErrorCode::NotInRoom, "join first"));
        assert_eq!(payload.code, ErrorCode::NotInRoom.code());
    }
}
