//! HTTP and WebSocket route handlers.

use axum::{
    Json,
    extract::{Path, State, WebSocketUpgrade},
    extract::ws::{CloseFrame, Message},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::AppState;
use crate::auth::{AuthUser, LoginRequest, RegisterRequest};
use crate::models::{ChatSession, MessageRecord};
use crate::registry::POLICY_VIOLATION;
use crate::relay::{self, PersistCtx, RelayDeps};
use crate::repository::is_unique_violation;

/// Sessions returned by the latest-sessions listing.
const SESSION_LIST_LIMIT: i64 = 20;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "handler internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<MessageRecord> for MessageView {
    fn from(m: MessageRecord) -> Self {
        Self {
            role: m.role.to_string(),
            content: m.content,
            timestamp: m.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub session_number: i64,
}

#[derive(Debug, Serialize)]
pub struct SessionMessages {
    pub session_number: i64,
    pub title: Option<String>,
    pub messages: Vec<MessageView>,
}

// =============================================================================
// Health
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// =============================================================================
// Anonymous conversations (in-memory)
// =============================================================================

/// Full history of a known conversation. Unknown ids are 404; `get` never
/// creates.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let conversation = state
        .registry
        .get(&id)
        .await
        .ok_or(ApiError::NotFound("Conversation not found"))?;
    Ok(Json(conversation.history().await).into_response())
}

/// Close a conversation: mark it inactive and force-disconnect everyone.
/// Closing an already-closed conversation succeeds without effect.
pub async fn close_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let conversation = state
        .registry
        .get(&id)
        .await
        .ok_or(ApiError::NotFound("Conversation not found"))?;
    conversation.close().await;
    Ok(Json(json!({ "message": "Conversation closed successfully" })).into_response())
}

/// WebSocket attach to an anonymous conversation, creating it on first use.
pub async fn conversation_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    let deps = RelayDeps {
        provider: state.provider.clone(),
        chat_params: state.chat_params.clone(),
        title_params: state.title_params.clone(),
        persist: None,
    };

    ws.on_upgrade(move |socket| async move {
        let conversation = registry.get_or_create(&id).await;
        relay::handle_socket(socket, conversation, deps).await;
    })
}

// =============================================================================
// Persistent sessions
// =============================================================================

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SessionCreated>, ApiError> {
    match state.repository.create_session(&user.user_id).await {
        Ok(session) => Ok(Json(SessionCreated {
            session_id: session.id,
            session_number: session.session_number,
        })),
        Err(e) if is_unique_violation(&e) => Err(ApiError::Conflict(
            "session number already allocated, retry".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_session_messages(
    State(state): State<AppState>,
    Path(session_number): Path<i64>,
    user: AuthUser,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let session = state
        .repository
        .get_session_by_number(&user.user_id, session_number)
        .await?
        .ok_or(ApiError::NotFound("Session not found"))?;

    let messages = state
        .repository
        .get_session_messages(&session.id, &user.user_id)
        .await?;
    Ok(Json(messages.into_iter().map(MessageView::from).collect()))
}

/// The caller's most recent sessions (up to 20), newest first, each with its
/// full message history and current title.
pub async fn get_latest_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SessionMessages>>, ApiError> {
    let sessions = state
        .repository
        .list_recent_sessions(&user.user_id, SESSION_LIST_LIMIT)
        .await?;

    let mut out = Vec::with_capacity(sessions.len());
    for session in sessions {
        let messages = state
            .repository
            .get_session_messages(&session.id, &user.user_id)
            .await?;
        out.push(SessionMessages {
            session_number: session.session_number,
            title: session.title,
            messages: messages.into_iter().map(MessageView::from).collect(),
        });
    }
    Ok(Json(out))
}

/// WebSocket attach to a persistent session, identified by per-owner number.
/// Unknown numbers upgrade and immediately close with a policy violation, so
/// browser clients observe a close code rather than a failed handshake.
pub async fn session_ws(
    State(state): State<AppState>,
    Path(session_number): Path<i64>,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let session: Option<ChatSession> = match state
        .repository
        .get_session_by_number(&user.user_id, session_number)
        .await
    {
        Ok(s) => s,
        Err(e) => return ApiError::Internal(e).into_response(),
    };

    let Some(session) = session else {
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "session not found".into(),
                })))
                .await;
        });
    };

    let state = state.clone();
    ws.on_upgrade(move |socket| async move {
        let conversation = state.registry.get_or_create(&session.id).await;

        // Hydrate durable history on first attach; later attaches no-op.
        match state
            .repository
            .get_session_messages(&session.id, &session.user_id)
            .await
        {
            Ok(stored) => {
                let stored = stored.iter().map(MessageRecord::to_chat_message).collect();
                conversation.hydrate_if_empty(stored).await;
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "history hydration failed");
                return;
            }
        }

        let deps = RelayDeps {
            provider: state.provider.clone(),
            chat_params: state.chat_params.clone(),
            title_params: state.title_params.clone(),
            persist: Some(PersistCtx {
                repository: state.repository.clone(),
                session,
            }),
        };
        relay::handle_socket(socket, conversation, deps).await;
    })
}

// =============================================================================
// Auth
// =============================================================================

pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match state
        .auth
        .register(&req.username, &req.email, &req.password)
        .await
    {
        Ok(user) => Json(json!({ "id": user.id, "username": user.username })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Response {
    match state.auth.login(&req.username, &req.password).await {
        Ok(token) => Json(token).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.auth.logout(token).await {
        Ok(_) => Json(json!({ "message": "Logged out" })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn api_error_status_codes() {
        let resp = ApiError::NotFound("Conversation not found").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::Conflict("dup".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::Internal(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn message_view_from_record() {
        let record = MessageRecord {
            id: Some(7),
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            role: Role::Assistant,
            content: "answer".to_string(),
            created_at: Utc::now(),
        };
        let view = MessageView::from(record);
        assert_eq!(view.role, "assistant");
        assert_eq!(view.content, "answer");
    }
}
