//! Authentication: argon2-hashed passwords and opaque bearer tokens.
//!
//! Registration and login issue a random token stored server-side with a TTL.
//! HTTP requests carry it as `Authorization: Bearer <token>`; WebSocket
//! upgrades, which cannot set headers from browsers, pass `?token=` instead.
//! Anonymous conversation routes skip auth entirely.

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use anyhow::Result;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::models::{AuthSession, User};
use crate::repository::ChatRepository;

// =============================================================================
// Password hashing
// =============================================================================

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// 256-bit random bearer token, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =============================================================================
// AuthUser
// =============================================================================

/// Authenticated user, populated from a resolved bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("registration is disabled")]
    RegistrationDisabled,

    #[error("username is already taken")]
    UsernameTaken,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("authentication required")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::RegistrationDisabled => (StatusCode::FORBIDDEN, self.to_string()),
            AuthError::UsernameTaken => (StatusCode::CONFLICT, self.to_string()),
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, self.to_string()),
            AuthError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AuthError::Internal(e) => {
                tracing::error!(error = %e, "auth internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// =============================================================================
// Auth Service
// =============================================================================

#[derive(Clone)]
pub struct AuthService {
    repository: Arc<ChatRepository>,
    config: AuthConfig,
}

#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: i64,
}

impl AuthService {
    pub fn new(repository: Arc<ChatRepository>, config: AuthConfig) -> Self {
        Self { repository, config }
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        if !self.config.allow_registration {
            return Err(AuthError::RegistrationDisabled);
        }
        if self
            .repository
            .get_user_by_username(username)
            .await?
            .is_some()
        {
            return Err(AuthError::UsernameTaken);
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash_password(password)?,
            created_at: Utc::now().timestamp(),
        };
        self.repository.create_user(&user).await?;
        Ok(user)
    }

    /// Verify credentials and issue a fresh bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let user = self
            .repository
            .get_user_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now().timestamp();
        let session = AuthSession {
            token: generate_token(),
            user_id: user.id.clone(),
            created_at: now,
            expires_at: now + self.config.session_ttl_secs as i64,
        };
        self.repository.insert_auth_session(&session).await?;

        Ok(IssuedToken {
            access_token: session.token,
            token_type: "bearer",
            expires_at: session.expires_at,
        })
    }

    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.repository.delete_auth_session(token).await?)
    }

    /// Resolve a bearer token to its user. Expired tokens are deleted on
    /// sight rather than waiting for the periodic sweep.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<AuthUser>, AuthError> {
        let Some(session) = self.repository.get_auth_session(token).await? else {
            return Ok(None);
        };

        if session.is_expired(Utc::now().timestamp()) {
            self.repository.delete_auth_session(token).await?;
            return Ok(None);
        }

        let Some(user) = self.repository.get_user_by_id(&session.user_id).await? else {
            return Ok(None);
        };
        Ok(Some(AuthUser {
            user_id: user.id,
            username: user.username,
        }))
    }
}

// =============================================================================
// Auth Middleware
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub service: AuthService,
}

/// Resolve the bearer token on protected routes and stash the [`AuthUser`] in
/// request extensions. Anonymous conversation routes and the auth endpoints
/// themselves pass through untouched.
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if is_public_route(&path) {
        return next.run(request).await;
    }

    let Some(token) = extract_token(&request) else {
        return AuthError::Unauthorized.into_response();
    };

    match auth_state.service.resolve_token(&token).await {
        Ok(Some(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(None) => AuthError::Unauthorized.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Routes that never require a token: health, the auth endpoints, and the
/// anonymous in-memory conversation API.
fn is_public_route(path: &str) -> bool {
    path == "/health"
        || path.starts_with("/api/auth/")
        || path.starts_with("/api/conversations")
}

/// `Authorization: Bearer <token>` header, falling back to a `token` query
/// parameter for WebSocket upgrades.
fn extract_token(request: &Request<Body>) -> Option<String> {
    if let Some(value) = request.headers().get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
    })
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract AuthUser from request extensions (set by middleware).
/// Returns 401 if not present.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthUser>().cloned().ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Authentication required"})),
            )
        })
    }
}

// =============================================================================
// Request payloads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers;

    fn service(repo: Arc<ChatRepository>, allow_registration: bool) -> AuthService {
        AuthService::new(
            repo,
            AuthConfig {
                session_ttl_secs: 3600,
                allow_registration,
            },
        )
    }

    #[test]
    fn hash_and_verify_password() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn register_login_resolve_roundtrip() {
        let repo = Arc::new(test_helpers::test_repository().await);
        let auth = service(repo, true);

        let user = auth
            .register("alice", "alice@example.com", "hunter2")
            .await
            .unwrap();
        assert_eq!(user.username, "alice");

        let token = auth.login("alice", "hunter2").await.unwrap();
        assert_eq!(token.token_type, "bearer");

        let resolved = auth
            .resolve_token(&token.access_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.user_id, user.id);
        assert_eq!(resolved.username, "alice");
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let repo = Arc::new(test_helpers::test_repository().await);
        let auth = service(repo, true);
        auth.register("alice", "alice@example.com", "hunter2")
            .await
            .unwrap();

        assert!(matches!(
            auth.login("alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("nobody", "hunter2").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let repo = Arc::new(test_helpers::test_repository().await);
        let auth = service(repo, true);
        auth.register("alice", "alice@example.com", "hunter2")
            .await
            .unwrap();

        assert!(matches!(
            auth.register("alice", "other@example.com", "pw").await,
            Err(AuthError::UsernameTaken)
        ));
    }

    #[tokio::test]
    async fn registration_can_be_disabled() {
        let repo = Arc::new(test_helpers::test_repository().await);
        let auth = service(repo, false);
        assert!(matches!(
            auth.register("alice", "alice@example.com", "pw").await,
            Err(AuthError::RegistrationDisabled)
        ));
    }

    #[tokio::test]
    async fn logout_invalidates_token() {
        let repo = Arc::new(test_helpers::test_repository().await);
        let auth = service(repo, true);
        auth.register("alice", "alice@example.com", "hunter2")
            .await
            .unwrap();
        let token = auth.login("alice", "hunter2").await.unwrap();

        assert!(auth.logout(&token.access_token).await.unwrap());
        assert!(auth
            .resolve_token(&token.access_token)
            .await
            .unwrap()
            .is_none());
        // Second logout finds nothing to delete
        assert!(!auth.logout(&token.access_token).await.unwrap());
    }

    #[test]
    fn public_routes() {
        assert!(is_public_route("/health"));
        assert!(is_public_route("/api/auth/login"));
        assert!(is_public_route("/api/auth/register"));
        assert!(is_public_route("/api/conversations/abc/ws"));
        assert!(!is_public_route("/api/sessions"));
        assert!(!is_public_route("/api/sessions/3/messages"));
    }

    #[test]
    fn token_extraction_prefers_header() {
        let request = Request::builder()
            .uri("/api/sessions?token=querytoken")
            .header("authorization", "Bearer headertoken")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request).as_deref(), Some("headertoken"));

        let request = Request::builder()
            .uri("/api/sessions/3/ws?token=querytoken")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request).as_deref(), Some("querytoken"));

        let request = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        assert!(extract_token(&request).is_none());
    }
}
