//! Record types shared between the registry, the relay, and the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System prompt inserted as the first message of every conversation.
pub const SYSTEM_PROMPT: &str = "You are a useful AI assistant.";

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown message role: {other}"),
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system_prompt() -> Self {
        Self::new(Role::System, SYSTEM_PROMPT)
    }
}

/// Durable message row belonging to a persistent session.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            timestamp: self.created_at,
        }
    }
}

/// Persistent session metadata: owner, per-owner number, optional title.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub session_number: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registered account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: i64,
}

/// Opaque bearer token row backing an authenticated login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl AuthSession {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn system_prompt_message() {
        let msg = ChatMessage::system_prompt();
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, SYSTEM_PROMPT);
    }

    #[test]
    fn auth_session_expiry() {
        let session = AuthSession {
            token: "t".into(),
            user_id: "u".into(),
            created_at: 100,
            expires_at: 200,
        };
        assert!(!session.is_expired(199));
        assert!(session.is_expired(200));
        assert!(session.is_expired(500));
    }
}
