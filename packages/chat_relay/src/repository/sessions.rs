use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::models::ChatSession;

use super::ChatRepository;

impl ChatRepository {
    /// Allocate the next per-owner session number (`max + 1`, defaulting to 1)
    /// and insert the session. Two concurrent creations for the same owner can
    /// both compute the same number; the UNIQUE(user_id, session_number)
    /// constraint rejects the loser, surfaced via [`is_unique_violation`].
    pub async fn create_session(&self, user_id: &str) -> Result<ChatSession> {
        let max_number: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(session_number) FROM chat_sessions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_number: max_number.unwrap_or(0) + 1,
            title: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, user_id, session_number, title, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.session_number)
        .bind(&session.title)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert chat session")?;

        Ok(session)
    }

    pub async fn get_session_by_number(
        &self,
        user_id: &str,
        session_number: i64,
    ) -> Result<Option<ChatSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, session_number, title, created_at
            FROM chat_sessions
            WHERE user_id = ? AND session_number = ?
            "#,
        )
        .bind(user_id)
        .bind(session_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_session))
    }

    pub async fn get_session_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query(
            "SELECT id, user_id, session_number, title, created_at FROM chat_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_session))
    }

    pub async fn set_session_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update session title")?;
        Ok(())
    }

    /// The owner's most recently created sessions, newest first.
    pub async fn list_recent_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, session_number, title, created_at
            FROM chat_sessions
            WHERE user_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_session).collect())
    }
}

fn row_to_session(r: sqlx::sqlite::SqliteRow) -> ChatSession {
    ChatSession {
        id: r.get("id"),
        user_id: r.get("user_id"),
        session_number: r.get("session_number"),
        title: r.get("title"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    }
}

/// True when the error is a SQLite uniqueness violation (e.g. two concurrent
/// session creations racing on the same number).
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}
