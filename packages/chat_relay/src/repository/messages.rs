use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::models::MessageRecord;

use super::ChatRepository;

impl ChatRepository {
    pub async fn insert_message(&self, msg: &MessageRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, user_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.session_id)
        .bind(&msg.user_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert chat message")?;

        Ok(result.last_insert_rowid())
    }

    /// Full ordered history for one session, oldest first.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, role, content, created_at
            FROM chat_messages
            WHERE session_id = ? AND user_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// The most recent `limit` messages for a session, returned oldest first.
    /// Used by the title summarizer.
    pub async fn get_last_messages(
        &self,
        session_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, role, content, created_at
            FROM chat_messages
            WHERE session_id = ? AND user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<MessageRecord> = rows
            .into_iter()
            .map(row_to_message)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        id: r.get("id"),
        session_id: r.get("session_id"),
        user_id: r.get("user_id"),
        role: r.get::<String, _>("role").parse()?,
        content: r.get("content"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use crate::models::{ChatSession, MessageRecord, Role, User};
    use crate::repository::test_helpers;
    use chrono::Utc;

    async fn seeded_session(repo: &crate::repository::ChatRepository) -> ChatSession {
        repo.create_user(&User {
            id: "u-1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "hashed".to_string(),
            created_at: Utc::now().timestamp(),
        })
        .await
        .unwrap();
        repo.create_session("u-1").await.unwrap()
    }

    fn make_msg(session_id: &str, role: Role, content: &str) -> MessageRecord {
        MessageRecord {
            id: None,
            session_id: session_id.to_string(),
            user_id: "u-1".to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_ordered() {
        let repo = test_helpers::test_repository().await;
        let session = seeded_session(&repo).await;

        repo.insert_message(&make_msg(&session.id, Role::User, "hello"))
            .await
            .unwrap();
        repo.insert_message(&make_msg(&session.id, Role::Assistant, "hi there"))
            .await
            .unwrap();

        let messages = repo
            .get_session_messages(&session.id, "u-1")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn last_messages_window() {
        let repo = test_helpers::test_repository().await;
        let session = seeded_session(&repo).await;

        for i in 0..8 {
            repo.insert_message(&make_msg(&session.id, Role::User, &format!("msg {i}")))
                .await
                .unwrap();
        }

        let last = repo.get_last_messages(&session.id, "u-1", 5).await.unwrap();
        assert_eq!(last.len(), 5);
        // Oldest first within the window
        assert_eq!(last[0].content, "msg 3");
        assert_eq!(last[4].content, "msg 7");
    }

    #[tokio::test]
    async fn messages_scoped_to_owner() {
        let repo = test_helpers::test_repository().await;
        let session = seeded_session(&repo).await;

        repo.insert_message(&make_msg(&session.id, Role::User, "mine"))
            .await
            .unwrap();

        let other = repo.get_session_messages(&session.id, "u-2").await.unwrap();
        assert!(other.is_empty());
    }
}
