use sqlx::{Executor, Pool, Sqlite};
use uuid::Uuid;

use crate::db::models::ChatMessage;
use crate::error::AppError;

pub struct MessageRepository;

impl MessageRepository {
    pub async fn create(
        pool: &Pool<Sqlite>,
        session_id: &str,
        sender_id: &str,
        text: &str,
        is_system: bool,
    ) -> Result<ChatMessage, AppError> {
        let id = Uuid::now_v7().to_string();
        let created_at = chrono::Utc::now().timestamp_millis();

        let message = sqlx::query_as::<_, ChatMessage>(
            r#"
INSERT INTO messages (id, session_id, sender_id, content, is_system, created_at)
VALUES (?, ?, ?, ?, ?, ?)
RETURNING id, session_id, sender_id, content AS text, is_system, created_at
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(sender_id)
        .bind(text)
        .bind(is_system)
        .bind(created_at)
        .fetch_one(pool)
        .await?;

        Ok(message)
    }

    /// All messages of a session in creation order.
    pub async fn list_for_session(
        pool: &Pool<Sqlite>,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let messages = sqlx::query_as::<_, ChatMessage>(
            r#"
SELECT id, session_id, sender_id, content AS text, is_system, created_at
FROM messages
WHERE session_id = ?
ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;

        Ok(messages)
    }

    pub async fn count_for_session(pool: &Pool<Sqlite>, session_id: &str) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(pool)
            .await?;

        Ok(count)
    }

    pub async fn delete_for_session<'e, E>(executor: E, session_id: &str) -> Result<u64, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }
}
