use sqlx::{Executor, Pool, Sqlite};

use crate::db::models::Participant;
use crate::error::AppError;

pub struct ParticipantRepository;

impl ParticipantRepository {
    pub async fn insert<'e, E>(
        executor: E,
        session_id: &str,
        user_id: &str,
        joined_at: i64,
    ) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("INSERT INTO participants (session_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(user_id)
            .bind(joined_at)
            .execute(executor)
            .await?;

        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete<'e, E>(executor: E, session_id: &str, user_id: &str) -> Result<bool, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM participants WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_for_session<'e, E>(executor: E, session_id: &str) -> Result<u64, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM participants WHERE session_id = ?")
            .bind(session_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_for_session(
        pool: &Pool<Sqlite>,
        session_id: &str,
    ) -> Result<Vec<Participant>, AppError> {
        let participants = sqlx::query_as::<_, Participant>(
            r#"
SELECT session_id, user_id, joined_at
FROM participants
WHERE session_id = ?
ORDER BY joined_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;

        Ok(participants)
    }

    pub async fn get_by_user(
        pool: &Pool<Sqlite>,
        user_id: &str,
    ) -> Result<Option<Participant>, AppError> {
        let participant = sqlx::query_as::<_, Participant>(
            "SELECT session_id, user_id, joined_at FROM participants WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(participant)
    }
}
