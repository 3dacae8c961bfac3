use sqlx::{Pool, Sqlite};

use crate::db::models::SessionRecord;
use crate::db::{MessageRepository, ParticipantRepository};
use crate::error::AppError;

pub struct SessionRepository;

impl SessionRepository {
    /// Insert a `waiting` session together with its first participant.
    pub async fn create_waiting(
        pool: &Pool<Sqlite>,
        session_id: &str,
        user_id: &str,
        created_at: i64,
    ) -> Result<(), AppError> {
        let mut tx = pool.begin().await?;

        sqlx::query("INSERT INTO sessions (id, state, created_at) VALUES (?, 'waiting', ?)")
            .bind(session_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        ParticipantRepository::insert(&mut *tx, session_id, user_id, created_at).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record a second participant and flip the session to `active`.
    ///
    /// Fails with `Conflict` when the row is no longer `waiting`. A uniqueness violation on the
    /// participant insert is returned as-is so the caller can tell the two apart.
    pub async fn activate(
        pool: &Pool<Sqlite>,
        session_id: &str,
        user_id: &str,
        joined_at: i64,
    ) -> Result<(), AppError> {
        let mut tx = pool.begin().await?;

        let updated = sqlx::query("UPDATE sessions SET state = 'active' WHERE id = ? AND state = 'waiting'")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "session {} is no longer waiting",
                session_id
            )));
        }

        ParticipantRepository::insert(&mut *tx, session_id, user_id, joined_at).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove one participant from a session that keeps its other occupant.
    pub async fn release(pool: &Pool<Sqlite>, session_id: &str, user_id: &str) -> Result<(), AppError> {
        let mut tx = pool.begin().await?;

        ParticipantRepository::delete(&mut *tx, session_id, user_id).await?;

        sqlx::query("UPDATE sessions SET state = 'waiting' WHERE id = ? AND state != 'ended'")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Terminal transition: drop participants and messages, mark the row `ended`.
    pub async fn end(pool: &Pool<Sqlite>, session_id: &str, ended_at: i64) -> Result<(), AppError> {
        let mut tx = pool.begin().await?;

        MessageRepository::delete_for_session(&mut *tx, session_id).await?;
        ParticipantRepository::delete_for_session(&mut *tx, session_id).await?;

        sqlx::query("UPDATE sessions SET state = 'ended', ended_at = ? WHERE id = ?")
            .bind(ended_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_id(
        pool: &Pool<Sqlite>,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, AppError> {
        let session = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, state, created_at, ended_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;

        Ok(session)
    }

    /// End every session a previous process left open. Returns how many were closed.
    pub async fn end_all_open(pool: &Pool<Sqlite>, ended_at: i64) -> Result<u64, AppError> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "DELETE FROM messages WHERE session_id IN (SELECT id FROM sessions WHERE state != 'ended')",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM participants WHERE session_id IN (SELECT id FROM sessions WHERE state != 'ended')",
        )
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("UPDATE sessions SET state = 'ended', ended_at = ? WHERE state != 'ended'")
            .bind(ended_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn activate_requires_waiting_row() {
        let pool = db::memory().await.unwrap();
        SessionRepository::create_waiting(&pool, "s1", "alice", 1).await.unwrap();
        SessionRepository::activate(&pool, "s1", "bob", 2).await.unwrap();

        let err = SessionRepository::activate(&pool, "s1", "carol", 3).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let record = SessionRepository::get_by_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(record.state, "active");
        assert_eq!(ParticipantRepository::list_for_session(&pool, "s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn participant_user_is_unique_across_sessions() {
        let pool = db::memory().await.unwrap();
        SessionRepository::create_waiting(&pool, "s1", "alice", 1).await.unwrap();

        let err = SessionRepository::create_waiting(&pool, "s2", "alice", 2).await.unwrap_err();
        assert!(err.is_unique_violation());
        // the failed transaction left no half-created session behind
        assert!(SessionRepository::get_by_id(&pool, "s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_cascades_messages_and_participants() {
        let pool = db::memory().await.unwrap();
        SessionRepository::create_waiting(&pool, "s1", "alice", 1).await.unwrap();
        MessageRepository::create(&pool, "s1", "alice", "hi", false).await.unwrap();

        SessionRepository::end(&pool, "s1", 5).await.unwrap();

        let record = SessionRepository::get_by_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(record.state, "ended");
        assert_eq!(record.ended_at, Some(5));
        assert_eq!(MessageRepository::count_for_session(&pool, "s1").await.unwrap(), 0);
        assert!(ParticipantRepository::get_by_user(&pool, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_all_open_closes_leftovers() {
        let pool = db::memory().await.unwrap();
        SessionRepository::create_waiting(&pool, "s1", "alice", 1).await.unwrap();
        SessionRepository::create_waiting(&pool, "s2", "bob", 2).await.unwrap();
        SessionRepository::end(&pool, "s2", 3).await.unwrap();

        let closed = SessionRepository::end_all_open(&pool, 10).await.unwrap();
        assert_eq!(closed, 1);
        assert!(ParticipantRepository::get_by_user(&pool, "alice").await.unwrap().is_none());
    }
}
