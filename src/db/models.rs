use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub state: String,
    pub created_at: i64,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Participant {
    pub session_id: String,
    pub user_id: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub text: String,
    pub is_system: bool,
    pub created_at: i64, // unix millis
}
