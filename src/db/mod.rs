pub mod models;
pub mod sessions;
pub mod participants;
pub mod messages;

pub use models::{ChatMessage, Participant, SessionRecord};
pub use sessions::SessionRepository;
pub use participants::ParticipantRepository;
pub use messages::MessageRepository;

use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

use crate::config::Config;
use crate::error::AppError;

/// Open the connection pool described by `config`.
pub async fn connect(config: &Config) -> Result<Pool<Sqlite>, AppError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn migrate(pool: &Pool<Sqlite>) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
///
/// Every connection to `sqlite::memory:` gets its own database, so the pool is pinned to one
/// connection that never expires.
pub async fn memory() -> Result<Pool<Sqlite>, AppError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}
