use std::str::FromStr;

use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub request_timeout_secs: u64,
    pub max_message_chars: usize,
    pub max_claim_attempts: usize,
    pub presence_ttl_secs: u64,
    pub presence_sweep_secs: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            database_url: "sqlite://pairchat.db?mode=rwc".to_string(),
            db_max_connections: 20,
            db_min_connections: 5,
            request_timeout_secs: 30,
            max_message_chars: 2000,
            max_claim_attempts: 8,
            presence_ttl_secs: 45,
            presence_sweep_secs: 15,
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();
        let config = Config {
            server_host: std::env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env_or("SERVER_PORT", defaults.server_port)?,
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_min_connections: env_or("DB_MIN_CONNECTIONS", defaults.db_min_connections)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            max_message_chars: env_or("MAX_MESSAGE_CHARS", defaults.max_message_chars)?,
            max_claim_attempts: env_or("MAX_CLAIM_ATTEMPTS", defaults.max_claim_attempts)?,
            presence_ttl_secs: env_or("PRESENCE_TTL_SECS", defaults.presence_ttl_secs)?,
            presence_sweep_secs: env_or("PRESENCE_SWEEP_SECS", defaults.presence_sweep_secs)?,
            rate_limit_requests: env_or("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests)?,
            rate_limit_window_secs: env_or(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.max_message_chars == 0 {
            return Err(AppError::Config("MAX_MESSAGE_CHARS must be positive".to_string()));
        }
        if self.max_claim_attempts == 0 {
            return Err(AppError::Config("MAX_CLAIM_ATTEMPTS must be positive".to_string()));
        }
        if self.db_min_connections > self.db_max_connections {
            return Err(AppError::Config(
                "DB_MIN_CONNECTIONS cannot exceed DB_MAX_CONNECTIONS".to_string(),
            ));
        }
        if self.presence_sweep_secs == 0 {
            return Err(AppError::Config("PRESENCE_SWEEP_SECS must be positive".to_string()));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
