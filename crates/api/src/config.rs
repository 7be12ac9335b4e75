use std::str::FromStr;
use std::time::Duration;

use cuepoint_core::config::{
    TimelineConfig, DEFAULT_REAP_INTERVAL_SECS, DEFAULT_SESSION_QUEUE_CAPACITY,
    DEFAULT_STORE_TIMEOUT_MS,
};
use cuepoint_core::annotation::DEFAULT_MAX_BODY_CHARS;
use cuepoint_core::session::DEFAULT_HEARTBEAT_TIMEOUT_SECS;

use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
///
/// All fields except the JWT secret have defaults suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for background tasks, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// PostgreSQL URL. Without one, annotations live in process memory.
    pub database_url: Option<String>,
    /// Identity token validation.
    pub jwt: JwtConfig,
    /// Engine tunables.
    pub timeline: TimelineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `3000`                  |
    /// | `CORS_ORIGINS`          | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    /// | `DATABASE_URL`          | unset (in-memory)       |
    ///
    /// Engine tunables are read by [`timeline_from_env`].
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env_or("PORT", 3000);

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30),
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", 30),
            database_url,
            jwt: JwtConfig::from_env(),
            timeline: timeline_from_env(),
        }
    }
}

/// Engine tunables from the environment.
///
/// | Env Var                  | Default |
/// |--------------------------|---------|
/// | `HEARTBEAT_TIMEOUT_SECS` | `30`    |
/// | `REAP_INTERVAL_SECS`     | `5`     |
/// | `SESSION_QUEUE_CAPACITY` | `256`   |
/// | `STORE_TIMEOUT_MS`       | `2000`  |
/// | `MAX_BODY_CHARS`         | `4000`  |
///
/// # Panics
///
/// Panics on unparsable values or a configuration the engine rejects.
pub fn timeline_from_env() -> TimelineConfig {
    let config = TimelineConfig {
        heartbeat_timeout: Duration::from_secs(env_or(
            "HEARTBEAT_TIMEOUT_SECS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        )),
        reap_interval: Duration::from_secs(env_or("REAP_INTERVAL_SECS", DEFAULT_REAP_INTERVAL_SECS)),
        session_queue_capacity: env_or("SESSION_QUEUE_CAPACITY", DEFAULT_SESSION_QUEUE_CAPACITY),
        store_timeout: Duration::from_millis(env_or("STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)),
        max_body_chars: env_or("MAX_BODY_CHARS", DEFAULT_MAX_BODY_CHARS),
        ..TimelineConfig::default()
    };
    if let Err(e) = config.validate() {
        panic!("Invalid timeline configuration: {e}");
    }
    config
}

/// Parse an env var, falling back to `default` when unset.
///
/// # Panics
///
/// Panics if the variable is set but does not parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
