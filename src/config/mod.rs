//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for generating URLs, logging only).
    pub host: Option<String>,

    /// Server port.
    pub port: u16,

    /// `postgres://...` or `mssql://...` — dispatch is on scheme, see [crate::db].
    pub database_url: String,

    /// How long to retry the initial database connection before giving up.
    pub connect_timeout: Duration,

    /// Secret used to verify bearer JWTs. `None` means auth is not enforced: every request
    /// resolves with an anonymous [crate::services::auth::AuthContext].
    pub jwt_secret: Option<String>,

    /// Response size (bytes) above which a query result is sent as a chunked Bifrost stream
    /// instead of a single `Result` frame.
    pub chunk_threshold: usize,

    /// Maximum number of chunks that may be in flight, unacknowledged, at once.
    pub chunk_window: usize,

    /// How long an unacknowledged chunk stays retransmittable before it falls out of the buffer.
    pub chunk_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        Ok(Self {
            host: env::var("HOST").ok(),

            port: env::var("PORT").unwrap_or_else(|_| "3001".to_string()).parse().context("Invalid PORT")?,

            database_url,

            connect_timeout: Duration::from_secs(
                env::var("DATABASE_CONNECT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid DATABASE_CONNECT_TIMEOUT_SECS")?,
            ),

            jwt_secret: env::var("JWT_SECRET").ok(),

            chunk_threshold: env::var("CHUNK_THRESHOLD_BYTES")
                .unwrap_or_else(|_| crate::transport::DEFAULT_CHUNK_THRESHOLD.to_string())
                .parse()
                .context("Invalid CHUNK_THRESHOLD_BYTES")?,

            chunk_window: env::var("CHUNK_WINDOW")
                .unwrap_or_else(|_| crate::transport::DEFAULT_WINDOW.to_string())
                .parse()
                .context("Invalid CHUNK_WINDOW")?,

            chunk_ttl: Duration::from_secs(
                env::var("CHUNK_RETRANSMIT_TTL_SECS")
                    .unwrap_or_else(|_| crate::transport::DEFAULT_RETRANSMIT_TTL.as_secs().to_string())
                    .parse()
                    .context("Invalid CHUNK_RETRANSMIT_TTL_SECS")?,
            ),
        })
    }
}
