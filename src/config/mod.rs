//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Shared secret for platform-issued HS256 tokens
    pub jwt_secret: String,

    /// Allowed client origins for CORS, `*` for any
    pub client_origins: Vec<String>,

    /// Extra map definitions loaded on top of the built-in catalog
    pub maps_dir: Option<PathBuf>,

    /// Platform achievements endpoint; unlocks are only logged without it
    pub achievements_url: Option<String>,
    pub achievements_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let jwt_secret = env::var("PLATFORM_JWT_SECRET")
            .map_err(|_| ConfigError::Missing("PLATFORM_JWT_SECRET"))?;
        if jwt_secret.is_empty() {
            return Err(ConfigError::Missing("PLATFORM_JWT_SECRET"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            jwt_secret,

            client_origins: parse_origins(
                &env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            ),

            maps_dir: optional("MAPS_DIR").map(PathBuf::from),

            achievements_url: optional("ACHIEVEMENTS_URL"),
            achievements_api_key: optional("ACHIEVEMENTS_API_KEY"),
        })
    }

    pub fn allows_any_origin(&self) -> bool {
        self.client_origins.iter().any(|o| o == "*")
    }
}

/// Unset and blank are the same
fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
