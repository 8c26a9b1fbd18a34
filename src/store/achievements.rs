//! Achievement unlock client
//!
//! Unlocks are one-way: the simulation fires them and never waits for or
//! branches on the result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Receiver of achievement unlocks
pub trait AchievementSink: Send + Sync {
    /// Fire-and-forget; must not block
    fn unlock(&self, user_id: Uuid, key: &str);
}

/// Sink for the configured platform, or a logging stand-in when none is set
pub fn achievement_sink(config: &Config) -> Arc<dyn AchievementSink> {
    match (&config.achievements_url, &config.achievements_api_key) {
        (Some(url), Some(key)) => Arc::new(AchievementClient::new(url.clone(), key.clone())),
        _ => {
            info!("No achievements endpoint configured, unlocks will only be logged");
            Arc::new(LogOnlyAchievements)
        }
    }
}

#[derive(Debug, Serialize)]
struct AchievementUnlock {
    user_id: Uuid,
    key: String,
    unlocked_at: DateTime<Utc>,
}

/// Posts unlocks to the platform's achievements endpoint
#[derive(Clone)]
pub struct AchievementClient {
    client: Client,
    url: String,
    api_key: String,
}

impl AchievementClient {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            url,
            api_key,
        }
    }

    async fn post_unlock(&self, unlock: &AchievementUnlock) -> Result<(), AchievementError> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(unlock)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AchievementError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl AchievementSink for AchievementClient {
    fn unlock(&self, user_id: Uuid, key: &str) {
        let unlock = AchievementUnlock {
            user_id,
            key: key.to_string(),
            unlocked_at: Utc::now(),
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(user_id = %user_id, key, "No runtime available, dropping achievement unlock");
            return;
        };

        let client = self.clone();
        runtime.spawn(async move {
            match client.post_unlock(&unlock).await {
                Ok(()) => {
                    debug!(user_id = %unlock.user_id, key = %unlock.key, "Achievement unlocked")
                }
                Err(e) => warn!(
                    user_id = %unlock.user_id,
                    key = %unlock.key,
                    error = %e,
                    "Achievement unlock failed"
                ),
            }
        });
    }
}

/// Used when no endpoint is configured
pub struct LogOnlyAchievements;

impl AchievementSink for LogOnlyAchievements {
    fn unlock(&self, user_id: Uuid, key: &str) {
        info!(user_id = %user_id, key, "Achievement unlocked (not forwarded)");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AchievementError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}
