use std::{str::FromStr, time::Duration};

use anyhow::Context;

/// Reconnect policy for dropped subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub reconnect_backoff: Duration,
    pub reconnect_jitter: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(250),
            reconnect_jitter: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(Self::MAX_BACKOFF)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Falls back to the in-memory store when unset.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub sync: SyncConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = SyncConfig::default();
        Ok(Self {
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            database_url: dotenv::var("DATABASE_URL").ok(),
            max_connections: parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(16),
            sync: SyncConfig {
                max_reconnect_attempts: parse_var("SYNC_MAX_RECONNECTS")?
                    .unwrap_or(defaults.max_reconnect_attempts),
                reconnect_backoff: parse_var("SYNC_BACKOFF_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_backoff),
                reconnect_jitter: parse_var("SYNC_JITTER_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_jitter),
            },
        })
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{name}={raw:?} is not valid")),
        Err(_) => Ok(None),
    }
}
