use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use betweenus_gateway::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub relational_db: PathBuf,
    pub document_db: PathBuf,
    pub watch_max_attempts: u32,
    pub watch_backoff: Duration,
    pub feed_capacity: usize,
}

fn var(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = var("BETWEENUS_PORT", "3000")
            .parse()
            .context("BETWEENUS_PORT")?;
        let watch_max_attempts = var("BETWEENUS_WATCH_MAX_ATTEMPTS", "3")
            .parse()
            .context("BETWEENUS_WATCH_MAX_ATTEMPTS")?;
        let backoff_ms: u64 = var("BETWEENUS_WATCH_BACKOFF_MS", "2000")
            .parse()
            .context("BETWEENUS_WATCH_BACKOFF_MS")?;
        let feed_capacity = var("BETWEENUS_FEED_CAPACITY", "1024")
            .parse()
            .context("BETWEENUS_FEED_CAPACITY")?;

        Ok(Self {
            host: var("BETWEENUS_HOST", "0.0.0.0"),
            port,
            relational_db: PathBuf::from(var("BETWEENUS_RELATIONAL_DB", "betweenus.db")),
            document_db: PathBuf::from(var("BETWEENUS_DOCUMENT_DB", "betweenus-chats.db")),
            watch_max_attempts,
            watch_backoff: Duration::from_millis(backoff_ms),
            feed_capacity,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.watch_max_attempts, self.watch_backoff)
    }
}
