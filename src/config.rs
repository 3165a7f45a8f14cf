use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};

const DEFAULT_HELM_BINARY: &str = "helm";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REQUEUE_TRANSIENT_SECS: u64 = 5;
const DEFAULT_REQUEUE_PERMANENT_SECS: u64 = 300;

/// Controller process configuration, read once from the environment at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of the versioned chart tree (`<dir>/<version>/charts/<chart>`)
    pub resource_directory: PathBuf,
    pub helm_binary: String,
    pub metrics_addr: String,
    /// Backoff after a failure that may resolve on its own
    pub requeue_transient: Duration,
    /// Backoff after a failure that needs user action (name clash, missing target)
    pub requeue_permanent: Duration,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let resource_directory = lookup("RESOURCE_DIRECTORY")
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| AppError::Config("RESOURCE_DIRECTORY must be set".to_string()))?;

        Ok(Self {
            resource_directory: PathBuf::from(resource_directory),
            helm_binary: lookup("HELM_BINARY").unwrap_or(DEFAULT_HELM_BINARY.to_string()),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(DEFAULT_METRICS_ADDR.to_string()),
            requeue_transient: secs(
                &lookup,
                "REQUEUE_TRANSIENT_SECS",
                DEFAULT_REQUEUE_TRANSIENT_SECS,
            )?,
            requeue_permanent: secs(
                &lookup,
                "REQUEUE_PERMANENT_SECS",
                DEFAULT_REQUEUE_PERMANENT_SECS,
            )?,
        })
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> AppResult<Duration> {
    match lookup(key) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| AppError::Config(format!("{key} must be a number of seconds: {e}"))),
    }
}
