use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CourierError, Result};

/// Runtime configuration for an [`crate::EndpointContainer`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Certificate bundle handed to the connector
    pub certs_path: Option<PathBuf>,
    /// Pause after a transient wait failure before the loop retries
    pub wait_retry_backoff_ms: u64,
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            certs_path: std::env::var("COURIER_CERTS_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            wait_retry_backoff_ms: std::env::var("COURIER_WAIT_RETRY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(100),
            log_filter: std::env::var("COURIER_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "info".to_string()),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file (path via COURIER_CONFIG or ./courier.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("COURIER_CONFIG").unwrap_or_else(|_| "courier.toml".into());
        Self::load_from(Path::new(&path))
    }

    /// Like [`RuntimeConfig::load`] with an explicit path. Never fails; a
    /// missing or invalid file yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        let default = Self::default();
        if !path.exists() {
            tracing::info!(target: "container", path = %path.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<RuntimeToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "container", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "container", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Parses a TOML document over the defaults. Unknown keys are rejected.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t: RuntimeToml = toml::from_str(s).map_err(|e| CourierError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }

    pub fn wait_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    certs_path: Option<PathBuf>,
    wait_retry_backoff_ms: Option<u64>,
    log_filter: Option<String>,
}

impl RuntimeToml {
    fn overlay(self, mut base: RuntimeConfig) -> RuntimeConfig {
        if let Some(p) = self.certs_path {
            base.certs_path = Some(p);
        }
        if let Some(ms) = self.wait_retry_backoff_ms {
            base.wait_retry_backoff_ms = ms;
        }
        if let Some(f) = self.log_filter {
            base.log_filter = f;
        }
        base
    }
}
