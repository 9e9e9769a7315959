//! TOML configuration with compiled-in defaults.
//!
//! Lookup order: an explicit `--config` path, the `APIPATROL_CONFIG`
//! environment variable, `/etc/apipatrol/apipatrol.toml`, then defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "data/apipatrol.db".to_string()
}

fn default_script_timeout_ms() -> u64 {
    crate::sandbox::DEFAULT_SCRIPT_TIMEOUT_MS
}

/// Root configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Hard wall-clock limit for one sandboxed script run.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    /// Failure notices POST here; unset logs them instead.
    #[serde(default)]
    pub notify_webhook: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            db_path: default_db_path(),
            script_timeout_ms: default_script_timeout_ms(),
            notify_webhook: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from the standard locations, falling back to
    /// compiled-in defaults. An explicit path that fails to load is an error;
    /// implicit locations degrade with a warning.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("APIPATROL_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "APIPATROL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/apipatrol/apipatrol.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        Ok(Self::default())
    }
}
