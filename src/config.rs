//! Configuration for the draft persistence agent.
//!
//! Settings are read from `draftsave.toml` and layered as
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [autosave]
//! endpoint_base = "http://localhost:8000/responses"
//! save_interval_ms = 30000
//! max_retries = 3
//! retry_delay_ms = 5000
//! enabled = true
//! request_timeout_ms = 10000
//!
//! [auth]
//! token_env = "DRAFTSAVE_TOKEN"
//!
//! [logging]
//! json = false
//! filter = "info"
//! ```
//!
//! Lookup order when no path is given: `./draftsave.toml`, then
//! `<user config dir>/draftsave/draftsave.toml`, then built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "draftsave.toml";

/// Environment variable that overrides `autosave.endpoint_base`.
pub const ENDPOINT_ENV: &str = "DRAFTSAVE_ENDPOINT";

/// Per-agent options. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Base path; requests go to `{endpoint_base}/{document_id}/autosave`
    #[serde(default = "default_endpoint_base")]
    pub endpoint_base: String,
    /// Period of the autosave timer
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    /// Failed attempts allowed before a terminal error is reported
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts (no backoff)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Whether periodic saving starts immediately
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Request timeout; unset leaves the HTTP client's default in place
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_endpoint_base() -> String {
    "http://localhost:8000/responses".to_string()
}

fn default_save_interval_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_enabled() -> bool {
    true
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            endpoint_base: default_endpoint_base(),
            save_interval_ms: default_save_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enabled: default_enabled(),
            request_timeout_ms: None,
        }
    }
}

impl AgentOptions {
    pub fn with_endpoint_base(mut self, base: impl Into<String>) -> Self {
        self.endpoint_base = base.into();
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Timer period, never zero.
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSection {
    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    "DRAFTSAVE_TOKEN".to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

/// Root of `draftsave.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftsaveToml {
    #[serde(default)]
    pub autosave: AgentOptions,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl DraftsaveToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse draftsave.toml")
    }

    /// First existing config file in the lookup order, if any.
    pub fn locate(working_dir: &Path) -> Option<PathBuf> {
        let local = working_dir.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("draftsave").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    /// Load from `explicit` (which must exist), or from the lookup order,
    /// falling back to defaults when nothing is found.
    pub fn load_or_default(explicit: Option<&Path>, working_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::locate(working_dir) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize draftsave.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Endpoint base with the environment override applied.
    pub fn endpoint_base(&self) -> String {
        resolve_endpoint(&self.autosave.endpoint_base, std::env::var(ENDPOINT_ENV).ok())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let autosave = &self.autosave;

        if autosave.save_interval_ms == 0 {
            warnings.push("save_interval_ms is 0; the timer will run as fast as possible".to_string());
        }
        if autosave.max_retries == 0 {
            warnings.push(
                "max_retries is 0; a single failed save is reported as an error immediately"
                    .to_string(),
            );
        }
        if autosave.retry_delay_ms > autosave.save_interval_ms {
            warnings.push(format!(
                "retry_delay_ms ({}) exceeds save_interval_ms ({}); periodic saves will pre-empt retries",
                autosave.retry_delay_ms, autosave.save_interval_ms
            ));
        }
        if !autosave.endpoint_base.starts_with("http://")
            && !autosave.endpoint_base.starts_with("https://")
        {
            warnings.push(format!(
                "endpoint_base '{}' is not an http(s) URL",
                autosave.endpoint_base
            ));
        }
        if self.auth.token_env.trim().is_empty() {
            warnings.push("auth.token_env is empty; requests will be unauthenticated".to_string());
        }

        warnings
    }
}

/// Environment value wins over the file value when set and non-empty.
pub fn resolve_endpoint(file_value: &str, env_value: Option<String>) -> String {
    env_value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| file_value.to_string())
}
