//! Turnkeeper configuration
//!
//! Built from defaults, then `{home}/config.toml`, then environment
//! overrides for the long-term memory credentials.

use crate::memory::{DEFAULT_BATCH_INTERVAL, DEFAULT_BATCH_SIZE};
use crate::warehouse::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};
use crate::{Result, TurnkeeperError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default Mem0 endpoint when only an API key is given
pub const DEFAULT_MEM0_BASE_URL: &str = "https://api.mem0.ai";

const CONFIG_FILE: &str = "config.toml";
const DEFAULT_FETCH_DEADLINE: Duration = Duration::from_millis(5000);
const DEFAULT_SHORT_TERM_SIZE: usize = 20;
const DEFAULT_ASSISTANT_ID: &str = "companion";

/// Credentials for a Mem0-compatible long-term memory service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mem0Config {
    #[serde(default = "default_mem0_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_mem0_base_url() -> String {
    DEFAULT_MEM0_BASE_URL.to_string()
}

impl Mem0Config {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_mem0_base_url(),
            api_key: api_key.into(),
            org_id: None,
            project_id: None,
        }
    }
}

/// Configuration for Turnkeeper
#[derive(Debug, Clone)]
pub struct TurnkeeperConfig {
    /// Directory holding one history file per session
    pub data_dir: PathBuf,

    /// Flush once this many turns are queued
    pub batch_size: usize,

    /// Flush once this much time has passed since the last flush
    pub batch_interval: Duration,

    pub max_reconnect_retries: u32,

    /// First reconnect delay; doubles with every attempt
    pub backoff_base: Duration,

    /// How long a memory lookup may take in total
    pub fetch_deadline: Duration,

    /// Recent turns kept in memory per session
    pub short_term_size: usize,

    /// Query both memory backends at once
    pub parallel_memory: bool,

    /// Refuse to open sessions without a long-term memory backend
    pub strict_memory: bool,

    /// Scope of the assistant's own memories
    pub assistant_id: String,

    pub mem0: Option<Mem0Config>,
}

/// `config.toml` as written by users; every key is optional
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    data_dir: Option<PathBuf>,
    batch_size: Option<usize>,
    batch_interval_seconds: Option<u64>,
    max_reconnect_retries: Option<u32>,
    backoff_base_seconds: Option<f64>,
    fetch_deadline_ms: Option<u64>,
    short_term_size: Option<usize>,
    parallel_memory: Option<bool>,
    strict_memory: Option<bool>,
    assistant_id: Option<String>,
    mem0: Option<Mem0Config>,
}

impl TurnkeeperConfig {
    pub fn new(home: &Path) -> Self {
        Self {
            data_dir: home.join("warehouse"),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_reconnect_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BASE_DELAY,
            fetch_deadline: DEFAULT_FETCH_DEADLINE,
            short_term_size: DEFAULT_SHORT_TERM_SIZE,
            parallel_memory: true,
            strict_memory: false,
            assistant_id: DEFAULT_ASSISTANT_ID.to_string(),
            mem0: None,
        }
    }

    /// Load `{home}/config.toml` if it exists, then apply environment overrides.
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        let file = if path.exists() {
            debug!("Loading config from {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<ConfigToml>(&content)?
        } else {
            ConfigToml::default()
        };

        let mut config = Self::new(home).merge(file);
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn merge(mut self, file: ConfigToml) -> Self {
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }
        if let Some(size) = file.batch_size {
            self.batch_size = size;
        }
        if let Some(secs) = file.batch_interval_seconds {
            self.batch_interval = Duration::from_secs(secs);
        }
        if let Some(retries) = file.max_reconnect_retries {
            self.max_reconnect_retries = retries;
        }
        if let Some(secs) = file.backoff_base_seconds {
            if secs.is_finite() && secs >= 0.0 {
                self.backoff_base = Duration::from_secs_f64(secs);
            }
        }
        if let Some(ms) = file.fetch_deadline_ms {
            self.fetch_deadline = Duration::from_millis(ms);
        }
        if let Some(size) = file.short_term_size {
            self.short_term_size = size;
        }
        if let Some(parallel) = file.parallel_memory {
            self.parallel_memory = parallel;
        }
        if let Some(strict) = file.strict_memory {
            self.strict_memory = strict;
        }
        if let Some(id) = file.assistant_id {
            self.assistant_id = id;
        }
        if file.mem0.is_some() {
            self.mem0 = file.mem0;
        }
        self
    }

    /// Override long-term memory credentials from `MEM0_*` variables.
    ///
    /// An API key alone is enough to enable the backend.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(api_key) = var("MEM0_API_KEY") {
            match self.mem0.as_mut() {
                Some(mem0) => mem0.api_key = api_key,
                None => self.mem0 = Some(Mem0Config::new(api_key)),
            }
        }
        let Some(mem0) = self.mem0.as_mut() else {
            return;
        };
        if let Some(base_url) = var("MEM0_BASE_URL") {
            mem0.base_url = base_url;
        }
        if let Some(org_id) = var("MEM0_ORG_ID") {
            mem0.org_id = Some(org_id);
        }
        if let Some(project_id) = var("MEM0_PROJECT_ID") {
            mem0.project_id = Some(project_id);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TurnkeeperError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(TurnkeeperError::Config(
                "batch_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_max_reconnect_retries(mut self, retries: u32) -> Self {
        self.max_reconnect_retries = retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_fetch_deadline(mut self, deadline: Duration) -> Self {
        self.fetch_deadline = deadline;
        self
    }

    pub fn with_short_term_size(mut self, size: usize) -> Self {
        self.short_term_size = size;
        self
    }

    pub fn with_parallel_memory(mut self, parallel: bool) -> Self {
        self.parallel_memory = parallel;
        self
    }

    pub fn with_strict_memory(mut self, strict: bool) -> Self {
        self.strict_memory = strict;
        self
    }

    pub fn with_mem0(mut self, mem0: Mem0Config) -> Self {
        self.mem0 = Some(mem0);
        self
    }
}

/// `$TURNKEEPER_HOME`, else `~/.turnkeeper`
pub fn default_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("TURNKEEPER_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| TurnkeeperError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".turnkeeper"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TurnkeeperConfig::new(Path::new("/tmp/tk"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tk/warehouse"));
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_interval, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert!(config.parallel_memory);
        assert!(config.mem0.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            r#"
batch_size = 3
backoff_base_seconds = 0.5
parallel_memory = false

[mem0]
api_key = "m0-test"
org_id = "acme"
"#,
        )
        .unwrap();

        let file: ConfigToml =
            toml::from_str(&std::fs::read_to_string(home.path().join("config.toml")).unwrap())
                .unwrap();
        let config = TurnkeeperConfig::new(home.path()).merge(file);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(500));
        assert!(!config.parallel_memory);
        assert_eq!(config.batch_interval, Duration::from_secs(10));

        let mem0 = config.mem0.unwrap();
        assert_eq!(mem0.base_url, DEFAULT_MEM0_BASE_URL);
        assert_eq!(mem0.org_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_env_overrides_mem0() {
        let env: HashMap<&str, &str> = [
            ("MEM0_API_KEY", "from-env"),
            ("MEM0_PROJECT_ID", "proj"),
            ("MEM0_ORG_ID", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = TurnkeeperConfig::new(Path::new("/tmp/tk"));
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        let mem0 = config.mem0.unwrap();
        assert_eq!(mem0.api_key, "from-env");
        assert_eq!(mem0.project_id.as_deref(), Some("proj"));
        assert!(mem0.org_id.is_none());
    }

    #[test]
    fn test_env_without_key_leaves_memory_disabled() {
        let mut config = TurnkeeperConfig::new(Path::new("/tmp/tk"));
        config.apply_env(|key| (key == "MEM0_ORG_ID").then(|| "acme".to_string()));
        assert!(config.mem0.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_batching() {
        let base = TurnkeeperConfig::new(Path::new("/tmp/tk"));
        assert!(matches!(
            base.clone().with_batch_size(0).validate(),
            Err(TurnkeeperError::Config(_))
        ));
        assert!(matches!(
            base.with_batch_interval(Duration::ZERO).validate(),
            Err(TurnkeeperError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join("config.toml"), "batch_size = \"many\"").unwrap();
        assert!(matches!(
            TurnkeeperConfig::load(home.path()),
            Err(TurnkeeperError::Toml(_))
        ));
    }
}
