use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::retry::RetryPolicy;
use crate::{twlog_debug, Error, Result};

/// Default number of concurrently running leaf tasks.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of leaf tasks running at once. Must be > 0.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Maximum number of queued tasks; 0 means unbounded.
    #[serde(default)]
    pub queue_capacity: usize,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            queue_capacity: 0,
        }
    }
}

impl PoolConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            queue_capacity: 0,
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "pool.max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(Error::InvalidConfig(format!(
                "pool.queue_capacity must be at most {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }

    pub fn is_queue_bounded(&self) -> bool {
        self.queue_capacity > 0
    }
}

/// Per-run orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for a whole run.
    #[serde(default, rename = "deadline_ms", with = "optional_millis")]
    pub deadline: Option<Duration>,
    /// Cancel the task graph when the deadline expires.
    #[serde(default = "default_true")]
    pub cancel_on_deadline: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline: None,
            cancel_on_deadline: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    /// Retry policy applied to leaf steps that do not set their own.
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn taskweave_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskweave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskweave_dir()?.join("taskweave.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        twlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            twlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.pool.validate()?;
        twlog_debug!(
            "Config loaded: max_concurrency={}, queue_capacity={}, retry={:?}",
            config.pool.max_concurrency,
            config.pool.queue_capacity,
            config.retry
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                twlog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        twlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
