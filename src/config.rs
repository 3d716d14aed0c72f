use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{AgentCapacity, EngineConfig, Strategy, TaskScheduler};
use crate::{Error, Result};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "MEMNEXUS_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Strategy used when a plan file does not name one.
    pub default_strategy: Strategy,
    /// Agents per role. Roles not listed get one agent.
    pub capacity: AgentCapacity,
    pub agent_timeout_secs: Option<u64>,
    pub intervention_timeout_secs: Option<u64>,
    pub review_gate_timeout_secs: Option<u64>,
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            default_strategy: Strategy::default(),
            capacity: AgentCapacity::new(),
            agent_timeout_secs: engine.agent_timeout.map(|d| d.as_secs()),
            intervention_timeout_secs: None,
            review_gate_timeout_secs: None,
            event_buffer: engine.event_buffer,
        }
    }
}

impl Config {
    pub fn data_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".memnexus"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("memnexus.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            strategy = %config.default_strategy,
            agent_timeout = ?config.agent_timeout_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tracing::debug!(dir = %dir.display(), "creating data directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            agent_timeout: self.agent_timeout_secs.map(Duration::from_secs),
            intervention_timeout: self.intervention_timeout_secs.map(Duration::from_secs),
            review_gate_timeout: self.review_gate_timeout_secs.map(Duration::from_secs),
            event_buffer: self.event_buffer,
        }
    }

    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(self.capacity.clone(), self.default_strategy)
    }
}
