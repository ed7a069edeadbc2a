//! Settings for devstack
//!
//! Resolution order, lowest to highest priority:
//! 1. Built-in defaults
//! 2. `<config_dir>/devstack/settings.yaml`
//! 3. `DEVSTACK_*` environment variables
//! 4. Command-line flags (applied by the caller)

use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file name inside the devstack config directory
pub const SETTINGS_FILE: &str = "settings.yaml";

/// What to do with already-started services when a start fails part way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupFailurePolicy {
    /// Leave them running so the operator can inspect logs
    #[default]
    LeaveRunning,
    /// Bring them down again before reporting the failure
    RollBack,
}

/// devstack settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base directory holding one directory per stack
    pub stacks_dir: PathBuf,
    /// How long a service may take to report healthy
    pub health_timeout_secs: u64,
    /// Delay between health polls
    pub poll_interval_ms: u64,
    /// Graceful stop timeout per service
    pub stop_timeout_secs: u64,
    /// Upper bound for a single in-container command
    pub exec_timeout_secs: u64,
    /// Partial start failure handling
    pub startup_failure: StartupFailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stacks_dir: default_stacks_dir(),
            health_timeout_secs: 120,
            poll_interval_ms: 1000,
            stop_timeout_secs: 30,
            exec_timeout_secs: 60,
            startup_failure: StartupFailurePolicy::default(),
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("devstack").join(SETTINGS_FILE))
    }

    /// Load settings from the default location and the process environment
    pub fn load() -> Result<Self> {
        let mut settings = match Self::settings_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StackError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse settings from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| StackError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `DEVSTACK_*` overrides using the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("DEVSTACK_STACKS_DIR") {
            self.stacks_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("DEVSTACK_HEALTH_TIMEOUT_SECS") {
            self.health_timeout_secs = parse_number("DEVSTACK_HEALTH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("DEVSTACK_STOP_TIMEOUT_SECS") {
            self.stop_timeout_secs = parse_number("DEVSTACK_STOP_TIMEOUT_SECS", &secs)?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(StackError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stacks_dir.as_os_str().is_empty() {
            return Err(StackError::Config("stacks_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

/// `~/.devstack/stacks`, or a relative `stacks` directory without a home
fn default_stacks_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".devstack").join("stacks"))
        .unwrap_or_else(|| PathBuf::from("stacks"))
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| StackError::Config(format!("{} must be a number, got '{}'", key, value)))
}
