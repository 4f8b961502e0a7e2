use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::util::duration_from_secs;
use crate::{flog_debug, Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 5.0;
pub const DEFAULT_TIMEOUT_SECS: f64 = 300.0;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_ROLLBACK_TIMEOUT_SECS: f64 = 300.0;

/// Retry settings applied to tasks that do not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub backoff_multiplier: f64,
    pub timeout_secs: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// When the orchestrator undoes work after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// Roll back each failed component once none of its tasks are outstanding.
    #[default]
    Component,
    /// Component rollback, plus a full system rollback when the run fails.
    Full,
    /// Never roll back automatically.
    Disabled,
}

impl std::str::FromStr for RollbackMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "component" => Ok(Self::Component),
            "full" => Ok(Self::Full),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(Error::InvalidConfig(format!(
                "unknown rollback mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub defaults: RetryDefaults,
    /// Upper bound on concurrently running tasks. Defaults to the core count.
    pub max_parallel: Option<usize>,
    /// Wall-clock budget for a whole run.
    pub global_timeout_secs: Option<f64>,
    #[serde(default)]
    pub rollback_mode: RollbackMode,
    pub rollback_timeout_secs: Option<f64>,
    pub report_path: Option<String>,
    pub state_dir: Option<String>,
}

impl Config {
    pub fn labforge_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".labforge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::labforge_dir()?.join("labforge.toml"))
    }

    /// Directory holding the resource ledger and the last report.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::labforge_dir(),
        }
    }

    pub fn ledger_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("resources.json"))
    }

    pub fn report_path(&self) -> Result<PathBuf> {
        match &self.report_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(self.state_dir()?.join("last-report.json")),
        }
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_secs.map(duration_from_secs)
    }

    pub fn rollback_timeout(&self) -> Duration {
        duration_from_secs(
            self.rollback_timeout_secs
                .unwrap_or(DEFAULT_ROLLBACK_TIMEOUT_SECS),
        )
    }

    /// Load `~/.labforge/labforge.toml` and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        let mut config = if path.exists() {
            Self::parse(&fs::read_to_string(&path)?)?
        } else {
            flog_debug!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        flog_debug!(
            "Config loaded: defaults={:?}, max_parallel={:?}, rollback_mode={:?}",
            config.defaults,
            config.max_parallel,
            config.rollback_mode
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::labforge_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Override values from `DEFAULT_*` and `LABFORGE_*` variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEFAULT_MAX_RETRIES") {
            self.defaults.max_retries = parse_env("DEFAULT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_RETRY_DELAY") {
            self.defaults.retry_delay_secs = parse_env("DEFAULT_RETRY_DELAY", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_TIMEOUT") {
            self.defaults.timeout_secs = parse_env("DEFAULT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_BACKOFF_MULTIPLIER") {
            self.defaults.backoff_multiplier = parse_env("DEFAULT_BACKOFF_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("LABFORGE_MAX_PARALLEL") {
            self.max_parallel = Some(parse_env("LABFORGE_MAX_PARALLEL", &v)?);
        }
        if let Some(v) = lookup("LABFORGE_GLOBAL_TIMEOUT") {
            self.global_timeout_secs = Some(parse_env("LABFORGE_GLOBAL_TIMEOUT", &v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.defaults;
        if !d.backoff_multiplier.is_finite() || d.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be >= 1, got {}",
                d.backoff_multiplier
            )));
        }
        if !d.timeout_secs.is_finite() || d.timeout_secs <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "timeout_secs must be > 0, got {}",
                d.timeout_secs
            )));
        }
        if !d.retry_delay_secs.is_finite() || d.retry_delay_secs < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "retry_delay_secs must be >= 0, got {}",
                d.retry_delay_secs
            )));
        }
        if self.max_parallel == Some(0) {
            return Err(Error::InvalidConfig("max_parallel must be >= 1".into()));
        }
        if let Some(t) = self.global_timeout_secs {
            if !t.is_finite() || t <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "global_timeout_secs must be > 0, got {}",
                    t
                )));
            }
        }
        if let Some(t) = self.rollback_timeout_secs {
            if !t.is_finite() || t <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "rollback_timeout_secs must be > 0, got {}",
                    t
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}={} is not a valid value", key, value)))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
