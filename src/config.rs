use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{hlog_debug, Error, Result};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BID_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_AGENTS: usize = 64;
pub const DEFAULT_BRANCH_PREFIX: &str = "hive";

/// User configuration, read from `~/.hive/hive.toml`.
///
/// Every key is optional; `effective_*` accessors supply the defaults.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Skip the confirmation prompt before running a batch.
    #[serde(default)]
    pub trust: bool,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub branch_prefix: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_dir: Option<String>,
    pub command: Option<String>,
    /// Path to the scaling rule file.
    pub rules: Option<String>,
    /// Value substituted when a metric provider fails. Unset means the rule is skipped.
    pub metric_fallback: Option<f64>,
    pub bid_timeout_ms: Option<u64>,
    pub max_agents: Option<usize>,
    pub audit_log: Option<String>,
    pub tenant: Option<String>,
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1)
    }

    pub fn effective_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn effective_branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or(DEFAULT_BRANCH_PREFIX)
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn effective_bid_timeout(&self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms.unwrap_or(DEFAULT_BID_TIMEOUT_MS))
    }

    pub fn effective_max_agents(&self) -> usize {
        self.max_agents.unwrap_or(DEFAULT_MAX_AGENTS)
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::hive_dir()?.join("worktrees")),
        }
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        match &self.audit_log {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::hive_dir()?.join("audit.jsonl")),
        }
    }

    pub fn rules_path(&self) -> Option<PathBuf> {
        self.rules.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        hlog_debug!(
            "Config loaded: concurrency={:?}, timeout_ms={:?}, command={:?}, rules={:?}",
            config.concurrency,
            config.timeout_ms,
            config.command,
            config.rules
        );
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        let worktrees_dir = self.worktrees_dir()?;
        for dir in [&hive_dir, &worktrees_dir] {
            if !dir.exists() {
                hlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
