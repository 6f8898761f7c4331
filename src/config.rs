use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{alog_debug, Error, Result};

const DEFAULT_MAX_RECURSION_DEPTH: u32 = 3;
const DEFAULT_BRANCH_PREFIX: &str = "agent";
/// Slash-separated components of ref-safe characters.
const BRANCH_PREFIX_PATTERN: &str = r"^[A-Za-z0-9_][A-Za-z0-9._-]*(/[A-Za-z0-9_][A-Za-z0-9._-]*)*$";

/// What happens to a spawn request that arrives while a sibling is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiblingPolicy {
    /// Park the request and admit it when the running sibling terminates.
    #[default]
    Queue,
    /// Refuse with `SequentialViolation`.
    Reject,
}

/// Consequence of the credit ledger refusing a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerPolicy {
    #[default]
    FailNode,
    BlockSpawns,
}

/// How a failed child affects its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The parent's engine is told; the parent keeps running.
    #[default]
    NotifyParent,
    /// Ancestors fail one after another up to the root.
    FailParent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_depth")]
    pub max_recursion_depth: u32,
    #[serde(default)]
    pub sibling_policy: SiblingPolicy,
    #[serde(default)]
    pub ledger_policy: LedgerPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub branch_prefix: Option<String>,
    pub state_file: Option<String>,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_RECURSION_DEPTH
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            sibling_policy: SiblingPolicy::default(),
            ledger_policy: LedgerPolicy::default(),
            failure_policy: FailurePolicy::default(),
            branch_prefix: None,
            state_file: None,
        }
    }
}

impl Config {
    pub fn arbor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".arbor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::arbor_dir()?.join("arbor.toml"))
    }

    pub fn effective_branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or(DEFAULT_BRANCH_PREFIX)
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match self.state_file {
            Some(ref file) => Ok(expand_tilde(file)),
            None => Ok(Self::arbor_dir()?.join("state.json")),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_recursion_depth == 0 {
            return Err(Error::Validation(
                "max_recursion_depth must be at least 1".to_string(),
            ));
        }
        let prefix = self.effective_branch_prefix();
        let pattern = Regex::new(BRANCH_PREFIX_PATTERN)
            .map_err(|e| Error::Validation(format!("branch prefix pattern: {}", e)))?;
        if !pattern.is_match(prefix) || prefix.contains("..") || prefix.ends_with(".lock") {
            return Err(Error::Validation(format!(
                "branch_prefix '{}' is not a usable ref component",
                prefix
            )));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        alog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            alog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        alog_debug!(
            "Config loaded: max_depth={} sibling={:?} ledger={:?} failure={:?}",
            config.max_recursion_depth,
            config.sibling_policy,
            config.ledger_policy,
            config.failure_policy
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::arbor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        alog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
