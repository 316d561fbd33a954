//! TOML configuration for the access core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Access-core configuration.
///
/// Policies themselves are fixed at load time; configuration covers the
/// sandbox probe location and how pending portal dialogs behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Resolve a pending portal dialog as granted after this many
    /// milliseconds without a `Response`. Dormant when absent.
    #[serde(default)]
    pub pending_grant_timeout_ms: Option<u64>,

    /// Root of the process filesystem used by the sandbox probe.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Emit a log line for every verdict.
    #[serde(default = "default_true")]
    pub log_decisions: bool,
}

impl AccessConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Save configuration to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pending_grant_timeout_ms == Some(0) {
            return Err("pending_grant_timeout_ms must be positive".to_string());
        }

        if self.proc_root.as_os_str().is_empty() {
            return Err("proc_root cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            pending_grant_timeout_ms: None,
            proc_root: default_proc_root(),
            log_decisions: true,
        }
    }
}

// Default value functions for serde
fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_true() -> bool {
    true
}
