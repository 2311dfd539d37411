use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SyncError;

pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_PERIODIC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 5_000;

/// Which side wins when the local write timestamp equals the remote
/// `last_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    #[default]
    Remote,
    Local,
}

/// Timing and policy knobs for the sync layer.
///
/// ```toml
/// debounce_ms = 1000
/// periodic_interval_ms = 30000
/// remote_timeout_ms = 5000
/// tie_break = "remote"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Quiet period before a burst of saves is written through.
    pub debounce_ms: u64,
    /// Interval of the background reconcile while changes are unsynced.
    pub periodic_interval_ms: u64,
    /// Budget handed to every remote call.
    pub remote_timeout_ms: u64,
    pub tie_break: TieBreak,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            periodic_interval_ms: DEFAULT_PERIODIC_INTERVAL_MS,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            tie_break: TieBreak::Remote,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for (name, value) in [
            ("debounce_ms", self.debounce_ms),
            ("periodic_interval_ms", self.periodic_interval_ms),
            ("remote_timeout_ms", self.remote_timeout_ms),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
