use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::paths;

/// Root configuration structure for rollout.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolloutConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

/// All configurable defaults that can be overridden via rollout.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    #[serde(default)]
    pub transport: TransportDefaults,

    #[serde(default)]
    pub releases: ReleaseDefaults,

    #[serde(default)]
    pub locks: LockDefaults,
}

/// Connection and retry policy for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDefaults {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_backoff_base_millis")]
    pub backoff_base_millis: u64,

    #[serde(default = "default_server_alive_interval_secs")]
    pub server_alive_interval_secs: u64,

    /// ssh client binary; resolved through PATH when not absolute.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

/// Release directory retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDefaults {
    #[serde(default = "default_keep_releases")]
    pub keep: usize,
}

/// Per-target activation lock behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDefaults {
    /// 0 rejects a second run immediately instead of queueing it.
    #[serde(default)]
    pub wait_secs: u64,

    #[serde(default = "default_lock_poll_millis")]
    pub poll_millis: u64,
}

impl Default for TransportDefaults {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            backoff_base_millis: default_backoff_base_millis(),
            server_alive_interval_secs: default_server_alive_interval_secs(),
            ssh_program: default_ssh_program(),
        }
    }
}

impl TransportDefaults {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ReleaseDefaults {
    fn default() -> Self {
        Self {
            keep: default_keep_releases(),
        }
    }
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self {
            wait_secs: 0,
            poll_millis: default_lock_poll_millis(),
        }
    }
}

impl LockDefaults {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_millis.max(10))
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_backoff_base_millis() -> u64 {
    1000
}

fn default_server_alive_interval_secs() -> u64 {
    15
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_keep_releases() -> usize {
    5
}

fn default_lock_poll_millis() -> u64 {
    250
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load defaults, merging file config with built-in defaults.
/// If rollout.json is missing or invalid, silently returns built-in defaults.
pub fn load_defaults() -> Defaults {
    load_config().defaults
}

/// Load the full rollout.json config, falling back to defaults on any error.
pub fn load_config() -> RolloutConfig {
    load_config_from_file().unwrap_or_default()
}

fn load_config_from_file() -> crate::Result<RolloutConfig> {
    let path = paths::rollout_json()?;

    let content = fs::read_to_string(&path).map_err(|e| {
        crate::Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    serde_json::from_str(&content).map_err(|e| {
        crate::Error::validation_invalid_json(e, Some("parse rollout.json".to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_builtin_defaults() {
        let config: RolloutConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.defaults.transport.retry_attempts, 3);
        assert_eq!(config.defaults.transport.connect_timeout_secs, 10);
        assert_eq!(config.defaults.releases.keep, 5);
        assert_eq!(config.defaults.locks.wait_secs, 0);
        assert_eq!(config.defaults.transport.ssh_program, "ssh");
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: RolloutConfig = serde_json::from_str(
            r#"{"defaults":{"transport":{"retryAttempts":5},"locks":{"waitSecs":30}}}"#,
        )
        .unwrap();
        assert_eq!(config.defaults.transport.retry_attempts, 5);
        assert_eq!(config.defaults.transport.backoff_base_millis, 1000);
        assert_eq!(config.defaults.locks.wait(), Duration::from_secs(30));
    }
}
