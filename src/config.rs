//! Engine configuration.
//!
//! The config is injected at `Engine` construction; no component reads
//! ambient global state. Every field has a serde default so a config file
//! can set only what it cares about.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on optimistic-save retries before surfacing `RetriesExceeded`.
    #[serde(default = "default_max_save_retries")]
    pub max_save_retries: u32,

    /// Default for runs that do not set the flag explicitly: a failed step
    /// kills unfinished sibling work under the same workflow.
    #[serde(default = "default_true")]
    pub hard_stop_on_fail: bool,

    /// Default for runs that do not set the flag explicitly: cancelling a
    /// run kills all descendant work immediately.
    #[serde(default = "default_true")]
    pub hard_stop_on_cancel: bool,

    /// Interval workers are told to heartbeat at.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u32,

    /// Root directory under which per-attempt working directories live.
    #[serde(default = "default_task_workdir_root")]
    pub task_workdir_root: PathBuf,
}

fn default_max_save_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u32 {
    60
}

fn default_task_workdir_root() -> PathBuf {
    PathBuf::from("/tmp/weft")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_save_retries: default_max_save_retries(),
            hard_stop_on_fail: true,
            hard_stop_on_cancel: true,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            task_workdir_root: default_task_workdir_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config.max_save_retries, 5);
        assert!(config.hard_stop_on_fail);
        assert_eq!(config.heartbeat_interval_secs, 60);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_save_retries": 2, "hard_stop_on_fail": false}"#)
                .expect("partial config");
        assert_eq!(config.max_save_retries, 2);
        assert!(!config.hard_stop_on_fail);
        assert!(config.hard_stop_on_cancel);
    }
}
