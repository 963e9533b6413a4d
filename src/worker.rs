//! Worker-facing settings contract.
//!
//! External task-execution workers fetch these per attempt: where to work,
//! where to write logs, how often to heartbeat. The core computes paths
//! from config; it never touches the filesystem itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::ids::{TaskAttemptId, TaskId};

/// Settings consumed by the external worker running one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub working_dir: PathBuf,
    pub stdout_log_file: PathBuf,
    pub stderr_log_file: PathBuf,
    pub heartbeat_interval_secs: u32,
}

impl WorkerSettings {
    pub fn for_attempt(config: &EngineConfig, task: TaskId, attempt: TaskAttemptId) -> Self {
        let working_dir = config
            .task_workdir_root
            .join(task.to_string())
            .join(attempt.to_string());
        Self {
            stdout_log_file: working_dir.join("stdout.log"),
            stderr_log_file: working_dir.join("stderr.log"),
            working_dir,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_directories_nest_under_the_task() {
        let config = EngineConfig {
            task_workdir_root: PathBuf::from("/scratch"),
            ..EngineConfig::default()
        };
        let task = TaskId::new();
        let attempt = TaskAttemptId::new();
        let settings = WorkerSettings::for_attempt(&config, task, attempt);
        assert!(settings.working_dir.starts_with("/scratch"));
        assert!(settings
            .working_dir
            .to_string_lossy()
            .contains(&task.to_string()));
        assert_eq!(settings.stdout_log_file, settings.working_dir.join("stdout.log"));
        assert_eq!(settings.heartbeat_interval_secs, 60);
    }
}
