use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_level: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub task_types: Option<Vec<TaskTypeConfig>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_check_interval_minutes: Option<u64>,
    pub max_check_interval_minutes: Option<u64>,
    pub interval_hysteresis_minutes: Option<u64>,
    pub max_concurrent_executions: Option<usize>,
    pub batch_timeout_secs: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
    // Leadership
    pub leader_check_interval_secs: Option<u64>,
    pub leader_lease_ttl_secs: Option<u64>,
    pub leader_lock_name: Option<String>,
    pub instance_id: Option<String>,
    pub due_batch_limit: Option<usize>,
}

/// One `[[task_types]]` entry: a command run once per due subject.
#[derive(Debug, Deserialize, Clone)]
pub struct TaskTypeConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub failure_threshold: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
db_path = "/var/lib/recheck/monitor.db"
metrics_port = 9095
log_level = "debug"

[scheduler]
min_check_interval_minutes = 2
max_check_interval_minutes = 10
max_concurrent_executions = 4
instance_id = "host-a"

[[task_types]]
name = "credential_health"
command = "/usr/local/bin/check-credential"
args = ["--json"]
failure_threshold = 3

[[task_types]]
name = "audit"
command = "/usr/local/bin/audit"
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.db_path.as_deref(), Some("/var/lib/recheck/monitor.db"));
        assert_eq!(config.metrics_port, Some(9095));
        let scheduler = config.scheduler.unwrap();
        assert_eq!(scheduler.min_check_interval_minutes, Some(2));
        assert_eq!(scheduler.instance_id.as_deref(), Some("host-a"));
        assert!(scheduler.batch_timeout_secs.is_none());

        let task_types = config.task_types.unwrap();
        assert_eq!(task_types.len(), 2);
        assert_eq!(task_types[0].args, vec!["--json"]);
        assert_eq!(task_types[0].failure_threshold, Some(3));
        assert!(task_types[1].args.is_empty());
    }

    #[test]
    fn test_load_empty_config() {
        let file = NamedTempFile::new().unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert!(config.db_path.is_none());
        assert!(config.scheduler.is_none());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "db_path = ").unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FileConfig::load(Path::new("/nonexistent/recheck.toml")).is_err());
    }
}
