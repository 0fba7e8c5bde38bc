mod file_config;

pub use file_config::{FileConfig, SchedulerConfig, TaskTypeConfig};

use crate::scheduler::DEFAULT_FAILURE_THRESHOLD;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Verbosity of the tracing subscriber when `LOG_LEVEL` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub log_level: LogLevel,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,
    pub log_level: LogLevel,

    pub scheduler: SchedulerSettings,
    pub task_types: Vec<TaskTypeSettings>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let log_level = file
            .log_level
            .and_then(|s| parse_log_level(&s))
            .unwrap_or(cli.log_level);

        let defaults = SchedulerSettings::default();
        let sc = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            min_check_interval_minutes: sc
                .min_check_interval_minutes
                .unwrap_or(defaults.min_check_interval_minutes),
            max_check_interval_minutes: sc
                .max_check_interval_minutes
                .unwrap_or(defaults.max_check_interval_minutes),
            interval_hysteresis_minutes: sc
                .interval_hysteresis_minutes
                .unwrap_or(defaults.interval_hysteresis_minutes),
            max_concurrent_executions: sc
                .max_concurrent_executions
                .unwrap_or(defaults.max_concurrent_executions),
            batch_timeout_secs: sc.batch_timeout_secs.unwrap_or(defaults.batch_timeout_secs),
            cancel_grace_secs: sc.cancel_grace_secs.unwrap_or(defaults.cancel_grace_secs),
            leader_check_interval_secs: sc
                .leader_check_interval_secs
                .unwrap_or(defaults.leader_check_interval_secs),
            leader_lease_ttl_secs: sc
                .leader_lease_ttl_secs
                .unwrap_or(defaults.leader_lease_ttl_secs),
            leader_lock_name: sc.leader_lock_name.unwrap_or(defaults.leader_lock_name),
            instance_id: sc
                .instance_id
                .or_else(|| cli.instance_id.clone())
                .unwrap_or(defaults.instance_id),
            due_batch_limit: sc.due_batch_limit.unwrap_or(defaults.due_batch_limit),
        };
        scheduler.validate()?;

        let mut seen = HashSet::new();
        let mut task_types = Vec::new();
        for entry in file.task_types.unwrap_or_default() {
            let name = entry.name.trim().to_string();
            if name.is_empty() {
                bail!("Task type name must not be empty");
            }
            if entry.command.trim().is_empty() {
                bail!("Task type {} has an empty command", name);
            }
            if !seen.insert(name.clone()) {
                bail!("Task type {} is configured more than once", name);
            }
            task_types.push(TaskTypeSettings {
                name,
                command: entry.command,
                args: entry.args,
                failure_threshold: entry.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            });
        }

        Ok(Self {
            db_path,
            metrics_port,
            log_level,
            scheduler,
            task_types,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub min_check_interval_minutes: u64,
    pub max_check_interval_minutes: u64,
    pub interval_hysteresis_minutes: u64,
    pub max_concurrent_executions: usize,
    /// Hard ceiling on one cycle's batch of executions.
    pub batch_timeout_secs: u64,
    /// How long cancelled executions get to finish before they are aborted.
    pub cancel_grace_secs: u64,
    pub leader_check_interval_secs: u64,
    pub leader_lease_ttl_secs: u64,
    pub leader_lock_name: String,
    pub instance_id: String,
    pub due_batch_limit: usize,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_check_interval_minutes == 0 {
            bail!("min_check_interval_minutes must be at least 1");
        }
        if self.min_check_interval_minutes > self.max_check_interval_minutes {
            bail!(
                "min_check_interval_minutes ({}) is greater than max_check_interval_minutes ({})",
                self.min_check_interval_minutes,
                self.max_check_interval_minutes
            );
        }
        if self.max_concurrent_executions == 0 {
            bail!("max_concurrent_executions must be greater than 0");
        }
        if self.batch_timeout_secs == 0 {
            bail!("batch_timeout_secs must be greater than 0");
        }
        if self.leader_lease_ttl_secs <= self.leader_check_interval_secs {
            bail!(
                "leader_lease_ttl_secs ({}) must be longer than leader_check_interval_secs ({})",
                self.leader_lease_ttl_secs,
                self.leader_check_interval_secs
            );
        }
        if self.leader_lock_name.trim().is_empty() {
            bail!("leader_lock_name must not be empty");
        }
        if self.due_batch_limit == 0 {
            bail!("due_batch_limit must be greater than 0");
        }
        Ok(())
    }

    pub fn min_check_interval(&self) -> Duration {
        Duration::from_secs(self.min_check_interval_minutes * 60)
    }

    pub fn max_check_interval(&self) -> Duration {
        Duration::from_secs(self.max_check_interval_minutes * 60)
    }

    pub fn interval_hysteresis(&self) -> Duration {
        Duration::from_secs(self.interval_hysteresis_minutes * 60)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn leader_check_interval(&self) -> Duration {
        Duration::from_secs(self.leader_check_interval_secs)
    }

    pub fn leader_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lease_ttl_secs)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_check_interval_minutes: 1,
            max_check_interval_minutes: 15,
            interval_hysteresis_minutes: 1,
            max_concurrent_executions: 8,
            batch_timeout_secs: 300,
            cancel_grace_secs: 5,
            leader_check_interval_secs: 15,
            leader_lease_ttl_secs: 45,
            leader_lock_name: "check_due_tasks".to_string(),
            instance_id: format!("recheck-{}", uuid::Uuid::new_v4()),
            due_batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskTypeSettings {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub failure_threshold: u32,
}

/// Parses a log level string into LogLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_log_level(s: &str) -> Option<LogLevel> {
    LogLevel::from_str(s, true).ok()
}
