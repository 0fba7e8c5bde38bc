use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recheck_scheduler::config::{self, LogLevel};
use recheck_scheduler::metrics;
use recheck_scheduler::monitor_store::{LogQuery, MonitorStore, SchedulerEventType, SqliteMonitorStore};
use recheck_scheduler::scheduler::{create_scheduler, ReconcileAction};
use recheck_scheduler::task_types::build_registry;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_event_type(s: &str) -> Result<SchedulerEventType, String> {
    SchedulerEventType::parse(s).ok_or_else(|| format!("Unknown event type: {}", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid RFC 3339 timestamp {}: {}", s, e))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite monitor database shared by all scheduler instances.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9095)]
    pub metrics_port: u16,

    /// Identity used for the leader lock. Random when not set.
    #[clap(long)]
    pub instance_id: Option<String>,

    /// Default log level, used when LOG_LEVEL is not set.
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl+C.
    Run,

    /// Start monitoring a subject, or re-enable a paused one.
    Enable {
        #[clap(long)]
        tenant: String,
        #[clap(long = "type")]
        task_type: String,
        #[clap(long)]
        subject: String,
        /// Seconds between checks.
        #[clap(long, default_value_t = 3600)]
        frequency_secs: u64,
    },

    /// Stop monitoring a task. History is kept.
    Disable {
        #[clap(long)]
        tenant: String,
        #[clap(long)]
        task_id: i64,
    },

    /// Force-run or reset a single task.
    Reconcile {
        #[clap(long)]
        tenant: String,
        #[clap(long)]
        task_id: i64,
        #[clap(long, value_enum)]
        action: ReconcileAction,
    },

    /// List a tenant's tasks.
    Tasks {
        #[clap(long)]
        tenant: String,
    },

    /// Show a task's execution history, newest first.
    History {
        #[clap(long)]
        tenant: String,
        #[clap(long)]
        task_id: i64,
        /// Only entries at or after this RFC 3339 timestamp.
        #[clap(long, value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,
        /// Only entries at or before this RFC 3339 timestamp.
        #[clap(long, value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
        #[clap(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show cumulative counters.
    Stats,

    /// Show scheduler events, newest first.
    Events {
        #[clap(long = "type", value_parser = parse_event_type)]
        event_type: Option<SchedulerEventType>,
        /// Only entries at or after this RFC 3339 timestamp.
        #[clap(long, value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,
        /// Only entries at or before this RFC 3339 timestamp.
        #[clap(long, value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
        #[clap(long, default_value_t = 0)]
        offset: usize,
    },
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            metrics_port: args.metrics_port,
            log_level: args.log_level,
            instance_id: args.instance_id.clone(),
        }
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(level_filter(app_config.log_level).into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    if let Some(path) = &cli_args.config {
        info!("Loaded configuration from {:?}", path);
    }
    if !app_config.db_path.exists() {
        info!("Creating new monitor database at {:?}", app_config.db_path);
    }
    let store = Arc::new(
        SqliteMonitorStore::new(&app_config.db_path)
            .with_context(|| format!("Failed to open monitor database {:?}", app_config.db_path))?,
    );
    let store: Arc<dyn MonitorStore> = store;

    let registry = build_registry(&app_config.task_types)?;
    let (runner, handle) = create_scheduler(Arc::clone(&store), registry, &app_config.scheduler);

    match cli_args.command {
        Command::Run => {
            if app_config.task_types.is_empty() {
                bail!("No task types configured, nothing to schedule");
            }
            info!("Configuration loaded:");
            info!("  db_path: {:?}", app_config.db_path);
            info!("  instance_id: {}", app_config.scheduler.instance_id);
            info!(
                "  check interval: {}-{} minutes",
                app_config.scheduler.min_check_interval_minutes,
                app_config.scheduler.max_check_interval_minutes
            );

            metrics::init_metrics();
            let shutdown_token = CancellationToken::new();

            let metrics_task = if app_config.metrics_port > 0 {
                let port = app_config.metrics_port;
                let token = shutdown_token.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = metrics::serve_metrics(port, token).await {
                        error!("Metrics server stopped: {:#}", e);
                    }
                }))
            } else {
                None
            };

            let signal_token = shutdown_token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                signal_token.cancel();
            });

            let result = runner.run(shutdown_token.clone()).await;
            shutdown_token.cancel();
            if let Some(task) = metrics_task {
                let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
            }
            result
        }
        Command::Enable {
            tenant,
            task_type,
            subject,
            frequency_secs,
        } => {
            let record = handle.enable_monitoring(
                &tenant,
                &task_type,
                &subject,
                Duration::from_secs(frequency_secs),
            )?;
            print_json(&record)
        }
        Command::Disable { tenant, task_id } => {
            print_json(&handle.disable_monitoring(&tenant, task_id)?)
        }
        Command::Reconcile {
            tenant,
            task_id,
            action,
        } => print_json(&handle.reconcile(&tenant, task_id, action).await?),
        Command::Tasks { tenant } => print_json(&handle.list_tenant_tasks(&tenant)?),
        Command::History {
            tenant,
            task_id,
            from,
            to,
            limit,
            offset,
        } => {
            let query = LogQuery {
                from,
                to,
                limit,
                offset,
            };
            print_json(&handle.list_execution_log(&tenant, task_id, &query)?)
        }
        Command::Stats => print_json(&handle.cumulative_stats()?),
        Command::Events {
            event_type,
            from,
            to,
            limit,
            offset,
        } => {
            let query = LogQuery {
                from,
                to,
                limit,
                offset,
            };
            print_json(&handle.list_scheduler_events(event_type, &query)?)
        }
    }
}
