use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quill_telemetry::context::{self, CorrelationContext};
use quill_telemetry::request::TASK_ID;
use quill_telemetry::retention::RetentionPolicy;
use quill_telemetry::rotation::LogFileManager;
use quill_telemetry::{
    instrument_request, instrument_task, HttpRequestInfo, Level, Logger, TelemetryConfig,
    TelemetrySystem,
};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Telemetry configuration file
    #[arg(long, help = "Path to telemetry configuration file")]
    config: Option<PathBuf>,

    /// Set log directory
    #[arg(long, help = "Directory for log files")]
    log_dir: Option<PathBuf>,

    /// Minimum level written (debug, info, warning, error, critical)
    #[arg(long, help = "Set minimum log level")]
    log_level: Option<String>,

    /// Reference time zone for timestamps
    #[arg(long, help = "Time zone offset such as UTC or +09:00")]
    timezone: Option<String>,

    /// Disable the stdout sink
    #[arg(long, help = "Do not write events to standard output")]
    no_console: bool,

    /// Disable file logging
    #[arg(long, help = "Do not write events to the rotating log file")]
    no_file_logging: bool,

    /// Route `tracing` events into the pipeline
    #[arg(long, help = "Install the tracing bridge")]
    tracing_bridge: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Emit a single event
    Emit {
        /// Event name
        event: String,

        #[arg(long, default_value = "INFO")]
        level: String,

        #[arg(long)]
        message: Option<String>,

        /// Payload section as NAME=JSON (repeatable)
        #[arg(long = "section", value_name = "NAME=JSON")]
        sections: Vec<String>,
    },

    /// Run a simulated concurrent workload of requests and tasks
    Demo {
        #[arg(long, default_value_t = 8)]
        requests: usize,

        /// Every Nth request fails (0 disables failures)
        #[arg(long, default_value_t = 4)]
        fail_every: usize,

        /// Per-request delay in milliseconds
        #[arg(long, default_value_t = 5)]
        delay_ms: u64,
    },

    /// Show log files and retention state
    Status {
        /// Delete rotated files beyond the retention count
        #[arg(long)]
        prune: bool,
    },

    /// Write the default configuration file
    InitConfig {
        #[arg(long)]
        path: Option<PathBuf>,

        #[arg(long)]
        force: bool,
    },
}

/// Create telemetry configuration from CLI arguments
async fn create_telemetry_config(cli: &Cli) -> Result<TelemetryConfig> {
    let mut config = TelemetryConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load telemetry configuration")?;
    config.load_env_overrides();

    if let Some(log_dir) = &cli.log_dir {
        config.logging.log_dir = log_dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.min_level = level
            .parse()
            .with_context(|| format!("Invalid log level '{}'", level))?;
    }
    if let Some(timezone) = &cli.timezone {
        config.logging.timezone = timezone.clone();
    }
    if cli.no_console {
        config.logging.console_enabled = false;
    }
    if cli.no_file_logging {
        config.logging.file_enabled = false;
    }
    if cli.tracing_bridge {
        config.logging.install_tracing_bridge = true;
    }

    config.validate().context("Invalid telemetry configuration")?;
    Ok(config)
}

/// Parse `NAME=JSON`; values that are not JSON are kept as strings
fn parse_section(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Section '{}' must look like NAME=JSON", raw))?;
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "Section name in '{}' is empty", raw);

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn emit(level: &str, event: &str, message: Option<&str>, sections: &[String]) -> Result<()> {
    let mut payload = Map::new();
    for raw in sections {
        let (name, value) = parse_section(raw)?;
        payload.insert(name, value);
    }

    let _bound = context::bind_scoped(CorrelationContext::for_request(None).iter().map(
        |(k, v)| (k.to_string(), v.to_string()),
    ));
    quill_telemetry::log(level, event, message, payload);
    Ok(())
}

/// Outcome counts of a demo run
#[derive(Debug, Default, PartialEq, Eq)]
struct DemoSummary {
    failed_requests: usize,
    failed_tasks: usize,
}

async fn run_demo(
    logger: &Logger,
    requests: usize,
    fail_every: usize,
    delay_ms: u64,
) -> Result<DemoSummary> {
    info!(event = "demo_started", requests, fail_every, "Starting demo workload");

    let failed_tasks = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(requests);
    for index in 0..requests {
        let logger = logger.clone();
        let failed_tasks = Arc::clone(&failed_tasks);
        handles.push(tokio::spawn(async move {
            let request = HttpRequestInfo::new("GET", format!("/users/{}", index))
                .with_client_ip("127.0.0.1")
                .with_user_agent("quill-demo");

            instrument_request(&logger, request, async {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if fail_every > 0 && (index + 1) % fail_every == 0 {
                    anyhow::bail!("user {} not found", index);
                }
                logger
                    .event(Level::Info, "user_fetched")
                    .message("User fetched")
                    .context(json!({ "user_id": index }))
                    .emit_to(&logger);

                // Follow-up work keeps the request's trace id
                let task = tokio::spawn(context::propagate({
                    let logger = logger.clone();
                    async move {
                        instrument_task(&logger, "warm_cache", async {
                            anyhow::ensure!(
                                context::current().get(TASK_ID).is_some(),
                                "task id missing from context"
                            );
                            Ok(())
                        })
                        .await
                    }
                }))
                .await;
                if !matches!(task, Ok(Ok(()))) {
                    failed_tasks.fetch_add(1, Ordering::Relaxed);
                }
                Ok(200u16)
            })
            .await
        }));
    }

    let mut summary = DemoSummary::default();
    for handle in handles {
        if handle.await.context("Demo request panicked")?.is_err() {
            summary.failed_requests += 1;
        }
    }
    summary.failed_tasks = failed_tasks.load(Ordering::Relaxed);

    info!(
        event = "demo_finished",
        requests,
        failed_requests = summary.failed_requests,
        failed_tasks = summary.failed_tasks,
        "Demo workload finished"
    );
    Ok(summary)
}

async fn show_status(config: &TelemetryConfig, prune: bool) -> Result<()> {
    let log_dir = &config.logging.log_dir;
    let base_name = &config.logging.log_file_name;

    let report = if prune {
        let policy = RetentionPolicy::new(config.rotation.retention_files as usize);
        Some(policy.perform_cleanup(log_dir, base_name)?)
    } else {
        None
    };

    let rotated = LogFileManager::find_rotated_files(log_dir, base_name)?;
    let current = config.log_file_path();
    let current_size = tokio::fs::metadata(&current).await.map(|m| m.len()).ok();

    let status = json!({
        "log_dir": log_dir.display().to_string(),
        "current_file": current.display().to_string(),
        "current_size_bytes": current_size,
        "retention_files": config.rotation.retention_files,
        "rotated_files": rotated
            .iter()
            .map(|f| json!({ "path": f.path.display().to_string(), "date": f.date.to_string(), "size_bytes": f.size }))
            .collect::<Vec<_>>(),
        "rotated_total_bytes": LogFileManager::calculate_total_size(&rotated),
        "cleanup": report,
    });

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => TelemetryConfig::default_config_path()?,
    };
    anyhow::ensure!(
        force || !path.exists(),
        "{} already exists (use --force to overwrite)",
        path.display()
    );

    TelemetryConfig::default()
        .save(Some(&path))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before parsing configuration
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match &cli.command {
        Command::InitConfig { path, force } => init_config(path.clone(), *force).await,
        Command::Status { prune } => {
            let config = create_telemetry_config(&cli).await?;
            show_status(&config, *prune).await
        }
        Command::Emit {
            event,
            level,
            message,
            sections,
        } => {
            let config = create_telemetry_config(&cli).await?;
            let _guard = TelemetrySystem::init(config)
                .context("Telemetry initialization failed")?;
            emit(level, event, message.as_deref(), sections)
        }
        Command::Demo {
            requests,
            fail_every,
            delay_ms,
        } => {
            let config = create_telemetry_config(&cli).await?;
            let guard = TelemetrySystem::init(config)
                .context("Telemetry initialization failed")?;
            let logger = guard.logger().clone();

            let summary = run_demo(&logger, *requests, *fail_every, *delay_ms).await?;

            let health = logger.health();
            eprintln!("{}", serde_json::to_string_pretty(&health)?);
            eprintln!(
                "{} request(s) failed, {} task(s) failed",
                summary.failed_requests, summary.failed_tasks
            );
            Ok(())
        }
    }
}
