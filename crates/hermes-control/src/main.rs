//! Hermes control service binary.
//!
//! Runs the deployment orchestration engine and its HTTP API.

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hermes_control::{ControlConfig, ControlService};

/// Hermes control service.
#[derive(Parser, Debug)]
#[command(name = "hermes-control")]
#[command(about = "Deployment orchestration engine for Hermes")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log output format.
    #[arg(long, env = "HERMES_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    let filter = if cli.verbose {
        "hermes_control=debug,sqlx=warn,info"
    } else {
        "hermes_control=info,sqlx=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.log_format == LogFormat::Json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Hermes control service starting");

    // An explicit config file must load; the default lookup may fall back.
    let config = match cli.config.as_deref() {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            ControlConfig::default()
        }),
    };

    info!(
        listen = %config.server.listen,
        workers = config.dispatch.workers,
        runner = ?config.execution.runner,
        inventory = ?config.inventory.kind,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;
    Ok(())
}
