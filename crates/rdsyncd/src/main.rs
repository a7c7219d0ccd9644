//! rdsyncd: rdsync daemon
//!
//! Usage:
//!   rdsyncd [--config /etc/rdsync/config.toml] [--log info] [--log-format text|json]

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rdsync_core::config::RdsyncConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rdsyncd", version, about = "rdsync file synchronization daemon")]
struct Cli {
    /// Path to the rdsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "RDSYNC_CONFIG",
        default_value = "/etc/rdsync/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides server.log_level
    #[arg(long, env = "RDSYNC_LOG")]
    log: Option<String>,

    /// Log format; overrides server.log_format
    #[arg(long, env = "RDSYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config is read before logging starts so its log settings apply.
    let (config, missing) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.server.log_level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None if config.server.log_format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);

    if missing {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "rdsyncd starting"
    );

    rdsyncd::run(config).await
}

/// The parsed config and whether the file was missing.
async fn load_config(path: &Path) -> Result<(RdsyncConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok((config, false))
    } else {
        Ok((RdsyncConfig::default(), true))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
