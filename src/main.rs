//! Pairgate - relay TCP connections between pairs of listen ports
//!
//! Every configured gateway listens on two ports and splices each connection
//! accepted on one port to a connection accepted on the other.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{GatewayDefinition, ServiceConfig, DEFAULT_CONFIG_FILE};
use pairgate_relay::{level, logger::tracing_directive, Gateway, Logger, TracingLogger};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status for errors that prevent the service from starting
const FATAL_EXIT_CODE: u8 = 99;

/// Pairgate - paired-listener TCP relay gateway
#[derive(Parser, Debug)]
#[command(name = "pairgate")]
#[command(about = "Relay TCP connections between pairs of listen ports")]
#[command(version)]
#[command(long_about = r#"
Relay TCP connections between pairs of listen ports. A client connecting to
the first port of a gateway is spliced to the next client connecting to the
second port, and vice versa.

EXAMPLES:
  # Run the gateways listed in pairgate.yaml
  pairgate

  # Run two gateways without a config file, logging every connection
  pairgate --gateway 7001:7002 --gateway 8001:8002 --log-level 2

ENVIRONMENT VARIABLES:
  PAIRGATE_CONFIG     Configuration file path
  PAIRGATE_LOG_LEVEL  Log verbosity, 0 to 9
  PAIRGATE_LOG_FILE   Log file path
"#)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "PAIRGATE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log verbosity (0 = fatal errors only, 9 = data tracing)
    #[arg(short, long, env = "PAIRGATE_LOG_LEVEL", value_parser = clap::value_parser!(u8).range(0..=9))]
    log_level: Option<u8>,

    /// Log file (stderr when omitted)
    #[arg(long, env = "PAIRGATE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Gateway port pair PORT1:PORT2, replacing the gateways of the config file
    #[arg(short, long = "gateway", value_name = "PORT1:PORT2")]
    gateways: Vec<GatewayDefinition>,
}

/// Local wall-clock timestamps
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Resolves the effective configuration from the file and the command line.
fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = if cli.gateways.is_empty() {
        ServiceConfig::load(&cli.config)?
    } else {
        ServiceConfig::load_or_default(&cli.config)?
    };

    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    if let Some(log_file) = &cli.log_file {
        config.log_file = Some(log_file.clone());
    }
    if !cli.gateways.is_empty() {
        config.gateways = cli.gateways.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Setup logging for the configured verbosity.
///
/// The returned guard keeps the file writer alive and must be held until
/// shutdown.
fn setup_logging(config: &ServiceConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(tracing_directive(config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_timer(LocalTimer)
                .with_target(false)
                .with_ansi(config.log_file.is_none()),
        )
        .with(filter)
        .init();

    Ok(guard)
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {:?}", path))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory: {:?}", dir))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Opens every gateway, then relays until Ctrl+C.
async fn run(config: &ServiceConfig) -> Result<()> {
    let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new(config.log_level));

    let mut gateways = Vec::new();
    for gateway_config in config.gateway_configs()? {
        let port1 = gateway_config.port1;
        let port2 = gateway_config.port2;
        let mut gateway = Gateway::new(gateway_config, logger.clone());
        gateway
            .open()
            .await
            .with_context(|| format!("Failed to open gateway {}/{}", port1, port2))?;
        gateways.push(gateway);
    }
    logger.log(
        level::GATEWAY,
        &format!("Pairgate started with {} gateway(s).", gateways.len()),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    for gateway in &mut gateways {
        gateway.close();
    }
    logger.log(level::GATEWAY, "Pairgate stopped.");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    let _guard = match setup_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}
