//! Command-line entry point for the Rust HTTP Connector

use clap::{Parser, Subcommand};
use rust_http_connector::{
    cli::{RequestArgs, TlsCheckArgs},
    init_logger_with_env, log_error, log_info,
    runtime::run_with_runtime,
    ConnectorConfig,
};
use tracing::error;

#[derive(Parser)]
#[command(name = "rust-http-connector")]
#[command(about = "Pooled HTTP/1.1 client connector with plain and TLS socket factories")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML); missing files fall back to defaults
    #[arg(short, long, global = true, default_value = "config.yml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue one or more requests through the connector
    #[command(name = "request")]
    Request(RequestArgs),

    /// Build the secure socket factory and report the result
    #[command(name = "tls-check")]
    TlsCheck(TlsCheckArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match ConnectorConfig::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    init_logger_with_env(&level);

    let runtime_config = config.runtime.clone();
    run_with_runtime(&runtime_config, async_main(cli, config))
}

async fn async_main(cli: Cli, config: ConnectorConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Request(args) => {
            log_info!("🚀 Rust HTTP Connector {}", env!("CARGO_PKG_VERSION"));

            if let Err(e) = args.execute(&config).await {
                log_error!("Request command failed: {:#}", e);
                error!("Request failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::TlsCheck(args) => {
            log_info!("🔐 Checking TLS configuration");

            if let Err(e) = args.execute(&config).await {
                log_error!("TLS check failed: {:#}", e);
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
