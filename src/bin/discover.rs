//! Discovery command
//!
//! Resolves the OpenNDI service type on the LAN and prints the first sender
//! that answers.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openndi::{config::AppConfig, constants::*, network::discovery, shutdown};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "openndi-discover", version, about = "Find an OpenNDI sender on the local network")]
struct Args {
    /// Output format
    #[arg(short, long, value_enum, default_value = "plain")]
    output: OutputFormat,

    /// Give up after this many milliseconds
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Service type to resolve
    #[arg(long)]
    service_type: Option<String>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    let service_type = args.service_type.unwrap_or_else(|| config.discovery.service_type.clone());

    let cancel = CancellationToken::new();
    shutdown::install(&cancel)?;

    let record = discovery::resolve(
        &config.discovery,
        &service_type,
        Duration::from_millis(args.timeout_ms),
        &cancel,
    )
    .await
    .context("discovery failed")?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Plain => {
            println!("Found OpenNDI sender `{}` at: {}", record.name, record.socket_addr());
        }
    }

    Ok(())
}
