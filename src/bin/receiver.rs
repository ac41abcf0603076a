//! OpenNDI Receiver
//!
//! Finds a sender on the LAN, negotiates a data endpoint with it and
//! consumes the stream until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openndi::{
    config::AppConfig,
    constants::*,
    network::{discovery, ReceivedFrame},
    session::{StreamOutcome, StreamSession},
    shutdown,
};

/// Frames between progress lines
const PROGRESS_INTERVAL: u64 = 300;

#[derive(Debug, Parser)]
#[command(name = "openndi-receiver", version, about = "Receive a stream from an OpenNDI sender")]
struct Args {
    /// Play the stream in a local window (MPEG-TS senders)
    #[arg(long)]
    preview: bool,

    /// Discovery timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Preferred local data port
    #[arg(long)]
    data_port: Option<u16>,

    /// Receiver name sent in the handshake
    #[arg(long)]
    name: Option<String>,

    /// Sender control address; skips discovery
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.data_port {
        config.stream.data_port = port;
    }
    if let Some(name) = &args.name {
        config.capture.stream_name = name.clone();
    }

    let cancel = CancellationToken::new();
    shutdown::install(&cancel)?;

    let peer = match args.peer {
        Some(peer) => peer,
        None => {
            tracing::info!(service = %config.discovery.service_type, "Looking for a sender");
            discovery::find(
                &config.discovery,
                &config.discovery.service_type,
                Duration::from_millis(args.timeout_ms),
                &cancel,
            )
            .await
            .context("discovery failed")?
        }
    };

    tracing::info!(%peer, "Connecting to sender - press Ctrl+C to stop");

    let mut frames = 0u64;
    let mut sink = |frame: ReceivedFrame| {
        frames += 1;
        tracing::debug!(
            sequence = frame.sequence,
            bytes = frame.payload_len(),
            source = %frame.source,
            "Received packet"
        );
        if frames % PROGRESS_INTERVAL == 0 {
            tracing::info!(frames, sequence = frame.sequence, "Receiving");
        }
    };

    let session = StreamSession::new(config, cancel).with_preview(args.preview);
    let report = session.run_receiver(peer, &mut sink).await.context("receiver session failed")?;

    match report.outcome {
        StreamOutcome::Received(stats) => tracing::info!(
            session = %report.negotiated.session_id,
            packets = stats.packets_received,
            bytes = stats.bytes_received,
            invalid = stats.invalid_packets,
            lost = stats.packets_lost,
            loss = %format!("{:.2}%", stats.loss_rate() * 100.0),
            "Session finished"
        ),
        other => tracing::info!(session = %report.negotiated.session_id, outcome = ?other, "Session finished"),
    }

    Ok(())
}
