//! OpenNDI Sender
//!
//! Advertises itself on the LAN, waits for a receiver to complete the
//! control handshake, then streams to the negotiated endpoint: framed
//! datagrams, or MPEG-TS from an ffmpeg encoder reading a V4L2 device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openndi::{
    config::{AppConfig, TransportMode},
    media::{list_capture_devices, MediaBridge, ProcessSpec},
    network::ZeroPayload,
    session::{StreamOutcome, StreamSession},
    shutdown,
};

#[derive(Debug, Parser)]
#[command(name = "openndi-sender", version, about = "Stream a capture device to an OpenNDI receiver")]
struct Args {
    /// V4L2 capture device
    #[arg(long)]
    device: Option<String>,

    /// Capture width
    #[arg(long)]
    width: Option<u32>,

    /// Capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Capture pixel format (yuyv422, mjpeg, ...)
    #[arg(long)]
    format: Option<String>,

    /// Stream name announced to receivers
    #[arg(long)]
    name: Option<String>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Show the capture device locally instead of streaming
    #[arg(long)]
    preview: bool,

    /// Data channel transport (framed | mpegts)
    #[arg(long)]
    transport: Option<TransportMode>,

    /// Encoder override (libx264, h264_v4l2m2m, ...)
    #[arg(long)]
    encoder: Option<String>,

    /// Control handshake port
    #[arg(long)]
    control_port: Option<u16>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        let capture = &mut config.capture;
        if let Some(device) = &self.device {
            capture.device = device.clone();
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(fps) = self.fps {
            capture.frame_rate = fps;
        }
        if let Some(format) = &self.format {
            capture.pixel_format = format.clone();
        }
        if let Some(name) = &self.name {
            capture.stream_name = name.clone();
        }
        if let Some(transport) = self.transport {
            config.media.transport = transport;
        }
        if let Some(encoder) = &self.encoder {
            config.media.encoder = Some(encoder.clone());
        }
        if let Some(port) = self.control_port {
            config.control.port = port;
        }
    }
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

    if args.list_devices {
        let devices = list_capture_devices().await?;
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for device in devices {
            println!("{}\t{}", device.path, device.name);
        }
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);

    let cancel = CancellationToken::new();
    shutdown::install(&cancel)?;

    if args.preview {
        return preview(&config, &cancel).await;
    }

    tracing::info!(
        name = %config.capture.stream_name,
        transport = %config.media.transport,
        control = %config.control.listen_address(),
        "Starting OpenNDI sender - press Ctrl+C to stop"
    );

    let mut source = ZeroPayload::new(config.stream.payload_size);
    let session = StreamSession::new(config, cancel);
    let report = session.run_sender(&mut source).await.context("sender session failed")?;

    match report.outcome {
        StreamOutcome::Sent(stats) => tracing::info!(
            session = %report.negotiated.session_id,
            packets = stats.packets_sent,
            bytes = stats.bytes_sent,
            failures = stats.send_failures,
            "Session finished"
        ),
        other => tracing::info!(session = %report.negotiated.session_id, outcome = ?other, "Session finished"),
    }

    Ok(())
}

/// Local preview window of the capture device
async fn preview(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    let spec = ProcessSpec::preview_device(&config.media, &config.capture);
    let mut bridge = MediaBridge::start(&spec)?;

    let state = tokio::select! {
        state = bridge.wait() => state,
        _ = cancel.cancelled() => bridge.stop(config.media.grace_period()).await,
    };

    tracing::info!(?state, "Preview closed");
    Ok(())
}
