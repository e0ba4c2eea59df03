//! Intercom Application
//!
//! Runs one end of a full-duplex intercom: captures the microphone, streams it
//! to the peer over UDP and plays what the peer sends back.
//!
//! Usage: `intercom [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_intercom::{
    audio::{
        aec::{NlmsEchoCanceller, NullEchoCanceller},
        device::list_devices,
        AudioTopology, CpalBackend, DriverConfig, DuplexAudioDriver,
    },
    config::AppConfig,
    control::ControlServer,
    network::UdpTransport,
    session::{SessionConfig, StreamSession},
};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting duplex intercom");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        let rate_marker = if device.supports_intercom_rate { "" } else { " (no 16 kHz)" };
        println!("  {} ({}){}{}:", device.name, device_type, default_marker, rate_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    // Gain is applied once, in the session's capture path. Echo is
    // cancelled in the driver against the frames it actually played.
    let backend = CpalBackend::new(
        config.audio.input_device.as_deref(),
        config.audio.output_device.as_deref(),
    );
    let driver = Arc::new(
        DuplexAudioDriver::new(
            Box::new(backend),
            DriverConfig {
                mic_gain: 1.0,
                volume: config.audio.volume,
                aec_enabled: config.aec.enabled,
                aec_filter_length: config.aec.filter_length,
            },
        )
        .with_echo_canceller(Box::new(NlmsEchoCanceller::new())),
    );
    let topology = AudioTopology::duplex(driver.clone());

    let session = Arc::new(
        StreamSession::new(
            SessionConfig::from_app(&config),
            topology,
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .context("Failed to create stream session")?,
    );

    if config.control.enabled {
        let server = ControlServer::new(
            config.control.clone(),
            session.clone(),
            config.network.remote_port,
        );
        let _control_handle = server.start_background();
        tracing::info!(
            "Control API available at http://{}:{}",
            config.control.bind_address,
            config.control.http_port
        );
    }

    if config.network.autostart {
        if let Err(e) = session.start_configured() {
            tracing::error!("Autostart failed: {}", e);
        }
    }

    tracing::info!("Running - press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.is_streaming() {
                    let m = session.metrics();
                    tracing::info!(
                        "TX: {} packets ({} dropped), RX: {} packets ({} dropped), buffer: {} bytes",
                        m.tx_packets,
                        m.tx_drops,
                        m.rx_packets,
                        m.rx_drops,
                        m.buffer_fill
                    );
                    tracing::debug!("Echo reference drops: {}", driver.reference_drops());
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    session.stop();
    driver.stop();
    Ok(())
}
