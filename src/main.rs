//! vmdisplay daemon
//!
//! Connects to a QEMU `-display dbus` instance, mirrors the guest display
//! into a frame buffer and samples it at the configured rate. Frames are
//! consumed in-process today; the sampling loop is where an encoder or
//! streaming sink plugs in.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmdisplay::capture::CaptureCoordinator;
use vmdisplay::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vmdisplay=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vmdisplay");

    let config = Config::load().context("Failed to load configuration")?;

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
            }
        });
    }

    let coordinator = CaptureCoordinator::connect(&config)
        .await
        .context("Failed to connect to the QEMU display")?;

    let result = tokio::select! {
        result = sample_frames(&coordinator, config.capture.fps) => result,
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, cleaning up...");
            Ok(())
        }
    };

    coordinator.teardown().await;
    if let Err(ref e) = result {
        error!("Capture loop error: {e}");
    }
    result
}

/// Poll for changed frames at `fps` and log throughput every few seconds
async fn sample_frames(coordinator: &CaptureCoordinator, fps: u32) -> Result<()> {
    let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));
    stats_interval.tick().await; // Skip first immediate tick

    let mut sampled: u64 = 0;
    let mut last_generation: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(frame) = coordinator.get_frame_if_changed() {
                    sampled += 1;
                    last_generation = frame.generation;
                    debug!(
                        "frame {}x{}, generation {}",
                        frame.width, frame.height, frame.generation
                    );
                }
            }
            _ = stats_interval.tick() => {
                info!("sampled {sampled} frames, at generation {last_generation}");
                sampled = 0;
            }
        }
    }
}
