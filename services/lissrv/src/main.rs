//! Laboratory instrument communication service binary
//!
//! Loads the instrument configuration, starts one link per active
//! analyzer, and drains the engine's output events. The default binary
//! logs what the persistence and telemetry collaborators would receive.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lissrv::config::AppConfig;
use lissrv::core::supervisor::LinkSupervisor;
use lissrv::events::{ChannelSink, EngineEvent};

#[derive(Parser)]
#[command(
    name = "lissrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Laboratory Instrument Communication Service",
    long_about = None
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "lissrv.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Validation mode - only validate configuration without starting
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    if args.validate {
        info!(
            "configuration valid: {} instrument(s), {} active",
            config.instruments.len(),
            config.active_instruments().count()
        );
        return Ok(());
    }

    let (sink, mut events) = ChannelSink::new(1024);
    let supervisor = Arc::new(LinkSupervisor::new(config, Arc::new(sink)));
    let started = supervisor.start_all();
    info!("started {} instrument link(s)", started);

    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Message(msg) => info!(
                    instrument = %msg.instrument_id,
                    protocol = msg.protocol.as_str(),
                    bytes = msg.text.len(),
                    "message ready for persistence"
                ),
                EngineEvent::Status {
                    instrument_id,
                    status,
                    detail,
                    ..
                } => info!(
                    instrument = %instrument_id,
                    ?status,
                    detail = detail.as_deref().unwrap_or(""),
                    "link status"
                ),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    supervisor.stop_all().await;
    drain.abort();
    info!("shutdown complete");
    Ok(())
}
