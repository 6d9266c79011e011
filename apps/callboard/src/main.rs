mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use callboard_core::capability::webrtc::WebRtcCapabilities;
use callboard_core::media::StaticMediaSource;
use callboard_core::telemetry::init_tracing;
use callboard_core::{Config, SessionController, TracingHost};
use clap::Parser;
use signal_bus::WsSignalTransport;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = cli::Cli::parse();
    let config = cli.apply(Config::from_env());
    init_tracing(&config.log_filter);

    info!(
        relay = %config.relay_url,
        max_peers = config.max_peers,
        stun = ?config.stun_servers,
        stream_name = %config.stream_name.as_deref().unwrap_or("unset"),
        "starting callboard"
    );

    let transport = Arc::new(
        WsSignalTransport::new(&config.relay_url).context("invalid relay url")?,
    );
    let capabilities = Arc::new(
        WebRtcCapabilities::new(&config.stun_servers).context("failed to build webrtc api")?,
    );
    let media = Arc::new(StaticMediaSource::new(config.media));
    let controller = SessionController::open(
        &config,
        transport,
        capabilities,
        media,
        Arc::new(TracingHost),
    )
    .await
    .context("failed to open session")?;

    if let Err(err) = controller.start().await {
        error!(error = %err, "failed to start local stream");
        controller.stop().await;
        return Err(err).context("failed to start session");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    controller.stop().await;
    Ok(())
}
