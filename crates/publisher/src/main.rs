//! `telemetry-publisher`: binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Connect the [`ChannelManager`] to the broker (mutual TLS on the secure port).
//! 4. Run the [`TelemetrySession`] until Ctrl-C or SIGTERM.
//! 5. Disconnect and report session statistics.

mod channel;
mod config;
mod sensors;
mod session;
mod telemetry;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use channel::{ChannelEvent, ChannelManager};
use config::Config;
use sensors::SimulatedSensors;
use session::TelemetrySession;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Logging is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cfg.mqtt_broker_host,
        port = cfg.mqtt_broker_port,
        secure = cfg.is_secure(),
        "telemetry-publisher starting"
    );

    // -----------------------------------------------------------------------
    // 3. Channel
    // -----------------------------------------------------------------------
    let (mut channel, mut events) = ChannelManager::new(cfg.channel_settings());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected { secure } => info!(secure, "channel up"),
                ChannelEvent::Disconnected => info!("channel down"),
                ChannelEvent::Faulted { reason } => warn!(reason = %reason, "channel faulted"),
            }
        }
    });
    channel.connect().await?;

    // -----------------------------------------------------------------------
    // 4. Session
    // -----------------------------------------------------------------------
    let (interval_min, interval_max) = cfg.publish_interval();
    let mut session = TelemetrySession::new(
        channel,
        SimulatedSensors::new(interval_min, interval_max),
        Arc::new(cfg.shared_key.clone()),
        cfg.shared_aad.clone(),
        cfg.session_settings(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    let outcome = session.run(cancel).await;

    // -----------------------------------------------------------------------
    // 5. Teardown
    // -----------------------------------------------------------------------
    let mut channel = session.into_publisher();
    if let Err(e) = channel.disconnect().await {
        warn!(error = %e, "disconnect did not complete cleanly");
    }

    let stats = outcome?;
    info!(
        published = stats.published,
        failed = stats.failed,
        skipped = stats.skipped,
        state = ?channel.state(),
        "telemetry-publisher stopped"
    );
    Ok(())
}

/// Cancel `token` on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
    token.cancel();
}
