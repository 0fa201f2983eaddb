//! Process-wide log output for the publisher.
//!
//! One JSON object per line on stdout. What gets recorded:
//!
//! - channel lifecycle: connecting, connected (and whether mTLS is on),
//!   faulted with its reason, disconnected;
//! - per reading: the topic and whether the publish succeeded;
//! - on shutdown: the published/failed/skipped counters.
//!
//! Never recorded, at any level: the pre-shared key, a reading's value, the
//! sealed envelope or its base64 form. Topics and error text are the only
//! per-message fields.
//!
//! `LOG_LEVEL` picks the default filter; a `RUST_LOG` directive overrides it.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the JSON subscriber. Fails if one is already installed.
pub fn init(log_level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("LOG_LEVEL {log_level:?} is not a valid filter"))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        )
        .try_init()
        .context("tracing subscriber already installed")
}
