//! Telemetry Session: the publish loop.
//!
//! Each iteration pulls one reading, seals its canonical decimal text into an
//! envelope, wraps it as `{"data": ...}` and hands it to the [`Publisher`].
//! Iterations are independent; a failed publish is counted and logged, and the
//! next reading goes out as usual. Only fatal errors (see
//! [`TelemetryError::is_fatal`]) end the loop early.
//!
//! Cancellation is checked between iterations, so an in-flight publish always
//! completes before [`TelemetrySession::run`] returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::envelope;
use common::{AssociatedData, Reading, SymmetricKey, TelemetryError, TelemetryPayload};
use rumqttc::QoS;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, ChannelManager};
use crate::sensors::ReadingSource;

/// The transport seam used by the session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), ChannelError>;
}

#[async_trait]
impl Publisher for ChannelManager {
    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), ChannelError> {
        ChannelManager::publish(self, topic, payload, qos).await
    }
}

/// Per-session settings. Keep-alive belongs to the channel, not the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub qos: QoS,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub published: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct TelemetrySession<P, S> {
    publisher: P,
    source: S,
    key: Arc<SymmetricKey>,
    aad: AssociatedData,
    settings: SessionSettings,
    stats: SessionStats,
}

impl<P: Publisher, S: ReadingSource> TelemetrySession<P, S> {
    pub fn new(
        publisher: P,
        source: S,
        key: Arc<SymmetricKey>,
        aad: AssociatedData,
        settings: SessionSettings,
    ) -> Self {
        Self {
            publisher,
            source,
            key,
            aad,
            settings,
            stats: SessionStats::default(),
        }
    }

    /// Publish readings until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error (configuration, entropy, key length).
    /// Per-message failures are counted in the returned stats instead.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionStats, TelemetryError> {
        info!(qos = ?self.settings.qos, "telemetry session started");

        while !cancel.is_cancelled() {
            let reading = self.source.next_reading();
            if reading.is_in_range() {
                match self.publish_once(&reading).await {
                    Ok(()) => {
                        self.stats.published += 1;
                        debug!(topic = %reading.topic, "reading published");
                    }
                    Err(e) if e.is_fatal() => {
                        error!(topic = %reading.topic, error = %e, "fatal error, stopping session");
                        return Err(e);
                    }
                    Err(e) => {
                        self.stats.failed += 1;
                        warn!(topic = %reading.topic, error = %e, "publish failed");
                    }
                }
            } else {
                self.stats.skipped += 1;
                warn!(topic = %reading.topic, "reading outside topic range, skipped");
            }

            let pause = self.source.pause();
            if !idle(pause, &cancel).await {
                break;
            }
        }

        info!(
            published = self.stats.published,
            failed = self.stats.failed,
            skipped = self.stats.skipped,
            "telemetry session stopped"
        );
        Ok(self.stats)
    }

    /// Give the publisher back for teardown.
    pub fn into_publisher(self) -> P {
        self.publisher
    }

    async fn publish_once(&mut self, reading: &Reading) -> Result<(), TelemetryError> {
        let text = reading.value_text();
        let sealed = envelope::encode(self.key.as_bytes(), self.aad.as_bytes(), text.as_bytes())?;
        let body = TelemetryPayload::from_envelope(&sealed).to_json()?;
        self.publisher
            .publish(reading.topic.as_str(), Bytes::from(body), self.settings.qos)
            .await?;
        Ok(())
    }
}

/// Sleep for `pause`. Returns `false` if cancelled first.
async fn idle(pause: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}
