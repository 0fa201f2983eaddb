//! Secure Channel Manager: owns the single MQTT connection to the broker.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Disconnecting | Faulted) -> Disconnected
//! ```
//!
//! Only this module advances the state. Once connected, a background driver
//! task polls the `rumqttc` event loop: it reports outgoing publishes and
//! PUBACKs back to the manager, answers the broker's keep-alive timer, and moves
//! the channel to `Faulted` on any connection error, including a missing
//! PINGRESP. It never touches key material. Lifecycle changes are reported on a
//! single-consumer [`ChannelEvent`] channel.
//!
//! There is no automatic reconnection. Once `Faulted`, publishes fail fast
//! until the owner calls [`ChannelManager::disconnect`] and connects again.
//!
//! # Transport security
//!
//! On the secure port the client certificate, client key and CA bundle are all
//! required and are loaded before any socket is opened. On any other port the
//! connection is plaintext MQTT, intended for local testing only.

pub mod tls;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::TelemetryError;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, QoS, TlsConfiguration, Transport,
};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests the client may queue ahead of the event loop.
const REQUEST_CAPACITY: usize = 16;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

/// Notifications emitted on lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { secure: bool },
    Disconnected,
    Faulted { reason: String },
}

/// Errors produced by the channel manager.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// TLS material or client settings are missing or unusable. Raised before
    /// any socket is opened.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `connect` was called while a connection is live or being set up.
    #[error("channel is already {0:?}")]
    AlreadyActive(ChannelState),

    /// The operation needs a `Connected` channel.
    #[error("channel is {0:?}, not connected")]
    NotConnected(ChannelState),

    /// TCP connect, TLS handshake and CONNACK did not finish in time.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    /// The broker answered CONNECT with a non-zero return code.
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    /// The publish was not written (QoS 0) or acknowledged (QoS 1) in time.
    #[error("publish not confirmed within {0:?}")]
    DeliveryTimeout(Duration),

    /// The connection dropped while a publish was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The client refused the request, e.g. after the event loop stopped.
    #[error("request rejected: {0}")]
    Request(#[from] ClientError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl From<ChannelError> for TelemetryError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Configuration(msg) => TelemetryError::Configuration(msg),
            other => TelemetryError::Transport(other.to_string()),
        }
    }
}

/// Immutable connection settings, derived from the process configuration.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub host: String,
    pub port: u16,
    /// Port on which mutual TLS is mandatory.
    pub secure_port: u16,
    pub client_id: String,
    /// MQTT keep-alive in seconds. The driver pings after this long without
    /// traffic and faults the channel if the PINGRESP does not follow.
    pub keep_alive_secs: u16,
    /// Bound on TCP connect + TLS handshake + CONNACK.
    pub connect_timeout: Duration,
    /// Bound on confirming one publish.
    pub ack_timeout: Duration,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl ChannelSettings {
    pub fn is_secure(&self) -> bool {
        self.port == self.secure_port
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the driver observed for the publishes it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// PUBLISH written to the socket, with its packet id (0 at QoS 0).
    Sent(u16),
    /// PUBACK received.
    Acked(u16),
}

/// The live half of a connection: the request handle plus the driver task.
struct Link {
    client: AsyncClient,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    driver: JoinHandle<()>,
}

/// Owns the lifecycle of one outbound broker connection.
pub struct ChannelManager {
    settings: ChannelSettings,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    link: Option<Link>,
}

impl ChannelManager {
    /// Create a disconnected manager and the receiving end of its event channel.
    pub fn new(settings: ChannelSettings) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            state: Arc::new(state),
            events,
            link: None,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Open the socket, run the TLS handshake on the secure port, and complete
    /// the MQTT CONNECT/CONNACK exchange.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] without touching the network if
    /// TLS material or the client id is missing or invalid. Any later failure
    /// leaves the channel `Faulted`.
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Disconnected | ChannelState::Faulted => {}
            other => return Err(ChannelError::AlreadyActive(other)),
        }
        if let Some(stale) = self.link.take() {
            stale.driver.abort();
        }

        let options = self.mqtt_options()?;
        let secure = self.settings.is_secure();
        let endpoint = self.settings.endpoint();
        self.state.send_replace(ChannelState::Connecting);
        info!(endpoint = %endpoint, client_id = %self.settings.client_id, mtls = secure, "connecting to broker");

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let attempt =
            tokio::time::timeout(self.settings.connect_timeout, await_connack(&mut eventloop)).await;
        match attempt {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fault(e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = ChannelError::ConnectTimeout(endpoint);
                self.fault(e.to_string());
                return Err(e);
            }
        }

        self.state.send_replace(ChannelState::Connected);
        info!(endpoint = %endpoint, secure, "connected to broker");
        let _ = self.events.send(ChannelEvent::Connected { secure });

        // Spawned only after `Connected` so a fault is never overwritten.
        let (delivered, deliveries) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(
            eventloop,
            delivered,
            self.state.clone(),
            self.events.clone(),
        ));
        self.link = Some(Link {
            client,
            deliveries,
            driver,
        });
        Ok(())
    }

    /// Send `payload` on `topic`.
    ///
    /// At [`QoS::AtMostOnce`] this returns once the PUBLISH is written to the
    /// socket. At [`QoS::AtLeastOnce`] it also waits for the broker's PUBACK.
    /// Either way the wait is bounded by the acknowledgement timeout.
    ///
    /// # Errors
    ///
    /// Fails fast with [`ChannelError::NotConnected`] unless the channel is
    /// `Connected`.
    pub async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), ChannelError> {
        self.ensure_connected()?;
        let timeout = self.settings.ack_timeout;
        let Some(link) = self.link.as_mut() else {
            return Err(ChannelError::ConnectionLost);
        };

        // Leftovers belong to publishes that already timed out.
        while link.deliveries.try_recv().is_ok() {}

        link.client.publish_bytes(topic, qos, false, payload).await?;

        let confirm = async {
            let mut sent = None;
            while let Some(delivery) = link.deliveries.recv().await {
                match (delivery, sent) {
                    (Delivery::Sent(_), None) if qos == QoS::AtMostOnce => return Ok(()),
                    (Delivery::Sent(pkid), None) => sent = Some(pkid),
                    (Delivery::Acked(pkid), Some(expected)) if pkid == expected => return Ok(()),
                    (other, _) => debug!(?other, "discarding stale delivery"),
                }
            }
            Err(ChannelError::ConnectionLost)
        };
        match tokio::time::timeout(timeout, confirm).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::DeliveryTimeout(timeout)),
        }
    }

    /// Send DISCONNECT, close the socket and return to `Disconnected`.
    ///
    /// Safe to call in any state; a `Faulted` channel is simply reset.
    ///
    /// # Errors
    ///
    /// Returns the client error if DISCONNECT could not be queued. The channel
    /// is `Disconnected` either way.
    pub async fn disconnect(&mut self) -> Result<(), ChannelError> {
        let Some(mut link) = self.link.take() else {
            self.settle_disconnected();
            return Ok(());
        };

        let was_connected = self.state() == ChannelState::Connected;
        self.state.send_replace(ChannelState::Disconnecting);

        let mut result = Ok(());
        if was_connected {
            result = link.client.disconnect().await.map_err(ChannelError::from);
            // The driver returns once DISCONNECT has been flushed.
            if result.is_ok()
                && tokio::time::timeout(self.settings.ack_timeout, &mut link.driver)
                    .await
                    .is_err()
            {
                warn!("DISCONNECT not flushed in time, dropping connection");
            }
        }
        link.driver.abort();

        self.settle_disconnected();
        result
    }

    fn settle_disconnected(&mut self) {
        if self.state.send_replace(ChannelState::Disconnected) != ChannelState::Disconnected {
            info!(endpoint = %self.settings.endpoint(), "disconnected from broker");
            let _ = self.events.send(ChannelEvent::Disconnected);
        }
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Connected if self.link.is_some() => Ok(()),
            other => Err(ChannelError::NotConnected(other)),
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions, ChannelError> {
        let client_id = self.settings.client_id.trim();
        if client_id.is_empty() {
            return Err(ChannelError::Configuration("MQTT client id must not be empty".into()));
        }

        let mut options = MqttOptions::new(client_id, self.settings.host.as_str(), self.settings.port);
        options
            .set_keep_alive(Duration::from_secs(u64::from(self.settings.keep_alive_secs)))
            .set_clean_session(true);

        if self.settings.is_secure() {
            let config = self.tls_config()?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(config)));
        } else {
            warn!(
                port = self.settings.port,
                "connecting without TLS; the plaintext port is for local testing only"
            );
        }
        Ok(options)
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>, ChannelError> {
        let ca = required_path(&self.settings.ca_cert, "MQTT_CA_CERT")?;
        let cert = required_path(&self.settings.client_cert, "MQTT_CLIENT_CERT")?;
        let key = required_path(&self.settings.client_key, "MQTT_CLIENT_KEY")?;

        // The handshake verifies the broker against this name.
        if ServerName::try_from(self.settings.host.as_str()).is_err() {
            return Err(ChannelError::Configuration(format!(
                "broker host {:?} is not a valid TLS server name",
                self.settings.host
            )));
        }

        let config = tls::load_client_config(ca, cert, key)
            .map_err(|e| ChannelError::Configuration(format!("{e:#}")))?;
        info!("mutual TLS enabled for secure port");
        Ok(config)
    }

    fn fault(&mut self, reason: String) {
        if let Some(link) = self.link.take() {
            link.driver.abort();
        }
        if mark_faulted(&self.state) {
            warn!(reason = %reason, "channel faulted");
            let _ = self.events.send(ChannelEvent::Faulted { reason });
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.driver.abort();
        }
    }
}

fn required_path<'a>(path: &'a Option<PathBuf>, var: &str) -> Result<&'a Path, ChannelError> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(p.as_path()),
        _ => Err(ChannelError::Configuration(format!(
            "{var} is required on the secure port"
        ))),
    }
}

/// Move to `Faulted` unless already there. Returns `true` on the transition.
fn mark_faulted(state: &watch::Sender<ChannelState>) -> bool {
    state.send_if_modified(|s| {
        if *s == ChannelState::Faulted {
            return false;
        }
        *s = ChannelState::Faulted;
        true
    })
}

/// Poll until the broker accepts or refuses the CONNECT.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ChannelError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => {
                        debug!(session_present = ack.session_present, "CONNACK accepted");
                        Ok(())
                    }
                    code => Err(ChannelError::Refused(code)),
                };
            }
            Ok(event) => debug!(?event, "event before CONNACK"),
            Err(ConnectionError::ConnectionRefused(code)) => return Err(ChannelError::Refused(code)),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Background driver: keeps the event loop turning and faults the channel when
/// it stops. Stopping the loop is final; it is never polled again.
async fn drive(
    mut eventloop: EventLoop,
    delivered: mpsc::UnboundedSender<Delivery>,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = delivered.send(Delivery::Sent(pkid));
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                let _ = delivered.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(event) => debug!(?event, "mqtt event"),
            Err(e) => break e.to_string(),
        }
    };

    // A close during Disconnecting is the one we asked for.
    if *state.borrow() == ChannelState::Disconnecting {
        return;
    }
    if mark_faulted(&state) {
        warn!(reason = %reason, "broker connection lost");
        let _ = events.send(ChannelEvent::Faulted { reason });
    }
}
