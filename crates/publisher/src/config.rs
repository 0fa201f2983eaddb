//! Configuration loading and validation for the telemetry publisher.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message before opening any socket if a required
//! variable is missing or invalid.

use std::path::PathBuf;
use std::time::Duration;

use common::{AssociatedData, SymmetricKey, TelemetryError};
use rumqttc::QoS;
use serde::Deserialize;

use crate::channel::ChannelSettings;
use crate::session::SessionSettings;

/// Validated publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Broker hostname or address. Also the TLS server name on the secure port.
    #[serde(default = "default_broker_host")]
    pub mqtt_broker_host: String,

    #[serde(default = "default_broker_port")]
    pub mqtt_broker_port: u16,

    /// Port on which mutual TLS is mandatory.
    #[serde(default = "default_secure_port")]
    pub mqtt_secure_port: u16,

    /// PEM client certificate chain. Required on the secure port.
    pub mqtt_client_cert: Option<PathBuf>,

    /// PEM client private key. Required on the secure port.
    pub mqtt_client_key: Option<PathBuf>,

    /// PEM CA bundle used to verify the broker. Required on the secure port.
    pub mqtt_ca_cert: Option<PathBuf>,

    /// Base64 of the 32-byte pre-shared key. **Required.**
    #[serde(rename = "shared_key_b64")]
    pub shared_key: SymmetricKey,

    /// Associated data bound into every envelope.
    #[serde(default = "default_shared_aad")]
    pub shared_aad: AssociatedData,

    /// MQTT client identifier; a random `rs-pub-` id when unset.
    pub mqtt_client_id: Option<String>,

    /// Delivery level, `0` or `1`.
    #[serde(default)]
    pub mqtt_qos: u8,

    #[serde(default = "default_keepalive")]
    pub mqtt_keepalive_secs: u16,

    /// Bound on TCP connect + TLS handshake + CONNACK.
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on waiting for a QoS 1 acknowledgement.
    #[serde(default = "default_timeout")]
    pub ack_timeout_secs: u64,

    #[serde(default = "default_interval_min")]
    pub publish_interval_min_ms: u64,

    #[serde(default = "default_interval_max")]
    pub publish_interval_max_ms: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_broker_host() -> String {
    "127.0.0.1".into()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_secure_port() -> u16 {
    8883
}
fn default_shared_aad() -> AssociatedData {
    AssociatedData::from("iot-lab-shared")
}
fn default_keepalive() -> u16 {
    60
}
fn default_timeout() -> u64 {
    10
}
fn default_interval_min() -> u64 {
    1000
}
fn default_interval_max() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Configuration`] if any required variable is
    /// absent, cannot be parsed, or fails validation.
    pub fn from_env() -> Result<Self, TelemetryError> {
        load(config::Config::builder().add_source(config::Environment::default()))
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<(), TelemetryError> {
        if self.mqtt_broker_host.trim().is_empty() {
            return Err(invalid("MQTT_BROKER_HOST must not be empty"));
        }
        if self.is_secure() {
            ensure_path(&self.mqtt_client_cert, "MQTT_CLIENT_CERT")?;
            ensure_path(&self.mqtt_client_key, "MQTT_CLIENT_KEY")?;
            ensure_path(&self.mqtt_ca_cert, "MQTT_CA_CERT")?;
        }
        if qos_level(self.mqtt_qos).is_none() {
            return Err(invalid(format!("MQTT_QOS must be 0 or 1, got {}", self.mqtt_qos)));
        }
        if self.mqtt_keepalive_secs == 0 {
            return Err(invalid("MQTT_KEEPALIVE_SECS must be > 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("CONNECT_TIMEOUT_SECS must be > 0"));
        }
        if self.ack_timeout_secs == 0 {
            return Err(invalid("ACK_TIMEOUT_SECS must be > 0"));
        }
        if self.publish_interval_min_ms > self.publish_interval_max_ms {
            return Err(invalid(
                "PUBLISH_INTERVAL_MIN_MS must not exceed PUBLISH_INTERVAL_MAX_MS",
            ));
        }
        Ok(())
    }

    /// `true` when the broker port is the mutual-TLS port.
    pub fn is_secure(&self) -> bool {
        self.mqtt_broker_port == self.mqtt_secure_port
    }

    pub fn qos(&self) -> QoS {
        qos_level(self.mqtt_qos).unwrap_or(QoS::AtMostOnce)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            host: self.mqtt_broker_host.clone(),
            port: self.mqtt_broker_port,
            secure_port: self.mqtt_secure_port,
            client_id: self
                .mqtt_client_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(random_client_id),
            keep_alive_secs: self.mqtt_keepalive_secs,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            ca_cert: self.mqtt_ca_cert.clone(),
            client_cert: self.mqtt_client_cert.clone(),
            client_key: self.mqtt_client_key.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            qos: self.qos(),
        }
    }

    /// `(min, max)` pause between publishes.
    pub fn publish_interval(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.publish_interval_min_ms),
            Duration::from_millis(self.publish_interval_max_ms),
        )
    }
}

fn load(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Config, TelemetryError> {
    let cfg = builder
        .build()
        .map_err(|e| invalid(format!("failed to build configuration from environment: {e}")))?;

    let c: Config = cfg
        .try_deserialize()
        .map_err(|e| invalid(format!("failed to deserialise configuration: {e}")))?;

    c.validate()?;
    Ok(c)
}

/// Only fire-and-forget and acknowledged delivery are supported.
fn qos_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        _ => None,
    }
}

fn random_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("rs-pub-{}", &id[..8])
}

fn ensure_path(path: &Option<PathBuf>, name: &str) -> Result<(), TelemetryError> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(()),
        _ => Err(invalid(format!(
            "{name} is required on the secure port and must not be empty"
        ))),
    }
}

fn invalid(msg: impl Into<String>) -> TelemetryError {
    TelemetryError::Configuration(msg.into())
}
