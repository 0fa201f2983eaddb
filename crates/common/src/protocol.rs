//! Readings and the wire payload published to the broker.
//!
//! The payload is a JSON document with a single `data` field holding the
//! base64 encoding of the envelope:
//!
//! ```text
//! {"data":"<base64(nonce || tag || ciphertext)>"}
//! ```

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EnvelopeError};

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// The fixed set of sensor topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Air temperature in °C.
    Temperature,
    /// Rainfall in mm/h.
    Rain,
    /// Wind speed in m/s.
    Wind,
}

impl Topic {
    /// Every topic, in publishing order.
    pub const ALL: [Topic; 3] = [Topic::Temperature, Topic::Rain, Topic::Wind];

    /// Broker topic name.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Temperature => "sensor/temp",
            Topic::Rain => "sensor/rain",
            Topic::Wind => "sensor/wind",
        }
    }

    /// Valid value range for readings on this topic.
    pub fn range(self) -> RangeInclusive<f64> {
        match self {
            Topic::Temperature => 15.0..=35.0,
            Topic::Rain => 0.0..=50.0,
            Topic::Wind => 0.0..=25.0,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown topic: {s}"))
    }
}

/// A single sensor reading, consumed once by the publish loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub topic: Topic,
    pub value: f64,
}

impl Reading {
    pub fn new(topic: Topic, value: f64) -> Self {
        Self { topic, value }
    }

    /// Returns `true` if the value lies within the topic's range.
    pub fn is_in_range(&self) -> bool {
        self.topic.range().contains(&self.value)
    }

    /// Canonical decimal text of the value: the shortest form that round-trips,
    /// with `.0` kept on integral values (`20.0`, `23.45`).
    pub fn value_text(&self) -> String {
        let mut text = self.value.to_string();
        if self.value.is_finite() && !text.contains('.') {
            text.push_str(".0");
        }
        text
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// JSON container carrying one base64-encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Standard base64 of `nonce || tag || ciphertext`.
    pub data: String,
}

impl TelemetryPayload {
    /// Wrap an envelope for transport.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            data: STANDARD.encode(envelope.to_bytes()),
        }
    }

    /// Serialise to the JSON bytes published on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedPayload`] if serialisation fails.
    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::MalformedPayload(e.to_string()))
    }

    /// Decode the `data` field back into an [`Envelope`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedPayload`] for invalid base64 and
    /// [`EnvelopeError::MalformedEnvelope`] for blobs that are too short.
    pub fn envelope(&self) -> Result<Envelope, EnvelopeError> {
        let blob = STANDARD
            .decode(self.data.trim())
            .map_err(|_| EnvelopeError::MalformedPayload("data is not valid base64".into()))?;
        Envelope::from_bytes(&blob)
    }

    /// Parse a received message body.
    ///
    /// Accepts the JSON wrapper or, as subscribers do, a bare base64 string.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedPayload`] if the body is neither, and
    /// [`EnvelopeError::MalformedEnvelope`] if the decoded blob is too short.
    pub fn parse(body: &[u8]) -> Result<Envelope, EnvelopeError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| EnvelopeError::MalformedPayload("body is not UTF-8".into()))?
            .trim();

        let payload = if text.starts_with('{') {
            serde_json::from_str::<TelemetryPayload>(text)
                .map_err(|e| EnvelopeError::MalformedPayload(e.to_string()))?
        } else {
            TelemetryPayload {
                data: text.to_owned(),
            }
        };
        payload.envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, encode, encode_with_nonce, KEY_LEN, NONCE_LEN};

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

    #[test]
    fn topic_names_and_ranges() {
        assert_eq!(Topic::Temperature.as_str(), "sensor/temp");
        assert_eq!(Topic::Rain.as_str(), "sensor/rain");
        assert_eq!(Topic::Wind.as_str(), "sensor/wind");
        assert_eq!(Topic::Temperature.range(), 15.0..=35.0);
        assert_eq!("sensor/wind".parse::<Topic>().unwrap(), Topic::Wind);
        assert!("sensor/+".parse::<Topic>().is_err());
    }

    #[test]
    fn value_text_is_canonical() {
        assert_eq!(Reading::new(Topic::Temperature, 23.45).value_text(), "23.45");
        assert_eq!(Reading::new(Topic::Temperature, 20.0).value_text(), "20.0");
        assert_eq!(Reading::new(Topic::Rain, 0.0).value_text(), "0.0");
        assert_eq!(Reading::new(Topic::Wind, 0.1).value_text(), "0.1");
    }

    #[test]
    fn range_check() {
        assert!(Reading::new(Topic::Wind, 25.0).is_in_range());
        assert!(!Reading::new(Topic::Wind, 25.01).is_in_range());
        assert!(!Reading::new(Topic::Temperature, 14.99).is_in_range());
    }

    #[test]
    fn payload_json_has_single_data_field() {
        let env = encode_with_nonce(&KEY, b"aad", [0u8; NONCE_LEN], b"1.5").unwrap();
        let json = TelemetryPayload::from_envelope(&env).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        let decoded = STANDARD.decode(obj["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, env.to_bytes());
    }

    #[test]
    fn parse_wrapped_payload() {
        let env = encode(&KEY, b"aad", b"12.34").unwrap();
        let json = TelemetryPayload::from_envelope(&env).to_json().unwrap();
        let parsed = TelemetryPayload::parse(&json).unwrap();
        assert_eq!(decode(&KEY, b"aad", &parsed).unwrap(), b"12.34");
    }

    #[test]
    fn parse_accepts_spaced_json() {
        let env = encode(&KEY, b"aad", b"3.0").unwrap();
        let body = format!("{{\"data\": \"{}\"}}", STANDARD.encode(env.to_bytes()));
        assert_eq!(TelemetryPayload::parse(body.as_bytes()).unwrap(), env);
    }

    #[test]
    fn parse_bare_base64() {
        let env = encode(&KEY, b"aad", b"7.25").unwrap();
        let body = STANDARD.encode(env.to_bytes());
        assert_eq!(TelemetryPayload::parse(body.as_bytes()).unwrap(), env);
    }

    #[test]
    fn parse_rejects_missing_data_field() {
        assert!(matches!(
            TelemetryPayload::parse(br#"{"value": "abc"}"#),
            Err(EnvelopeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn parse_rejects_short_blob() {
        let body = STANDARD.encode([0u8; 10]);
        assert_eq!(
            TelemetryPayload::parse(body.as_bytes()).unwrap_err(),
            EnvelopeError::MalformedEnvelope(10)
        );
    }

    #[test]
    fn parse_rejects_bad_base64() {
        assert!(matches!(
            TelemetryPayload::parse(br#"{"data": "!!!"}"#),
            Err(EnvelopeError::MalformedPayload(_))
        ));
    }
}
