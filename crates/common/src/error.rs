//! Common error types shared across crates.

use thiserror::Error;

use crate::envelope::EnvelopeError;

/// Top-level publisher error type.
///
/// Variants fall into two classes, reported by [`TelemetryError::is_fatal`]:
/// - fatal: [`TelemetryError::Configuration`],
///   [`TelemetryError::EntropySourceUnavailable`], [`TelemetryError::InvalidKeyLength`]
/// - per message: everything else; the publish loop logs and continues
///
/// Messages never carry key material, plaintext, or ciphertext.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// Missing or invalid certificates, key, or settings. Raised before any
    /// network activity.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The OS random source could not produce a nonce.
    #[error("secure random source unavailable")]
    EntropySourceUnavailable,

    /// The key is not exactly 32 bytes.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// An envelope or its transport wrapper could not be parsed.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope tag did not verify.
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// Connection drop, handshake failure, or a publish on a faulted channel.
    #[error("transport error: {0}")]
    Transport(String),
}

impl TelemetryError {
    /// Returns `true` if the process must stop rather than skip the message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TelemetryError::Configuration(_)
                | TelemetryError::EntropySourceUnavailable
                | TelemetryError::InvalidKeyLength(_)
        )
    }
}

impl From<EnvelopeError> for TelemetryError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::InvalidKeyLength(len) => TelemetryError::InvalidKeyLength(len),
            EnvelopeError::InvalidKeyEncoding => TelemetryError::Configuration(e.to_string()),
            EnvelopeError::EntropySourceUnavailable => TelemetryError::EntropySourceUnavailable,
            EnvelopeError::AuthenticationFailed => TelemetryError::AuthenticationFailed,
            EnvelopeError::MalformedEnvelope(_)
            | EnvelopeError::MalformedPayload(_)
            | EnvelopeError::EncryptionFailed => TelemetryError::MalformedEnvelope(e.to_string()),
        }
    }
}
