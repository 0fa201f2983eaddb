//! Common types, the AES-256-GCM envelope codec, and errors shared by the
//! telemetry publisher and any verifier that decodes its payloads.
//!
//! Nothing in this crate touches the network.

pub mod envelope;
pub mod error;
pub mod key;
pub mod protocol;

pub use envelope::{Envelope, EnvelopeError};
pub use error::TelemetryError;
pub use key::{AssociatedData, SymmetricKey};
pub use protocol::{Reading, TelemetryPayload, Topic};
