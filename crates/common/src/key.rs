//! Pre-shared key material: the AES-256 [`SymmetricKey`] and the fixed
//! [`AssociatedData`] bound into every envelope tag.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::envelope::{EnvelopeError, KEY_LEN};

/// Fixed-size AES-256 key that holds exactly [`KEY_LEN`] bytes.
///
/// The bytes are overwritten with zeroes when the value is dropped. The key
/// never appears in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Build a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_LEN`] bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != KEY_LEN {
            return Err(EnvelopeError::InvalidKeyLength(bytes.len()));
        }
        let mut key = Self([0u8; KEY_LEN]);
        key.0.copy_from_slice(bytes);
        Ok(key)
    }

    /// Decode a standard-alphabet base64 string into a key.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidKeyEncoding`] if the string is not valid
    /// base64, or [`EnvelopeError::InvalidKeyLength`] if it does not decode to
    /// exactly [`KEY_LEN`] bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, EnvelopeError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| EnvelopeError::InvalidKeyEncoding)?,
        );
        Self::from_bytes(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("SymmetricKey([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Associated data shared out-of-band between publisher and verifiers.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct AssociatedData(Vec<u8>);

impl AssociatedData {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for AssociatedData {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for AssociatedData {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for AssociatedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssociatedData({:?})", String::from_utf8_lossy(&self.0))
    }
}
