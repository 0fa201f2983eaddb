//! AES-256-GCM envelope encoding and decoding.
//!
//! Every call to [`encode`] draws a fresh random 96-bit nonce from the OS
//! CSPRNG. Reusing a (key, nonce) pair under GCM is catastrophic: it breaks both
//! confidentiality and authentication for every message sharing the pair.
//!
//! # Wire layout
//!
//! ```text
//! nonce (12) || tag (16) || ciphertext (variable)
//! ```
//!
//! The tag sits between the nonce and the ciphertext. Deployed subscribers
//! split the blob at these fixed offsets, so the order must not change.

use std::fmt;

use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of an AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Smallest valid wire envelope: a nonce and a tag around an empty ciphertext.
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

/// Errors produced by the envelope codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The configured key is not valid base64.
    #[error("key is not valid base64")]
    InvalidKeyEncoding,

    /// The OS random source could not produce a nonce.
    #[error("secure random source unavailable")]
    EntropySourceUnavailable,

    /// The blob is too short to hold a nonce and a tag.
    #[error("malformed envelope: expected at least {MIN_ENVELOPE_LEN} bytes, got {0}")]
    MalformedEnvelope(usize),

    /// The transport wrapper around the envelope could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The tag did not verify: tampered data, wrong key, or wrong AAD.
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// AES-GCM refused the plaintext (only reachable beyond the GCM length limit).
    #[error("aead encryption failed")]
    EncryptionFailed,
}

/// A parsed envelope: nonce, detached tag, and ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw authentication tag bytes.
    pub tag: [u8; TAG_LEN],
    /// Ciphertext without the tag.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialise to the `nonce || tag || ciphertext` wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a wire blob back into its fields using the fixed widths.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedEnvelope`] if `blob` is shorter than
    /// [`MIN_ENVELOPE_LEN`].
    pub fn from_bytes(blob: &[u8]) -> Result<Self, EnvelopeError> {
        if blob.len() < MIN_ENVELOPE_LEN {
            return Err(EnvelopeError::MalformedEnvelope(blob.len()));
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut envelope = Self {
            nonce: [0u8; NONCE_LEN],
            tag: [0u8; TAG_LEN],
            ciphertext: ciphertext.to_vec(),
        };
        envelope.nonce.copy_from_slice(nonce);
        envelope.tag.copy_from_slice(tag);
        Ok(envelope)
    }

    /// Length of the wire form in bytes.
    pub fn wire_len(&self) -> usize {
        MIN_ENVELOPE_LEN + self.ciphertext.len()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Sizes only: ciphertext stays out of diagnostics.
        f.debug_struct("Envelope")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` under `key`, binding `aad` into the tag.
///
/// # Errors
///
/// Returns [`EnvelopeError::InvalidKeyLength`] if `key` is not [`KEY_LEN`]
/// bytes, checked before any cryptographic work. Returns
/// [`EnvelopeError::EntropySourceUnavailable`] if the OS CSPRNG fails; there is
/// no fallback source.
pub fn encode(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Envelope, EnvelopeError> {
    encode_from_rng(key, aad, plaintext, &mut OsRng)
}

/// Encrypt with a caller-supplied nonce.
///
/// Output is deterministic for a fixed nonce. Outside of tests and known-answer
/// checks, use [`encode`]: a repeated nonce under the same key is fatal to GCM.
///
/// # Errors
///
/// Same as [`encode`], minus the entropy failure.
pub fn encode_with_nonce(
    key: &[u8],
    aad: &[u8],
    nonce: [u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Envelope, EnvelopeError> {
    let cipher = build_cipher(key)?;

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut ciphertext)
        .map_err(|_| EnvelopeError::EncryptionFailed)?;

    let mut envelope = Envelope {
        nonce,
        tag: [0u8; TAG_LEN],
        ciphertext,
    };
    envelope.tag.copy_from_slice(&tag);
    Ok(envelope)
}

/// Verify and decrypt an [`Envelope`].
///
/// Decryption is all-or-nothing: on failure no plaintext bytes are returned.
///
/// # Errors
///
/// Returns [`EnvelopeError::InvalidKeyLength`] if `key` is not [`KEY_LEN`]
/// bytes. Returns [`EnvelopeError::AuthenticationFailed`] if the tag does not
/// verify.
pub fn decode(key: &[u8], aad: &[u8], envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = build_cipher(key)?;

    let mut buffer = envelope.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| EnvelopeError::AuthenticationFailed)?;
    Ok(buffer)
}

/// Split a wire blob and decrypt it.
///
/// # Errors
///
/// Returns [`EnvelopeError::MalformedEnvelope`] for blobs shorter than
/// [`MIN_ENVELOPE_LEN`], otherwise the errors of [`decode`].
pub fn decode_bytes(key: &[u8], aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    // Key length is checked first so a bad key is reported as such even for
    // short blobs.
    if key.len() != KEY_LEN {
        return Err(EnvelopeError::InvalidKeyLength(key.len()));
    }
    decode(key, aad, &Envelope::from_bytes(blob)?)
}

fn encode_from_rng<R: RngCore>(
    key: &[u8],
    aad: &[u8],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Envelope, EnvelopeError> {
    if key.len() != KEY_LEN {
        return Err(EnvelopeError::InvalidKeyLength(key.len()));
    }

    let mut nonce = [0u8; NONCE_LEN];
    rng.try_fill_bytes(&mut nonce)
        .map_err(|_| EnvelopeError::EntropySourceUnavailable)?;

    encode_with_nonce(key, aad, nonce, plaintext)
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, EnvelopeError> {
    if key.len() != KEY_LEN {
        return Err(EnvelopeError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::InvalidKeyLength(key.len()))
}
