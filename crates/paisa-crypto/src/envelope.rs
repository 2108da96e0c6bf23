//! AES-256-GCM encrypted envelopes.
//!
//! The envelope is the storage/wire representation of any ciphertext:
//! `{version, nonce: 12 bytes, ciphertext + tag}`. A fresh random nonce is
//! generated on every seal, so encrypting the same plaintext twice never
//! yields the same envelope. The version field gates future algorithm
//! migration without breaking old payloads.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::master_key::{MasterKey, KEY_LENGTH};

/// AES-GCM nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Envelope version written by this build.
pub const CURRENT_VERSION: u8 = 1;

/// Versions this build can open.
pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// Storage/wire representation of a ciphertext.
///
/// Serializes with base64-encoded bytes so it can live inside JSON records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub version: u8,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Generate a random 12-byte nonce.
fn generate_nonce() -> Result<[u8; NONCE_LENGTH], CryptoError> {
    let mut nonce = [0u8; NONCE_LENGTH];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
    Ok(nonce)
}

/// Encrypt plaintext under the master key into a fresh envelope.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<EncryptedEnvelope, CryptoError> {
    seal_with_raw_key(plaintext, key.as_bytes())
}

/// Encrypt under raw 32-byte key material. Used for wrapping keys that are
/// not themselves master keys (password-derived, credential-derived).
pub fn seal_with_raw_key(
    plaintext: &[u8],
    key: &[u8],
) -> Result<EncryptedEnvelope, CryptoError> {
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce = generate_nonce()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(EncryptedEnvelope {
        version: CURRENT_VERSION,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypt an envelope under the master key.
///
/// A wrong key or tampered ciphertext fails the GCM tag check and returns
/// `DecryptionFailed`. This is a hard failure: no partial plaintext is ever
/// returned.
pub fn open(envelope: &EncryptedEnvelope, key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    open_with_raw_key(envelope, key.as_bytes())
}

/// Decrypt under raw 32-byte key material.
pub fn open_with_raw_key(
    envelope: &EncryptedEnvelope,
    key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    if !SUPPORTED_VERSIONS.contains(&envelope.version) {
        return Err(CryptoError::UnsupportedVersion(envelope.version));
    }
    if envelope.nonce.len() != NONCE_LENGTH || envelope.ciphertext.len() < TAG_LENGTH {
        return Err(CryptoError::DataTooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
