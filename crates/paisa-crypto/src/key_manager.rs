//! Master key lifecycle: wrap, unwrap, rotate, session storage, and
//! device-to-device export of the key store.
//!
//! The master key is never persisted or transmitted raw. At rest it exists
//! only inside a [`WrappedKey`]: the key encrypted under a wrapping key that
//! is either password-derived (PBKDF2) or bound to a platform authenticator
//! credential (HKDF over the assertion secret). Unwrapping requires the
//! matching proof and either fully succeeds or fails with
//! `AuthenticationFailed`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::envelope::{open_with_raw_key, seal_with_raw_key, EncryptedEnvelope};
use crate::error::CryptoError;
use crate::kdf::{
    derive_credential_key, derive_password_key, generate_salt, PBKDF2_ITERATIONS,
};
use crate::master_key::MasterKey;

/// How a wrapped key is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMethod {
    PasswordDerived,
    PlatformAuthenticator,
}

/// A master key encrypted for storage.
///
/// Invariants: a password-derived wrapping always carries a salt and an
/// iteration count; a platform-authenticator wrapping stores only a reference
/// to the credential, never the authenticator secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub id: String,
    pub protection_method: ProtectionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    pub envelope: EncryptedEnvelope,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds, updated on each successful unwrap.
    pub last_used_at: i64,
}

/// Proof presented to unwrap a key: the password, or a fresh user-presence
/// assertion secret from the platform authenticator.
pub enum UnlockProof<'a> {
    Password(&'a str),
    PlatformAssertion { secret: &'a [u8] },
}

/// Wrap a master key under a password-derived key.
///
/// A fresh salt is generated when none is supplied.
pub fn wrap_with_password(
    key: &MasterKey,
    password: &str,
    salt: Option<[u8; crate::kdf::SALT_LENGTH]>,
) -> Result<WrappedKey, CryptoError> {
    let salt = match salt {
        Some(s) => s,
        None => generate_salt()?,
    };
    let mut wrap_key = derive_password_key(password, &salt, PBKDF2_ITERATIONS)?;
    let envelope = seal_with_raw_key(key.as_bytes(), &wrap_key);
    wrap_key.zeroize();
    let now = Utc::now().timestamp_millis();
    Ok(WrappedKey {
        id: Uuid::new_v4().to_string(),
        protection_method: ProtectionMethod::PasswordDerived,
        salt: Some(salt.to_vec()),
        iterations: Some(PBKDF2_ITERATIONS),
        credential_ref: None,
        envelope: envelope?,
        created_at: now,
        last_used_at: now,
    })
}

/// Wrap a master key under a platform-authenticator credential.
///
/// `assertion_secret` comes from a fresh user-presence assertion and is not
/// stored; only `credential_ref` is kept so the right credential can be
/// re-asserted at unwrap time.
pub fn wrap_with_platform_credential(
    key: &MasterKey,
    credential_ref: &str,
    assertion_secret: &[u8],
) -> Result<WrappedKey, CryptoError> {
    let mut wrap_key = derive_credential_key(assertion_secret, credential_ref)?;
    let envelope = seal_with_raw_key(key.as_bytes(), &wrap_key);
    wrap_key.zeroize();
    let now = Utc::now().timestamp_millis();
    Ok(WrappedKey {
        id: Uuid::new_v4().to_string(),
        protection_method: ProtectionMethod::PlatformAuthenticator,
        salt: None,
        iterations: None,
        credential_ref: Some(credential_ref.to_string()),
        envelope: envelope?,
        created_at: now,
        last_used_at: now,
    })
}

/// Unwrap a master key given the matching proof.
///
/// Fails with `AuthenticationFailed` on a wrong password, wrong assertion
/// secret, or a proof of the wrong kind. Never partially succeeds.
pub fn unwrap(wrapped: &WrappedKey, proof: &UnlockProof<'_>) -> Result<MasterKey, CryptoError> {
    let mut wrap_key = match (wrapped.protection_method, proof) {
        (ProtectionMethod::PasswordDerived, UnlockProof::Password(password)) => {
            let salt = wrapped.salt.as_deref().ok_or(CryptoError::MissingSalt)?;
            let iterations = wrapped.iterations.unwrap_or(PBKDF2_ITERATIONS);
            derive_password_key(password, salt, iterations)?
        }
        (
            ProtectionMethod::PlatformAuthenticator,
            UnlockProof::PlatformAssertion { secret },
        ) => {
            let credential_ref = wrapped
                .credential_ref
                .as_deref()
                .ok_or(CryptoError::AuthenticationFailed)?;
            derive_credential_key(secret, credential_ref)?
        }
        _ => return Err(CryptoError::AuthenticationFailed),
    };
    let raw = open_with_raw_key(&wrapped.envelope, &wrap_key);
    wrap_key.zeroize();
    let mut raw = raw.map_err(|_| CryptoError::AuthenticationFailed)?;
    let key = MasterKey::from_bytes(&raw);
    raw.zeroize();
    key
}

/// Session holder for the active, unlocked master key.
///
/// Exactly one active key at a time. The key lives in memory only and is
/// cleared (zeroized) on [`KeyManager::lock`].
#[derive(Default)]
pub struct KeyManager {
    active: Option<MasterKey>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Generate a fresh master key and make it the active session key.
    pub fn generate(&mut self) -> Result<&MasterKey, CryptoError> {
        let key = MasterKey::generate()?;
        Ok(self.active.insert(key))
    }

    /// Install an unwrapped key as the session key.
    pub fn unlock(&mut self, key: MasterKey) {
        self.active = Some(key);
    }

    /// The active key, or `KeyLocked` if the session is locked.
    pub fn active_key(&self) -> Result<&MasterKey, CryptoError> {
        self.active.as_ref().ok_or(CryptoError::KeyLocked)
    }

    pub fn is_unlocked(&self) -> bool {
        self.active.is_some()
    }

    /// Clear the session key. Called on logout.
    pub fn lock(&mut self) {
        // MasterKey zeroizes on drop
        self.active.take();
    }

    /// Replace the active key with a fresh one and return it.
    ///
    /// Does NOT re-encrypt existing data; anything not re-encrypted by the
    /// caller becomes unreadable under the new key.
    pub fn rotate(&mut self) -> Result<MasterKey, CryptoError> {
        let key = MasterKey::generate()?;
        tracing::warn!("master key rotated; data not re-encrypted will be unreadable");
        self.active = Some(key.clone());
        Ok(key)
    }
}

/// Passphrase-encrypted export of a set of wrapped-key rows, for
/// device-to-device backup. The plaintext master key never appears here;
/// the export holds only already-wrapped keys, themselves sealed under a
/// passphrase-derived key.
#[derive(Serialize, Deserialize)]
struct KeyStoreExport {
    salt: Vec<u8>,
    iterations: u32,
    envelope: EncryptedEnvelope,
}

/// Serialize and encrypt the whole key store under a caller-supplied
/// passphrase.
pub fn export_store(rows: &[WrappedKey], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let payload = serde_json::to_vec(rows)
        .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
    let salt = generate_salt()?;
    let mut export_key = derive_password_key(passphrase, &salt, PBKDF2_ITERATIONS)?;
    let envelope = seal_with_raw_key(&payload, &export_key);
    export_key.zeroize();
    let export = KeyStoreExport {
        salt: salt.to_vec(),
        iterations: PBKDF2_ITERATIONS,
        envelope: envelope?,
    };
    serde_json::to_vec(&export).map_err(|e| CryptoError::SerializationError(e.to_string()))
}

/// Decrypt and deserialize a key-store export blob.
pub fn import_store(blob: &[u8], passphrase: &str) -> Result<Vec<WrappedKey>, CryptoError> {
    let export: KeyStoreExport = serde_json::from_slice(blob)
        .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
    let mut export_key = derive_password_key(passphrase, &export.salt, export.iterations)?;
    let payload = open_with_raw_key(&export.envelope, &export_key);
    export_key.zeroize();
    let payload = payload.map_err(|_| CryptoError::AuthenticationFailed)?;
    serde_json::from_slice(&payload).map_err(|e| CryptoError::SerializationError(e.to_string()))
}
