//! Wrap-key derivation.
//!
//! Two ways to derive the 256-bit key that wraps the master key:
//! - PBKDF2-HMAC-SHA256 over a user password (slow by construction), or
//! - HKDF-SHA256 over a platform authenticator's assertion secret, bound to
//!   the credential id via the info parameter.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::master_key::KEY_LENGTH;

/// Salt length for password-derived wrapping keys.
pub const SALT_LENGTH: usize = 16;

/// Default PBKDF2 iteration count (OWASP 2023 recommendation for SHA-256).
pub const PBKDF2_ITERATIONS: u32 = 210_000;

/// Floor below which the work factor is considered unsafe.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Domain separation for credential-bound wrap keys.
const CREDENTIAL_WRAP_INFO: &[u8] = b"paisa/credential-wrap-key/v1";

/// Generate a random salt for password-based derivation.
pub fn generate_salt() -> Result<[u8; SALT_LENGTH], CryptoError> {
    let mut salt = [0u8; SALT_LENGTH];
    getrandom::getrandom(&mut salt)
        .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
    Ok(salt)
}

/// Derive a 256-bit wrapping key from a password with PBKDF2-HMAC-SHA256.
///
/// Iteration counts below [`MIN_PBKDF2_ITERATIONS`] are refused.
pub fn derive_password_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<[u8; KEY_LENGTH], CryptoError> {
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(CryptoError::KdfFailed(format!(
            "iteration count {} below minimum {}",
            iterations, MIN_PBKDF2_ITERATIONS
        )));
    }
    if salt.is_empty() {
        return Err(CryptoError::MissingSalt);
    }
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    Ok(key)
}

/// Derive a 256-bit wrapping key from an authenticator assertion secret.
///
/// The credential id is mixed in as HKDF info so that the same secret bound
/// to two different credentials yields two different wrap keys. The secret
/// itself is never persisted.
pub fn derive_credential_key(
    assertion_secret: &[u8],
    credential_ref: &str,
) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(CREDENTIAL_WRAP_INFO), assertion_secret);
    let mut okm = [0u8; KEY_LENGTH];
    hk.expand(credential_ref.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}
