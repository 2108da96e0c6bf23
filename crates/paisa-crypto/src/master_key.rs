//! The per-user 256-bit master key.
//!
//! Exactly one active master key exists per user. The raw bytes never leave
//! this crate except through [`MasterKey::as_bytes`], and the key is zeroized
//! on drop.

use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Master key length in bytes (256 bits).
pub const KEY_LENGTH: usize = 32;

/// The symmetric master key protecting all sensitive fields for one user.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Generate a fresh random master key from the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LENGTH];
        getrandom::getrandom(&mut key)
            .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
        Ok(Self { key })
    }

    /// Wrap raw key material. Fails unless exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self { key })
    }

    /// Raw key bytes. Use sparingly; callers must not persist these.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("MasterKey(..)")
    }
}
