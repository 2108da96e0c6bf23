use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("No cryptographically secure random source available: {0}")]
    EntropyUnavailable(String),

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Password-derived wrapping requires a salt")]
    MissingSalt,

    #[error("No unlocked master key in the session")]
    KeyLocked,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}
