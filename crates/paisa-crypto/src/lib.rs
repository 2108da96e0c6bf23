//! Master key management and encryption primitives for paisa sync.
//!
//! Sensitive record fields are encrypted client-side under a per-user 256-bit
//! master key before they ever leave the device. This crate owns the key
//! lifecycle (generation, wrapping, rotation, session storage, export) and
//! the AES-256-GCM envelope format everything else builds on.

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key_manager;
pub mod master_key;

pub use envelope::{
    open, open_with_raw_key, seal, seal_with_raw_key, EncryptedEnvelope, CURRENT_VERSION,
    NONCE_LENGTH, SUPPORTED_VERSIONS, TAG_LENGTH,
};
pub use error::CryptoError;
pub use kdf::{
    derive_credential_key, derive_password_key, generate_salt, MIN_PBKDF2_ITERATIONS,
    PBKDF2_ITERATIONS, SALT_LENGTH,
};
pub use key_manager::{
    export_store, import_store, unwrap, wrap_with_password, wrap_with_platform_credential,
    KeyManager, ProtectionMethod, UnlockProof, WrappedKey,
};
pub use master_key::{MasterKey, KEY_LENGTH};
