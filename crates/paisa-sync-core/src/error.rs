use thiserror::Error;

use paisa_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Reserved `_encrypted` field is not a valid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Decrypted payload is not a JSON object")]
    InvalidPayload,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
