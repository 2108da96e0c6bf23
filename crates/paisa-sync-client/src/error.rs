use thiserror::Error;

use paisa_crypto::CryptoError;
use paisa_sync_core::CodecError;

use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Sync {phase} timed out after {millis}ms")]
    Timeout { phase: &'static str, millis: u64 },

    #[error("Unknown sync table: {0}")]
    UnknownTable(String),

    #[error("Sync for {table} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        table: String,
        attempts: u32,
        last_error: String,
    },
}

impl From<TransportError> for ClientError {
    fn from(error: TransportError) -> Self {
        ClientError::Transport(error)
    }
}
