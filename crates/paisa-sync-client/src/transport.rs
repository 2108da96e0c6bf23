//! Network boundary traits.
//!
//! Implementations handle the actual wire (HTTP, in-process for tests); the
//! engine only sees the request/response types from `paisa-sync-core`.

use async_trait::async_trait;

use paisa_sync_core::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Classification of transport failures, used by the engine's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Retriable: network failure, server 5xx, timeout inside the transport.
    Transient,
    /// Not retriable: malformed request, protocol mismatch.
    Permanent,
    /// Authentication failed; retrying without new credentials is pointless.
    Auth,
}

/// Transport-level error.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Permanent,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// User-implemented transport for push/pull against the sync log service.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, TransportError>;

    async fn pull(
        &self,
        user_id: &str,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError>;
}

/// Remote backup of the (already encrypted) key-store blob. The remote side
/// only ever holds opaque ciphertext.
#[async_trait]
pub trait KeyBackup: Send + Sync {
    async fn backup_key(&self, user_id: &str, blob: Vec<u8>) -> Result<(), TransportError>;

    async fn fetch_key_blob(&self, user_id: &str) -> Result<Option<Vec<u8>>, TransportError>;
}
