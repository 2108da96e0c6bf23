//! Shared protocol types and the field encryption codec for paisa sync.
//!
//! Both sides of the wire depend on this crate: the client encrypts sensitive
//! fields through [`codec`] before pushing, and the server stores and replays
//! the resulting opaque payloads without ever seeing plaintext.

pub mod codec;
pub mod error;
pub mod fields;
pub mod types;

pub use codec::{
    decrypt_fields, decrypt_records, encrypt_fields, encrypt_records, ENCRYPTED_KEY,
};
pub use error::CodecError;
pub use fields::{is_sync_table, sensitive_fields, SYNC_TABLES};
pub use types::{
    Conflict, ConflictReason, Operation, PullChange, PullRequest, PullResponse, PushChange,
    PushRequest, PushResponse, RejectedChange, SyncStatus, DEFAULT_PULL_LIMIT,
};
