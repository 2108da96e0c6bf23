//! Server side of paisa sync: the authoritative sync log.
//!
//! Every mutation a device pushes becomes an immutable log entry stamped with
//! a server-assigned, per-(user, table) monotonic clock. Other devices replay
//! the log from their last-seen clock. Payloads are opaque ciphertext; the
//! server only ever indexes plaintext metadata.

pub mod error;
pub mod service;

pub use error::ServerError;
pub use service::SyncLogService;
