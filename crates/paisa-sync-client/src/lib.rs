//! Client side of paisa sync: local record storage, change tracking, the
//! wrapped-key store, and the push/pull engine.
//!
//! The flow is local-first: application code reads and writes the
//! [`SqliteStore`] through a [`ChangeTracker`], which keeps per-table sync
//! bookkeeping. A [`SyncEngine`] then pushes pending mutations (sensitive
//! fields encrypted client-side) over a [`SyncTransport`] and replays the
//! server's log back into the store.

pub mod backoff;
pub mod clock;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod store;
pub mod tracker;
pub mod transport;

pub use backoff::Backoff;
pub use clock::TableClock;
pub use engine::{
    EngineStatus, ErrorObserver, SyncEngine, SyncErrorEvent, SyncOptions, SyncPhase, SyncResult,
    SyncTrigger,
};
pub use error::ClientError;
pub use keystore::KeyStore;
pub use store::{LocalRecord, LocalStore, SqliteStore, StoreError};
pub use tracker::ChangeTracker;
pub use transport::{KeyBackup, SyncTransport, TransportError, TransportErrorKind};
