//! Wire types shared by the sync client and the sync log service.
//!
//! These serialize to the camelCase JSON bodies of `POST /sync/push` and
//! `POST /sync/pull`. The server assigns every clock value; clients only
//! echo the last clock they have seen.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page size for pull requests.
pub const DEFAULT_PULL_LIMIT: usize = 500;

/// Mutation kind carried by a change or log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Local-only sync state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    Error,
}

/// Why the server reported a conflict for a pushed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ClockMismatch,
    HashMismatch,
    ConcurrentEdit,
    Deleted,
}

/// One client-side mutation being pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChange {
    pub id: String,
    pub operation: Operation,
    /// Encrypted record payload; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Client-observed wall clock, epoch milliseconds.
    pub client_timestamp: i64,
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub table: String,
    pub changes: Vec<PushChange>,
}

/// A change the server refused on structural grounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    pub id: String,
    pub reason: String,
}

/// A change the server resolved against the client (last-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub reason: ConflictReason,
    /// The authoritative stored version, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<Value>,
}

/// Response of `POST /sync/push`.
///
/// Acknowledgment is by explicit id list, never positional: a partially
/// failed batch acks exactly the ids that were persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedChange>,
    pub conflicts: Vec<Conflict>,
    pub current_server_clock: i64,
}

/// Body of `POST /sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub table: String,
    pub last_server_clock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One replayable log entry returned by pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullChange {
    pub id: String,
    pub operation: Operation,
    /// Encrypted record payload; always absent for tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server-assigned clock, strictly increasing per (user, table).
    pub clock: i64,
    /// Server-observed wall clock, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub tombstone: bool,
}

/// Response of `POST /sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub table: String,
    pub changes: Vec<PullChange>,
    pub current_server_clock: i64,
    pub has_more: bool,
}
