//! The sync log service.
//!
//! Per (user, table) partition the server keeps an append-only log of
//! operations, each stamped with a monotonically increasing clock the server
//! assigns, plus an authoritative record store the log folds into. Clock
//! assignment and log append happen inside one sqlite transaction, so no
//! entry is ever visible with a gap in its partition's clock sequence.
//!
//! Payloads arrive already encrypted; this service never sees plaintext
//! sensitive fields.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use paisa_sync_core::{
    is_sync_table, Conflict, ConflictReason, Operation, PullChange, PullResponse, PushChange,
    PushResponse, RejectedChange, DEFAULT_PULL_LIMIT,
};

use crate::error::ServerError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_log (
    log_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    table_name TEXT NOT NULL,
    record_id  TEXT NOT NULL,
    operation  TEXT NOT NULL,
    clock      INTEGER NOT NULL,
    timestamp  INTEGER NOT NULL,
    tombstone  INTEGER NOT NULL DEFAULT 0,
    data       TEXT,
    UNIQUE(user_id, table_name, clock)
);
CREATE INDEX IF NOT EXISTS idx_sync_log_partition
    ON sync_log(user_id, table_name, clock);

CREATE TABLE IF NOT EXISTS records (
    user_id          TEXT NOT NULL,
    table_name       TEXT NOT NULL,
    record_id        TEXT NOT NULL,
    data             TEXT,
    client_timestamp INTEGER NOT NULL,
    clock            INTEGER NOT NULL,
    tombstone        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(user_id, table_name, record_id)
);
";

/// Stored state of one authoritative record, read under the push transaction.
struct StoredRecord {
    data: Option<String>,
    client_timestamp: i64,
    tombstone: bool,
}

/// Append-only, per-user, per-table operation ledger.
///
/// The connection sits behind a mutex: pushes for the same partition are
/// serialized, which together with the transaction keeps the clock sequence
/// duplicate-free and gap-free under concurrent devices.
pub struct SyncLogService {
    conn: Mutex<Connection>,
}

impl SyncLogService {
    /// Open (or create) the service database at the given path.
    pub fn open(path: &str) -> Result<Self, ServerError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory service for tests.
    pub fn in_memory() -> Result<Self, ServerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ServerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply a batch of client changes.
    ///
    /// Each applied change gets the next clock for its `(user, table)`
    /// partition. Changes are rejected only for structural reasons (unknown
    /// table, missing payload); a stale write is never rejected — under
    /// last-write-wins the stored newer version simply stands and the change
    /// is reported as a conflict instead.
    pub fn push(
        &self,
        user_id: &str,
        table: &str,
        changes: &[PushChange],
    ) -> Result<PushResponse, ServerError> {
        if !is_sync_table(table) {
            tracing::warn!(table, "push to unknown table rejected");
            return Ok(PushResponse {
                accepted: Vec::new(),
                rejected: changes
                    .iter()
                    .map(|change| RejectedChange {
                        id: change.id.clone(),
                        reason: format!("unknown table: {}", table),
                    })
                    .collect(),
                conflicts: Vec::new(),
                current_server_clock: self.current_clock(user_id, table)?,
            });
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut clock = partition_clock(&tx, user_id, table)?;
        let now = Utc::now().timestamp_millis();

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut conflicts = Vec::new();

        for change in changes {
            let is_delete = change.operation == Operation::Delete;
            if !is_delete && change.data.is_none() {
                rejected.push(RejectedChange {
                    id: change.id.clone(),
                    reason: "missing payload".to_string(),
                });
                continue;
            }

            let stored = load_record(&tx, user_id, table, &change.id)?;
            if let Some(stored) = &stored {
                if !is_delete && stored.tombstone {
                    conflicts.push(Conflict {
                        id: change.id.clone(),
                        reason: ConflictReason::Deleted,
                        server_version: None,
                    });
                    continue;
                }
                if stored.client_timestamp > change.client_timestamp {
                    // The stored write is newer: it wins, the device pulls it
                    conflicts.push(Conflict {
                        id: change.id.clone(),
                        reason: ConflictReason::ConcurrentEdit,
                        server_version: stored
                            .data
                            .as_deref()
                            .and_then(|data| serde_json::from_str::<Value>(data).ok()),
                    });
                    continue;
                }
            }

            clock += 1;
            // Tombstones carry only the record id, never a payload
            let data = if is_delete {
                None
            } else {
                change
                    .data
                    .as_ref()
                    .map(|value| value.to_string())
            };

            tx.execute(
                "INSERT INTO sync_log
                     (user_id, table_name, record_id, operation, clock, timestamp, tombstone, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    user_id,
                    table,
                    change.id,
                    operation_name(change.operation),
                    clock,
                    now,
                    is_delete,
                    data,
                ],
            )?;
            tx.execute(
                "INSERT INTO records
                     (user_id, table_name, record_id, data, client_timestamp, clock, tombstone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, table_name, record_id) DO UPDATE SET
                     data = excluded.data,
                     client_timestamp = excluded.client_timestamp,
                     clock = excluded.clock,
                     tombstone = excluded.tombstone",
                params![
                    user_id,
                    table,
                    change.id,
                    data,
                    change.client_timestamp,
                    clock,
                    is_delete,
                ],
            )?;
            accepted.push(change.id.clone());
        }

        tx.commit()?;
        tracing::debug!(
            user_id,
            table,
            accepted = accepted.len(),
            rejected = rejected.len(),
            conflicts = conflicts.len(),
            clock,
            "push applied"
        );

        Ok(PushResponse {
            accepted,
            rejected,
            conflicts,
            current_server_clock: clock,
        })
    }

    /// Return log entries strictly after `last_server_clock`, clock
    /// ascending, capped at `limit` (default 500). `has_more` is set when the
    /// page was full.
    pub fn pull(
        &self,
        user_id: &str,
        table: &str,
        last_server_clock: i64,
        limit: Option<usize>,
    ) -> Result<PullResponse, ServerError> {
        if !is_sync_table(table) {
            return Err(ServerError::UnknownTable(table.to_string()));
        }
        let limit = limit.unwrap_or(DEFAULT_PULL_LIMIT).max(1);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT record_id, operation, clock, timestamp, tombstone, data
             FROM sync_log
             WHERE user_id = ?1 AND table_name = ?2 AND clock > ?3
             ORDER BY clock ASC
             LIMIT ?4",
        )?;
        let changes = stmt
            .query_map(
                params![user_id, table, last_server_clock, limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let changes: Vec<PullChange> = changes
            .into_iter()
            .map(|(id, operation, clock, timestamp, tombstone, data)| {
                Ok(PullChange {
                    id,
                    operation: parse_operation(&operation)?,
                    data: data
                        .as_deref()
                        .map(serde_json::from_str::<Value>)
                        .transpose()
                        .map_err(|e| ServerError::Serialization(e.to_string()))?,
                    clock,
                    timestamp,
                    tombstone,
                })
            })
            .collect::<Result<Vec<_>, ServerError>>()?;

        let has_more = changes.len() == limit;
        let current_server_clock = partition_clock(&conn, user_id, table)?;
        tracing::debug!(
            user_id,
            table,
            since = last_server_clock,
            returned = changes.len(),
            has_more,
            "pull served"
        );

        Ok(PullResponse {
            table: table.to_string(),
            changes,
            current_server_clock,
            has_more,
        })
    }

    /// Highest clock assigned so far in a partition (0 if none).
    pub fn current_clock(&self, user_id: &str, table: &str) -> Result<i64, ServerError> {
        let conn = self.conn.lock();
        partition_clock(&conn, user_id, table)
    }
}

fn partition_clock(conn: &Connection, user_id: &str, table: &str) -> Result<i64, ServerError> {
    let clock: Option<i64> = conn
        .query_row(
            "SELECT MAX(clock) FROM sync_log WHERE user_id = ?1 AND table_name = ?2",
            params![user_id, table],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(clock.unwrap_or(0))
}

fn load_record(
    conn: &Connection,
    user_id: &str,
    table: &str,
    record_id: &str,
) -> Result<Option<StoredRecord>, ServerError> {
    let row = conn
        .query_row(
            "SELECT data, client_timestamp, tombstone FROM records
             WHERE user_id = ?1 AND table_name = ?2 AND record_id = ?3",
            params![user_id, table, record_id],
            |row| {
                Ok(StoredRecord {
                    data: row.get(0)?,
                    client_timestamp: row.get(1)?,
                    tombstone: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Insert => "insert",
        Operation::Update => "update",
        Operation::Delete => "delete",
    }
}

fn parse_operation(name: &str) -> Result<Operation, ServerError> {
    match name {
        "insert" => Ok(Operation::Insert),
        "update" => Ok(Operation::Update),
        "delete" => Ok(Operation::Delete),
        other => Err(ServerError::Serialization(format!(
            "unknown operation in log: {}",
            other
        ))),
    }
}
