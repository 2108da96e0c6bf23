//! Local record storage behind a narrow trait.
//!
//! The trait covers only what the tracker and engine need: CRUD, the
//! "rows where sync_status = pending" query, clock rows, and two batched
//! operations (`mark_synced`, `apply_remote`) whose implementations must be
//! atomic. The sqlite implementation wraps each batch in a transaction, so
//! a crash mid-pull never leaves a half-applied page or a clock that ran
//! ahead of its records.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use paisa_sync_core::{is_sync_table, SyncStatus};

use crate::clock::TableClock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unknown sync table: {0}")]
    UnknownTable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One locally stored record plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub id: String,
    pub data: Value,
    pub sync_status: SyncStatus,
    /// Pending local delete awaiting a tombstone push.
    pub deleted: bool,
    /// Client-observed wall clock of the last local mutation, epoch ms.
    pub modified_at: i64,
    /// Epoch ms of the last successful push/pull for this row.
    pub last_synced_at: Option<i64>,
}

/// Storage interface used by the change tracker and the sync engine.
///
/// The engine is the only caller of `mark_synced` / `apply_remote` /
/// `set_clock`; application code goes through the tracker, which keeps
/// `pending_ops` consistent with row statuses.
pub trait LocalStore: Send + Sync {
    fn get(&self, table: &str, id: &str) -> Result<Option<LocalRecord>, StoreError>;
    fn put(&self, table: &str, record: &LocalRecord) -> Result<(), StoreError>;
    fn remove(&self, table: &str, id: &str) -> Result<(), StoreError>;
    fn get_pending(&self, table: &str) -> Result<Vec<LocalRecord>, StoreError>;
    fn set_status(&self, table: &str, id: &str, status: SyncStatus) -> Result<(), StoreError>;

    fn clock(&self, table: &str) -> Result<TableClock, StoreError>;
    fn set_clock(&self, table: &str, clock: &TableClock) -> Result<(), StoreError>;

    /// Adjust the table's pending-op counter by `delta`, floored at zero, as
    /// one atomic statement. Callers must never read-modify-write the clock
    /// row for this: a stale snapshot written back would clobber a concurrent
    /// acknowledgment and could rewind `last_server_clock`.
    fn adjust_pending(&self, table: &str, delta: i64) -> Result<(), StoreError>;

    /// Acknowledge pushed rows: tombstoned rows are removed, live rows flip
    /// to `synced`, and `pending_ops` drops by the number acknowledged
    /// (floored at zero). Atomic.
    fn mark_synced(&self, table: &str, ids: &[String], synced_at: i64) -> Result<(), StoreError>;

    /// Apply one pulled page: upserts land as `synced`, tombstones delete,
    /// and the table clock advances — all atomically. Re-applying the same
    /// page is safe because operations are absolute.
    fn apply_remote(
        &self,
        table: &str,
        upserts: &[(String, Value)],
        deletes: &[String],
        server_clock: i64,
        sync_ts: i64,
    ) -> Result<(), StoreError>;
}

/// Sqlite-backed local store. One table per entity type, one clock row per
/// table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_clocks (
                 table_name        TEXT PRIMARY KEY,
                 last_server_clock INTEGER NOT NULL DEFAULT 0,
                 last_sync_ts      INTEGER NOT NULL DEFAULT 0,
                 pending_ops       INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Validate the table name and return the quoted record-table identifier.
    ///
    /// Names come from the fixed sync-table list, never from user input, but
    /// the check keeps a typo from turning into SQL.
    fn table_ident(table: &str) -> Result<String, StoreError> {
        if !is_sync_table(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        Ok(format!("\"records_{}\"", table))
    }

    fn ensure_table(conn: &Connection, table: &str) -> Result<String, StoreError> {
        let ident = Self::table_ident(table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ident} (
                 id             TEXT PRIMARY KEY,
                 data           TEXT NOT NULL,
                 sync_status    TEXT NOT NULL,
                 deleted        INTEGER NOT NULL DEFAULT 0,
                 modified_at    INTEGER NOT NULL,
                 last_synced_at INTEGER
             );
             CREATE INDEX IF NOT EXISTS \"idx_{table}_status\"
                 ON {ident}(sync_status);"
        ))?;
        Ok(ident)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, bool, i64, Option<i64>)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode_record(
        (id, data, status, deleted, modified_at, last_synced_at): (
            String,
            String,
            String,
            bool,
            i64,
            Option<i64>,
        ),
    ) -> Result<LocalRecord, StoreError> {
        Ok(LocalRecord {
            id,
            data: serde_json::from_str(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            sync_status: parse_status(&status)?,
            deleted,
            modified_at,
            last_synced_at,
        })
    }
}

fn status_name(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Synced => "synced",
        SyncStatus::Pending => "pending",
        SyncStatus::Conflict => "conflict",
        SyncStatus::Error => "error",
    }
}

fn parse_status(name: &str) -> Result<SyncStatus, StoreError> {
    match name {
        "synced" => Ok(SyncStatus::Synced),
        "pending" => Ok(SyncStatus::Pending),
        "conflict" => Ok(SyncStatus::Conflict),
        "error" => Ok(SyncStatus::Error),
        other => Err(StoreError::Serialization(format!(
            "unknown sync status: {}",
            other
        ))),
    }
}

fn read_clock(conn: &Connection, table: &str) -> Result<TableClock, StoreError> {
    let clock = conn
        .query_row(
            "SELECT last_server_clock, last_sync_ts, pending_ops
             FROM sync_clocks WHERE table_name = ?1",
            params![table],
            |row| {
                Ok(TableClock {
                    last_server_clock: row.get(0)?,
                    last_sync_ts: row.get(1)?,
                    pending_ops: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(clock.unwrap_or_default())
}

fn write_clock(conn: &Connection, table: &str, clock: &TableClock) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_clocks (table_name, last_server_clock, last_sync_ts, pending_ops)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(table_name) DO UPDATE SET
             last_server_clock = excluded.last_server_clock,
             last_sync_ts = excluded.last_sync_ts,
             pending_ops = excluded.pending_ops",
        params![
            table,
            clock.last_server_clock,
            clock.last_sync_ts,
            clock.pending_ops
        ],
    )?;
    Ok(())
}

impl LocalStore for SqliteStore {
    fn get(&self, table: &str, id: &str) -> Result<Option<LocalRecord>, StoreError> {
        let conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, data, sync_status, deleted, modified_at, last_synced_at
                     FROM {ident} WHERE id = ?1"
                ),
                params![id],
                Self::row_to_record,
            )
            .optional()?;
        row.map(Self::decode_record).transpose()
    }

    fn put(&self, table: &str, record: &LocalRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        conn.execute(
            &format!(
                "INSERT INTO {ident} (id, data, sync_status, deleted, modified_at, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     data = excluded.data,
                     sync_status = excluded.sync_status,
                     deleted = excluded.deleted,
                     modified_at = excluded.modified_at,
                     last_synced_at = excluded.last_synced_at"
            ),
            params![
                record.id,
                record.data.to_string(),
                status_name(record.sync_status),
                record.deleted,
                record.modified_at,
                record.last_synced_at,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        conn.execute(&format!("DELETE FROM {ident} WHERE id = ?1"), params![id])?;
        Ok(())
    }

    fn get_pending(&self, table: &str) -> Result<Vec<LocalRecord>, StoreError> {
        let conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data, sync_status, deleted, modified_at, last_synced_at
             FROM {ident} WHERE sync_status = 'pending' ORDER BY modified_at ASC"
        ))?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_record).collect()
    }

    fn set_status(&self, table: &str, id: &str, status: SyncStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        conn.execute(
            &format!("UPDATE {ident} SET sync_status = ?1 WHERE id = ?2"),
            params![status_name(status), id],
        )?;
        Ok(())
    }

    fn clock(&self, table: &str) -> Result<TableClock, StoreError> {
        Self::table_ident(table)?;
        let conn = self.conn.lock();
        read_clock(&conn, table)
    }

    fn set_clock(&self, table: &str, clock: &TableClock) -> Result<(), StoreError> {
        Self::table_ident(table)?;
        let conn = self.conn.lock();
        write_clock(&conn, table, clock)
    }

    fn adjust_pending(&self, table: &str, delta: i64) -> Result<(), StoreError> {
        Self::table_ident(table)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_clocks (table_name, last_server_clock, last_sync_ts, pending_ops)
             VALUES (?1, 0, 0, MAX(0, ?2))
             ON CONFLICT(table_name) DO UPDATE SET
                 pending_ops = MAX(0, pending_ops + ?2)",
            params![table, delta],
        )?;
        Ok(())
    }

    fn mark_synced(&self, table: &str, ids: &[String], synced_at: i64) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        let tx = conn.transaction()?;
        for id in ids {
            // Acked tombstones are gone for good; live rows flip to synced
            tx.execute(
                &format!("DELETE FROM {ident} WHERE id = ?1 AND deleted = 1"),
                params![id],
            )?;
            tx.execute(
                &format!(
                    "UPDATE {ident} SET sync_status = 'synced', last_synced_at = ?1
                     WHERE id = ?2"
                ),
                params![synced_at, id],
            )?;
        }
        let mut clock = read_clock(&tx, table)?;
        clock.acknowledge(ids.len() as i64);
        clock.last_sync_ts = synced_at;
        write_clock(&tx, table, &clock)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_remote(
        &self,
        table: &str,
        upserts: &[(String, Value)],
        deletes: &[String],
        server_clock: i64,
        sync_ts: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let ident = Self::ensure_table(&conn, table)?;
        let tx = conn.transaction()?;
        for (id, data) in upserts {
            tx.execute(
                &format!(
                    "INSERT INTO {ident}
                         (id, data, sync_status, deleted, modified_at, last_synced_at)
                     VALUES (?1, ?2, 'synced', 0, ?3, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                         data = excluded.data,
                         sync_status = 'synced',
                         deleted = 0,
                         modified_at = excluded.modified_at,
                         last_synced_at = excluded.last_synced_at"
                ),
                params![id, data.to_string(), sync_ts],
            )?;
        }
        for id in deletes {
            tx.execute(&format!("DELETE FROM {ident} WHERE id = ?1"), params![id])?;
        }
        let mut clock = read_clock(&tx, table)?;
        clock.advance(server_clock, sync_ts);
        write_clock(&tx, table, &clock)?;
        tx.commit()?;
        Ok(())
    }
}
