//! Change tracking hooks.
//!
//! Application code mutates records through these hooks so that sync
//! bookkeeping (`sync_status`, `pending_ops`) stays consistent with what is
//! actually stored. The sync engine is the only other writer of that
//! bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use paisa_sync_core::SyncStatus;

use crate::store::{LocalRecord, LocalStore, StoreError};

/// Tracks local mutations and exposes the push candidate set.
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn LocalStore>,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Create a record. Generates an id when the payload carries none.
    /// The row starts `pending` and bumps the table's `pending_ops`.
    pub fn insert(&self, table: &str, mut data: Value) -> Result<String, StoreError> {
        let id = match data.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Some(object) = data.as_object_mut() {
                    object.insert("id".to_string(), Value::String(id.clone()));
                }
                id
            }
        };
        self.write_pending(table, &id, data, None)?;
        Ok(id)
    }

    /// Update a record in place, marking it `pending` again. The previous
    /// `last_synced_at` is preserved so the engine can tell inserts from
    /// updates at push time.
    pub fn update(&self, table: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let last_synced_at = self
            .store
            .get(table, id)?
            .and_then(|record| record.last_synced_at);
        self.write_pending(table, id, data, last_synced_at)
    }

    /// Delete a record.
    ///
    /// A row that has never reached the server is removed outright — there
    /// is nothing for any other device to forget. A previously synced row
    /// becomes a pending tombstone and is pushed as a delete.
    pub fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let Some(existing) = self.store.get(table, id)? else {
            return Ok(());
        };
        if existing.last_synced_at.is_none() {
            self.store.remove(table, id)?;
            if existing.sync_status == SyncStatus::Pending {
                // The create never left the device; drop its pending op too
                self.store.adjust_pending(table, -1)?;
            }
            return Ok(());
        }

        let was_pending = existing.sync_status == SyncStatus::Pending;
        let tombstone = LocalRecord {
            deleted: true,
            sync_status: SyncStatus::Pending,
            modified_at: Utc::now().timestamp_millis(),
            ..existing
        };
        self.store.put(table, &tombstone)?;
        if !was_pending {
            self.store.adjust_pending(table, 1)?;
        }
        Ok(())
    }

    /// Push candidate set for a table.
    pub fn get_pending(&self, table: &str) -> Result<Vec<LocalRecord>, StoreError> {
        self.store.get_pending(table)
    }

    /// Number of local mutations awaiting push.
    pub fn pending_ops(&self, table: &str) -> Result<i64, StoreError> {
        Ok(self.store.clock(table)?.pending_ops)
    }

    fn write_pending(
        &self,
        table: &str,
        id: &str,
        data: Value,
        last_synced_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let was_pending = self
            .store
            .get(table, id)?
            .map(|record| record.sync_status == SyncStatus::Pending)
            .unwrap_or(false);
        let record = LocalRecord {
            id: id.to_string(),
            data,
            sync_status: SyncStatus::Pending,
            deleted: false,
            modified_at: Utc::now().timestamp_millis(),
            last_synced_at,
        };
        self.store.put(table, &record)?;
        if !was_pending {
            // Re-editing an already-pending row is still one pending op
            self.store.adjust_pending(table, 1)?;
        }
        Ok(())
    }
}
