//! The sync protocol engine.
//!
//! Per table the engine runs `Idle → Pushing → Pulling → Idle`. Push always
//! precedes pull so a device's own changes reach the server log before it
//! asks "what's new" and re-downloads its own stale state. At most one cycle
//! per table is in flight: triggers arriving while busy are dropped (the
//! next periodic trigger catches up), enforced by an explicit atomic flag
//! rather than any assumption about the host runtime.
//!
//! The engine is constructed explicitly with its store, transport, and key
//! manager handles; there is no process-wide singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::timeout;

use paisa_crypto::{KeyManager, MasterKey};
use paisa_sync_core::{
    decrypt_fields, encrypt_fields, sensitive_fields, ConflictReason, Operation, PullRequest,
    PushChange, PushRequest, SyncStatus, DEFAULT_PULL_LIMIT,
};

use crate::backoff::Backoff;
use crate::error::ClientError;
use crate::store::{LocalRecord, LocalStore};
use crate::transport::{SyncTransport, TransportErrorKind};

/// What woke the engine up. Only these transitions leave `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Manual,
    Periodic,
    NetworkRestored,
    Foreground,
}

/// Which phase of a cycle an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Push,
    Pull,
}

/// A per-record error collected during a cycle, never thrown.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub id: Option<String>,
    pub message: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub pushed: usize,
    pub pulled: usize,
    /// True when the trigger was coalesced because a cycle was in flight.
    pub skipped: bool,
    pub errors: Vec<SyncErrorEvent>,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Timeout for the push request, independent of transport timeouts.
    pub push_timeout: Duration,
    /// Timeout for each pull page request.
    pub pull_timeout: Duration,
    pub pull_limit: usize,
    pub backoff: Backoff,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(30),
            pull_limit: DEFAULT_PULL_LIMIT,
            backoff: Backoff::default(),
        }
    }
}

/// Snapshot of a table's sync state for status indicators.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub last_server_clock: i64,
    pub last_sync_ts: i64,
    pub pending_ops: i64,
    pub last_error: Option<String>,
}

/// Clears the in-flight flag when a cycle ends, on every path.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Observer invoked for every per-record error collected during a cycle.
pub type ErrorObserver = Arc<dyn Fn(&SyncErrorEvent) + Send + Sync>;

/// Client-side sync engine. One instance owns sync for one user's table set.
pub struct SyncEngine {
    user_id: String,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn SyncTransport>,
    keys: Arc<Mutex<KeyManager>>,
    options: SyncOptions,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    last_errors: Mutex<HashMap<String, String>>,
    on_error: Option<ErrorObserver>,
}

impl SyncEngine {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn SyncTransport>,
        keys: Arc<Mutex<KeyManager>>,
        options: SyncOptions,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            transport,
            keys,
            options,
            in_flight: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
            on_error: None,
        }
    }

    /// Install an observer for per-record errors (UI toasts, telemetry).
    pub fn with_error_observer(
        mut self,
        observer: impl Fn(&SyncErrorEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(observer));
        self
    }

    fn record_error(&self, result: &mut SyncResult, event: SyncErrorEvent) {
        if let Some(observer) = &self.on_error {
            observer(&event);
        }
        result.errors.push(event);
    }

    /// Run one push-then-pull cycle for a table.
    ///
    /// Returns a skipped result when a cycle for this table is already in
    /// flight. Transient failures are retried with exponential backoff; once
    /// attempts are exhausted the error is recorded in the table's status
    /// and surfaced, without blocking future cycles.
    pub async fn sync_table(
        &self,
        table: &str,
        trigger: SyncTrigger,
    ) -> Result<SyncResult, ClientError> {
        let sensitive =
            sensitive_fields(table).ok_or_else(|| ClientError::UnknownTable(table.to_string()))?;

        let flag = {
            let mut map = self.in_flight.lock();
            Arc::clone(
                map.entry(table.to_string())
                    .or_insert_with(|| Arc::new(AtomicBool::new(false))),
            )
        };
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(table, ?trigger, "sync already in flight, trigger dropped");
            return Ok(SyncResult {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = InFlightGuard(flag);
        tracing::debug!(table, ?trigger, "sync cycle starting");

        let max_attempts = self.options.backoff.max_attempts;
        let mut attempt = 0;
        loop {
            match self.run_cycle(table, sensitive).await {
                Ok(result) => {
                    self.last_errors.lock().remove(table);
                    tracing::info!(
                        table,
                        pushed = result.pushed,
                        pulled = result.pulled,
                        errors = result.errors.len(),
                        "sync cycle complete"
                    );
                    return Ok(result);
                }
                Err(error) if is_retriable(&error) && attempt + 1 < max_attempts => {
                    let delay = self.options.backoff.delay(attempt);
                    tracing::warn!(
                        table,
                        attempt,
                        ?delay,
                        %error,
                        "sync cycle failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    let wrapped = if is_retriable(&error) {
                        ClientError::RetriesExhausted {
                            table: table.to_string(),
                            attempts: attempt + 1,
                            last_error: error.to_string(),
                        }
                    } else {
                        error
                    };
                    tracing::error!(table, %wrapped, "sync cycle failed");
                    self.last_errors
                        .lock()
                        .insert(table.to_string(), wrapped.to_string());
                    return Err(wrapped);
                }
            }
        }
    }

    /// Status snapshot for a table (feeds the UI sync indicator).
    pub fn status(&self, table: &str) -> Result<EngineStatus, ClientError> {
        let clock = self.store.clock(table)?;
        Ok(EngineStatus {
            last_server_clock: clock.last_server_clock,
            last_sync_ts: clock.last_sync_ts,
            pending_ops: clock.pending_ops,
            last_error: self.last_errors.lock().get(table).cloned(),
        })
    }

    async fn run_cycle(
        &self,
        table: &str,
        sensitive: &[&str],
    ) -> Result<SyncResult, ClientError> {
        // Key is cloned out so no lock is held across awaits
        let key = self.keys.lock().active_key()?.clone();
        let mut result = SyncResult::default();

        self.push_phase(table, sensitive, &key, &mut result).await?;
        self.pull_phase(table, &key, &mut result).await?;
        Ok(result)
    }

    async fn push_phase(
        &self,
        table: &str,
        sensitive: &[&str],
        key: &MasterKey,
        result: &mut SyncResult,
    ) -> Result<(), ClientError> {
        let pending = self.store.get_pending(table)?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut changes = Vec::with_capacity(pending.len());
        for record in &pending {
            if record.deleted {
                changes.push(PushChange {
                    id: record.id.clone(),
                    operation: Operation::Delete,
                    data: None,
                    client_timestamp: record.modified_at,
                });
            } else {
                let operation = if record.last_synced_at.is_none() {
                    Operation::Insert
                } else {
                    Operation::Update
                };
                changes.push(PushChange {
                    id: record.id.clone(),
                    operation,
                    data: Some(encrypt_fields(&record.data, key, sensitive)?),
                    client_timestamp: record.modified_at,
                });
            }
        }

        let request = PushRequest {
            table: table.to_string(),
            changes,
        };
        let response = timeout(
            self.options.push_timeout,
            self.transport.push(&self.user_id, request),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            phase: "push",
            millis: self.options.push_timeout.as_millis() as u64,
        })??;

        // Ack strictly by returned id, never by batch position
        self.store
            .mark_synced(table, &response.accepted, Utc::now().timestamp_millis())?;
        result.pushed = response.accepted.len();

        for conflict in &response.conflicts {
            // Last-write-wins: the stored version stands, so adopt it here.
            // Waiting for a pull is not enough: the winning entry's clock can
            // already sit at or below this device's cursor (the losing edit
            // was made after pulling it), so no later page would carry it
            tracing::warn!(
                table,
                id = %conflict.id,
                reason = ?conflict.reason,
                "push conflict, server version wins"
            );
            let applied = match (conflict.reason, &conflict.server_version) {
                (ConflictReason::Deleted, _) => {
                    self.store.remove(table, &conflict.id)?;
                    true
                }
                (_, Some(version)) => match decrypt_fields(version, key) {
                    Ok(data) => {
                        let now = Utc::now().timestamp_millis();
                        self.store.put(
                            table,
                            &LocalRecord {
                                id: conflict.id.clone(),
                                data,
                                sync_status: SyncStatus::Synced,
                                deleted: false,
                                modified_at: now,
                                last_synced_at: Some(now),
                            },
                        )?;
                        true
                    }
                    Err(error) => {
                        tracing::warn!(
                            table,
                            id = %conflict.id,
                            %error,
                            "conflict server version undecryptable"
                        );
                        self.record_error(
                            result,
                            SyncErrorEvent {
                                phase: SyncPhase::Push,
                                id: Some(conflict.id.clone()),
                                message: error.to_string(),
                            },
                        );
                        false
                    }
                },
                (_, None) => false,
            };
            if !applied {
                self.store
                    .set_status(table, &conflict.id, SyncStatus::Conflict)?;
            }
        }
        for rejected in &response.rejected {
            tracing::warn!(table, id = %rejected.id, reason = %rejected.reason, "push rejected");
            self.store
                .set_status(table, &rejected.id, SyncStatus::Error)?;
            self.record_error(
                result,
                SyncErrorEvent {
                    phase: SyncPhase::Push,
                    id: Some(rejected.id.clone()),
                    message: rejected.reason.clone(),
                },
            );
        }

        // Conflicted and rejected rows left the pending set too; they will
        // not be retried as-is, so they no longer count as awaiting push
        let resolved = response.conflicts.len() + response.rejected.len();
        if resolved > 0 {
            self.store.adjust_pending(table, -(resolved as i64))?;
        }
        Ok(())
    }

    async fn pull_phase(
        &self,
        table: &str,
        key: &MasterKey,
        result: &mut SyncResult,
    ) -> Result<(), ClientError> {
        loop {
            let clock = self.store.clock(table)?;
            let request = PullRequest {
                table: table.to_string(),
                last_server_clock: clock.last_server_clock,
                limit: Some(self.options.pull_limit),
            };
            let response = timeout(
                self.options.pull_timeout,
                self.transport.pull(&self.user_id, request),
            )
            .await
            .map_err(|_| ClientError::Timeout {
                phase: "pull",
                millis: self.options.pull_timeout.as_millis() as u64,
            })??;

            let mut upserts: Vec<(String, Value)> = Vec::new();
            let mut deletes: Vec<String> = Vec::new();
            let mut page_max_clock = clock.last_server_clock;

            for change in &response.changes {
                page_max_clock = page_max_clock.max(change.clock);
                if change.tombstone || change.operation == Operation::Delete {
                    deletes.push(change.id.clone());
                    continue;
                }
                let Some(data) = &change.data else {
                    tracing::warn!(table, id = %change.id, "pulled entry missing payload, skipped");
                    self.record_error(
                        result,
                        SyncErrorEvent {
                            phase: SyncPhase::Pull,
                            id: Some(change.id.clone()),
                            message: "missing payload".to_string(),
                        },
                    );
                    continue;
                };
                match decrypt_fields(data, key) {
                    Ok(record) => upserts.push((change.id.clone(), record)),
                    Err(error) => {
                        // One corrupted row must not block the rest of the
                        // batch; the local row keeps its last-known-good state
                        tracing::warn!(table, id = %change.id, %error, "decrypt failed, row skipped");
                        self.record_error(
                            result,
                            SyncErrorEvent {
                                phase: SyncPhase::Pull,
                                id: Some(change.id.clone()),
                                message: error.to_string(),
                            },
                        );
                    }
                }
            }

            // With more pages pending, advance only to what was applied;
            // jumping to the server's current clock would skip the gap
            let new_clock = if response.has_more {
                page_max_clock
            } else {
                response.current_server_clock.max(page_max_clock)
            };
            result.pulled += upserts.len() + deletes.len();
            self.store.apply_remote(
                table,
                &upserts,
                &deletes,
                new_clock,
                Utc::now().timestamp_millis(),
            )?;

            if !response.has_more {
                return Ok(());
            }
        }
    }
}

fn is_retriable(error: &ClientError) -> bool {
    match error {
        ClientError::Timeout { .. } => true,
        ClientError::Transport(e) => e.kind == TransportErrorKind::Transient,
        _ => false,
    }
}
