//! End-to-end sync tests: two devices sharing one user's sync log, with an
//! in-process transport bridging straight into `SyncLogService`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use paisa_crypto::{
    unwrap, wrap_with_password, KeyManager, MasterKey, UnlockProof,
};
use paisa_sync_client::{
    Backoff, ChangeTracker, KeyBackup, KeyStore, LocalStore, SqliteStore, SyncEngine,
    SyncOptions, SyncTransport, SyncTrigger, TransportError,
};
use paisa_sync_core::{PullRequest, PullResponse, PushRequest, PushResponse, SyncStatus};
use paisa_sync_server::SyncLogService;

struct InProcessTransport {
    service: Arc<SyncLogService>,
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn push(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, TransportError> {
        self.service
            .push(user_id, &request.table, &request.changes)
            .map_err(|e| TransportError::permanent(e.to_string()))
    }

    async fn pull(
        &self,
        user_id: &str,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError> {
        self.service
            .pull(
                user_id,
                &request.table,
                request.last_server_clock,
                request.limit,
            )
            .map_err(|e| TransportError::permanent(e.to_string()))
    }
}

/// Remote key backup holding opaque export blobs, keyed by user.
struct InProcessKeyBackup {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InProcessKeyBackup {
    fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KeyBackup for InProcessKeyBackup {
    async fn backup_key(&self, user_id: &str, blob: Vec<u8>) -> Result<(), TransportError> {
        self.blobs.lock().insert(user_id.to_string(), blob);
        Ok(())
    }

    async fn fetch_key_blob(&self, user_id: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.blobs.lock().get(user_id).cloned())
    }
}

struct Device {
    store: Arc<SqliteStore>,
    tracker: ChangeTracker,
    engine: SyncEngine,
}

impl Device {
    fn new(service: &Arc<SyncLogService>, key: &MasterKey) -> Self {
        Self::with_options(service, key, SyncOptions::default())
    }

    fn with_options(
        service: &Arc<SyncLogService>,
        key: &MasterKey,
        options: SyncOptions,
    ) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn LocalStore>);
        let mut manager = KeyManager::new();
        manager.unlock(key.clone());
        let engine = SyncEngine::new(
            "user-1",
            Arc::clone(&store) as Arc<dyn LocalStore>,
            Arc::new(InProcessTransport {
                service: Arc::clone(service),
            }),
            Arc::new(Mutex::new(manager)),
            options,
        );
        Self {
            store,
            tracker,
            engine,
        }
    }

    async fn sync(&self, table: &str) -> paisa_sync_client::SyncResult {
        self.engine.sync_table(table, SyncTrigger::Manual).await.unwrap()
    }
}

fn server() -> Arc<SyncLogService> {
    Arc::new(SyncLogService::in_memory().unwrap())
}

#[tokio::test]
async fn record_round_trips_between_devices() {
    let service = server();
    let key = MasterKey::generate().unwrap();

    // Device one wraps its key under a password and backs the store up to
    // the remote key backup; the remote side only ever holds the opaque blob
    let backup = InProcessKeyBackup::new();
    let wrapped = wrap_with_password(&key, "correct-horse", None).unwrap();
    let keystore_one = KeyStore::in_memory().unwrap();
    keystore_one.save(&wrapped).unwrap();
    backup
        .backup_key("user-1", keystore_one.export("correct-horse").unwrap())
        .await
        .unwrap();

    let device_one = Device::new(&service, &key);
    let id = device_one
        .tracker
        .insert(
            "transactions",
            json!({"merchant": "Fuel Station", "amount": 42.50, "category": "fuel"}),
        )
        .unwrap();
    device_one.sync("transactions").await;

    // Device two restores the same master key from the fetched backup
    assert!(backup.fetch_key_blob("someone-else").await.unwrap().is_none());
    let blob = backup.fetch_key_blob("user-1").await.unwrap().unwrap();
    let keystore_two = KeyStore::in_memory().unwrap();
    keystore_two.import(&blob, "correct-horse").unwrap();
    let restored = keystore_two.load(&wrapped.id).unwrap().unwrap();
    let restored_key = unwrap(&restored, &UnlockProof::Password("correct-horse")).unwrap();
    assert_eq!(restored_key.as_bytes(), key.as_bytes());

    let device_two = Device::new(&service, &restored_key);
    let result = device_two.sync("transactions").await;
    assert_eq!(result.pulled, 1);

    let record = device_two.store.get("transactions", &id).unwrap().unwrap();
    assert_eq!(record.data["merchant"], "Fuel Station");
    assert_eq!(record.data["amount"], 42.50);
    assert_eq!(record.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn server_only_sees_ciphertext() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device = Device::new(&service, &key);

    device
        .tracker
        .insert(
            "transactions",
            json!({"merchant": "Fuel Station", "amount": 42.50, "category": "fuel"}),
        )
        .unwrap();
    device.sync("transactions").await;

    let page = service.pull("user-1", "transactions", 0, None).unwrap();
    assert_eq!(page.changes.len(), 1);
    let stored = page.changes[0].data.as_ref().unwrap();
    assert!(stored.get("_encrypted").is_some());
    assert!(stored.get("merchant").is_none());
    assert!(stored.get("amount").is_none());
    // Plaintext fields the server filters on stay readable
    assert_eq!(stored["category"], "fuel");
    assert!(!stored.to_string().contains("Fuel Station"));
}

#[tokio::test]
async fn push_acks_clear_pending_ops() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device = Device::new(&service, &key);

    for merchant in ["a", "b", "c"] {
        device
            .tracker
            .insert("transactions", json!({"merchant": merchant}))
            .unwrap();
    }
    assert_eq!(device.tracker.pending_ops("transactions").unwrap(), 3);

    let result = device.sync("transactions").await;
    assert_eq!(result.pushed, 3);
    assert_eq!(device.tracker.pending_ops("transactions").unwrap(), 0);
    assert!(device.store.get_pending("transactions").unwrap().is_empty());

    let status = device.engine.status("transactions").unwrap();
    assert_eq!(status.pending_ops, 0);
    assert_eq!(status.last_server_clock, 3);
}

#[tokio::test]
async fn remote_delete_removes_local_row() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    let device_two = Device::new(&service, &key);

    let id = device_one
        .tracker
        .insert("accounts", json!({"name": "Checking", "balance": 100}))
        .unwrap();
    device_one.sync("accounts").await;
    device_two.sync("accounts").await;
    assert!(device_two.store.get("accounts", &id).unwrap().is_some());

    device_one.tracker.delete("accounts", &id).unwrap();
    device_one.sync("accounts").await;
    // Acked tombstone is gone on the deleting device too
    assert!(device_one.store.get("accounts", &id).unwrap().is_none());

    let result = device_two.sync("accounts").await;
    assert_eq!(result.pulled, 1);
    assert!(device_two.store.get("accounts", &id).unwrap().is_none());
}

#[tokio::test]
async fn concurrent_edit_resolves_last_write_wins() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    let device_two = Device::new(&service, &key);

    let id = device_one
        .tracker
        .insert("transactions", json!({"merchant": "Original", "category": "x"}))
        .unwrap();
    device_one.sync("transactions").await;
    device_two.sync("transactions").await;

    // Device two edits first (older timestamp), device one edits later
    device_two
        .tracker
        .update(
            "transactions",
            &id,
            json!({"id": id, "merchant": "Older Edit", "category": "x"}),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    device_one
        .tracker
        .update(
            "transactions",
            &id,
            json!({"id": id, "merchant": "Newer Edit", "category": "x"}),
        )
        .unwrap();

    // The newer edit lands on the server first
    device_one.sync("transactions").await;

    // The stale push loses; staleness is a conflict, never a rejection
    let result = device_two.sync("transactions").await;
    assert_eq!(result.pushed, 0);
    assert!(result.errors.is_empty());

    // The conflict response carries the winning version, which the cycle
    // adopts locally
    let record = device_two.store.get("transactions", &id).unwrap().unwrap();
    assert_eq!(record.data["merchant"], "Newer Edit");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(device_two.tracker.pending_ops("transactions").unwrap(), 0);

    let one = device_one.store.get("transactions", &id).unwrap().unwrap();
    assert_eq!(one.data["merchant"], "Newer Edit");
}

#[tokio::test]
async fn stale_conflicting_edit_converges_despite_clock_skew() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    let device_two = Device::new(&service, &key);

    let id = device_one
        .tracker
        .insert("transactions", json!({"merchant": "Server Wins", "category": "x"}))
        .unwrap();
    device_one.sync("transactions").await;
    device_two.sync("transactions").await;

    // Device two's wall clock runs far behind: its edit happens after the
    // pull but carries an older timestamp than the stored write. The winning
    // entry's clock already sits at this device's cursor, so no pull page
    // will ever deliver it again; convergence must come from the conflict
    // response itself
    let mut record = device_two.store.get("transactions", &id).unwrap().unwrap();
    record.data["merchant"] = json!("Local Stale");
    record.sync_status = SyncStatus::Pending;
    record.modified_at = 5_000;
    device_two.store.put("transactions", &record).unwrap();
    device_two.store.adjust_pending("transactions", 1).unwrap();

    let result = device_two.sync("transactions").await;
    assert_eq!(result.pushed, 0);
    assert!(result.errors.is_empty());

    let record = device_two.store.get("transactions", &id).unwrap().unwrap();
    assert_eq!(record.data["merchant"], "Server Wins");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(device_two.tracker.pending_ops("transactions").unwrap(), 0);
}

#[tokio::test]
async fn update_against_remote_tombstone_converges_to_deleted() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    let device_two = Device::new(&service, &key);

    let id = device_one
        .tracker
        .insert("accounts", json!({"name": "Closing", "balance": 0}))
        .unwrap();
    device_one.sync("accounts").await;
    device_two.sync("accounts").await;

    device_one.tracker.delete("accounts", &id).unwrap();
    device_one.sync("accounts").await;

    // Device two edits the now-tombstoned row; the delete wins and the
    // local copy goes away in the same cycle
    device_two
        .tracker
        .update("accounts", &id, json!({"id": id, "name": "Renamed", "balance": 1}))
        .unwrap();
    let result = device_two.sync("accounts").await;
    assert_eq!(result.pushed, 0);

    assert!(device_two.store.get("accounts", &id).unwrap().is_none());
    assert_eq!(device_two.tracker.pending_ops("accounts").unwrap(), 0);
}

#[tokio::test]
async fn pull_paginates_without_skipping() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    for i in 0..120 {
        device_one
            .tracker
            .insert("transactions", json!({"merchant": format!("m-{i}"), "seq": i}))
            .unwrap();
    }
    device_one.sync("transactions").await;

    let small_pages = SyncOptions {
        pull_limit: 50,
        ..Default::default()
    };
    let device_two = Device::with_options(&service, &key, small_pages);
    let result = device_two.sync("transactions").await;
    assert_eq!(result.pulled, 120);
    assert!(result.errors.is_empty());

    let clock = device_two.store.clock("transactions").unwrap();
    assert_eq!(clock.last_server_clock, 120);
}

#[tokio::test]
async fn sync_with_no_changes_is_a_noop() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device = Device::new(&service, &key);

    device
        .tracker
        .insert("transactions", json!({"merchant": "once"}))
        .unwrap();
    let first = device.sync("transactions").await;
    assert_eq!(first.pushed, 1);

    let second = device.sync("transactions").await;
    assert_eq!(second.pushed, 0);
    assert_eq!(second.pulled, 0);
    assert!(second.errors.is_empty());
}

#[tokio::test]
async fn own_pushes_echo_back_harmlessly() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device = Device::new(&service, &key);

    let id = device
        .tracker
        .insert("transactions", json!({"merchant": "mine"}))
        .unwrap();
    // The pull after a push replays this device's own log entry; re-applying
    // it is a no-op upsert and moves the clock past it
    let result = device.sync("transactions").await;
    assert_eq!(result.pushed, 1);
    assert_eq!(result.pulled, 1);

    let record = device.store.get("transactions", &id).unwrap().unwrap();
    assert_eq!(record.data["merchant"], "mine");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(device.store.clock("transactions").unwrap().last_server_clock, 1);
}

#[tokio::test]
async fn tables_sync_independently() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device = Device::new(&service, &key);

    device
        .tracker
        .insert("transactions", json!({"merchant": "t"}))
        .unwrap();
    device
        .tracker
        .insert("accounts", json!({"name": "a"}))
        .unwrap();

    device.sync("transactions").await;
    assert_eq!(device.tracker.pending_ops("transactions").unwrap(), 0);
    assert_eq!(device.tracker.pending_ops("accounts").unwrap(), 1);

    let transactions = device.store.clock("transactions").unwrap();
    let accounts = device.store.clock("accounts").unwrap();
    assert_eq!(transactions.last_server_clock, 1);
    assert_eq!(accounts.last_server_clock, 0);
}

#[tokio::test]
async fn update_round_trips_as_update() {
    let service = server();
    let key = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key);
    let device_two = Device::new(&service, &key);

    let id = device_one
        .tracker
        .insert("holdings", json!({"quantity": 10, "symbol": "VTI"}))
        .unwrap();
    device_one.sync("holdings").await;
    device_two.sync("holdings").await;

    device_one
        .tracker
        .update("holdings", &id, json!({"id": id, "quantity": 12, "symbol": "VTI"}))
        .unwrap();
    device_one.sync("holdings").await;

    device_two.sync("holdings").await;
    let record = device_two.store.get("holdings", &id).unwrap().unwrap();
    assert_eq!(record.data["quantity"], 12);
}

#[tokio::test]
async fn wrong_key_skips_rows_but_keeps_syncing() {
    let service = server();
    let key_one = MasterKey::generate().unwrap();
    let device_one = Device::new(&service, &key_one);
    device_one
        .tracker
        .insert("transactions", json!({"merchant": "secret"}))
        .unwrap();
    device_one.sync("transactions").await;

    // A device with a different key cannot decrypt, but the cycle completes
    // and the clock advances so the bad row is not refetched forever
    let key_two = MasterKey::generate().unwrap();
    let device_two = Device::new(&service, &key_two);
    let result = device_two.sync("transactions").await;
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.pulled, 0);
    assert_eq!(
        device_two.store.clock("transactions").unwrap().last_server_clock,
        1
    );
}

#[tokio::test]
async fn backoff_options_are_honored_end_to_end() {
    // A permanent transport error must fail fast with no retries
    struct FailingTransport;

    #[async_trait]
    impl SyncTransport for FailingTransport {
        async fn push(
            &self,
            _user_id: &str,
            _request: PushRequest,
        ) -> Result<PushResponse, TransportError> {
            Err(TransportError::permanent("bad request"))
        }

        async fn pull(
            &self,
            _user_id: &str,
            _request: PullRequest,
        ) -> Result<PullResponse, TransportError> {
            Err(TransportError::permanent("bad request"))
        }
    }

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut manager = KeyManager::new();
    manager.generate().unwrap();
    let engine = SyncEngine::new(
        "user-1",
        Arc::clone(&store) as Arc<dyn LocalStore>,
        Arc::new(FailingTransport),
        Arc::new(Mutex::new(manager)),
        SyncOptions {
            backoff: Backoff {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
                max_attempts: 5,
            },
            ..Default::default()
        },
    );

    let started = std::time::Instant::now();
    let error = engine
        .sync_table("transactions", SyncTrigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(error, paisa_sync_client::ClientError::Transport(_)));
    // No retry sleeps for a permanent failure
    assert!(started.elapsed() < Duration::from_secs(1));
}
