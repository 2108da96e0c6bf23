//! Persistence for wrapped master keys.
//!
//! Only [`WrappedKey`] rows ever touch disk; the raw master key stays in the
//! in-memory [`KeyManager`] session. A device may hold several rows for the
//! same key (password wrap plus a platform-authenticator wrap).

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use paisa_crypto::{
    export_store, import_store, unwrap, CryptoError, KeyManager, ProtectionMethod, UnlockProof,
    WrappedKey,
};

use crate::error::ClientError;
use crate::store::StoreError;

/// Sqlite-backed store of wrapped-key rows.
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS wrapped_keys (
                 id                TEXT PRIMARY KEY,
                 protection_method TEXT NOT NULL,
                 salt              BLOB,
                 iterations        INTEGER,
                 credential_ref    TEXT,
                 envelope          TEXT NOT NULL,
                 created_at        INTEGER NOT NULL,
                 last_used_at      INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, wrapped: &WrappedKey) -> Result<(), StoreError> {
        let envelope = serde_json::to_string(&wrapped.envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wrapped_keys
                 (id, protection_method, salt, iterations, credential_ref,
                  envelope, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 protection_method = excluded.protection_method,
                 salt = excluded.salt,
                 iterations = excluded.iterations,
                 credential_ref = excluded.credential_ref,
                 envelope = excluded.envelope,
                 last_used_at = excluded.last_used_at",
            params![
                wrapped.id,
                method_name(wrapped.protection_method),
                wrapped.salt,
                wrapped.iterations,
                wrapped.credential_ref,
                envelope,
                wrapped.created_at,
                wrapped.last_used_at,
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<WrappedKey>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, protection_method, salt, iterations, credential_ref,
                    envelope, created_at, last_used_at
             FROM wrapped_keys WHERE id = ?1",
            params![id],
            row_to_wrapped,
        )
        .optional()?
        .map(decode_wrapped)
        .transpose()
    }

    /// All rows, most recently used first.
    pub fn load_all(&self) -> Result<Vec<WrappedKey>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, protection_method, salt, iterations, credential_ref,
                    envelope, created_at, last_used_at
             FROM wrapped_keys ORDER BY last_used_at DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_wrapped)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_wrapped).collect()
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM wrapped_keys WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Unwrap a stored row with the given proof and install the key in the
    /// session. Updates the row's `last_used_at` on success.
    pub fn unlock(
        &self,
        id: &str,
        proof: &UnlockProof<'_>,
        manager: &mut KeyManager,
        now: i64,
    ) -> Result<(), ClientError> {
        let wrapped = self
            .load(id)?
            .ok_or(CryptoError::AuthenticationFailed)
            .map_err(ClientError::Crypto)?;
        let key = unwrap(&wrapped, proof).map_err(ClientError::Crypto)?;
        manager.unlock(key);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE wrapped_keys SET last_used_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Passphrase-encrypted blob of every stored row, for device transfer
    /// or remote backup.
    pub fn export(&self, passphrase: &str) -> Result<Vec<u8>, ClientError> {
        let rows = self.load_all()?;
        export_store(&rows, passphrase).map_err(ClientError::Crypto)
    }

    /// Import rows from an export blob, overwriting rows with matching ids.
    pub fn import(&self, blob: &[u8], passphrase: &str) -> Result<usize, ClientError> {
        let rows = import_store(blob, passphrase).map_err(ClientError::Crypto)?;
        for row in &rows {
            self.save(row)?;
        }
        Ok(rows.len())
    }
}

fn method_name(method: ProtectionMethod) -> &'static str {
    match method {
        ProtectionMethod::PasswordDerived => "password_derived",
        ProtectionMethod::PlatformAuthenticator => "platform_authenticator",
    }
}

fn parse_method(name: &str) -> Result<ProtectionMethod, StoreError> {
    match name {
        "password_derived" => Ok(ProtectionMethod::PasswordDerived),
        "platform_authenticator" => Ok(ProtectionMethod::PlatformAuthenticator),
        other => Err(StoreError::Serialization(format!(
            "unknown protection method: {}",
            other
        ))),
    }
}

type WrappedRow = (
    String,
    String,
    Option<Vec<u8>>,
    Option<u32>,
    Option<String>,
    String,
    i64,
    i64,
);

fn row_to_wrapped(row: &rusqlite::Row<'_>) -> rusqlite::Result<WrappedRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_wrapped(
    (id, method, salt, iterations, credential_ref, envelope, created_at, last_used_at): WrappedRow,
) -> Result<WrappedKey, StoreError> {
    Ok(WrappedKey {
        id,
        protection_method: parse_method(&method)?,
        salt,
        iterations,
        credential_ref,
        envelope: serde_json::from_str(&envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at,
        last_used_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use paisa_crypto::{wrap_with_password, wrap_with_platform_credential, MasterKey};

    #[test]
    fn save_load_round_trip() {
        let store = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        let wrapped = wrap_with_password(&key, "pw", None).unwrap();
        store.save(&wrapped).unwrap();

        let loaded = store.load(&wrapped.id).unwrap().unwrap();
        assert_eq!(loaded.id, wrapped.id);
        assert_eq!(loaded.salt, wrapped.salt);
        assert_eq!(loaded.envelope.ciphertext, wrapped.envelope.ciphertext);
    }

    #[test]
    fn load_missing_is_none() {
        let store = KeyStore::in_memory().unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn unlock_installs_session_key_and_touches_row() {
        let store = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        let wrapped = wrap_with_password(&key, "correct-horse", None).unwrap();
        store.save(&wrapped).unwrap();

        let mut manager = KeyManager::new();
        store
            .unlock(
                &wrapped.id,
                &UnlockProof::Password("correct-horse"),
                &mut manager,
                9_999,
            )
            .unwrap();
        assert_eq!(manager.active_key().unwrap().as_bytes(), key.as_bytes());
        assert_eq!(store.load(&wrapped.id).unwrap().unwrap().last_used_at, 9_999);
    }

    #[test]
    fn unlock_with_wrong_password_fails_and_leaves_locked() {
        let store = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        let wrapped = wrap_with_password(&key, "right", None).unwrap();
        store.save(&wrapped).unwrap();

        let mut manager = KeyManager::new();
        let result = store.unlock(
            &wrapped.id,
            &UnlockProof::Password("wrong"),
            &mut manager,
            0,
        );
        assert!(matches!(
            result,
            Err(ClientError::Crypto(CryptoError::AuthenticationFailed))
        ));
        assert!(!manager.is_unlocked());
    }

    #[test]
    fn holds_multiple_wraps_of_same_key() {
        let store = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        store
            .save(&wrap_with_password(&key, "pw", None).unwrap())
            .unwrap();
        store
            .save(&wrap_with_platform_credential(&key, "cred-1", &[7u8; 32]).unwrap())
            .unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn export_import_moves_rows_between_stores() {
        let source = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        let wrapped = wrap_with_password(&key, "pw", None).unwrap();
        source.save(&wrapped).unwrap();

        let blob = source.export("transfer-phrase").unwrap();
        let target = KeyStore::in_memory().unwrap();
        assert_eq!(target.import(&blob, "transfer-phrase").unwrap(), 1);

        let mut manager = KeyManager::new();
        target
            .unlock(&wrapped.id, &UnlockProof::Password("pw"), &mut manager, 0)
            .unwrap();
        assert_eq!(manager.active_key().unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn delete_removes_row() {
        let store = KeyStore::in_memory().unwrap();
        let key = MasterKey::generate().unwrap();
        let wrapped = wrap_with_password(&key, "pw", None).unwrap();
        store.save(&wrapped).unwrap();
        store.delete(&wrapped.id).unwrap();
        assert!(store.load(&wrapped.id).unwrap().is_none());
    }
}
