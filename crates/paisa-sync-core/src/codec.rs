//! Field-level encryption codec.
//!
//! Push: strip the declared sensitive fields off a record, serialize them as
//! one JSON object, seal that object into an envelope, and attach it under
//! the reserved `_encrypted` key. Pull: reverse. Plaintext metadata fields
//! (dates, categories, ids) pass through untouched so the server can index
//! them.

use serde_json::{Map, Value};

use paisa_crypto::{open, seal, EncryptedEnvelope, MasterKey};

use crate::error::CodecError;

/// Reserved record key holding the encrypted field bundle.
pub const ENCRYPTED_KEY: &str = "_encrypted";

/// Encrypt the listed fields of a record.
///
/// Fields absent from the record are skipped. The record `id` is never
/// encrypted even if listed. A record with none of the listed fields present
/// is returned unchanged. Each call generates a fresh nonce, so encrypting
/// the same record twice never produces the same ciphertext.
pub fn encrypt_fields(
    record: &Value,
    key: &MasterKey,
    sensitive: &[&str],
) -> Result<Value, CodecError> {
    let object = record.as_object().ok_or(CodecError::NotAnObject)?;

    let mut plaintext = Map::new();
    let mut bundle = Map::new();
    for (name, value) in object {
        if name != "id" && sensitive.contains(&name.as_str()) {
            bundle.insert(name.clone(), value.clone());
        } else {
            plaintext.insert(name.clone(), value.clone());
        }
    }
    if bundle.is_empty() {
        return Ok(record.clone());
    }

    let payload = serde_json::to_vec(&Value::Object(bundle))
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    let envelope = seal(&payload, key)?;
    let envelope_value = serde_json::to_value(&envelope)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    plaintext.insert(ENCRYPTED_KEY.to_string(), envelope_value);
    Ok(Value::Object(plaintext))
}

/// Decrypt a record's `_encrypted` bundle and merge the fields back.
///
/// A record without `_encrypted` is returned unchanged (legacy rows synced
/// before encryption was enabled). A wrong key or tampered envelope is a
/// hard `DecryptionFailed`; no partial or garbage data is ever merged.
pub fn decrypt_fields(record: &Value, key: &MasterKey) -> Result<Value, CodecError> {
    let object = record.as_object().ok_or(CodecError::NotAnObject)?;
    let Some(envelope_value) = object.get(ENCRYPTED_KEY) else {
        return Ok(record.clone());
    };

    let envelope: EncryptedEnvelope = serde_json::from_value(envelope_value.clone())
        .map_err(|e| CodecError::InvalidEnvelope(e.to_string()))?;
    let payload = open(&envelope, key)?;
    let recovered: Value = serde_json::from_slice(&payload)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    let recovered = match recovered {
        Value::Object(map) => map,
        _ => return Err(CodecError::InvalidPayload),
    };

    let mut merged = object.clone();
    merged.remove(ENCRYPTED_KEY);
    for (name, value) in recovered {
        merged.insert(name, value);
    }
    Ok(Value::Object(merged))
}

/// Encrypt a batch of records. Each record is independent; ordering carries
/// no meaning.
pub fn encrypt_records(
    records: &[Value],
    key: &MasterKey,
    sensitive: &[&str],
) -> Result<Vec<Value>, CodecError> {
    records
        .iter()
        .map(|record| encrypt_fields(record, key, sensitive))
        .collect()
}

/// Decrypt a batch of records, keeping per-record outcomes so one corrupted
/// row cannot block the rest of the batch.
pub fn decrypt_records(records: &[Value], key: &MasterKey) -> Vec<Result<Value, CodecError>> {
    records
        .iter()
        .map(|record| decrypt_fields(record, key))
        .collect()
}
