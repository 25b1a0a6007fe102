//! Remote key directory.
//!
//! Devices publish their key bundle as one document per device under
//! `users/{user_id}/devices/{device_id}`. Peers fetch bundles to start
//! sessions and strike the embedded one-time prekey in the same transaction
//! as the read.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use parley_crypto::signal::{BundledPreKey, DeviceKeyBundle};

use crate::error::{KeysError, Result};

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Upsert one device's bundle.
    async fn publish(&self, user_id: &str, bundle: &DeviceKeyBundle) -> Result<()>;

    async fn fetch_all(&self, user_id: &str) -> Result<Vec<DeviceKeyBundle>>;

    async fn fetch_one(&self, user_id: &str, device_id: u32) -> Result<Option<DeviceKeyBundle>>;

    /// Read and clear the device's one-time prekey atomically. Of any number
    /// of racing callers, at most one gets `Some`.
    async fn consume_one_time_prekey(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> Result<Option<BundledPreKey>>;

    async fn delete(&self, user_id: &str, device_id: u32) -> Result<()>;
}

/// Fetch a device's bundle and claim its one-time prekey.
///
/// The returned bundle carries only the prekey this caller actually won,
/// so a lost race yields a bundle without one.
pub async fn claim_bundle(
    directory: &dyn KeyDirectory,
    user_id: &str,
    device_id: u32,
) -> Result<Option<DeviceKeyBundle>> {
    let Some(bundle) = directory.fetch_one(user_id, device_id).await? else {
        return Ok(None);
    };
    let prekey = directory.consume_one_time_prekey(user_id, device_id).await?;
    if prekey.is_none() {
        tracing::debug!(user_id, device_id, "no one-time prekey left to claim");
    }
    Ok(Some(bundle.with_prekey(prekey)))
}

/// Directory document for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: String,
    pub signed_pre_key_signature: String,
    pub pre_key_id: Option<u32>,
    pub pre_key_public: Option<String>,
    pub timestamp: i64,
}

impl From<&DeviceKeyBundle> for DeviceRecord {
    fn from(bundle: &DeviceKeyBundle) -> Self {
        Self {
            device_id: bundle.device_id,
            registration_id: bundle.registration_id,
            identity_key: STANDARD.encode(&bundle.identity_key),
            signed_pre_key_id: bundle.signed_prekey_id,
            signed_pre_key_public: STANDARD.encode(&bundle.signed_prekey_public),
            signed_pre_key_signature: STANDARD.encode(&bundle.signed_prekey_signature),
            pre_key_id: bundle.prekey.as_ref().map(|p| p.id),
            pre_key_public: bundle.prekey.as_ref().map(|p| STANDARD.encode(&p.public_key)),
            timestamp: bundle.timestamp,
        }
    }
}

impl DeviceRecord {
    /// The one-time prekey fields, if both are present.
    fn prekey(&self) -> Result<Option<BundledPreKey>> {
        match (self.pre_key_id, &self.pre_key_public) {
            (Some(id), Some(public)) => Ok(Some(BundledPreKey {
                id,
                public_key: decode("preKeyPublic", public)?,
            })),
            _ => Ok(None),
        }
    }

    pub fn to_bundle(&self) -> Result<DeviceKeyBundle> {
        Ok(DeviceKeyBundle {
            device_id: self.device_id,
            registration_id: self.registration_id,
            identity_key: decode("identityKey", &self.identity_key)?,
            signed_prekey_id: self.signed_pre_key_id,
            signed_prekey_public: decode("signedPreKeyPublic", &self.signed_pre_key_public)?,
            signed_prekey_signature: decode(
                "signedPreKeySignature",
                &self.signed_pre_key_signature,
            )?,
            prekey: self.prekey()?,
            timestamp: self.timestamp,
        })
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| KeysError::Directory(format!("{field} is not valid base64: {e}")))
}

/// In-process directory holding JSON documents.
///
/// Each operation runs under one lock, which makes the consume a true
/// read-then-clear transaction.
#[derive(Default)]
pub struct MemoryKeyDirectory {
    users: Mutex<HashMap<String, BTreeMap<u32, serde_json::Value>>>,
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document as stored, for inspection.
    pub fn document(&self, user_id: &str, device_id: u32) -> Option<serde_json::Value> {
        self.users
            .lock()
            .get(user_id)
            .and_then(|devices| devices.get(&device_id))
            .cloned()
    }
}

fn parse_record(doc: &serde_json::Value) -> Result<DeviceRecord> {
    DeviceRecord::deserialize(doc)
        .map_err(|e| KeysError::Directory(format!("malformed device document: {e}")))
}

#[async_trait]
impl KeyDirectory for MemoryKeyDirectory {
    async fn publish(&self, user_id: &str, bundle: &DeviceKeyBundle) -> Result<()> {
        let doc = serde_json::to_value(DeviceRecord::from(bundle))
            .map_err(|e| KeysError::Directory(format!("encode device document: {e}")))?;
        self.users
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(bundle.device_id, doc);
        tracing::debug!(user_id, device_id = bundle.device_id, "bundle published");
        Ok(())
    }

    async fn fetch_all(&self, user_id: &str) -> Result<Vec<DeviceKeyBundle>> {
        let users = self.users.lock();
        let Some(devices) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        devices
            .values()
            .map(|doc| parse_record(doc)?.to_bundle())
            .collect()
    }

    async fn fetch_one(&self, user_id: &str, device_id: u32) -> Result<Option<DeviceKeyBundle>> {
        self.document(user_id, device_id)
            .map(|doc| parse_record(&doc)?.to_bundle())
            .transpose()
    }

    async fn consume_one_time_prekey(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> Result<Option<BundledPreKey>> {
        let mut users = self.users.lock();
        let Some(doc) = users
            .get_mut(user_id)
            .and_then(|devices| devices.get_mut(&device_id))
        else {
            return Ok(None);
        };

        let prekey = parse_record(doc)?.prekey()?;
        if prekey.is_some() {
            doc["preKeyId"] = serde_json::Value::Null;
            doc["preKeyPublic"] = serde_json::Value::Null;
        }
        Ok(prekey)
    }

    async fn delete(&self, user_id: &str, device_id: u32) -> Result<()> {
        let mut users = self.users.lock();
        if let Some(devices) = users.get_mut(user_id) {
            devices.remove(&device_id);
            if devices.is_empty() {
                users.remove(user_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn bundle(device_id: u32, prekey_id: Option<u32>) -> DeviceKeyBundle {
        DeviceKeyBundle {
            device_id,
            registration_id: 1234,
            identity_key: vec![1; 32],
            signed_prekey_id: 77,
            signed_prekey_public: vec![2; 32],
            signed_prekey_signature: vec![3; 64],
            prekey: prekey_id.map(|id| BundledPreKey {
                id,
                public_key: vec![4; 32],
            }),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn document_uses_camel_case_base64_fields() {
        let dir = MemoryKeyDirectory::new();
        dir.publish("alice", &bundle(1, Some(7))).await.unwrap();

        let doc = dir.document("alice", 1).unwrap();
        assert_eq!(doc["deviceId"], 1);
        assert_eq!(doc["preKeyId"], 7);
        assert_eq!(doc["identityKey"], STANDARD.encode([1u8; 32]));
        assert_eq!(doc["signedPreKeySignature"], STANDARD.encode([3u8; 64]));
        assert_eq!(doc["timestamp"], 1_700_000_000_000_i64);
    }

    #[tokio::test]
    async fn consume_clears_prekey_once() {
        let dir = MemoryKeyDirectory::new();
        dir.publish("alice", &bundle(1, Some(7))).await.unwrap();

        let first = dir.consume_one_time_prekey("alice", 1).await.unwrap();
        assert_eq!(first.map(|p| p.id), Some(7));
        assert!(dir.consume_one_time_prekey("alice", 1).await.unwrap().is_none());

        let doc = dir.document("alice", 1).unwrap();
        assert!(doc["preKeyId"].is_null());
        assert!(doc["preKeyPublic"].is_null());
        let fetched = dir.fetch_one("alice", 1).await.unwrap().unwrap();
        assert!(fetched.prekey.is_none());
        assert_eq!(fetched.signed_prekey_id, 77);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_consumers_get_at_most_one_prekey() {
        let dir = Arc::new(MemoryKeyDirectory::new());
        dir.publish("victim", &bundle(1, Some(42))).await.unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.consume_one_time_prekey("victim", 1).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_bundle_carries_only_the_won_prekey() {
        let dir = MemoryKeyDirectory::new();
        dir.publish("bob", &bundle(2, Some(5))).await.unwrap();

        let first = claim_bundle(&dir, "bob", 2).await.unwrap().unwrap();
        assert_eq!(first.prekey.map(|p| p.id), Some(5));
        let second = claim_bundle(&dir, "bob", 2).await.unwrap().unwrap();
        assert!(second.prekey.is_none());
        assert!(claim_bundle(&dir, "bob", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_all_and_delete() {
        let dir = MemoryKeyDirectory::new();
        dir.publish("carol", &bundle(1, None)).await.unwrap();
        dir.publish("carol", &bundle(2, Some(1))).await.unwrap();
        dir.publish("carol", &bundle(2, Some(3))).await.unwrap();

        let all = dir.fetch_all("carol").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].prekey.as_ref().map(|p| p.id), Some(3));

        dir.delete("carol", 1).await.unwrap();
        dir.delete("carol", 2).await.unwrap();
        assert!(dir.fetch_all("carol").await.unwrap().is_empty());
        assert!(dir.fetch_all("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn bad_base64_is_a_directory_error() {
        let mut record = DeviceRecord::from(&bundle(1, None));
        record.identity_key = "***".into();
        assert!(matches!(record.to_bundle(), Err(KeysError::Directory(_))));
    }
}
