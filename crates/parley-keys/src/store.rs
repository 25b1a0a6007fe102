//! Durable protocol store.
//!
//! The local identity key pair and registration id live in the encrypted
//! vault behind [`Keychain`]. Everything else lives in SQLite: pinned remote
//! identities, session records, one-time and signed prekeys, and the prekey
//! id watermark. Every operation is a single statement or transaction, so a
//! crash never leaves a half-written record.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use parley_crypto::keychain::{KEY_LOCAL_IDENTITY, VAULT_SIGNAL};
use parley_crypto::signal::{
    IdentityKeyStore, PreKeyRecord, PreKeyStore, ProtocolAddress, ProtocolStore, SessionRecord,
    SessionStore, SignedPreKeyRecord, SignedPreKeyStore, MAX_PREKEY_ID,
};
use parley_crypto::{CryptoError, IdentityKey, IdentityKeyPair, Keychain};

use crate::db;
use crate::error::Result;

const NEXT_PREKEY_ID: &str = "next_prekey_id";

pub struct PersistentKeyStore {
    keychain: Arc<dyn Keychain>,
    conn: Mutex<Connection>,
}

impl PersistentKeyStore {
    /// Open the record database at `database_path` next to an open vault.
    pub fn open(keychain: Arc<dyn Keychain>, database_path: &str) -> Result<Self> {
        let (conn, schema_reset) = db::open(database_path)?;
        if schema_reset {
            tracing::debug!(path = database_path, "initialized key database");
        }
        Ok(Self {
            keychain,
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> std::result::Result<T, CryptoError> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(storage_error)
    }
}

fn storage_error(e: rusqlite::Error) -> CryptoError {
    CryptoError::StorageError(format!("sqlite: {e}"))
}

impl IdentityKeyStore for PersistentKeyStore {
    fn get_identity_key_pair(&self) -> std::result::Result<IdentityKeyPair, CryptoError> {
        let bytes = self
            .keychain
            .load_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY)?
            .ok_or(CryptoError::UninitializedIdentity)?;
        let pair = bytes
            .get(4..)
            .ok_or_else(|| CryptoError::InvalidKey("local identity record truncated".into()))?;
        IdentityKeyPair::deserialize(pair)
    }

    fn get_local_registration_id(&self) -> std::result::Result<u32, CryptoError> {
        let bytes = self
            .keychain
            .load_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY)?
            .ok_or(CryptoError::UninitializedIdentity)?;
        let raw: [u8; 4] = bytes
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| CryptoError::InvalidKey("local identity record truncated".into()))?;
        Ok(u32::from_le_bytes(raw))
    }

    fn save_identity_key_pair(
        &self,
        pair: &IdentityKeyPair,
        registration_id: u32,
    ) -> std::result::Result<(), CryptoError> {
        let mut record = zeroize::Zeroizing::new(registration_id.to_le_bytes().to_vec());
        record.extend_from_slice(&pair.serialize());
        self.keychain.store_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY, &record)?;
        self.keychain.flush()
    }

    fn clear_local_identity(&self) -> std::result::Result<(), CryptoError> {
        self.keychain.delete_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY)?;
        self.keychain.flush()
    }

    fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> std::result::Result<Option<IdentityKey>, CryptoError> {
        let bytes: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT identity_key FROM trusted_identities WHERE name = ?1 AND device_id = ?2",
                params![address.name(), address.device_id()],
                |row| row.get(0),
            )
            .optional()
        })?;
        bytes.map(|b| IdentityKey::from_bytes(&b)).transpose()
    }

    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> std::result::Result<bool, CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let replaced = pin_identity(&tx, address, identity)?;
            tx.commit()?;
            Ok(replaced)
        })
    }
}

/// Upsert the pinned key for `address`. Returns true if a different key
/// was replaced.
fn pin_identity(
    conn: &Connection,
    address: &ProtocolAddress,
    identity: &IdentityKey,
) -> rusqlite::Result<bool> {
    let key = identity.as_bytes().to_vec();
    let previous: Option<Vec<u8>> = conn
        .query_row(
            "SELECT identity_key FROM trusted_identities WHERE name = ?1 AND device_id = ?2",
            params![address.name(), address.device_id()],
            |row| row.get(0),
        )
        .optional()?;
    if previous.as_deref() != Some(key.as_slice()) {
        conn.execute(
            "INSERT INTO trusted_identities (name, device_id, identity_key, first_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (name, device_id) DO UPDATE SET
                identity_key = excluded.identity_key,
                first_seen = excluded.first_seen",
            params![address.name(), address.device_id(), key, db::timestamp_now()],
        )?;
    }
    Ok(previous.is_some_and(|p| p != key))
}

fn upsert_session(
    conn: &Connection,
    address: &ProtocolAddress,
    record: &[u8],
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sessions (name, device_id, record, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (name, device_id) DO UPDATE SET
            record = excluded.record,
            updated_at = excluded.updated_at",
        params![address.name(), address.device_id(), record, db::timestamp_now()],
    )
    .map(|_| ())
}

impl PreKeyStore for PersistentKeyStore {
    fn load_prekey(&self, id: u32) -> std::result::Result<PreKeyRecord, CryptoError> {
        let bytes: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.query_row("SELECT record FROM prekeys WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
        })?;
        let bytes = bytes.ok_or_else(|| CryptoError::KeyNotFound(format!("prekey {id}")))?;
        PreKeyRecord::deserialize(&bytes)
    }

    fn store_prekey(&self, record: &PreKeyRecord) -> std::result::Result<(), CryptoError> {
        let bytes = record.serialize()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO prekeys (id, record) VALUES (?1, ?2)",
                params![record.id(), bytes],
            )
            .map(|_| ())
        })
    }

    fn remove_prekey(&self, id: u32) -> std::result::Result<bool, CryptoError> {
        let removed =
            self.with_conn(|conn| conn.execute("DELETE FROM prekeys WHERE id = ?1", [id]))?;
        Ok(removed > 0)
    }

    fn contains_prekey(&self, id: u32) -> std::result::Result<bool, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM prekeys WHERE id = ?1)",
                [id],
                |row| row.get(0),
            )
        })
    }

    fn prekey_ids(&self) -> std::result::Result<Vec<u32>, CryptoError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM prekeys ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<u32>>>()?;
            Ok(ids)
        })
    }

    fn prekey_count(&self) -> std::result::Result<usize, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM prekeys", [], |row| row.get(0))
        })
    }

    fn next_prekey_id(&self) -> std::result::Result<u32, CryptoError> {
        let stored: Option<u32> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                [NEXT_PREKEY_ID],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(match stored {
            Some(id) if (1..=MAX_PREKEY_ID).contains(&id) => id,
            _ => 1,
        })
    }

    fn set_next_prekey_id(&self, id: u32) -> std::result::Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![NEXT_PREKEY_ID, id],
            )
            .map(|_| ())
        })
    }
}

impl SignedPreKeyStore for PersistentKeyStore {
    fn load_signed_prekey(&self, id: u32) -> std::result::Result<SignedPreKeyRecord, CryptoError> {
        let bytes: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM signed_prekeys WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
        })?;
        let bytes = bytes.ok_or_else(|| CryptoError::KeyNotFound(format!("signed prekey {id}")))?;
        SignedPreKeyRecord::deserialize(&bytes)
    }

    fn load_signed_prekeys(&self) -> std::result::Result<Vec<SignedPreKeyRecord>, CryptoError> {
        let blobs: Vec<Vec<u8>> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT record FROM signed_prekeys ORDER BY created_at, id")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
            Ok(rows)
        })?;
        blobs
            .iter()
            .map(|b| SignedPreKeyRecord::deserialize(b))
            .collect()
    }

    fn store_signed_prekey(
        &self,
        record: &SignedPreKeyRecord,
    ) -> std::result::Result<(), CryptoError> {
        let bytes = record.serialize()?;
        let created_at = i64::try_from(record.timestamp()).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO signed_prekeys (id, record, created_at) VALUES (?1, ?2, ?3)",
                params![record.id(), bytes, created_at],
            )
            .map(|_| ())
        })
    }

    fn contains_signed_prekey(&self, id: u32) -> std::result::Result<bool, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM signed_prekeys WHERE id = ?1)",
                [id],
                |row| row.get(0),
            )
        })
    }

    fn remove_signed_prekey(&self, id: u32) -> std::result::Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM signed_prekeys WHERE id = ?1", [id])
                .map(|_| ())
        })
    }
}

impl SessionStore for PersistentKeyStore {
    fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> std::result::Result<SessionRecord, CryptoError> {
        let bytes: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM sessions WHERE name = ?1 AND device_id = ?2",
                params![address.name(), address.device_id()],
                |row| row.get(0),
            )
            .optional()
        })?;
        match bytes {
            Some(b) => SessionRecord::deserialize(&b),
            None => Ok(SessionRecord::new_fresh()),
        }
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> std::result::Result<(), CryptoError> {
        let bytes = record.serialize()?;
        self.with_conn(|conn| upsert_session(conn, address, &bytes))
    }

    fn delete_session(&self, address: &ProtocolAddress) -> std::result::Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE name = ?1 AND device_id = ?2",
                params![address.name(), address.device_id()],
            )
            .map(|_| ())
        })
    }

    fn delete_all_sessions(&self, name: &str) -> std::result::Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE name = ?1", [name])
                .map(|_| ())
        })
    }

    fn sub_device_sessions(&self, name: &str) -> std::result::Result<Vec<u32>, CryptoError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT device_id FROM sessions WHERE name = ?1 ORDER BY device_id")?;
            let ids = stmt
                .query_map([name], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<u32>>>()?;
            Ok(ids)
        })
    }
}

impl ProtocolStore for PersistentKeyStore {
    fn commit_handshake(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        record: &SessionRecord,
        prekey_id: Option<u32>,
    ) -> std::result::Result<bool, CryptoError> {
        let bytes = record.serialize()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(id) = prekey_id {
                if tx.execute("DELETE FROM prekeys WHERE id = ?1", [id])? == 0 {
                    return Ok(false);
                }
            }
            pin_identity(&tx, address, identity)?;
            upsert_session(&tx, address, &bytes)?;
            tx.commit()?;
            Ok(true)
        })
    }
}
