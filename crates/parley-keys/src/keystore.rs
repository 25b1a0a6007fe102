use std::collections::HashMap;
use std::path::Path;

use iota_stronghold::{KeyProvider, SnapshotPath, Stronghold};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use parley_crypto::{CryptoError, Keychain};

const SNAPSHOT_FILE: &str = "parley.stronghold";
const CLIENT_NAME: &[u8] = b"parley-keys";

/// Encrypted vault for the device's long-term secrets.
///
/// Secrets live in the Stronghold client store, encrypted at rest in a
/// snapshot file whose key is derived from a passphrase with `Argon2id`.
/// Writes stay in memory until [`Keychain::flush`].
pub struct StrongholdKeystore {
    stronghold: Stronghold,
    snapshot_path: SnapshotPath,
    keyprovider: KeyProvider,
}

impl StrongholdKeystore {
    /// Open the vault in `snapshot_dir`, loading an existing snapshot.
    /// A wrong passphrase fails here.
    pub fn open(snapshot_dir: &Path, passphrase: &str) -> Result<Self, CryptoError> {
        let snapshot_file = snapshot_dir.join(SNAPSHOT_FILE);
        let keyprovider = KeyProvider::try_from(derive_key(passphrase)?)
            .map_err(|e| CryptoError::StorageError(format!("vault key: {e:?}")))?;
        let snapshot_path = SnapshotPath::from_path(&snapshot_file);

        let stronghold = Stronghold::default();
        if snapshot_file.exists() {
            stronghold
                .load_snapshot(&keyprovider, &snapshot_path)
                .map_err(|e| CryptoError::StorageError(format!("unlock vault snapshot: {e}")))?;
        }

        stronghold
            .load_client(CLIENT_NAME)
            .or_else(|_| stronghold.create_client(CLIENT_NAME))
            .map_err(|e| CryptoError::StorageError(format!("open vault client: {e}")))?;

        Ok(Self {
            stronghold,
            snapshot_path,
            keyprovider,
        })
    }

    /// Remove the snapshot file, e.g. on account reset.
    pub fn delete_snapshot(snapshot_dir: &Path) -> Result<(), std::io::Error> {
        let snapshot_file = snapshot_dir.join(SNAPSHOT_FILE);
        if snapshot_file.exists() {
            std::fs::remove_file(snapshot_file)?;
        }
        Ok(())
    }

    fn client(&self) -> Result<iota_stronghold::Client, CryptoError> {
        self.stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| CryptoError::StorageError(format!("get client: {e}")))
    }
}

fn store_key_name(vault: &str, key: &str) -> String {
    format!("{vault}/{key}")
}

impl Keychain for StrongholdKeystore {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.client()?
            .store()
            .insert(store_key_name(vault, key).into_bytes(), data.to_vec(), None)
            .map_err(|e| CryptoError::StorageError(format!("vault write {vault}/{key}: {e}")))?;
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.client()?
            .store()
            .get(store_key_name(vault, key).as_bytes())
            .map_err(|e| CryptoError::StorageError(format!("vault read {vault}/{key}: {e}")))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.client()?
            .store()
            .delete(store_key_name(vault, key).as_bytes())
            .map_err(|e| CryptoError::StorageError(format!("vault delete {vault}/{key}: {e}")))?;
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        self.client()?
            .store()
            .contains_key(store_key_name(vault, key).as_bytes())
            .map_err(|e| CryptoError::StorageError(format!("vault lookup {vault}/{key}: {e}")))
    }

    fn flush(&self) -> Result<(), CryptoError> {
        self.stronghold
            .write_client(CLIENT_NAME)
            .map_err(|e| CryptoError::StorageError(format!("write client: {e}")))?;
        self.stronghold
            .commit_with_keyprovider(&self.snapshot_path, &self.keyprovider)
            .map_err(|e| CryptoError::StorageError(format!("commit snapshot: {e}")))
    }
}

/// Non-persistent keychain for tests and ephemeral devices.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert(store_key_name(vault, key), Zeroizing::new(data.to_vec()));
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&store_key_name(vault, key))
            .map(|v| v.to_vec()))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries.lock().remove(&store_key_name(vault, key));
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.entries.lock().contains_key(&store_key_name(vault, key)))
    }
}

/// Derive the 32-byte snapshot key from a passphrase using `Argon2id`.
///
/// Release: `m=65536, t=3, p=4`. Debug builds use `m=256, t=1, p=1`.
fn derive_key(passphrase: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let salt = b"parley-keys-vault-salt";

    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(32));
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(32));
    let params = params.map_err(|e| CryptoError::KeyGeneration(format!("argon2 params: {e}")))?;

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; 32]);
    hasher
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyGeneration(format!("argon2: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::keychain::{KEY_LOCAL_IDENTITY, VAULT_SIGNAL};
    use tempfile::TempDir;

    #[test]
    fn flushed_secret_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let secret = [7u8; 68];

        {
            let ks = StrongholdKeystore::open(dir.path(), "pass123").unwrap();
            ks.store_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY, &secret).unwrap();
            ks.flush().unwrap();
        }

        let ks = StrongholdKeystore::open(dir.path(), "pass123").unwrap();
        let loaded = ks
            .load_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY)
            .unwrap()
            .expect("secret should persist");
        assert_eq!(loaded, secret);
    }

    #[test]
    fn wrong_passphrase_rejects_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let ks = StrongholdKeystore::open(dir.path(), "correct-pass").unwrap();
            ks.store_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY, &[9u8; 4]).unwrap();
            ks.flush().unwrap();
        }

        assert!(StrongholdKeystore::open(dir.path(), "wrong-pass").is_err());
    }

    #[test]
    fn unflushed_writes_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let ks = StrongholdKeystore::open(dir.path(), "pw").unwrap();
            ks.store_key(VAULT_SIGNAL, "scratch", &[1]).unwrap();
        }
        let ks = StrongholdKeystore::open(dir.path(), "pw").unwrap();
        assert!(!ks.key_exists(VAULT_SIGNAL, "scratch").unwrap());
    }

    #[test]
    fn memory_keychain_exists_and_delete() {
        let ks = MemoryKeychain::new();
        assert!(!ks.key_exists(VAULT_SIGNAL, KEY_LOCAL_IDENTITY).unwrap());
        ks.store_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY, &[1u8; 32]).unwrap();
        assert!(ks.key_exists(VAULT_SIGNAL, KEY_LOCAL_IDENTITY).unwrap());
        ks.delete_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY).unwrap();
        assert_eq!(ks.load_key(VAULT_SIGNAL, KEY_LOCAL_IDENTITY).unwrap(), None);
    }
}
