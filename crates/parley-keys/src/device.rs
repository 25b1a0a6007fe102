use std::sync::Arc;

use parley_crypto::signal::{KeyManager, ProtocolStore, SessionCipher};
use parley_crypto::Keychain;

use crate::config::KeysConfig;
use crate::directory::KeyDirectory;
use crate::error::Result;
use crate::initializer::DeviceInitializer;
use crate::keystore::StrongholdKeystore;
use crate::session_service::SessionService;
use crate::store::PersistentKeyStore;

/// One local device: its stores, key manager, bootstrap and sessions,
/// sharing a single protocol store.
pub struct Device {
    store: Arc<PersistentKeyStore>,
    keys: Arc<KeyManager>,
    initializer: DeviceInitializer,
    sessions: SessionService,
}

impl Device {
    /// Open the vault in `config.vault_dir` with `passphrase` and the record
    /// database at `config.database_path`.
    pub fn open(
        config: &KeysConfig,
        passphrase: &str,
        directory: Arc<dyn KeyDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let vault = StrongholdKeystore::open(&config.vault_dir, passphrase)?;
        Self::with_keychain(config, Arc::new(vault), directory)
    }

    /// Build a device over any vault, e.g. a [`MemoryKeychain`](crate::MemoryKeychain).
    pub fn with_keychain(
        config: &KeysConfig,
        keychain: Arc<dyn Keychain>,
        directory: Arc<dyn KeyDirectory>,
    ) -> Result<Self> {
        let store = Arc::new(PersistentKeyStore::open(keychain, &config.database_path)?);
        let protocol_store: Arc<dyn ProtocolStore> = store.clone();

        let keys = Arc::new(KeyManager::new(
            protocol_store.clone(),
            config.prekey_policy(),
        ));
        let initializer = DeviceInitializer::new(
            keys.clone(),
            directory,
            config.device_id,
            config.signed_prekey_max_age(),
        );
        let cipher = SessionCipher::new(protocol_store.clone(), config.trust_policy);
        let sessions = SessionService::new(protocol_store, cipher);

        tracing::debug!(
            device_id = config.device_id,
            database = %config.database_path,
            "device opened"
        );
        Ok(Self {
            store,
            keys,
            initializer,
            sessions,
        })
    }

    pub fn store(&self) -> &Arc<PersistentKeyStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn initializer(&self) -> &DeviceInitializer {
        &self.initializer
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }
}
