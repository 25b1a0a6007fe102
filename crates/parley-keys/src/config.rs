use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_crypto::signal::{PreKeyPolicy, TrustPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{KeysError, Result};

/// Device-level settings, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Our device id within the user's device list.
    pub device_id: u32,
    /// One-time prekeys kept available after a refresh.
    pub prekey_batch_size: u32,
    /// Refresh when fewer than this many one-time prekeys remain.
    pub prekey_refresh_threshold: u32,
    /// Age after which the signed prekey is rotated.
    pub signed_prekey_max_age_days: u32,
    pub trust_policy: TrustPolicy,
    /// SQLite file for sessions and prekeys. `:memory:` is allowed.
    pub database_path: String,
    /// Directory holding the encrypted vault snapshot.
    pub vault_dir: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            prekey_batch_size: 100,
            prekey_refresh_threshold: 50,
            signed_prekey_max_age_days: 30,
            trust_policy: TrustPolicy::default(),
            database_path: "parley-keys.db".to_string(),
            vault_dir: PathBuf::from("."),
        }
    }
}

impl KeysConfig {
    /// Read and validate a JSON config file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KeysError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| KeysError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prekey_batch_size == 0 {
            return Err(KeysError::Config("prekey_batch_size must be positive".into()));
        }
        if self.prekey_refresh_threshold > self.prekey_batch_size {
            return Err(KeysError::Config(format!(
                "prekey_refresh_threshold ({}) exceeds prekey_batch_size ({})",
                self.prekey_refresh_threshold, self.prekey_batch_size
            )));
        }
        Ok(())
    }

    pub fn prekey_policy(&self) -> PreKeyPolicy {
        PreKeyPolicy {
            batch_size: self.prekey_batch_size,
            refresh_threshold: self.prekey_refresh_threshold,
        }
    }

    pub fn signed_prekey_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.signed_prekey_max_age_days) * 24 * 60 * 60)
    }
}
