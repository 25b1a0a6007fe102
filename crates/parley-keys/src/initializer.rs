use std::sync::Arc;
use std::time::Duration;

use parley_crypto::signal::{DeviceKeyBundle, KeyManager};
use tokio::sync::Mutex;

use crate::directory::KeyDirectory;
use crate::error::Result;
use crate::run_blocking;

/// Bootstrap progress for this process. Not persisted: every step is
/// idempotent, so a restart simply re-runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initialized,
}

/// First-run bootstrap: local key material plus the published bundle.
pub struct DeviceInitializer {
    keys: Arc<KeyManager>,
    directory: Arc<dyn KeyDirectory>,
    device_id: u32,
    signed_prekey_max_age: Duration,
    state: Mutex<InitState>,
}

impl DeviceInitializer {
    pub fn new(
        keys: Arc<KeyManager>,
        directory: Arc<dyn KeyDirectory>,
        device_id: u32,
        signed_prekey_max_age: Duration,
    ) -> Self {
        Self {
            keys,
            directory,
            device_id,
            signed_prekey_max_age,
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    pub async fn state(&self) -> InitState {
        *self.state.lock().await
    }

    /// Ensure identity, signed prekey and one-time prekeys exist, then
    /// publish the bundle. Returns false if any step failed; the state stays
    /// `Uninitialized` and the call can be retried.
    pub async fn initialize_device_if_needed(&self, user_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if *state == InitState::Initialized {
            return true;
        }

        match self.bootstrap(user_id).await {
            Ok(()) => {
                *state = InitState::Initialized;
                tracing::info!(user_id, device_id = self.device_id, "device initialized");
                true
            }
            Err(e) => {
                tracing::error!(user_id, device_id = self.device_id, error = %e, "device initialization failed");
                false
            }
        }
    }

    async fn bootstrap(&self, user_id: &str) -> Result<()> {
        let keys = self.keys.clone();
        let max_age = self.signed_prekey_max_age;
        let device_id = self.device_id;

        let bundle = run_blocking(move || {
            keys.ensure_identity_keys()?;
            keys.rotate_signed_prekey(max_age)?;

            let batch = keys.policy().batch_size as usize;
            let missing = batch.saturating_sub(keys.prekey_count()?);
            if missing > 0 {
                keys.generate_one_time_prekeys(u32::try_from(missing).unwrap_or(u32::MAX), None)?;
            }
            keys.create_device_key_bundle(device_id)
        })
        .await?;

        self.publish(user_id, &bundle).await
    }

    /// Top up one-time prekeys and rotate a stale signed prekey, then
    /// republish if anything changed. Returns whether it republished.
    pub async fn refresh_prekeys_if_needed(&self, user_id: &str) -> Result<bool> {
        let keys = self.keys.clone();
        let max_age = self.signed_prekey_max_age;
        let device_id = self.device_id;

        let bundle = run_blocking(move || {
            let refreshed = keys.refresh_prekeys_if_needed()?;
            let rotated = keys.rotate_signed_prekey(max_age)?;
            if refreshed || rotated {
                keys.create_device_key_bundle(device_id).map(Some)
            } else {
                Ok(None)
            }
        })
        .await?;

        match bundle {
            Some(bundle) => {
                self.publish(user_id, &bundle).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forget that this process bootstrapped, e.g. on logout.
    pub async fn reset(&self) {
        *self.state.lock().await = InitState::Uninitialized;
    }

    async fn publish(&self, user_id: &str, bundle: &DeviceKeyBundle) -> Result<()> {
        self.directory.publish(user_id, bundle).await?;
        tracing::debug!(
            user_id,
            device_id = bundle.device_id,
            prekey_id = ?bundle.prekey.as_ref().map(|p| p.id),
            "published key bundle"
        );
        Ok(())
    }
}
