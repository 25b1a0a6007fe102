//! Async session front end for the chat send/receive paths.
//!
//! Every load-mutate-store of a session runs on the blocking pool holding
//! that address's lock, so an encrypt and a decrypt for the same peer device
//! never interleave. The guard moves into the blocking closure: a caller that
//! is cancelled mid-operation does not release the lock before the write-back.

use std::collections::HashMap;
use std::sync::Arc;

use parley_crypto::signal::{
    CiphertextMessage, CiphertextMessageType, DeviceKeyBundle, ProtocolAddress, ProtocolStore,
    SessionCipher,
};
use parley_crypto::{CryptoError, IdentityKey};
use tokio::sync::OwnedMutexGuard;

use crate::directory::{claim_bundle, KeyDirectory};
use crate::error::Result;
use crate::run_blocking;

pub struct SessionService {
    store: Arc<dyn ProtocolStore>,
    cipher: Arc<SessionCipher>,
    locks: parking_lot::Mutex<HashMap<ProtocolAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionService {
    pub fn new(store: Arc<dyn ProtocolStore>, cipher: SessionCipher) -> Self {
        Self {
            store,
            cipher: Arc::new(cipher),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, address: &ProtocolAddress) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock();
            // Drop slots nobody holds or waits on.
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            locks.entry(address.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Run the handshake against `bundle` unless an established session
    /// already exists for that device.
    pub async fn build_session_for_remote(
        &self,
        user_id: &str,
        bundle: &DeviceKeyBundle,
    ) -> Result<()> {
        let address = ProtocolAddress::new(user_id, bundle.device_id);
        let guard = self.lock(&address).await;

        let store = self.store.clone();
        let cipher = self.cipher.clone();
        let bundle = bundle.clone();
        run_blocking(move || {
            let _guard = guard;
            if store.contains_session(&address)? {
                tracing::debug!(%address, "session already established; keeping it");
                return Ok(());
            }
            cipher.process_prekey_bundle(&address, &bundle)
        })
        .await
    }

    /// Claim bundles from `directory` and build sessions for every device of
    /// `user_id` that has none yet. Returns how many were built.
    pub async fn build_sessions_with_user(
        &self,
        directory: &dyn KeyDirectory,
        user_id: &str,
    ) -> Result<usize> {
        let mut built = 0;
        for device in directory.fetch_all(user_id).await? {
            if self.has_session(user_id, device.device_id).await? {
                continue;
            }
            let Some(bundle) = claim_bundle(directory, user_id, device.device_id).await? else {
                continue;
            };
            self.build_session_for_remote(user_id, &bundle).await?;
            built += 1;
        }
        Ok(built)
    }

    pub async fn has_session(&self, user_id: &str, device_id: u32) -> Result<bool> {
        let address = ProtocolAddress::new(user_id, device_id);
        let store = self.store.clone();
        run_blocking(move || store.contains_session(&address)).await
    }

    /// Fails with `NoSession` until a session was built or received.
    pub async fn encrypt_message(
        &self,
        user_id: &str,
        device_id: u32,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage> {
        let address = ProtocolAddress::new(user_id, device_id);
        let guard = self.lock(&address).await;

        let cipher = self.cipher.clone();
        let plaintext = plaintext.to_vec();
        run_blocking(move || {
            let _guard = guard;
            cipher.encrypt(&address, &plaintext)
        })
        .await
    }

    /// Decrypt wire bytes tagged with their ciphertext type. A handshake
    /// message builds or updates the sender's session.
    ///
    /// Replays fail with a duplicate error that callers should drop
    /// silently; see [`KeysError::is_duplicate`](crate::KeysError::is_duplicate).
    pub async fn decrypt_message(
        &self,
        sender_id: &str,
        device_id: u32,
        ciphertext: &[u8],
        ciphertext_type: u8,
    ) -> Result<Vec<u8>> {
        let message_type = CiphertextMessageType::try_from(ciphertext_type)?;
        let message = CiphertextMessage::parse(message_type, ciphertext)?;

        let address = ProtocolAddress::new(sender_id, device_id);
        let guard = self.lock(&address).await;

        let cipher = self.cipher.clone();
        run_blocking(move || {
            let _guard = guard;
            cipher.decrypt(&address, &message)
        })
        .await
    }

    pub async fn encrypt_text(
        &self,
        user_id: &str,
        device_id: u32,
        text: &str,
    ) -> Result<CiphertextMessage> {
        self.encrypt_message(user_id, device_id, text.as_bytes()).await
    }

    pub async fn decrypt_text(
        &self,
        sender_id: &str,
        device_id: u32,
        ciphertext: &[u8],
        ciphertext_type: u8,
    ) -> Result<String> {
        let bytes = self
            .decrypt_message(sender_id, device_id, ciphertext, ciphertext_type)
            .await?;
        String::from_utf8(bytes).map_err(|e| {
            CryptoError::InvalidMessage(format!("plaintext is not UTF-8: {e}")).into()
        })
    }

    pub async fn delete_session(&self, user_id: &str, device_id: u32) -> Result<()> {
        let address = ProtocolAddress::new(user_id, device_id);
        let guard = self.lock(&address).await;

        let store = self.store.clone();
        run_blocking(move || {
            let _guard = guard;
            store.delete_session(&address)
        })
        .await
    }

    pub async fn delete_all_sessions_with_user(&self, user_id: &str) -> Result<()> {
        let store = self.store.clone();
        let name = user_id.to_string();
        let devices = run_blocking(move || store.sub_device_sessions(&name)).await?;

        let mut guards = Vec::with_capacity(devices.len());
        for device_id in devices {
            guards.push(self.lock(&ProtocolAddress::new(user_id, device_id)).await);
        }

        let store = self.store.clone();
        let name = user_id.to_string();
        run_blocking(move || {
            let _guards = guards;
            store.delete_all_sessions(&name)
        })
        .await?;
        tracing::info!(user_id, "deleted all sessions");
        Ok(())
    }

    /// Retire the current ratchet state; in-flight messages still decrypt.
    pub async fn archive_session(&self, user_id: &str, device_id: u32) -> Result<()> {
        let address = ProtocolAddress::new(user_id, device_id);
        let guard = self.lock(&address).await;

        let store = self.store.clone();
        run_blocking(move || {
            let _guard = guard;
            store.archive_session(&address)
        })
        .await
    }

    /// Accept a changed identity key after out-of-band verification.
    /// Returns whether a different key was replaced.
    pub async fn trust_identity(
        &self,
        user_id: &str,
        device_id: u32,
        identity_key: &[u8],
    ) -> Result<bool> {
        let identity = IdentityKey::from_bytes(identity_key)?;
        let address = ProtocolAddress::new(user_id, device_id);
        let guard = self.lock(&address).await;

        let cipher = self.cipher.clone();
        run_blocking(move || {
            let _guard = guard;
            cipher.trust_identity(&address, &identity)
        })
        .await
    }
}
