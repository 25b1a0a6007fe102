//! Generation, rotation and bundling of local key material.
//!
//! Pure orchestration over a [`ProtocolStore`]; nothing here touches the
//! network.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::signal::prekeys::{BundledPreKey, DeviceKeyBundle, PreKeyRecord, SignedPreKeyRecord};
use crate::signal::store::{MAX_PREKEY_ID, ProtocolStore};

/// Registration ids are 14-bit, never zero.
const MAX_REGISTRATION_ID: u32 = 16_380;

/// One-time prekey batch sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreKeyPolicy {
    /// Target number of unconsumed prekeys after a refresh.
    pub batch_size: u32,
    /// Refresh runs when fewer than this many remain.
    pub refresh_threshold: u32,
}

impl Default for PreKeyPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            refresh_threshold: 50,
        }
    }
}

pub struct KeyManager {
    store: Arc<dyn ProtocolStore>,
    policy: PreKeyPolicy,
}

impl KeyManager {
    pub fn new(store: Arc<dyn ProtocolStore>, policy: PreKeyPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> PreKeyPolicy {
        self.policy
    }

    /// Unconsumed one-time prekeys in the store.
    pub fn prekey_count(&self) -> Result<usize, CryptoError> {
        self.store.prekey_count()
    }

    /// Return the local identity, creating one if it is missing or corrupt.
    ///
    /// Corrupt state is cleared before the replacement is written. Storage
    /// I/O failures propagate unchanged.
    pub fn ensure_identity_keys(&self) -> Result<IdentityKeyPair, CryptoError> {
        let existing = self
            .store
            .get_identity_key_pair()
            .and_then(|pair| self.store.get_local_registration_id().map(|_| pair));

        match existing {
            Ok(pair) => return Ok(pair),
            Err(e @ CryptoError::StorageError(_)) => return Err(e),
            Err(CryptoError::UninitializedIdentity) => {
                debug!("no local identity yet");
            }
            Err(e) => {
                warn!(error = %e, "local identity unreadable; regenerating");
            }
        }

        self.store.clear_local_identity()?;
        let pair = IdentityKeyPair::generate();
        let registration_id = rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID);
        self.store.save_identity_key_pair(&pair, registration_id)?;

        info!(
            registration_id,
            fingerprint = %pair.identity_key().fingerprint(),
            "generated local identity"
        );
        Ok(pair)
    }

    /// Generate, sign and store a signed prekey with a time-derived id.
    pub fn generate_signed_prekey(&self) -> Result<SignedPreKeyRecord, CryptoError> {
        let identity = self.store.get_identity_key_pair()?;
        let now = now_millis();

        // Seconds since the epoch, kept within a positive i32.
        let mut id = ((now / 1000) & 0x7FFF_FFFF) as u32;
        while self.store.contains_signed_prekey(id)? {
            id = id.wrapping_add(1) & 0x7FFF_FFFF;
        }

        let record = SignedPreKeyRecord::generate(id, now, &identity);
        self.store.store_signed_prekey(&record)?;
        debug!(signed_prekey_id = id, "generated signed prekey");
        Ok(record)
    }

    /// Generate and store `count` one-time prekeys.
    ///
    /// Ids start at `start_id` when given, otherwise at the store's
    /// watermark. Ids still held by unconsumed prekeys are skipped, and the
    /// sequence wraps from [`MAX_PREKEY_ID`] back to 1.
    pub fn generate_one_time_prekeys(
        &self,
        count: u32,
        start_id: Option<u32>,
    ) -> Result<Vec<PreKeyRecord>, CryptoError> {
        if count > MAX_PREKEY_ID {
            return Err(CryptoError::KeyGeneration(format!(
                "cannot generate {count} prekeys at once"
            )));
        }

        let mut id = match start_id {
            Some(id) => clamp_prekey_id(id),
            None => self.store.next_prekey_id()?,
        };
        let mut records = Vec::with_capacity(count as usize);
        let mut probed = 0u32;

        while records.len() < count as usize {
            if probed > MAX_PREKEY_ID {
                return Err(CryptoError::KeyGeneration("prekey id space exhausted".into()));
            }
            probed += 1;

            if !self.store.contains_prekey(id)? {
                let record = PreKeyRecord::generate(id);
                self.store.store_prekey(&record)?;
                records.push(record);
            }
            id = next_prekey_id(id);
        }

        self.store.set_next_prekey_id(id)?;
        debug!(count, next_prekey_id = id, "generated one-time prekeys");
        Ok(records)
    }

    /// Snapshot of the public key material for `device_id`.
    ///
    /// Uses the newest signed prekey (generating one if none exist) and the
    /// lowest unconsumed one-time prekey, if any.
    pub fn create_device_key_bundle(&self, device_id: u32) -> Result<DeviceKeyBundle, CryptoError> {
        let identity = self.store.get_identity_key_pair()?;
        let registration_id = self.store.get_local_registration_id()?;

        let signed_prekey = match self.store.load_signed_prekeys()?.pop() {
            Some(record) => record,
            None => self.generate_signed_prekey()?,
        };

        let prekey = match self.store.prekey_ids()?.first() {
            Some(&id) => {
                let record = self.store.load_prekey(id)?;
                Some(BundledPreKey {
                    id,
                    public_key: record.public_key().to_vec(),
                })
            }
            None => {
                warn!(device_id, "no one-time prekeys left; bundling without one");
                None
            }
        };

        Ok(DeviceKeyBundle {
            device_id,
            registration_id,
            identity_key: identity.identity_key().as_bytes().to_vec(),
            signed_prekey_id: signed_prekey.id(),
            signed_prekey_public: signed_prekey.public_key().to_vec(),
            signed_prekey_signature: signed_prekey.signature().to_vec(),
            prekey,
            timestamp: i64::try_from(now_millis()).unwrap_or(i64::MAX),
        })
    }

    /// Top the one-time prekeys back up to the batch size when fewer than
    /// the threshold remain. Returns whether any were generated.
    pub fn refresh_prekeys_if_needed(&self) -> Result<bool, CryptoError> {
        let remaining = self.store.prekey_count()?;
        let threshold = self.policy.refresh_threshold as usize;
        let target = self.policy.batch_size as usize;
        if remaining >= threshold {
            return Ok(false);
        }

        let missing = target.saturating_sub(remaining);
        if missing == 0 {
            return Ok(false);
        }
        let count = u32::try_from(missing)
            .map_err(|_| CryptoError::KeyGeneration(format!("batch of {missing} too large")))?;
        self.generate_one_time_prekeys(count, None)?;
        info!(remaining, generated = count, "refreshed one-time prekeys");
        Ok(true)
    }

    /// Replace the signed prekey once the newest is at least `max_age` old.
    ///
    /// Signed prekeys older than twice `max_age` are pruned; the newest one
    /// always survives. Returns whether a new key was generated.
    pub fn rotate_signed_prekey(&self, max_age: Duration) -> Result<bool, CryptoError> {
        let now = now_millis();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);

        let newest_age = self
            .store
            .load_signed_prekeys()?
            .last()
            .map(|r| now.saturating_sub(r.timestamp()));
        let rotated = match newest_age {
            Some(age) if age < max_age_ms => false,
            _ => {
                let record = self.generate_signed_prekey()?;
                info!(signed_prekey_id = record.id(), "rotated signed prekey");
                true
            }
        };

        let mut records = self.store.load_signed_prekeys()?;
        records.pop();
        let cutoff = max_age_ms.saturating_mul(2);
        for old in records
            .iter()
            .filter(|r| now.saturating_sub(r.timestamp()) >= cutoff)
        {
            self.store.remove_signed_prekey(old.id())?;
            debug!(signed_prekey_id = old.id(), "pruned signed prekey");
        }

        Ok(rotated)
    }

    /// Hex SHA-256 of the local identity public key.
    pub fn identity_fingerprint(&self) -> Result<String, CryptoError> {
        Ok(self.store.get_identity_key_pair()?.identity_key().fingerprint())
    }
}

fn clamp_prekey_id(id: u32) -> u32 {
    if id == 0 || id > MAX_PREKEY_ID { 1 } else { id }
}

fn next_prekey_id(id: u32) -> u32 {
    if id >= MAX_PREKEY_ID { 1 } else { id + 1 }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
