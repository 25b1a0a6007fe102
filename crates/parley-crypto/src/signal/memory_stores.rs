//! In-memory protocol store.
//!
//! Used by tests and by callers that do not need persistence. Records are
//! held in serialized form so that every load goes through the same
//! byte round-trip as a durable store.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::CryptoError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::signal::address::ProtocolAddress;
use crate::signal::prekeys::{PreKeyRecord, SignedPreKeyRecord};
use crate::signal::ratchet::SessionRecord;
use crate::signal::store::{
    IdentityKeyStore, MAX_PREKEY_ID, PreKeyStore, ProtocolStore, SessionStore, SignedPreKeyStore,
};

#[derive(Default)]
struct Inner {
    identity: Option<(Vec<u8>, u32)>,
    trusted: HashMap<ProtocolAddress, IdentityKey>,
    prekeys: BTreeMap<u32, Vec<u8>>,
    next_prekey_id: u32,
    signed_prekeys: BTreeMap<u32, Vec<u8>>,
    sessions: BTreeMap<ProtocolAddress, Vec<u8>>,
    fail_session_writes: bool,
}

impl Inner {
    fn check_session_writable(&self) -> Result<(), CryptoError> {
        if self.fail_session_writes {
            return Err(CryptoError::StorageError("session writes disabled".into()));
        }
        Ok(())
    }
}

/// All protocol state behind one lock.
#[derive(Default)]
pub struct MemoryProtocolStore {
    inner: Mutex<Inner>,
}

impl MemoryProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `pair` as its local identity.
    pub fn with_identity(pair: &IdentityKeyPair, registration_id: u32) -> Self {
        let store = Self::new();
        store.inner.lock().identity = Some((pair.serialize(), registration_id));
        store
    }

    /// Flip a bit in the stored public half so the pair no longer matches.
    #[cfg(test)]
    pub(crate) fn corrupt_identity(&self) {
        if let Some((bytes, _)) = self.inner.lock().identity.as_mut() {
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x01;
            }
        }
    }

    /// Make every session write fail with `StorageError`.
    #[cfg(test)]
    pub(crate) fn fail_session_writes(&self, fail: bool) {
        self.inner.lock().fail_session_writes = fail;
    }
}

impl IdentityKeyStore for MemoryProtocolStore {
    fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        let inner = self.inner.lock();
        let (bytes, _) = inner
            .identity
            .as_ref()
            .ok_or(CryptoError::UninitializedIdentity)?;
        IdentityKeyPair::deserialize(bytes)
    }

    fn get_local_registration_id(&self) -> Result<u32, CryptoError> {
        self.inner
            .lock()
            .identity
            .as_ref()
            .map(|(_, id)| *id)
            .ok_or(CryptoError::UninitializedIdentity)
    }

    fn save_identity_key_pair(
        &self,
        pair: &IdentityKeyPair,
        registration_id: u32,
    ) -> Result<(), CryptoError> {
        self.inner.lock().identity = Some((pair.serialize(), registration_id));
        Ok(())
    }

    fn clear_local_identity(&self) -> Result<(), CryptoError> {
        self.inner.lock().identity = None;
        Ok(())
    }

    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, CryptoError> {
        Ok(self.inner.lock().trusted.get(address).copied())
    }

    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        let previous = self.inner.lock().trusted.insert(address.clone(), *identity);
        Ok(previous.is_some_and(|p| p != *identity))
    }
}

impl PreKeyStore for MemoryProtocolStore {
    fn load_prekey(&self, id: u32) -> Result<PreKeyRecord, CryptoError> {
        let inner = self.inner.lock();
        let bytes = inner
            .prekeys
            .get(&id)
            .ok_or_else(|| CryptoError::KeyNotFound(format!("prekey {id}")))?;
        PreKeyRecord::deserialize(bytes)
    }

    fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), CryptoError> {
        let bytes = record.serialize()?;
        self.inner.lock().prekeys.insert(record.id(), bytes);
        Ok(())
    }

    fn remove_prekey(&self, id: u32) -> Result<bool, CryptoError> {
        Ok(self.inner.lock().prekeys.remove(&id).is_some())
    }

    fn contains_prekey(&self, id: u32) -> Result<bool, CryptoError> {
        Ok(self.inner.lock().prekeys.contains_key(&id))
    }

    fn prekey_ids(&self) -> Result<Vec<u32>, CryptoError> {
        Ok(self.inner.lock().prekeys.keys().copied().collect())
    }

    fn prekey_count(&self) -> Result<usize, CryptoError> {
        Ok(self.inner.lock().prekeys.len())
    }

    fn next_prekey_id(&self) -> Result<u32, CryptoError> {
        let next = self.inner.lock().next_prekey_id;
        Ok(if next == 0 || next > MAX_PREKEY_ID { 1 } else { next })
    }

    fn set_next_prekey_id(&self, id: u32) -> Result<(), CryptoError> {
        self.inner.lock().next_prekey_id = id;
        Ok(())
    }
}

impl SignedPreKeyStore for MemoryProtocolStore {
    fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, CryptoError> {
        let inner = self.inner.lock();
        let bytes = inner
            .signed_prekeys
            .get(&id)
            .ok_or_else(|| CryptoError::KeyNotFound(format!("signed prekey {id}")))?;
        SignedPreKeyRecord::deserialize(bytes)
    }

    fn load_signed_prekeys(&self) -> Result<Vec<SignedPreKeyRecord>, CryptoError> {
        let inner = self.inner.lock();
        let mut records = inner
            .signed_prekeys
            .values()
            .map(|b| SignedPreKeyRecord::deserialize(b))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| (r.timestamp(), r.id()));
        Ok(records)
    }

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        let bytes = record.serialize()?;
        self.inner.lock().signed_prekeys.insert(record.id(), bytes);
        Ok(())
    }

    fn contains_signed_prekey(&self, id: u32) -> Result<bool, CryptoError> {
        Ok(self.inner.lock().signed_prekeys.contains_key(&id))
    }

    fn remove_signed_prekey(&self, id: u32) -> Result<(), CryptoError> {
        self.inner.lock().signed_prekeys.remove(&id);
        Ok(())
    }
}

impl SessionStore for MemoryProtocolStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord, CryptoError> {
        match self.inner.lock().sessions.get(address) {
            Some(bytes) => SessionRecord::deserialize(bytes),
            None => Ok(SessionRecord::new_fresh()),
        }
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError> {
        let bytes = record.serialize()?;
        let mut inner = self.inner.lock();
        inner.check_session_writable()?;
        inner.sessions.insert(address.clone(), bytes);
        Ok(())
    }

    fn delete_session(&self, address: &ProtocolAddress) -> Result<(), CryptoError> {
        self.inner.lock().sessions.remove(address);
        Ok(())
    }

    fn delete_all_sessions(&self, name: &str) -> Result<(), CryptoError> {
        self.inner.lock().sessions.retain(|addr, _| addr.name() != name);
        Ok(())
    }

    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .keys()
            .filter(|addr| addr.name() == name)
            .map(ProtocolAddress::device_id)
            .collect())
    }
}

impl ProtocolStore for MemoryProtocolStore {
    fn commit_handshake(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        record: &SessionRecord,
        prekey_id: Option<u32>,
    ) -> Result<bool, CryptoError> {
        let bytes = record.serialize()?;
        let mut inner = self.inner.lock();
        if prekey_id.is_some_and(|id| !inner.prekeys.contains_key(&id)) {
            return Ok(false);
        }
        inner.check_session_writable()?;

        if let Some(id) = prekey_id {
            inner.prekeys.remove(&id);
        }
        inner.trusted.insert(address.clone(), *identity);
        inner.sessions.insert(address.clone(), bytes);
        Ok(true)
    }
}
