use crate::CryptoError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::signal::address::ProtocolAddress;
use crate::signal::prekeys::{PreKeyRecord, SignedPreKeyRecord};
use crate::signal::ratchet::SessionRecord;

/// Highest one-time prekey id handed out before the watermark wraps.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFE;

/// Storage for our own identity and the identities pinned for peers.
///
/// The local key pair is the only long-term secret. Implementations must
/// write the pair and its registration id together.
pub trait IdentityKeyStore: Send + Sync {
    /// Our identity key pair. Fails with `UninitializedIdentity` if none
    /// has been saved; corrupt bytes surface as `InvalidKey`.
    fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError>;

    /// Registration id bound to the identity key pair.
    fn get_local_registration_id(&self) -> Result<u32, CryptoError>;

    /// Replace the local identity. Irreversible.
    fn save_identity_key_pair(
        &self,
        pair: &IdentityKeyPair,
        registration_id: u32,
    ) -> Result<(), CryptoError>;

    /// Remove the local identity, e.g. before regenerating corrupt state.
    fn clear_local_identity(&self) -> Result<(), CryptoError>;

    /// Identity key pinned for `address`, if any.
    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, CryptoError>;

    /// Pin `identity` for `address`. Returns true if a different key was
    /// replaced.
    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError>;
}

/// One-time prekey storage.
///
/// Removal is immediate and final: a removed id must never load again.
pub trait PreKeyStore: Send + Sync {
    /// Fails with `KeyNotFound` if the id was never stored or is consumed.
    fn load_prekey(&self, id: u32) -> Result<PreKeyRecord, CryptoError>;

    fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), CryptoError>;

    /// Delete the prekey. Returns false if it was already gone, which lets a
    /// handshake detect that another consumer won the race.
    fn remove_prekey(&self, id: u32) -> Result<bool, CryptoError>;

    fn contains_prekey(&self, id: u32) -> Result<bool, CryptoError>;

    /// Unconsumed ids in ascending order.
    fn prekey_ids(&self) -> Result<Vec<u32>, CryptoError>;

    fn prekey_count(&self) -> Result<usize, CryptoError> {
        Ok(self.prekey_ids()?.len())
    }

    /// Next id the generator should use. Starts at 1.
    fn next_prekey_id(&self) -> Result<u32, CryptoError>;

    fn set_next_prekey_id(&self, id: u32) -> Result<(), CryptoError>;
}

/// Signed prekey storage. Several may be valid at once during rotation.
pub trait SignedPreKeyStore: Send + Sync {
    /// Fails with `KeyNotFound` if absent.
    fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, CryptoError>;

    /// All stored signed prekeys, oldest first.
    fn load_signed_prekeys(&self) -> Result<Vec<SignedPreKeyRecord>, CryptoError>;

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError>;

    fn contains_signed_prekey(&self, id: u32) -> Result<bool, CryptoError>;

    fn remove_signed_prekey(&self, id: u32) -> Result<(), CryptoError>;
}

/// Session records keyed by remote address.
pub trait SessionStore: Send + Sync {
    /// The stored record, or a fresh one if the address has none.
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord, CryptoError>;

    /// Upsert; last write wins.
    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError>;

    /// True only for a stored record that can encrypt.
    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, CryptoError> {
        Ok(!self.load_session(address)?.is_fresh())
    }

    fn delete_session(&self, address: &ProtocolAddress) -> Result<(), CryptoError>;

    /// Delete every device session for `name`.
    fn delete_all_sessions(&self, name: &str) -> Result<(), CryptoError>;

    /// Device ids with a stored session for `name`.
    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, CryptoError>;

    /// Retire the current ratchet state, keeping it for in-flight messages.
    fn archive_session(&self, address: &ProtocolAddress) -> Result<(), CryptoError> {
        let mut record = self.load_session(address)?;
        if record.is_fresh() {
            return Ok(());
        }
        record.archive_current_state();
        self.store_session(address, &record)
    }
}

/// Everything the session cipher and key manager need from storage.
pub trait ProtocolStore: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore {
    /// Commit a completed handshake as one unit: consume `prekey_id` if
    /// given, pin `identity` and upsert `record`.
    ///
    /// Returns false and writes nothing if the prekey is already gone. On
    /// error nothing is written either.
    fn commit_handshake(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        record: &SessionRecord,
        prekey_id: Option<u32>,
    ) -> Result<bool, CryptoError>;
}
