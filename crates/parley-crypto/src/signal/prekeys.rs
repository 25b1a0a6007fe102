//! `PreKey` records and the publishable device key bundle.
//!
//! Bundles are published to the remote key directory so that new contacts
//! can establish a session asynchronously.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;

/// A one-time prekey. Consumed by exactly one session handshake.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreKeyRecord {
    id: u32,
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl PreKeyRecord {
    /// Generate a fresh X25519 key pair under `id`.
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            id,
            public_key: X25519Public::from(&secret).to_bytes(),
            private_key: secret.to_bytes(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::StorageError(format!("encode prekey: {e}")))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes)
            .map_err(|e| CryptoError::StorageError(format!("corrupt prekey record: {e}")))
    }
}

/// A medium-lived prekey whose public half is signed by the identity key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    id: u32,
    /// Creation time, milliseconds since the UNIX epoch.
    timestamp: u64,
    public_key: [u8; 32],
    private_key: [u8; 32],
    signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    /// Generate a key pair and sign its public half with `identity`.
    pub fn generate(id: u32, timestamp: u64, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = X25519Public::from(&secret).to_bytes();
        let signature = identity.sign(&public_key).to_vec();
        Self {
            id,
            timestamp,
            public_key,
            private_key: secret.to_bytes(),
            signature,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self)
            .map_err(|e| CryptoError::StorageError(format!("encode signed prekey: {e}")))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes)
            .map_err(|e| CryptoError::StorageError(format!("corrupt signed prekey record: {e}")))
    }
}

/// A snapshot of one device's public key material, ready for publication.
///
/// Built on demand from store state. The embedded one-time prekey must be
/// struck from the directory atomically when a peer claims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeyBundle {
    pub device_id: u32,
    pub registration_id: u32,
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey_public: Vec<u8>,
    /// Signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    /// Optional one-time prekey (consumed on first use).
    pub prekey: Option<BundledPreKey>,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// The one-time prekey slot of a [`DeviceKeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledPreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

impl DeviceKeyBundle {
    /// Replace the one-time prekey slot, e.g. with the value a directory
    /// transaction actually handed out.
    pub fn with_prekey(mut self, prekey: Option<BundledPreKey>) -> Self {
        self.prekey = prekey;
        self
    }
}
