use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Length of a serialized public identity key.
pub const IDENTITY_KEY_LEN: usize = 32;

/// Serialized pair layout: secret (32) || public (32).
const SERIALIZED_PAIR_LEN: usize = 64;

/// The public half of a device identity (Ed25519 verifying key bytes).
///
/// Shared freely through key bundles and embedded in handshake messages.
/// For X3DH the key is mapped onto Curve25519 with [`IdentityKey::to_x25519`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; IDENTITY_KEY_LEN]);

impl IdentityKey {
    /// Parse and validate a public identity key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; IDENTITY_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "identity key must be {IDENTITY_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map_err(|e| CryptoError::InvalidKey(format!("identity key is not an Ed25519 point: {e}")))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_KEY_LEN] {
        &self.0
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let verifying_key = self.verifying_key()?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    /// Map the Ed25519 public key onto its X25519 (Montgomery) form.
    ///
    /// Matches [`IdentityKeyPair::to_x25519_secret`] on the owner's side via the
    /// standard Edwards→Montgomery birational map (RFC 7748).
    pub fn to_x25519(&self) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let montgomery = self.verifying_key()?.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }

    /// SHA-256 over the serialized key, hex-encoded, for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityKey").field(&hex::encode(self.0)).finish()
    }
}

/// A device's long-lived identity key pair.
///
/// Created once per install. The private half never leaves the key store;
/// losing it invalidates every session the device had, and peers re-establish.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with the identity private key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Derive the X25519 static secret used for X3DH.
    ///
    /// Uses the SHA-512-expanded scalar (same scalar Ed25519 uses internally)
    /// so the public side matches [`IdentityKey::to_x25519`].
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Serialize as `secret || public` for the key store.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERIALIZED_PAIR_LEN);
        out.extend_from_slice(self.signing_key.as_bytes());
        out.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        out
    }

    /// Restore a pair written by [`serialize`](Self::serialize).
    ///
    /// Rejects truncated data and pairs whose stored public half does not
    /// match the secret, which is how store corruption is detected.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SERIALIZED_PAIR_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "identity key pair must be {SERIALIZED_PAIR_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let secret: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity secret wrong length".into()))?;
        let pair = Self::from_secret_bytes(&secret);
        if pair.identity_key().as_bytes()[..] != bytes[32..] {
            return Err(CryptoError::InvalidKey(
                "identity public key does not match secret".into(),
            ));
        }
        Ok(pair)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.identity_key())
            .finish_non_exhaustive()
    }
}
