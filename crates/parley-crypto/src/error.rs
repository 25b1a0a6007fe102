use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("local identity key pair has not been created")]
    UninitializedIdentity,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("unknown key id: {0}")]
    InvalidKeyId(String),

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),

    #[error("no session for {0}")]
    NoSession(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("legacy message version {0} is not supported")]
    LegacyMessage(u8),

    #[error("duplicate message from {address} (counter {counter})")]
    DuplicateMessage { address: String, counter: u32 },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}

impl CryptoError {
    /// A replayed ciphertext. Retransmission is normal, so callers log and drop.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage { .. })
    }

    /// Only storage failures are worth retrying; a ciphertext that failed to
    /// decrypt will fail again and must be resent by its sender.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError(_))
    }
}
