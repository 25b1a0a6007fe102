use crate::CryptoError;

/// Encrypted vault for long-lived secrets, addressed by `(vault, key)`.
///
/// Only the local identity goes here; session and prekey records are kept by
/// the protocol store. `parley-keys` backs this with an `iota_stronghold`
/// snapshot.
pub trait Keychain: Send + Sync {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// `None` if nothing is stored under the name.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;

    /// Make buffered writes durable. Write-through backends keep the default.
    fn flush(&self) -> Result<(), CryptoError> {
        Ok(())
    }
}

pub const VAULT_SIGNAL: &str = "signal";

/// Registration id (4 bytes LE) followed by the serialized identity key pair,
/// so both are always written together.
pub const KEY_LOCAL_IDENTITY: &str = "local_identity";
