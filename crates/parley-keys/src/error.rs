use parley_crypto::CryptoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeysError>;

#[derive(Debug, Error)]
pub enum KeysError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("key directory: {0}")]
    Directory(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl KeysError {
    /// A replayed ciphertext. Log and drop; never an application failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_duplicate())
    }

    /// The underlying crypto error, if this is one.
    pub fn as_crypto(&self) -> Option<&CryptoError> {
        match self {
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
