pub mod error;
pub mod identity;
pub mod keychain;
pub mod signal;

pub use error::CryptoError;
pub use identity::{IdentityKey, IdentityKeyPair};
pub use keychain::Keychain;
pub use signal::{KeyManager, ProtocolAddress, SessionCipher};
