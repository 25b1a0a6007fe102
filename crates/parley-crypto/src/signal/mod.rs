//! X3DH session establishment and the double ratchet.
//!
//! Storage is abstracted behind the traits in [`store`]; everything in this
//! module is synchronous and performs no I/O of its own.

pub mod address;
pub mod key_manager;
pub mod memory_stores;
pub mod message;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod store;
mod x3dh;

pub use address::ProtocolAddress;
pub use key_manager::{KeyManager, PreKeyPolicy};
pub use memory_stores::MemoryProtocolStore;
pub use message::{CiphertextMessage, CiphertextMessageType, PreKeySignalMessage, SignalMessage};
pub use prekeys::{BundledPreKey, DeviceKeyBundle, PreKeyRecord, SignedPreKeyRecord};
pub use ratchet::SessionRecord;
pub use session::{SessionCipher, TrustPolicy};
pub use store::{
    IdentityKeyStore, PreKeyStore, ProtocolStore, SessionStore, SignedPreKeyStore, MAX_PREKEY_ID,
};
