//! Device key management and end-to-end sessions on top of `parley-crypto`.
//!
//! [`Device`] wires the pieces together: the encrypted vault and SQLite
//! record store, the [`DeviceInitializer`] that publishes our bundle, and
//! the [`SessionService`] used by the send and receive paths.

pub mod config;
pub mod db;
pub mod device;
pub mod directory;
pub mod error;
pub mod initializer;
pub mod keystore;
pub mod session_service;
pub mod store;
pub mod telemetry;

pub use config::KeysConfig;
pub use device::Device;
pub use directory::{claim_bundle, DeviceRecord, KeyDirectory, MemoryKeyDirectory};
pub use error::{KeysError, Result};
pub use initializer::{DeviceInitializer, InitState};
pub use keystore::{MemoryKeychain, StrongholdKeystore};
pub use session_service::SessionService;
pub use store::PersistentKeyStore;
pub use telemetry::init_tracing;

use parley_crypto::CryptoError;

/// Run synchronous key-store work on the blocking pool.
///
/// Every store call touches SQLite or the vault, so none of it runs on an
/// async worker thread.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, CryptoError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
