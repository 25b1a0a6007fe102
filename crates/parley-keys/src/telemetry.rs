use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{KeysError, Result};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default
/// `info`). Later calls are no-ops.
pub fn init_tracing() -> Result<()> {
    TRACING_INITIALIZED
        .get_or_try_init(|| {
            let env_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|e| KeysError::Config(format!("tracing subscriber: {e}")))
        })
        .map(|_| ())
}
