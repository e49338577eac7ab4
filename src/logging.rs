//! Tracing setup helper.

use crate::error::{Result, ShardError};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber with the given filter
/// directive (e.g. `"info"` or `"tessera=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| ShardError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| ShardError::Config("logging already initialized".into()))
}
