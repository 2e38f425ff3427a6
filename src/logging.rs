//! Process-wide logging setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, TramaError};

/// Installs the global tracing subscriber with the given filter directive,
/// e.g. `"info"` or `"trama=debug"`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level).map_err(|_| TramaError::Invalid("invalid log filter"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| TramaError::Invalid("logging already initialized"))
}
