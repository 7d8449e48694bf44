//! Opt-in tracing setup for binaries embedding the engine.
//!
//! The library itself only emits `tracing` events; call [`init_logging`]
//! from an application (or test) that wants them on stdout. Filtering
//! follows `RUST_LOG`, defaulting to "info".

use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .try_init()?;

    Ok(())
}
