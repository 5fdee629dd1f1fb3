//! Tracing initialization.
//!
//! Console output through the fmt layer, filtered by `RUST_LOG` (default `info`). Repository
//! operations emit spans at `info` and cache and connection lifecycle events at `debug`, so
//! `RUST_LOG=dbrepo=debug` shows what the facade is doing.

use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // logs go to stderr so command output on stdout stays machine readable
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    debug!("Telemetry initialized");
    Ok(())
}
