//! Wires `tracing` + `tracing-subscriber` as this crate's logging
//! backend, replacing the original's `boost::log LOG(trace/debug/info/
//! error)` call sites one-for-one in register:
//!
//! - `trace!` — routine evidence bookkeeping (a prepare/commit vote
//!   recorded, a persistent value rehydrated).
//! - `debug!` — dedup/stale request rejections, dropped out-of-window
//!   messages.
//! - `info!` — stage transitions worth an operator's attention (view
//!   installed, checkpoint promoted to stable, state transfer
//!   completed).
//! - `error!` — safety alarms (checkpoint divergence, audit conflict,
//!   `StorageNotSaved`).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global `tracing` subscriber.
///
/// The filter defaults to `info` for this crate and `warn` for
/// everything else, overridable through `RUST_LOG` the usual way.
/// Returns an error if a global subscriber was already installed.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swarm_pbft=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
