//! TANDEM Test Harness - Multi-peer scenarios and network chaos
//!
//! This crate provides:
//! - A deterministic counter simulation and its nudge command
//! - Latency and jitter injection that keeps per-link order
//! - A cluster of synchronizers over the in-memory router
//! - End-to-end scenarios

pub mod chaos;
pub mod cluster;
pub mod fixtures;

#[cfg(test)]
mod scenarios;

pub use chaos::*;
pub use cluster::*;
pub use fixtures::*;

/// Install a test subscriber filtered by `RUST_LOG` (default `warn`).
/// Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
