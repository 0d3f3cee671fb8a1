//! TANDEM Transport Layer - Moving packages between peers
//!
//! This crate provides:
//! - The `Transport` contract a synchronizer drives
//! - Per-peer channels batching event packages into tagged streams
//! - An in-memory transport for tests and single-process sessions
//! - A TCP transport with UDP host discovery

pub mod channel;
pub mod mock;
pub mod tcp;
pub mod transport;

pub use channel::*;
pub use mock::*;
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::*;
