//! TANDEM Wire Protocol - Binary package format
//!
//! This crate implements the bytes exchanged between peers:
//! - Event packages (timestep, engine, length-prefixed commands)
//! - Length-prefix frames batching several packages into one transport write

pub mod framing;
pub mod package;

pub use framing::*;
pub use package::*;
