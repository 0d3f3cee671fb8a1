//! TANDEM Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every TANDEM layer:
//! - Identifiers (EngineId, Timestep, CommandType)
//! - The fixed-capacity time window
//! - Commands, meta commands and the command registry
//! - Per-timestep roster metadata
//! - The simulation state contract

pub mod codec;
pub mod command;
pub mod error;
pub mod id;
pub mod meta;
pub mod roster;
pub mod state;
pub mod window;

pub use command::*;
pub use error::*;
pub use id::*;
pub use meta::*;
pub use roster::*;
pub use state::*;
pub use window::*;
