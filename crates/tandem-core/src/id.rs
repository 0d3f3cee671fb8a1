//! Identity types for TANDEM
//!
//! Engine ids, timesteps and command types all travel as 32-bit
//! little-endian signed integers. Negative values carry meaning: the host
//! seeds timestep `-1`, a peer without an assigned engine reports `-1`, and
//! negative command types are reserved for session bookkeeping.

use std::fmt;

/// Discrete simulation tick, agreed on by every peer.
pub type Timestep = i32;

/// Wire encoding of a timestep
#[inline]
pub fn timestep_to_bytes(timestep: Timestep) -> [u8; 4] {
    timestep.to_le_bytes()
}

/// Wire decoding of a timestep
#[inline]
pub fn timestep_from_bytes(bytes: [u8; 4]) -> Timestep {
    Timestep::from_le_bytes(bytes)
}

/// Identity of one participating simulation instance
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EngineId(pub i32);

impl EngineId {
    /// The authoritative host. Its batch is required for every timestep.
    pub const HOST: EngineId = EngineId(0);

    /// Placeholder used before the host has assigned a permanent id
    pub const UNASSIGNED: EngineId = EngineId(-1);

    #[inline]
    pub fn new(id: i32) -> Self {
        EngineId(id)
    }

    #[inline]
    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        EngineId(i32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine({})", self.0)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command type tag
///
/// Zero is never valid. Negative ids are reserved for roster and session
/// effects; positive ids belong to the application.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandType(pub i32);

impl CommandType {
    /// Full snapshot sent to a joining peer
    pub const SNAPSHOT_TRANSFER: CommandType = CommandType(-1);
    /// Joining peer has installed its snapshot
    pub const READY_TO_PLAY: CommandType = CommandType(-2);
    /// Host admits a peer under a permanent engine id
    pub const NEW_ENGINE: CommandType = CommandType(-3);

    #[inline]
    pub fn new(id: i32) -> Self {
        CommandType(id)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn is_meta(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_application(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        CommandType(i32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandType({})", self.0)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
