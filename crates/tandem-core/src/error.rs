//! Error types for TANDEM

use thiserror::Error;

use crate::{EngineId, Timestep};

/// Core TANDEM errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TandemError {
    // Window errors
    #[error("Timestep {index} outside window [{first}, {last}]")]
    OutOfWindow {
        index: Timestep,
        first: Timestep,
        last: Timestep,
    },

    #[error("Invalid window capacity: {0}")]
    InvalidWindowCapacity(usize),

    // Command errors
    #[error("Unknown command type: {0}")]
    UnknownCommandType(i32),

    #[error("Invalid command type: {0}")]
    InvalidCommandType(i32),

    #[error("Command type {0} registered twice")]
    DuplicateCommandType(i32),

    #[error("Command body {0} is not registered")]
    UnregisteredCommand(&'static str),

    #[error("Truncated command: {actual} bytes, need at least 4")]
    TruncatedCommand { actual: usize },

    #[error("Invalid command payload: {0}")]
    InvalidPayload(String),

    // Wire errors
    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    // Protocol faults
    #[error("Duplicate package for timestep {timestep} from engine {engine}")]
    DuplicatePackage { timestep: Timestep, engine: EngineId },

    #[error("No complete timestep in window [{first}, {last}]")]
    IncompleteWindowInvariant { first: Timestep, last: Timestep },

    #[error("Join backlog reaches timestep {newest}, window from {snapshot} holds {capacity}")]
    JoinBacklogExceedsWindow {
        snapshot: Timestep,
        newest: Timestep,
        capacity: usize,
    },

    // State errors
    #[error("No state available for timestep {0}")]
    StateUnavailable(Timestep),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid synchronizer state: {0}")]
    InvalidState(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transport not started")]
    NotStarted,

    #[error("Connection failed")]
    ConnectionFailed,
}

impl TandemError {
    /// Faults that leave the history inconsistent. The affected synchronizer
    /// must stop.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            TandemError::OutOfWindow { .. }
                | TandemError::DuplicatePackage { .. }
                | TandemError::IncompleteWindowInvariant { .. }
                | TandemError::JoinBacklogExceedsWindow { .. }
        )
    }

    /// Malformed wire data. Only the offending package is rejected.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TandemError::UnknownCommandType(_)
                | TandemError::InvalidCommandType(_)
                | TandemError::TruncatedCommand { .. }
                | TandemError::InvalidPayload(_)
                | TandemError::BufferTooShort { .. }
                | TandemError::InvalidWireFormat(_)
        )
    }
}

/// Result type for TANDEM operations
pub type TandemResult<T> = Result<T, TandemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        let dup = TandemError::DuplicatePackage {
            timestep: 4,
            engine: EngineId::new(2),
        };
        assert!(dup.is_protocol_fault());
        assert!(!dup.is_malformed());

        let unknown = TandemError::UnknownCommandType(77);
        assert!(unknown.is_malformed());
        assert!(!unknown.is_protocol_fault());

        assert!(!TandemError::ConnectionFailed.is_protocol_fault());
        assert!(!TandemError::ConnectionFailed.is_malformed());
    }

    #[test]
    fn test_error_display() {
        let err = TandemError::OutOfWindow {
            index: 12,
            first: 0,
            last: 10,
        };
        assert_eq!(err.to_string(), "Timestep 12 outside window [0, 10]");
    }
}
