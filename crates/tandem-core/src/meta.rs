//! Session meta commands
//!
//! Negative type ids drive the join protocol and roster changes. They are
//! registered by every [`CommandRegistry`](crate::CommandRegistry) and never
//! touch application state.

use std::any::Any;

use bytes::{BufMut, BytesMut};

use crate::codec::Reader;
use crate::{CommandBody, EngineId, Roster, TandemError, TandemResult, Timestep};

/// Full snapshot for a joining peer (type -1)
///
/// Carries everything the joiner needs before it can size its history:
/// the state at the host's complete timestep, the roster at that timestep,
/// window sizing and frame timing, and where the host's clock stood.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotTransfer {
    pub state: Vec<u8>,
    pub timestep: Timestep,
    pub engines: Vec<EngineId>,
    pub source_engine: EngineId,
    pub temporary_engine: EngineId,
    pub max_frames: u32,
    pub ms_per_frame: u32,
    pub input_delay: u32,
    /// Host's delayed timestep when the snapshot was taken
    pub host_frame: Timestep,
}

impl<S> CommandBody<S> for SnapshotTransfer {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.state.len() as u32);
        buf.put_slice(&self.state);
        buf.put_i32_le(self.timestep);
        buf.put_u32_le(self.engines.len() as u32);
        for engine in &self.engines {
            buf.put_i32_le(engine.0);
        }
        buf.put_i32_le(self.source_engine.0);
        buf.put_i32_le(self.temporary_engine.0);
        buf.put_u32_le(self.max_frames);
        buf.put_u32_le(self.ms_per_frame);
        buf.put_u32_le(self.input_delay);
        buf.put_i32_le(self.host_frame);
    }

    fn decode(&mut self, payload: &[u8]) -> TandemResult<()> {
        let mut reader = Reader::new(payload);
        self.state = reader.read_prefixed()?.to_vec();
        self.timestep = reader.read_i32()?;
        let count = reader.read_u32()? as usize;
        if count > reader.remaining() / 4 {
            return Err(TandemError::InvalidPayload(format!(
                "snapshot lists {} engines in {} bytes",
                count,
                reader.remaining()
            )));
        }
        self.engines = (0..count)
            .map(|_| reader.read_i32().map(EngineId))
            .collect::<TandemResult<_>>()?;
        self.source_engine = EngineId(reader.read_i32()?);
        self.temporary_engine = EngineId(reader.read_i32()?);
        self.max_frames = reader.read_u32()?;
        self.ms_per_frame = reader.read_u32()?;
        self.input_delay = reader.read_u32()?;
        self.host_frame = reader.read_i32()?;
        reader.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Joiner has installed its snapshot and waits for admission (type -2)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyToPlay {
    pub origin: EngineId,
    pub temporary: EngineId,
}

impl Default for ReadyToPlay {
    fn default() -> Self {
        ReadyToPlay {
            origin: EngineId::UNASSIGNED,
            temporary: EngineId::UNASSIGNED,
        }
    }
}

impl<S> CommandBody<S> for ReadyToPlay {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.origin.0);
        buf.put_i32_le(self.temporary.0);
    }

    fn decode(&mut self, payload: &[u8]) -> TandemResult<()> {
        let mut reader = Reader::new(payload);
        self.origin = EngineId(reader.read_i32()?);
        self.temporary = EngineId(reader.read_i32()?);
        reader.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Host admits a joiner under a permanent engine id (type -3)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewEngine {
    pub origin: EngineId,
    pub temporary: EngineId,
    pub engine: EngineId,
}

impl NewEngine {
    /// True if this admission answers the given join request
    pub fn admits(&self, origin: EngineId, temporary: EngineId) -> bool {
        self.origin == origin && self.temporary == temporary
    }
}

impl<S> CommandBody<S> for NewEngine {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.origin.0);
        buf.put_i32_le(self.temporary.0);
        buf.put_i32_le(self.engine.0);
    }

    fn decode(&mut self, payload: &[u8]) -> TandemResult<()> {
        let mut reader = Reader::new(payload);
        self.origin = EngineId(reader.read_i32()?);
        self.temporary = EngineId(reader.read_i32()?);
        self.engine = EngineId(reader.read_i32()?);
        reader.finish()
    }

    fn apply_to_roster(&self, roster: &mut Roster) {
        roster.insert(self.engine);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(body: &dyn CommandBody<()>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_snapshot_transfer_fields_survive() {
        let original = SnapshotTransfer {
            state: vec![9, 8, 7, 6],
            timestep: 65536,
            engines: vec![EngineId::HOST, EngineId::new(255), EngineId::new(i32::MAX)],
            source_engine: EngineId::HOST,
            temporary_engine: EngineId::new(3),
            max_frames: 50,
            ms_per_frame: 33,
            input_delay: 2,
            host_frame: 65540,
        };
        let bytes = encoded(&original);
        let mut decoded = SnapshotTransfer::default();
        CommandBody::<()>::decode(&mut decoded, &bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_snapshot_transfer_rejects_bogus_engine_count() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&5i32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut decoded = SnapshotTransfer::default();
        assert!(matches!(
            CommandBody::<()>::decode(&mut decoded, &bytes),
            Err(TandemError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_ready_to_play_layout() {
        let ready = ReadyToPlay {
            origin: EngineId::HOST,
            temporary: EngineId::new(256),
        };
        assert_eq!(encoded(&ready), vec![0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(ReadyToPlay::default().origin, EngineId::UNASSIGNED);
    }

    #[test]
    fn test_new_engine_admission() {
        let admit = NewEngine {
            origin: EngineId::HOST,
            temporary: EngineId::new(1),
            engine: EngineId::new(2),
        };
        assert!(admit.admits(EngineId::HOST, EngineId::new(1)));
        assert!(!admit.admits(EngineId::HOST, EngineId::new(2)));

        let mut roster = Roster::with_engines([EngineId::HOST]);
        CommandBody::<()>::apply_to_roster(&admit, &mut roster);
        assert!(roster.contains(EngineId::new(2)));
    }

    #[test]
    fn test_new_engine_trailing_bytes_rejected() {
        let mut bytes = encoded(&NewEngine::default());
        bytes.push(0);
        let mut decoded = NewEngine::default();
        assert!(CommandBody::<()>::decode(&mut decoded, &bytes).is_err());
    }
}
