//! Event package encoding
//!
//! An event package is one engine's command batch for one timestep:
//!
//! ```text
//! [timestep: i32 LE][engine: i32 LE]
//! repeated: [len: u32 LE][command: len bytes]
//! ```
//!
//! Each command is the registry encoding `[type: i32 LE][payload]`. Peers
//! must agree on this layout bit for bit.

use std::fmt;

use bytes::{BufMut, BytesMut};

use tandem_core::codec::Reader;
use tandem_core::{
    Command, CommandBody, CommandRegistry, CommandType, EngineId, TandemError, TandemResult,
    Timestep,
};

use crate::{begin_frame, end_frame};

/// Package header size (timestep + engine)
pub const PACKAGE_HEADER_SIZE: usize = 8;

/// Key of a package. Ordered by timestep, then engine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId {
    pub timestep: Timestep,
    pub engine: EngineId,
}

impl PackageId {
    #[inline]
    pub fn new(timestep: Timestep, engine: EngineId) -> Self {
        PackageId { timestep, engine }
    }
}

impl fmt::Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Package(t={}, {})", self.timestep, self.engine)
    }
}

/// One engine's commands for one timestep
#[derive(Debug)]
pub struct EventPackage<S> {
    pub id: PackageId,
    pub commands: Vec<Command<S>>,
}

impl<S: 'static> EventPackage<S> {
    pub fn new(id: PackageId, commands: Vec<Command<S>>) -> Self {
        EventPackage { id, commands }
    }

    /// Parse a package (without its outer length frame)
    pub fn parse(registry: &CommandRegistry<S>, buf: &[u8]) -> TandemResult<Self> {
        if buf.len() < PACKAGE_HEADER_SIZE {
            return Err(TandemError::BufferTooShort {
                expected: PACKAGE_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut reader = Reader::new(buf);
        let timestep = reader.read_i32()?;
        let engine = EngineId(reader.read_i32()?);

        let mut commands = Vec::new();
        while !reader.is_empty() {
            let bytes = reader.read_prefixed()?;
            commands.push(registry.deserialize(bytes)?);
        }

        Ok(EventPackage {
            id: PackageId::new(timestep, engine),
            commands,
        })
    }

    /// Serialize this package (without an outer length frame)
    pub fn serialize(&self, registry: &CommandRegistry<S>, buf: &mut BytesMut) {
        serialize_package(registry, self.id, &self.commands, buf);
    }

    /// First command of body type `C`
    pub fn find<C: CommandBody<S>>(&self) -> Option<&C> {
        self.commands.iter().find_map(|c| c.downcast_ref::<C>())
    }

    pub fn contains_kind(&self, kind: CommandType) -> bool {
        self.commands.iter().any(|c| c.kind() == kind)
    }

    /// True if the package carries nothing but join acknowledgements.
    /// Those are never recorded into the history.
    pub fn is_ready_only(&self) -> bool {
        !self.commands.is_empty()
            && self
                .commands
                .iter()
                .all(|c| c.kind() == CommandType::READY_TO_PLAY)
    }
}

/// Serialize a package from borrowed commands
pub fn serialize_package<S: 'static>(
    registry: &CommandRegistry<S>,
    id: PackageId,
    commands: &[Command<S>],
    buf: &mut BytesMut,
) {
    buf.put_i32_le(id.timestep);
    buf.put_i32_le(id.engine.0);
    for command in commands {
        let start = begin_frame(buf);
        registry.serialize(command, buf);
        end_frame(buf, start);
    }
}

/// Serialize a package wrapped in its length frame
pub fn serialize_framed<S: 'static>(
    registry: &CommandRegistry<S>,
    id: PackageId,
    commands: &[Command<S>],
    buf: &mut BytesMut,
) {
    let start = begin_frame(buf);
    serialize_package(registry, id, commands, buf);
    end_frame(buf, start);
}
