//! Commands and the command registry
//!
//! A command is the only way to change simulation state. On the wire it is
//! laid out as:
//!
//! ```text
//! [type: i32 LE][payload ...]
//! ```
//!
//! The registry maps the type id back to a constructor, so a receiver can
//! rebuild a command without knowing its concrete type in advance. One
//! registry is built at start-up and shared by every channel and
//! synchronizer that needs to (de)serialize commands.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::{
    CommandType, NewEngine, ReadyToPlay, Roster, SnapshotTransfer, TandemError, TandemResult,
};

/// Size of the type id prefix
pub const COMMAND_TYPE_SIZE: usize = 4;

/// Behaviour of one concrete command kind
pub trait CommandBody<S>: Any + Send + Sync + fmt::Debug {
    /// Append the payload encoding
    fn encode(&self, buf: &mut BytesMut);

    /// Parse the payload. `payload` holds exactly this command's bytes.
    fn decode(&mut self, payload: &[u8]) -> TandemResult<()>;

    /// Application effect. Only invoked for positive type ids.
    fn apply_to_state(&self, _state: &mut S) {}

    /// Roster effect. Only invoked for negative type ids.
    fn apply_to_roster(&self, _roster: &mut Roster) {}

    fn as_any(&self) -> &dyn Any;
}

/// A typed command. The type id is fixed when the registry builds it.
pub struct Command<S> {
    kind: CommandType,
    body: Box<dyn CommandBody<S>>,
}

impl<S: 'static> Command<S> {
    #[inline]
    pub fn kind(&self) -> CommandType {
        self.kind
    }

    #[inline]
    pub fn is_meta(&self) -> bool {
        self.kind.is_meta()
    }

    pub fn body(&self) -> &dyn CommandBody<S> {
        self.body.as_ref()
    }

    pub fn downcast_ref<C: CommandBody<S>>(&self) -> Option<&C> {
        self.body.as_any().downcast_ref::<C>()
    }

    pub fn apply_to_state(&self, state: &mut S) {
        if self.kind.is_application() {
            self.body.apply_to_state(state);
        }
    }

    pub fn apply_to_roster(&self, roster: &mut Roster) {
        if self.kind.is_meta() {
            self.body.apply_to_roster(roster);
        }
    }
}

impl<S> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("body", &self.body)
            .finish()
    }
}

/// Zero-argument constructor stored per type id
pub type Constructor<S> = fn() -> Box<dyn CommandBody<S>>;

fn construct<S, C>() -> Box<dyn CommandBody<S>>
where
    C: CommandBody<S> + Default,
{
    Box::new(C::default())
}

struct Tables<S> {
    constructors: HashMap<CommandType, Constructor<S>>,
    kinds: HashMap<TypeId, CommandType>,
}

/// Type-id keyed command factory
pub struct CommandRegistry<S> {
    tables: RwLock<Tables<S>>,
}

impl<S: 'static> CommandRegistry<S> {
    /// Registry with the session meta commands already registered
    pub fn new() -> Self {
        let mut tables = Tables {
            constructors: HashMap::new(),
            kinds: HashMap::new(),
        };
        Self::insert_builtin::<SnapshotTransfer>(&mut tables, CommandType::SNAPSHOT_TRANSFER);
        Self::insert_builtin::<ReadyToPlay>(&mut tables, CommandType::READY_TO_PLAY);
        Self::insert_builtin::<NewEngine>(&mut tables, CommandType::NEW_ENGINE);
        CommandRegistry {
            tables: RwLock::new(tables),
        }
    }

    fn insert_builtin<C: CommandBody<S> + Default>(tables: &mut Tables<S>, kind: CommandType) {
        tables.constructors.insert(kind, construct::<S, C>);
        tables.kinds.insert(TypeId::of::<C>(), kind);
    }

    /// Register a default-constructible command body under `kind`
    pub fn register<C: CommandBody<S> + Default>(&self, kind: CommandType) -> TandemResult<()> {
        self.register_with(kind, construct::<S, C>)
    }

    /// Register an explicit constructor under `kind`
    pub fn register_with(&self, kind: CommandType, constructor: Constructor<S>) -> TandemResult<()> {
        if !kind.is_valid() {
            return Err(TandemError::InvalidCommandType(kind.0));
        }
        let sample = constructor();
        let body_type = sample.as_any().type_id();

        let mut tables = self.tables.write();
        if tables.constructors.contains_key(&kind) {
            return Err(TandemError::DuplicateCommandType(kind.0));
        }
        if let Some(existing) = tables.kinds.get(&body_type) {
            return Err(TandemError::DuplicateCommandType(existing.0));
        }
        tables.constructors.insert(kind, constructor);
        tables.kinds.insert(body_type, kind);
        Ok(())
    }

    pub fn is_registered(&self, kind: CommandType) -> bool {
        self.tables.read().constructors.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.tables.read().constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a default command of type `kind`
    pub fn create(&self, kind: CommandType) -> TandemResult<Command<S>> {
        if !kind.is_valid() {
            return Err(TandemError::InvalidCommandType(kind.0));
        }
        let constructor = self
            .tables
            .read()
            .constructors
            .get(&kind)
            .copied()
            .ok_or(TandemError::UnknownCommandType(kind.0))?;
        Ok(Command {
            kind,
            body: constructor(),
        })
    }

    /// Wrap a filled-in body, looking up its registered type id
    pub fn wrap<C: CommandBody<S>>(&self, body: C) -> TandemResult<Command<S>> {
        let kind = self
            .tables
            .read()
            .kinds
            .get(&TypeId::of::<C>())
            .copied()
            .ok_or(TandemError::UnregisteredCommand(std::any::type_name::<C>()))?;
        Ok(Command {
            kind,
            body: Box::new(body),
        })
    }

    /// Write `[type][payload]`
    pub fn serialize(&self, command: &Command<S>, buf: &mut BytesMut) {
        buf.put_i32_le(command.kind.0);
        command.body.encode(buf);
    }

    pub fn to_bytes(&self, command: &Command<S>) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize(command, &mut buf);
        buf.freeze()
    }

    /// Rebuild a command from `[type][payload]`
    pub fn deserialize(&self, bytes: &[u8]) -> TandemResult<Command<S>> {
        if bytes.len() < COMMAND_TYPE_SIZE {
            return Err(TandemError::TruncatedCommand {
                actual: bytes.len(),
            });
        }
        let kind = CommandType::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut command = self.create(kind)?;
        command.body_mut().decode(&bytes[COMMAND_TYPE_SIZE..])?;
        Ok(command)
    }
}

impl<S> Command<S> {
    fn body_mut(&mut self) -> &mut dyn CommandBody<S> {
        self.body.as_mut()
    }
}

impl<S: 'static> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
