//! Deterministic simulation used by the scenarios and benches

use std::any::Any;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use tandem_core::codec::Reader;
use tandem_core::{CommandBody, CommandRegistry, CommandType, SimState, TandemResult};

/// Counter with a log of every nudge it received.
///
/// `tick` counts transitions since the seed, so a log entry tells exactly
/// which timestep applied it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterState {
    pub value: i64,
    pub tick: u32,
    /// `(tick, engine, amount)` in application order
    pub log: Vec<(u32, i32, i32)>,
    /// The simulation ends once `tick` reaches this
    pub limit: Option<u32>,
}

impl CounterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A simulation that ends after `ticks` transitions
    pub fn with_limit(ticks: u32) -> Self {
        CounterState {
            limit: Some(ticks),
            ..Self::default()
        }
    }

    /// Engines in the order their nudges were applied at `tick`
    pub fn order_at(&self, tick: u32) -> Vec<i32> {
        self.log
            .iter()
            .filter(|(t, _, _)| *t == tick)
            .map(|(_, engine, _)| *engine)
            .collect()
    }
}

impl SimState for CounterState {
    fn think(&mut self) -> bool {
        self.tick += 1;
        self.limit.map_or(true, |limit| self.tick < limit)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.log.len() * 12);
        buf.put_i64_le(self.value);
        buf.put_u32_le(self.tick);
        buf.put_u32_le(self.limit.unwrap_or(0));
        buf.put_u32_le(self.log.len() as u32);
        for (tick, engine, amount) in &self.log {
            buf.put_u32_le(*tick);
            buf.put_i32_le(*engine);
            buf.put_i32_le(*amount);
        }
        buf.to_vec()
    }

    fn decode(data: &[u8]) -> TandemResult<Self> {
        let mut reader = Reader::new(data);
        let value = i64::from_le_bytes(reader.read_array()?);
        let tick = reader.read_u32()?;
        let limit = Some(reader.read_u32()?).filter(|limit| *limit > 0);
        let count = reader.read_u32()?;
        let mut log = Vec::new();
        for _ in 0..count {
            log.push((reader.read_u32()?, reader.read_i32()?, reader.read_i32()?));
        }
        reader.finish()?;
        Ok(CounterState {
            value,
            tick,
            log,
            limit,
        })
    }
}

/// Adds `amount` to the counter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NudgeCommand {
    pub engine: i32,
    pub amount: i32,
}

impl NudgeCommand {
    pub const KIND: CommandType = CommandType(1);

    pub fn new(engine: i32, amount: i32) -> Self {
        NudgeCommand { engine, amount }
    }
}

impl CommandBody<CounterState> for NudgeCommand {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.engine);
        buf.put_i32_le(self.amount);
    }

    fn decode(&mut self, payload: &[u8]) -> TandemResult<()> {
        let mut reader = Reader::new(payload);
        self.engine = reader.read_i32()?;
        self.amount = reader.read_i32()?;
        reader.finish()
    }

    fn apply_to_state(&self, state: &mut CounterState) {
        state.value += self.amount as i64;
        state.log.push((state.tick, self.engine, self.amount));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry with the meta commands and [`NudgeCommand`]
pub fn counter_registry() -> TandemResult<Arc<CommandRegistry<CounterState>>> {
    let registry = CommandRegistry::new();
    registry.register::<NudgeCommand>(NudgeCommand::KIND)?;
    Ok(Arc::new(registry))
}
