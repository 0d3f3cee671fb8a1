//! Multi-peer sessions over the in-memory router
//!
//! Every peer owns a [`ManualFrameCalculator`], so a scenario decides
//! exactly when timesteps pass. One [`Cluster::step`] thinks every peer
//! once, in join order, then moves every clock forward one timestep.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tandem_core::{CommandRegistry, TandemError, TandemResult, Timestep};
use tandem_runtime::{SyncConfig, Synchronizer, ThinkState};
use tandem_time::{FrameTiming, ManualFrameCalculator};
use tandem_transport::{shared, MockRouter, SharedTransport};

use crate::{counter_registry, ChaosConfig, ChaosTransport, CounterState, NudgeCommand};

/// Port every scenario session listens on
pub const SESSION_PORT: u16 = 7000;

/// Advert message of scenario hosts
pub const SESSION_MESSAGE: &str = "tandem scenario";

/// One synchronizer and the clock that drives it
pub struct Peer {
    pub sync: Synchronizer<CounterState>,
    pub clock: ManualFrameCalculator,
}

impl Peer {
    pub fn think_state(&self) -> ThinkState {
        self.sync.think_state()
    }

    /// Snapshot bytes at the complete timestep
    pub fn complete_snapshot(&self) -> Option<Vec<u8>> {
        use tandem_core::SimState;
        self.sync.complete_state().ok().map(SimState::encode)
    }
}

/// Builder for a [`Cluster`]
#[derive(Clone, Debug)]
pub struct ScenarioBuilder {
    joiners: usize,
    config: SyncConfig,
    timing: FrameTiming,
    chaos: Option<ChaosConfig>,
    seed: u64,
    initial: CounterState,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        ScenarioBuilder {
            joiners: 1,
            config: SyncConfig::default(),
            timing: FrameTiming::default(),
            chaos: None,
            seed: 0x7a4d,
            initial: CounterState::new(),
        }
    }
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers that join the host
    pub fn joiners(mut self, joiners: usize) -> Self {
        self.joiners = joiners;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.config.max_frames = max_frames;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn timing(mut self, timing: FrameTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Delay every peer's outgoing data
    pub fn chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = Some(chaos);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// End the simulation after `ticks` transitions
    pub fn game_length(mut self, ticks: u32) -> Self {
        self.initial.limit = Some(ticks);
        self
    }

    /// Start the host and have every joiner connect to it
    pub fn build(self) -> TandemResult<Cluster> {
        let registry = counter_registry()?;
        let mut cluster = Cluster {
            router: MockRouter::new(),
            registry,
            peers: Vec::new(),
            config: self.config,
            timing: self.timing,
            chaos: self.chaos,
            seed: self.seed,
        };

        let clock = ManualFrameCalculator::new(cluster.timing);
        let mut host = Synchronizer::host(
            self.initial,
            0,
            Arc::clone(&cluster.registry),
            Box::new(clock.clone()),
            cluster.config.clone(),
        )?;
        host.start_network(cluster.transport(0), SESSION_PORT)?;
        host.allow_incoming(SESSION_MESSAGE)?;
        cluster.peers.push(Peer { sync: host, clock });

        for _ in 0..self.joiners {
            cluster.add_joiner()?;
        }
        Ok(cluster)
    }
}

/// A host plus joiners on one [`MockRouter`]
pub struct Cluster {
    router: MockRouter,
    registry: Arc<CommandRegistry<CounterState>>,
    peers: Vec<Peer>,
    config: SyncConfig,
    timing: FrameTiming,
    chaos: Option<ChaosConfig>,
    seed: u64,
}

impl Cluster {
    fn transport(&self, index: usize) -> SharedTransport {
        let mock = self.router.transport();
        match &self.chaos {
            Some(chaos) => shared(ChaosTransport::new(
                mock,
                chaos.clone(),
                self.seed.wrapping_add(index as u64),
            )),
            None => shared(mock),
        }
    }

    /// A fresh joiner, not yet connected
    pub fn joiner(&self) -> TandemResult<Peer> {
        let clock = ManualFrameCalculator::new(self.timing);
        let mut sync = Synchronizer::joiner(
            Arc::clone(&self.registry),
            Box::new(clock.clone()),
            self.config.clone(),
        )?;
        sync.start_network(self.transport(self.peers.len()), SESSION_PORT)?;
        Ok(Peer { sync, clock })
    }

    /// Add a joiner connecting to the host. Returns its index.
    pub fn add_joiner(&mut self) -> TandemResult<usize> {
        let host = self.host().sync.local_addr().ok_or(TandemError::NotStarted)?;
        let mut peer = self.joiner()?;
        peer.sync.connect(host)?;
        self.peers.push(peer);
        Ok(self.peers.len() - 1)
    }

    /// Take over a peer created with [`Cluster::joiner`]
    pub fn push(&mut self, peer: Peer) -> usize {
        self.peers.push(peer);
        self.peers.len() - 1
    }

    pub fn router(&self) -> &MockRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<CommandRegistry<CounterState>> {
        &self.registry
    }

    pub fn host(&self) -> &Peer {
        &self.peers[0]
    }

    pub fn peer(&self, index: usize) -> &Peer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut Peer {
        &mut self.peers[index]
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Think every peer once, then advance every clock one timestep
    pub fn step(&mut self) -> TandemResult<Vec<ThinkState>> {
        let states = self.think_all()?;
        for peer in &self.peers {
            peer.clock.advance(1);
        }
        Ok(states)
    }

    fn think_all(&mut self) -> TandemResult<Vec<ThinkState>> {
        self.peers.iter_mut().map(|peer| peer.sync.think()).collect()
    }

    pub fn run(&mut self, steps: usize) -> TandemResult<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Step until `done` holds. Returns `false` if `max_steps` ran out.
    pub fn run_until(
        &mut self,
        max_steps: usize,
        done: impl Fn(&Cluster) -> bool,
    ) -> TandemResult<bool> {
        for _ in 0..max_steps {
            if done(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(done(self))
    }

    pub fn all_playing(&self) -> bool {
        self.peers
            .iter()
            .all(|peer| peer.think_state() == ThinkState::Playing)
    }

    /// Queue a nudge on `index` under its own engine id
    pub fn nudge(&mut self, index: usize, amount: i32) -> TandemResult<()> {
        let peer = &mut self.peers[index];
        let engine = peer.sync.engine_id().0;
        peer.sync.apply(NudgeCommand::new(engine, amount))
    }

    /// Every peer nudges once
    pub fn nudge_all(&mut self, amount: i32) -> TandemResult<()> {
        for index in 0..self.peers.len() {
            self.nudge(index, amount)?;
        }
        Ok(())
    }

    /// Line every clock up with the furthest one and think without
    /// advancing time until in-flight data has landed.
    pub fn settle(&mut self, rounds: usize) -> TandemResult<()> {
        let target = self
            .peers
            .iter()
            .map(|peer| peer.clock.delayed())
            .max()
            .unwrap_or_default();
        for peer in &self.peers {
            peer.clock.jump_to(target);
        }
        for _ in 0..rounds {
            self.think_all()?;
        }
        debug!(timestep = target, "cluster settled");
        Ok(())
    }

    pub fn complete_timesteps(&self) -> Vec<Option<Timestep>> {
        self.peers
            .iter()
            .map(|peer| peer.sync.complete_timestep())
            .collect()
    }

    /// The shared complete timestep, if every peer agrees on it and on
    /// the snapshot bytes there
    pub fn converged(&self) -> Option<Timestep> {
        let first = self.peers.first()?;
        let timestep = first.sync.complete_timestep()?;
        let snapshot = first.complete_snapshot()?;
        self.peers
            .iter()
            .all(|peer| {
                peer.sync.complete_timestep() == Some(timestep)
                    && peer.complete_snapshot().as_ref() == Some(&snapshot)
            })
            .then_some(timestep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_connects_joiners() {
        let cluster = ScenarioBuilder::new().joiners(2).build().unwrap();
        assert_eq!(cluster.len(), 3);
        assert!(cluster.host().sync.is_host());
        assert_eq!(cluster.host().think_state(), ThinkState::Playing);
        assert_eq!(cluster.peer(1).think_state(), ThinkState::Connecting);
        assert_eq!(cluster.peer(2).think_state(), ThinkState::Connecting);
        assert_eq!(cluster.router().endpoint_count(), 3);
    }

    #[test]
    fn test_host_alone_converges_with_itself() {
        let mut cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
        cluster.nudge(0, 4).unwrap();
        cluster.run(10).unwrap();
        cluster.settle(2).unwrap();

        let timestep = cluster.converged().unwrap();
        assert_eq!(Some(timestep), cluster.host().sync.complete_timestep());
        assert_eq!(cluster.host().sync.complete_state().unwrap().value, 4);
    }

    #[test]
    fn test_nudge_uses_engine_id() {
        let mut cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
        cluster.nudge_all(1).unwrap();
        cluster.run(4).unwrap();
        let state = cluster.host().sync.head_state().unwrap();
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log[0].1, 0);
    }
}
