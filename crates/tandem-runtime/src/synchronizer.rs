//! Lockstep synchronizer
//!
//! A synchronizer keeps one engine's view of the shared simulation history.
//! Local commands are flushed as one package per timestep to every channel;
//! received packages are recorded, relayed to every other channel once
//! accepted, and any computed timestep they invalidate is recomputed. The complete
//! timestep is the last one for which every expected engine's package has
//! arrived. It never moves backwards.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use tandem_core::{
    Command, CommandBody, CommandRegistry, CommandType, EngineId, NewEngine, ReadyToPlay, Roster,
    SimState, SnapshotTransfer, TandemError, TandemResult, Timestep,
};
use tandem_state::HistoryWindow;
use tandem_time::{FrameCalculator, FrameTiming};
use tandem_transport::{Channel, ChannelTag, HostAdvert, ReceivedPackage, SharedTransport};
use tandem_wire::{EventPackage, PackageId};

use crate::SyncConfig;

/// Result of one [`Synchronizer::think`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThinkState {
    /// Nothing to do
    Idle,
    /// Waiting for the transport to report the host connection
    Connecting,
    /// Connected, waiting for the host's snapshot
    Joining,
    /// Snapshot installed, waiting to be admitted
    Ready,
    Playing,
    /// The current timestep ran past the history window
    Lagging,
    /// The simulation ended at the complete timestep
    GameOver,
    ConnectionFailed,
}

/// Synchronizer counters
#[derive(Clone, Debug, Default)]
pub struct SyncStats {
    pub thinks: u64,
    /// Recomputations of an already computed timestep
    pub rethinks: u64,
    pub packages_sent: u64,
    pub packages_received: u64,
    pub packages_relayed: u64,
    pub malformed_packages: u64,
    pub deferred_packages: u64,
    /// Received packages that invalidated a computed timestep
    pub rollbacks: u64,
    pub last_think_duration: Duration,
}

/// A package ahead of the window
struct Deferred<S> {
    package: EventPackage<S>,
    raw: Bytes,
}

/// Join handshake as seen by the joiner
#[derive(Clone, Copy, Debug)]
struct Admission {
    source: EngineId,
    temporary: EngineId,
}

/// Deterministic lockstep synchronizer for one engine
pub struct Synchronizer<S: SimState> {
    registry: Arc<CommandRegistry<S>>,
    config: SyncConfig,
    calculator: Box<dyn FrameCalculator>,
    /// Created at start for the host, at snapshot install for a joiner
    history: Option<HistoryWindow<S>>,
    state: ThinkState,
    is_host: bool,
    engine_id: EngineId,
    /// Locally applied commands not yet flushed
    pending: Vec<Command<S>>,
    last_flushed: Timestep,
    /// Oldest timestep invalidated since the last recomputation
    dirty: Timestep,
    head: Timestep,
    channels: BTreeMap<u64, Channel<S>>,
    /// Channels whose link closed, drained once more before dropping
    closing: Vec<(u64, Channel<S>)>,
    next_channel: u64,
    transport: Option<SharedTransport>,
    accepting: bool,
    /// Connections we refused
    refused: HashSet<SocketAddr>,
    connect_target: Option<(SocketAddr, Instant)>,
    join_started: Option<Instant>,
    join_buffer: Vec<ReceivedPackage<S>>,
    admission: Option<Admission>,
    /// Host side: engine ids handed out so far
    next_engine: i32,
    next_temporary: i32,
    admitted: HashSet<EngineId>,
    deferred: VecDeque<Deferred<S>>,
    link_lost: bool,
    fault: Option<TandemError>,
    stats: SyncStats,
}

impl<S: SimState> Synchronizer<S> {
    /// Start a session as the host.
    ///
    /// `initial` is installed at `initial_timestep - 1` with a roster of
    /// just the host; the first computed timestep is `initial_timestep`.
    pub fn host(
        initial: S,
        initial_timestep: Timestep,
        registry: Arc<CommandRegistry<S>>,
        mut calculator: Box<dyn FrameCalculator>,
        config: SyncConfig,
    ) -> TandemResult<Self> {
        config.validate(&calculator.timing())?;
        let seed = initial_timestep - 1;
        let history = HistoryWindow::seeded(config.max_frames, seed, initial, [EngineId::HOST])?;
        calculator.set(initial_timestep);

        info!(timestep = initial_timestep, "hosting session");
        let mut sync = Self::empty(registry, calculator, config);
        sync.history = Some(history);
        sync.is_host = true;
        sync.engine_id = EngineId::HOST;
        sync.last_flushed = seed;
        sync.dirty = initial_timestep;
        sync.head = seed;
        sync.state = ThinkState::Playing;
        Ok(sync)
    }

    /// A peer that will join an existing session
    pub fn joiner(
        registry: Arc<CommandRegistry<S>>,
        calculator: Box<dyn FrameCalculator>,
        config: SyncConfig,
    ) -> TandemResult<Self> {
        config.validate(&calculator.timing())?;
        Ok(Self::empty(registry, calculator, config))
    }

    fn empty(
        registry: Arc<CommandRegistry<S>>,
        calculator: Box<dyn FrameCalculator>,
        config: SyncConfig,
    ) -> Self {
        Synchronizer {
            registry,
            config,
            calculator,
            history: None,
            state: ThinkState::Idle,
            is_host: false,
            engine_id: EngineId::UNASSIGNED,
            pending: Vec::new(),
            last_flushed: 0,
            dirty: 0,
            head: 0,
            channels: BTreeMap::new(),
            closing: Vec::new(),
            next_channel: 0,
            transport: None,
            accepting: false,
            refused: HashSet::new(),
            connect_target: None,
            join_started: None,
            join_buffer: Vec::new(),
            admission: None,
            next_engine: 1,
            next_temporary: 1,
            admitted: HashSet::new(),
            deferred: VecDeque::new(),
            link_lost: false,
            fault: None,
            stats: SyncStats::default(),
        }
    }

    // ---- Networking ----

    /// Start the transport on `port` and drive it from `think`
    pub fn start_network(&mut self, transport: SharedTransport, port: u16) -> TandemResult<()> {
        transport.lock().startup(port)?;
        self.transport = Some(transport);
        Ok(())
    }

    fn transport(&self) -> TandemResult<&SharedTransport> {
        self.transport.as_ref().ok_or(TandemError::NotStarted)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref()?.lock().local_addr()
    }

    /// Advertise the session and admit new connections
    pub fn allow_incoming(&mut self, message: &str) -> TandemResult<()> {
        if !self.is_host {
            return Err(TandemError::InvalidState(
                "only the host admits new peers".into(),
            ));
        }
        self.transport()?.lock().start_hosting(message)?;
        self.accepting = true;
        Ok(())
    }

    pub fn disallow_incoming(&mut self) {
        self.accepting = false;
        if let Some(transport) = &self.transport {
            transport.lock().stop_hosting();
        }
    }

    pub fn find_hosts(&mut self, port: u16) -> TandemResult<()> {
        self.transport()?.lock().find_hosts(port)
    }

    pub fn clear_hosts(&mut self) {
        if let Some(transport) = &self.transport {
            transport.lock().clear_hosts();
        }
    }

    pub fn available_hosts(&self) -> Vec<HostAdvert> {
        self.transport
            .as_ref()
            .map(|transport| transport.lock().available_hosts())
            .unwrap_or_default()
    }

    /// Connect to a host and join its session.
    ///
    /// A refused connection is reported as [`ThinkState::ConnectionFailed`]
    /// by the next `think`.
    pub fn connect(&mut self, address: SocketAddr) -> TandemResult<()> {
        self.check_can_join()?;
        let result = self.transport()?.lock().connect(address);
        match result {
            Ok(()) => {
                info!(%address, "connecting");
                self.connect_target = Some((address, Instant::now()));
                self.state = ThinkState::Connecting;
            }
            Err(e) => {
                warn!(%address, error = %e, "connect failed");
                self.state = ThinkState::ConnectionFailed;
            }
        }
        Ok(())
    }

    /// Join over an already established channel
    pub fn join_channel(&mut self, channel: Channel<S>) -> TandemResult<()> {
        self.check_can_join()?;
        self.begin_join(channel);
        Ok(())
    }

    /// Admit a peer over an already established channel (host only)
    pub fn accept_channel(&mut self, channel: Channel<S>) -> TandemResult<()> {
        if !self.is_host {
            return Err(TandemError::InvalidState(
                "only the host admits new peers".into(),
            ));
        }
        self.admit_peer(channel)
    }

    fn check_can_join(&self) -> TandemResult<()> {
        let idle = matches!(self.state, ThinkState::Idle | ThinkState::ConnectionFailed);
        if self.is_host || self.history.is_some() || !idle {
            return Err(TandemError::InvalidState(format!(
                "cannot join from {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn add_channel(&mut self, channel: Channel<S>) -> u64 {
        let id = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(id, channel);
        id
    }

    // ---- Local commands ----

    /// Queue a command for the next flushed timestep
    pub fn apply_command(&mut self, command: Command<S>) {
        self.pending.push(command);
    }

    pub fn apply_commands(&mut self, commands: impl IntoIterator<Item = Command<S>>) {
        self.pending.extend(commands);
    }

    /// Wrap and queue a command body
    pub fn apply<C: CommandBody<S>>(&mut self, body: C) -> TandemResult<()> {
        let command = self.registry.wrap(body)?;
        self.apply_command(command);
        Ok(())
    }

    // ---- Think ----

    /// Run one frame. Protocol faults are returned once and halt the
    /// synchronizer.
    pub fn think(&mut self) -> TandemResult<ThinkState> {
        if let Some(fault) = &self.fault {
            return Err(TandemError::InvalidState(format!(
                "synchronizer halted after: {}",
                fault
            )));
        }

        let start = Instant::now();
        self.stats.thinks += 1;

        let result = match self.state {
            ThinkState::Idle => Ok(ThinkState::Idle),
            ThinkState::Connecting => self.think_connecting(),
            ThinkState::Joining => self.think_joining(),
            ThinkState::Ready => self.think_session(false),
            ThinkState::Playing | ThinkState::Lagging => self.think_session(true),
            ThinkState::GameOver | ThinkState::ConnectionFailed => {
                self.state = ThinkState::Idle;
                Ok(ThinkState::Idle)
            }
        };

        self.stats.last_think_duration = start.elapsed();
        result.map_err(|e| {
            error!(engine = %self.engine_id, error = %e, "synchronizer halted");
            self.fault = Some(e.clone());
            self.state = ThinkState::Idle;
            e
        })
    }

    fn think_session(&mut self, flush: bool) -> TandemResult<ThinkState> {
        // Stage 1: Pump the transport and admit new peers
        self.pump_transport()?;
        let frame = self.calculator.frame();

        // Stage 2: Flush local commands
        if flush {
            self.flush_local(frame.current)?;
        }

        // Stage 3: Ingest, relay and record
        self.ingest()?;

        let history = self
            .history
            .as_mut()
            .ok_or_else(|| TandemError::InvalidState("session without history".into()))?;

        // Stage 4: Recompute invalidated timesteps
        let target = frame.delayed.min(history.last_index()).max(self.head);
        if self.dirty <= target {
            self.stats.rethinks += history.recreate_range(self.dirty, target)?;
        }

        // Stage 5: Move the complete frontier and evict
        let complete = history.update_complete()?;
        let evicted = history.advance();

        // Stage 6: Reset the dirty frontier
        self.head = target;
        self.dirty = target + 1;
        debug!(
            engine = %self.engine_id,
            head = target,
            complete,
            evicted,
            "think"
        );

        // Stage 7: Report
        if history.roster(complete)?.finished {
            info!(timestep = complete, "simulation finished");
            self.state = ThinkState::GameOver;
        } else if self.link_lost {
            warn!(engine = %self.engine_id, "lost connection to session");
            self.state = ThinkState::ConnectionFailed;
        } else if self.state != ThinkState::Ready {
            self.state = if frame.current > history.last_index() {
                ThinkState::Lagging
            } else {
                ThinkState::Playing
            };
        }
        Ok(self.state)
    }

    /// Pump the transport, drop channels whose link vanished and pick up
    /// new connections
    fn pump_transport(&mut self) -> TandemResult<()> {
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        let connections: HashSet<SocketAddr> = {
            let mut transport = transport.lock();
            transport.think();
            transport.connections().into_iter().collect()
        };

        let lost: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.peer().map_or(false, |a| !connections.contains(&a)))
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            if let Some(channel) = self.channels.remove(&id) {
                warn!(peer = ?channel.peer(), "peer disconnected");
                self.closing.push((id, channel));
            }
        }
        self.note_channel_loss();

        let known: HashSet<SocketAddr> =
            self.channels.values().filter_map(Channel::peer).collect();
        let mut fresh: Vec<SocketAddr> = connections
            .into_iter()
            .filter(|a| !known.contains(a) && !self.refused.contains(a))
            .collect();
        fresh.sort();

        for address in fresh {
            if self.is_host && self.accepting {
                info!(%address, "peer connected");
                let channel =
                    Channel::network(Arc::clone(&self.registry), address, Arc::clone(&transport));
                self.admit_peer(channel)?;
            } else {
                warn!(%address, "refusing connection");
                self.refused.insert(address);
                transport.lock().disconnect(address);
            }
        }
        Ok(())
    }

    fn note_channel_loss(&mut self) {
        if !self.is_host && self.channels.is_empty() && self.state != ThinkState::Idle {
            self.link_lost = true;
        }
    }

    /// Send a new peer the complete snapshot and everything recorded after it
    fn admit_peer(&mut self, mut channel: Channel<S>) -> TandemResult<()> {
        let history = self
            .history
            .as_ref()
            .ok_or_else(|| TandemError::InvalidState("host without history".into()))?;
        let complete = history.complete_timestep();
        let timing = self.calculator.timing();
        let temporary = EngineId::new(self.next_temporary);
        self.next_temporary += 1;

        let snapshot = SnapshotTransfer {
            state: history.state(complete)?.encode(),
            timestep: complete,
            engines: history.roster(complete)?.engines.iter().copied().collect(),
            source_engine: self.engine_id,
            temporary_engine: temporary,
            max_frames: history.max_frames() as u32,
            ms_per_frame: timing.ms_per_frame,
            input_delay: timing.input_delay,
            host_frame: self.calculator.frame().delayed,
        };
        let snapshot = self.registry.wrap(snapshot)?;
        channel.queue_commands(
            ChannelTag::SNAPSHOT,
            PackageId::new(complete, self.engine_id),
            &[snapshot],
        );

        let mut backlog = 0;
        for timestep in complete + 1..=history.last_index() {
            for (engine, commands) in history.batch(timestep)? {
                let id = PackageId::new(timestep, *engine);
                channel.queue_commands(ChannelTag::EVENTS, id, commands);
                backlog += 1;
            }
        }
        for deferred in &self.deferred {
            channel.queue_encoded(ChannelTag::EVENTS, &deferred.raw);
            backlog += 1;
        }

        let sent = channel
            .flush(ChannelTag::SNAPSHOT)
            .and_then(|()| channel.flush(ChannelTag::EVENTS));
        if let Err(e) = sent {
            warn!(peer = ?channel.peer(), error = %e, "could not send snapshot");
            return Ok(());
        }

        info!(
            peer = ?channel.peer(),
            timestep = complete,
            temporary = %temporary,
            backlog,
            "snapshot sent"
        );
        self.stats.packages_sent += backlog + 1;
        self.add_channel(channel);
        Ok(())
    }

    fn flush_local(&mut self, current: Timestep) -> TandemResult<()> {
        let history = self
            .history
            .as_mut()
            .ok_or_else(|| TandemError::InvalidState("session without history".into()))?;
        let end = current.min(history.last_index());

        let mut timestep = self.last_flushed + 1;
        while timestep <= end {
            // The first flushed timestep carries everything pending
            let commands = std::mem::take(&mut self.pending);
            let id = PackageId::new(timestep, self.engine_id);
            for channel in self.channels.values_mut() {
                channel.queue_commands(ChannelTag::EVENTS, id, &commands);
                self.stats.packages_sent += 1;
            }
            history.record(timestep, self.engine_id, commands)?;
            self.dirty = self.dirty.min(timestep);
            self.last_flushed = timestep;
            timestep += 1;
        }

        self.flush_channels();
        Ok(())
    }

    fn flush_channels(&mut self) {
        let mut failed = Vec::new();
        for (id, channel) in self.channels.iter_mut() {
            if let Err(e) = channel.flush_all() {
                warn!(peer = ?channel.peer(), error = %e, "dropping channel");
                failed.push(*id);
            }
        }
        for id in failed {
            self.channels.remove(&id);
        }
        self.note_channel_loss();
    }

    fn ingest(&mut self) -> TandemResult<()> {
        let retry = std::mem::take(&mut self.deferred);
        for Deferred { package, raw } in retry {
            self.record_package(package, raw, true)?;
        }

        // Whatever a lost peer sent before closing still counts
        for (origin, mut channel) in std::mem::take(&mut self.closing) {
            let received = channel.receive();
            self.stats.malformed_packages += channel.take_malformed();
            self.ingest_from(origin, received)?;
        }

        let ids: Vec<u64> = self.channels.keys().copied().collect();
        for origin in ids {
            let Some(channel) = self.channels.get_mut(&origin) else {
                continue;
            };
            let received = channel.receive();
            self.stats.malformed_packages += channel.take_malformed();
            self.ingest_from(origin, received)?;
        }

        self.flush_channels();
        Ok(())
    }

    fn ingest_from(&mut self, origin: u64, received: Vec<ReceivedPackage<S>>) -> TandemResult<()> {
        for ReceivedPackage { package, raw } in received {
            self.stats.packages_received += 1;
            if package.is_ready_only() {
                self.handle_ready(&package);
                continue;
            }
            self.handle_admission(&package);
            if self.record_package(package, raw.clone(), false)? {
                self.relay(origin, &raw);
            }
        }
        Ok(())
    }

    /// Host answers a joiner's ready signal with an engine id
    fn handle_ready(&mut self, package: &EventPackage<S>) {
        if !self.is_host {
            debug!(package = ?package.id, "ignoring ready signal");
            return;
        }
        for command in &package.commands {
            let Some(ready) = command.downcast_ref::<ReadyToPlay>() else {
                continue;
            };
            if ready.origin != self.engine_id || !self.admitted.insert(ready.temporary) {
                continue;
            }
            let admit = NewEngine {
                origin: self.engine_id,
                temporary: ready.temporary,
                engine: EngineId::new(self.next_engine),
            };
            self.next_engine += 1;
            info!(temporary = %admit.temporary, engine = %admit.engine, "admitting engine");
            match self.registry.wrap(admit) {
                Ok(command) => self.pending.push(command),
                Err(e) => warn!(error = %e, "cannot admit engine"),
            }
        }
    }

    /// Joiner picks up its permanent engine id
    fn handle_admission(&mut self, package: &EventPackage<S>) {
        if self.state != ThinkState::Ready {
            return;
        }
        let Some(admission) = self.admission else {
            return;
        };
        let admitted = package
            .commands
            .iter()
            .filter_map(|c| c.downcast_ref::<NewEngine>())
            .find(|n| n.admits(admission.source, admission.temporary));
        let Some(admit) = admitted else {
            return;
        };

        let timestep = package.id.timestep;
        self.engine_id = admit.engine;
        self.last_flushed = timestep - 1;
        self.state = ThinkState::Playing;

        let frame = self.calculator.frame();
        if frame.current < timestep {
            let delay = self.calculator.timing().input_delay as Timestep;
            self.calculator.set(timestep - delay);
        }
        info!(engine = %admit.engine, timestep, "admitted to session");
    }

    fn relay(&mut self, origin: u64, raw: &Bytes) {
        for (id, channel) in self.channels.iter_mut() {
            if *id != origin {
                channel.queue_encoded(ChannelTag::EVENTS, raw);
                self.stats.packages_relayed += 1;
            }
        }
    }

    /// Record or defer a received package. Returns `false` if it was
    /// dropped, in which case it must not be relayed either.
    fn record_package(
        &mut self,
        package: EventPackage<S>,
        raw: Bytes,
        retry: bool,
    ) -> TandemResult<bool> {
        let history = self
            .history
            .as_mut()
            .ok_or_else(|| TandemError::InvalidState("session without history".into()))?;
        let EventPackage { id, commands } = package;

        if id.timestep > history.last_index() {
            if self.deferred.len() >= self.config.max_deferred_packages {
                warn!(package = ?id, "deferred queue full, dropping package");
                return Ok(false);
            }
            if !retry {
                self.stats.deferred_packages += 1;
            }
            self.deferred.push_back(Deferred {
                package: EventPackage::new(id, commands),
                raw,
            });
            return Ok(true);
        }

        // Evicted timesteps were complete, so every roster engine already
        // delivered there.
        if id.timestep < history.first_index() {
            let first = history.first_index();
            if id.engine.is_host() || history.roster(first)?.contains(id.engine) {
                return Err(TandemError::DuplicatePackage {
                    timestep: id.timestep,
                    engine: id.engine,
                });
            }
            warn!(package = ?id, first, "evicted package from engine outside the roster");
            return Ok(false);
        }

        if id.timestep <= history.complete_timestep()
            && !id.engine.is_host()
            && !history.roster(id.timestep)?.contains(id.engine)
        {
            warn!(package = ?id, "package from engine outside the roster");
            return Ok(false);
        }

        history.record(id.timestep, id.engine, commands)?;
        if id.timestep < self.dirty {
            if id.timestep <= self.head {
                self.stats.rollbacks += 1;
            }
            self.dirty = id.timestep;
        }
        Ok(true)
    }

    // ---- Join ----

    fn begin_join(&mut self, channel: Channel<S>) {
        info!(peer = ?channel.peer(), "joining session");
        self.add_channel(channel);
        self.join_started = Some(Instant::now());
        self.link_lost = false;
        self.state = ThinkState::Joining;
    }

    fn think_connecting(&mut self) -> TandemResult<ThinkState> {
        let Some((address, started)) = self.connect_target else {
            self.state = ThinkState::Idle;
            return Ok(self.state);
        };
        let transport = Arc::clone(self.transport()?);
        let connected = {
            let mut transport = transport.lock();
            transport.think();
            transport.connections().contains(&address)
        };

        if connected {
            self.connect_target = None;
            let channel = Channel::network(Arc::clone(&self.registry), address, transport);
            self.begin_join(channel);
        } else if started.elapsed() > self.config.connect_timeout {
            warn!(%address, "connect timed out");
            self.connect_target = None;
            self.state = ThinkState::ConnectionFailed;
        }
        Ok(self.state)
    }

    fn think_joining(&mut self) -> TandemResult<ThinkState> {
        self.pump_transport()?;

        // A host that closed right after sending may have left the snapshot behind
        let mut closing: Vec<Channel<S>> = std::mem::take(&mut self.closing)
            .into_iter()
            .map(|(_, channel)| channel)
            .collect();
        for channel in self.channels.values_mut().chain(closing.iter_mut()) {
            let received = channel.receive();
            self.stats.malformed_packages += channel.take_malformed();
            self.stats.packages_received += received.len() as u64;
            self.join_buffer.extend(received);
        }

        let snapshot = self
            .join_buffer
            .iter()
            .find_map(|r| r.package.find::<SnapshotTransfer>())
            .cloned();
        match snapshot {
            Some(snapshot) => {
                let buffered = std::mem::take(&mut self.join_buffer);
                self.install_snapshot(snapshot, buffered)?;
            }
            None if self.channels.is_empty() => {
                warn!("lost host before snapshot arrived");
                self.abandon_join();
            }
            None => {
                let waited = self.join_started.map_or(Duration::ZERO, |s| s.elapsed());
                if waited > self.config.connect_timeout {
                    warn!("no snapshot from host");
                    self.abandon_join();
                }
            }
        }
        Ok(self.state)
    }

    /// Size the history at the snapshot, replay the backlog and tell the
    /// host we are ready
    fn install_snapshot(
        &mut self,
        snapshot: SnapshotTransfer,
        buffered: Vec<ReceivedPackage<S>>,
    ) -> TandemResult<()> {
        let base = snapshot.timestep;
        let max_frames = snapshot.max_frames as usize;
        let state = match S::decode(&snapshot.state) {
            Ok(state) if max_frames > 0 => state,
            Ok(_) => {
                warn!(timestep = base, "rejecting snapshot with empty window");
                self.abandon_join();
                return Ok(());
            }
            Err(e) => {
                warn!(timestep = base, error = %e, "rejecting malformed snapshot");
                self.abandon_join();
                return Ok(());
            }
        };
        let mut history =
            HistoryWindow::seeded(max_frames, base, state, snapshot.engines.iter().copied())?;

        let mut newest = base;
        for ReceivedPackage { package, .. } in buffered {
            let id = package.id;
            if id.timestep <= base
                || package.is_ready_only()
                || package.contains_kind(CommandType::SNAPSHOT_TRANSFER)
            {
                continue;
            }
            if id.timestep > history.last_index() {
                return Err(TandemError::JoinBacklogExceedsWindow {
                    snapshot: base,
                    newest: id.timestep,
                    capacity: history.capacity(),
                });
            }
            history.record(id.timestep, id.engine, package.commands)?;
            newest = newest.max(id.timestep);
        }

        self.stats.rethinks += history.recreate_range(base + 1, newest)?;
        history.update_complete()?;
        history.advance();

        self.calculator.set_timing(FrameTiming::new(
            snapshot.ms_per_frame,
            snapshot.input_delay,
        ));
        self.calculator.set(snapshot.host_frame);

        self.history = Some(history);
        self.head = newest;
        self.dirty = newest + 1;
        self.admission = Some(Admission {
            source: snapshot.source_engine,
            temporary: snapshot.temporary_engine,
        });

        let ready = self.registry.wrap(ReadyToPlay {
            origin: snapshot.source_engine,
            temporary: snapshot.temporary_engine,
        })?;
        let id = PackageId::new(newest, snapshot.temporary_engine);
        for channel in self.channels.values_mut() {
            channel.queue_commands(ChannelTag::EVENTS, id, std::slice::from_ref(&ready));
            self.stats.packages_sent += 1;
        }
        self.flush_channels();

        info!(
            timestep = base,
            newest,
            temporary = %snapshot.temporary_engine,
            "snapshot installed"
        );
        self.state = ThinkState::Ready;
        Ok(())
    }

    /// Drop the link to the host so `connect` can be tried again
    fn abandon_join(&mut self) {
        if let Some(transport) = &self.transport {
            let mut transport = transport.lock();
            for channel in self.channels.values() {
                if let Some(address) = channel.peer() {
                    transport.disconnect(address);
                }
            }
        }
        self.channels.clear();
        self.closing.clear();
        self.join_buffer.clear();
        self.join_started = None;
        self.admission = None;
        self.state = ThinkState::ConnectionFailed;
    }

    // ---- Accessors ----

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn think_state(&self) -> ThinkState {
        self.state
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CommandRegistry<S>> {
        &self.registry
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fault that halted this synchronizer, if any
    pub fn fault(&self) -> Option<&TandemError> {
        self.fault.as_ref()
    }

    fn history(&self) -> TandemResult<&HistoryWindow<S>> {
        self.history
            .as_ref()
            .ok_or_else(|| TandemError::InvalidState("no history before joining".into()))
    }

    pub fn complete_timestep(&self) -> Option<Timestep> {
        self.history.as_ref().map(HistoryWindow::complete_timestep)
    }

    pub fn head_timestep(&self) -> Option<Timestep> {
        self.history.as_ref().map(|_| self.head)
    }

    /// Stable state every peer agrees on
    pub fn complete_state(&self) -> TandemResult<&S> {
        let history = self.history()?;
        history.state(history.complete_timestep())
    }

    /// Newest computed state, possibly revised later
    pub fn head_state(&self) -> TandemResult<&S> {
        self.history()?.state(self.head)
    }

    pub fn state(&self, timestep: Timestep) -> TandemResult<&S> {
        self.history()?.state(timestep)
    }

    pub fn roster(&self, timestep: Timestep) -> TandemResult<&Roster> {
        self.history()?.roster(timestep)
    }

    pub fn frame_calculator(&self) -> &dyn FrameCalculator {
        self.calculator.as_ref()
    }

    pub fn frame_calculator_mut(&mut self) -> &mut dyn FrameCalculator {
        self.calculator.as_mut()
    }
}
