//! End-to-end lockstep scenarios

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use proptest::prelude::*;

use tandem_core::{EngineId, NewEngine, SimState, TandemError, TandemResult, Timestep};
use tandem_runtime::{SyncConfig, Synchronizer, ThinkState};
use tandem_time::{FrameTiming, ManualFrameCalculator};
use tandem_transport::{Channel, ChannelTag, Transport};
use tandem_wire::{serialize_framed, PackageId};

use crate::{
    counter_registry, init_tracing, ChaosConfig, Cluster, CounterState, Gate, GatedLink,
    NudgeCommand, Peer, ScenarioBuilder, SESSION_MESSAGE, SESSION_PORT,
};

/// Host and one joiner wired through gated in-process links
struct GatedPair {
    host: Peer,
    peer: Peer,
    to_host: Gate,
    to_peer: Gate,
}

impl GatedPair {
    fn new(config: SyncConfig) -> TandemResult<Self> {
        let registry = counter_registry()?;
        let timing = FrameTiming::default();

        let host_clock = ManualFrameCalculator::new(timing);
        let mut host = Synchronizer::host(
            CounterState::new(),
            0,
            Arc::clone(&registry),
            Box::new(host_clock.clone()),
            config.clone(),
        )?;
        let peer_clock = ManualFrameCalculator::new(timing);
        let mut peer =
            Synchronizer::joiner(Arc::clone(&registry), Box::new(peer_clock.clone()), config)?;

        let (host_link, peer_link, to_peer, to_host) = GatedLink::pair();
        host.accept_channel(Channel::new(Arc::clone(&registry), Box::new(host_link)))?;
        peer.join_channel(Channel::new(registry, Box::new(peer_link)))?;

        Ok(GatedPair {
            host: Peer {
                sync: host,
                clock: host_clock,
            },
            peer: Peer {
                sync: peer,
                clock: peer_clock,
            },
            to_host,
            to_peer,
        })
    }

    fn step(&mut self) -> TandemResult<(ThinkState, ThinkState)> {
        let host = self.host.sync.think()?;
        let peer = self.peer.sync.think()?;
        self.host.clock.advance(1);
        self.peer.clock.advance(1);
        Ok((host, peer))
    }

    fn joined(&mut self, max_steps: usize) -> TandemResult<bool> {
        for _ in 0..max_steps {
            if self.peer.think_state() == ThinkState::Playing {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(false)
    }
}

fn all_admitted(cluster: &Cluster) -> bool {
    cluster
        .peers()
        .iter()
        .all(|peer| peer.sync.engine_id() != EngineId::UNASSIGNED)
}

#[test]
fn test_two_peer_convergence() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(1).build().unwrap();
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());
    assert_eq!(cluster.peer(1).sync.engine_id(), EngineId::new(1));

    for round in 0..50 {
        cluster.nudge(0, 1).unwrap();
        cluster.nudge(1, 100 + round).unwrap();
        cluster.step().unwrap();
    }
    cluster.run(5).unwrap();
    cluster.settle(5).unwrap();

    let timestep = cluster.converged().expect("peers disagree");
    let host = cluster.host().sync.complete_state().unwrap();
    assert_eq!(host.value, 50 + (100..150).sum::<i64>());
    assert!(cluster.host().sync.roster(timestep).unwrap().contains(EngineId::new(1)));
}

#[test]
fn test_convergence_under_jitter() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new()
        .joiners(2)
        .chaos(ChaosConfig::default())
        .seed(11)
        .build()
        .unwrap();
    assert!(cluster.run_until(200, all_admitted).unwrap());

    for round in 0..60 {
        for index in 0..cluster.len() {
            cluster.nudge(index, round * 3 + index as i32).unwrap();
        }
        cluster.step().unwrap();
    }
    cluster.run(10).unwrap();
    cluster.settle(40).unwrap();

    assert!(cluster.converged().is_some());
    assert_eq!(cluster.host().sync.complete_state().unwrap().log.len(), 180);
    let rollbacks: u64 = cluster
        .peers()
        .iter()
        .map(|peer| peer.sync.stats().rollbacks)
        .sum();
    assert!(rollbacks > 0);
}

#[test]
fn test_complete_never_moves_backwards() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new()
        .joiners(2)
        .chaos(ChaosConfig::poor())
        .seed(5)
        .build()
        .unwrap();

    let mut last: Vec<Option<Timestep>> = cluster.complete_timesteps();
    for round in 0..300 {
        if round % 4 == 0 {
            cluster.nudge_all(1).unwrap();
        }
        cluster.step().unwrap();
        let now = cluster.complete_timesteps();
        for (before, after) in last.iter().zip(&now) {
            if let (Some(before), Some(after)) = (before, after) {
                assert!(after >= before, "complete went from {} to {}", before, after);
            }
        }
        last = now;
    }
    assert!(all_admitted(&cluster));
    assert!(cluster.host().sync.complete_timestep().unwrap() > 100);
}

#[test]
fn test_fairness_rotation_across_peers() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(2).build().unwrap();
    assert!(cluster.run_until(30, Cluster::all_playing).unwrap());

    for _ in 0..30 {
        cluster.nudge_all(1).unwrap();
        cluster.step().unwrap();
    }
    cluster.settle(5).unwrap();
    assert!(cluster.converged().is_some());

    // The host seeds timestep -1, so tick n is applied at timestep n - 1
    let state = cluster.host().sync.complete_state().unwrap();
    let mut checked = 0;
    for tick in 1..=state.tick {
        let mut order = state.order_at(tick);
        order.dedup();
        if order.len() != 3 {
            continue;
        }
        let timestep = tick as i32 - 1;
        let expected: Vec<i32> = (0..3).map(|i| (i + timestep).rem_euclid(3)).collect();
        assert_eq!(order, expected, "tick {}", tick);
        checked += 1;
    }
    assert!(checked >= 20);
}

#[test]
fn test_late_arrival_rolls_back() {
    init_tracing();
    let mut pair = GatedPair::new(SyncConfig::default()).unwrap();
    assert!(pair.joined(20).unwrap());
    for _ in 0..5 {
        pair.step().unwrap();
    }

    pair.to_host.close();
    let late = pair.peer.clock.delayed() + 2;
    pair.peer.sync.apply(NudgeCommand::new(1, 5)).unwrap();
    for _ in 0..20 {
        if pair.host.sync.head_timestep().unwrap() >= late + 5 {
            break;
        }
        pair.step().unwrap();
    }
    assert!(pair.host.sync.head_timestep().unwrap() >= late + 5);
    assert!(pair.host.sync.complete_timestep().unwrap() < late);

    let before: Vec<Vec<u8>> = (late..=late + 5)
        .map(|t| pair.host.sync.state(t).unwrap().encode())
        .collect();
    let rollbacks = pair.host.sync.stats().rollbacks;
    let rethinks = pair.host.sync.stats().rethinks;

    // Only the package carrying the nudge arrives
    assert!(pair.to_host.release_one());
    pair.step().unwrap();

    assert_eq!(pair.host.sync.stats().rollbacks, rollbacks + 1);
    assert!(pair.host.sync.stats().rethinks >= rethinks + 6);
    assert_eq!(pair.host.sync.complete_timestep(), Some(late));
    for (i, t) in (late..=late + 5).enumerate() {
        let after = pair.host.sync.state(t).unwrap();
        assert_eq!(after.value, 5, "timestep {}", t);
        assert_ne!(after.encode(), before[i], "timestep {}", t);
    }

    pair.to_host.open();
    for _ in 0..5 {
        pair.step().unwrap();
    }
    assert_eq!(
        pair.host.sync.complete_state().unwrap().value,
        pair.peer.sync.complete_state().unwrap().value
    );
}

#[test]
fn test_lagging_until_frontier_moves() {
    init_tracing();
    let config = SyncConfig {
        max_frames: 4,
        ..SyncConfig::default()
    };
    let mut pair = GatedPair::new(config).unwrap();
    assert!(pair.joined(20).unwrap());

    pair.to_host.close();
    let mut lagging = false;
    for _ in 0..15 {
        let (host, _) = pair.step().unwrap();
        lagging |= host == ThinkState::Lagging;
    }
    assert!(lagging);
    assert_eq!(pair.host.think_state(), ThinkState::Lagging);
    let stuck = pair.host.sync.complete_timestep().unwrap();

    pair.to_host.open();
    let mut recovered = false;
    for _ in 0..40 {
        let (host, peer) = pair.step().unwrap();
        if host == ThinkState::Playing && peer == ThinkState::Playing {
            recovered = true;
            break;
        }
    }
    assert!(recovered);
    assert!(pair.host.sync.complete_timestep().unwrap() > stuck);
}

#[test]
fn test_held_snapshot_keeps_joiner_waiting() {
    init_tracing();
    let mut pair = GatedPair::new(SyncConfig::default()).unwrap();
    // accept_channel already queued the snapshot; hold everything after it
    pair.to_peer.close();
    let (_, peer) = pair.step().unwrap();
    assert_eq!(peer, ThinkState::Ready);

    for _ in 0..5 {
        let (_, peer) = pair.step().unwrap();
        assert_eq!(peer, ThinkState::Ready);
    }
    assert_eq!(pair.peer.sync.engine_id(), EngineId::UNASSIGNED);

    pair.to_peer.open();
    assert!(pair.joined(5).unwrap());
    assert_eq!(pair.peer.sync.engine_id(), EngineId::new(1));
}

#[test]
fn test_late_joiner_catches_up() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
    for _ in 0..40 {
        cluster.nudge(0, 2).unwrap();
        cluster.step().unwrap();
    }

    let index = cluster.add_joiner().unwrap();
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());
    let joined_at = cluster.peer(index).sync.complete_timestep().unwrap();
    assert!(joined_at >= 38);

    for _ in 0..20 {
        cluster.nudge(0, 2).unwrap();
        cluster.nudge(index, -1).unwrap();
        cluster.step().unwrap();
    }
    cluster.run(5).unwrap();
    cluster.settle(5).unwrap();

    assert!(cluster.converged().is_some());
    let state = cluster.peer(index).sync.complete_state().unwrap();
    assert_eq!(state.value, 60 * 2 - 20);
}

#[test]
fn test_discover_and_join() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
    let host = cluster.host().sync.local_addr().unwrap();

    let mut peer = cluster.joiner().unwrap();
    peer.sync.find_hosts(SESSION_PORT).unwrap();
    let hosts = peer.sync.available_hosts();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].address, host);
    assert_eq!(hosts[0].message, SESSION_MESSAGE);

    peer.sync.connect(hosts[0].address).unwrap();
    peer.sync.clear_hosts();
    assert!(peer.sync.available_hosts().is_empty());
    cluster.push(peer);
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());
}

#[test]
fn test_host_refuses_when_closed() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new()
        .joiners(0)
        .connect_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    cluster.peer_mut(0).sync.disallow_incoming();
    cluster.add_joiner().unwrap();

    let mut failed = false;
    for _ in 0..100 {
        let states = cluster.step().unwrap();
        if states[1] == ThinkState::ConnectionFailed {
            failed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(failed);
    assert_eq!(cluster.host().sync.channel_count(), 0);
    assert_eq!(cluster.step().unwrap()[1], ThinkState::Idle);
}

#[test]
fn test_connect_timeout_then_retry() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new()
        .joiners(0)
        .connect_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let host = cluster.host().sync.local_addr().unwrap();
    let nowhere = "10.200.0.1:7000".parse().unwrap();
    cluster.router().blackhole(nowhere);

    let mut peer = cluster.joiner().unwrap();
    peer.sync.connect(nowhere).unwrap();
    assert_eq!(peer.think_state(), ThinkState::Connecting);

    let mut state = ThinkState::Connecting;
    for _ in 0..200 {
        state = peer.sync.think().unwrap();
        if state != ThinkState::Connecting {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(state, ThinkState::ConnectionFailed);
    assert_eq!(peer.sync.think().unwrap(), ThinkState::Idle);

    peer.sync.connect(host).unwrap();
    cluster.push(peer);
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());
}

#[test]
fn test_refused_connect_fails_fast() {
    let cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
    let mut peer = cluster.joiner().unwrap();
    peer.sync.connect("10.201.0.1:7000".parse().unwrap()).unwrap();
    assert_eq!(peer.think_state(), ThinkState::ConnectionFailed);
    assert_eq!(peer.sync.think().unwrap(), ThinkState::Idle);
}

#[test]
fn test_joiner_loses_host() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(1).build().unwrap();
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());

    let host = cluster.host().sync.local_addr().unwrap();
    let peer = cluster.peer(1).sync.local_addr().unwrap();
    cluster.router().sever(host, peer);

    let states = cluster.step().unwrap();
    assert_ne!(states[0], ThinkState::ConnectionFailed);
    assert_eq!(states[1], ThinkState::ConnectionFailed);
    assert_eq!(cluster.host().sync.channel_count(), 0);
    assert_eq!(cluster.step().unwrap()[1], ThinkState::Idle);
}

#[test]
fn test_duplicate_package_is_fatal() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(0).build().unwrap();
    let host = cluster.host().sync.local_addr().unwrap();

    let mut rogue = cluster.router().transport();
    rogue.startup(SESSION_PORT).unwrap();
    rogue.connect(host).unwrap();
    cluster.run(3).unwrap();
    assert_eq!(cluster.host().sync.channel_count(), 1);
    assert!(rogue.receive(host).is_some());

    let timestep = cluster.host().sync.complete_timestep().unwrap() + 5;
    let id = PackageId::new(timestep, EngineId::new(7));
    let mut buf = BytesMut::new();
    serialize_framed(cluster.registry(), id, &[], &mut buf);
    serialize_framed(cluster.registry(), id, &[], &mut buf);
    rogue.send(host, buf.freeze()).unwrap();

    let err = cluster.step().unwrap_err();
    assert_eq!(
        err,
        TandemError::DuplicatePackage {
            timestep,
            engine: EngineId::new(7)
        }
    );
    assert_eq!(cluster.host().think_state(), ThinkState::Idle);
    assert!(matches!(
        cluster.step(),
        Err(TandemError::InvalidState(_))
    ));
}

#[test]
fn test_malformed_blob_is_dropped() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(1).build().unwrap();
    assert!(cluster.run_until(20, Cluster::all_playing).unwrap());
    let host = cluster.host().sync.local_addr().unwrap();

    let mut rogue = cluster.router().transport();
    rogue.startup(SESSION_PORT).unwrap();
    rogue.connect(host).unwrap();
    cluster.step().unwrap();

    // Unknown command type 99 inside a well-framed package
    let mut blob = Vec::new();
    blob.extend_from_slice(&16u32.to_le_bytes());
    blob.extend_from_slice(&40i32.to_le_bytes());
    blob.extend_from_slice(&9i32.to_le_bytes());
    blob.extend_from_slice(&4u32.to_le_bytes());
    blob.extend_from_slice(&99i32.to_le_bytes());
    rogue.send(host, blob.into()).unwrap();

    cluster.run(3).unwrap();
    assert_eq!(cluster.host().sync.stats().malformed_packages, 1);
    assert!(cluster.all_playing());
}

#[test]
fn test_game_over_reaches_every_peer() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new()
        .joiners(1)
        .game_length(30)
        .build()
        .unwrap();

    let mut seen = vec![false; cluster.len()];
    for _ in 0..80 {
        let states = cluster.step().unwrap();
        for (seen, state) in seen.iter_mut().zip(states) {
            *seen |= state == ThinkState::GameOver;
        }
    }
    assert_eq!(seen, vec![true, true]);
    assert!(cluster
        .peers()
        .iter()
        .all(|peer| peer.think_state() == ThinkState::Idle));
    assert!(cluster.host().sync.complete_state().unwrap().tick >= 30);
}

#[test]
fn test_messages_relayed_between_joiners() {
    init_tracing();
    let mut cluster = ScenarioBuilder::new().joiners(2).build().unwrap();
    assert!(cluster.run_until(30, Cluster::all_playing).unwrap());

    cluster.nudge(2, 9).unwrap();
    cluster.run(10).unwrap();

    let relayed = cluster.host().sync.stats().packages_relayed;
    assert!(relayed > 0);
    let state = cluster.peer(1).sync.complete_state().unwrap();
    assert!(state.log.iter().any(|(_, engine, amount)| *engine == 2 && *amount == 9));
}

/// Feed packages for engines 1 and 2 over `0..=last` in `order`, thinking
/// after every `chunk` packages, and return the final snapshot
fn feed(order: &[(Timestep, i32)], chunk: usize, last: Timestep) -> Vec<u8> {
    let registry = counter_registry().unwrap();
    let clock = ManualFrameCalculator::default();
    let mut host = Synchronizer::host(
        CounterState::new(),
        0,
        Arc::clone(&registry),
        Box::new(clock.clone()),
        SyncConfig::default(),
    )
    .unwrap();
    for engine in 1..=2 {
        host.apply(NewEngine {
            origin: EngineId::HOST,
            temporary: EngineId::new(engine),
            engine: EngineId::new(engine),
        })
        .unwrap();
    }
    let (host_end, mut feeder) = Channel::pair(Arc::clone(&registry));
    host.accept_channel(host_end).unwrap();
    host.think().unwrap();

    for packages in order.chunks(chunk) {
        for &(timestep, engine) in packages {
            let nudge = registry
                .wrap(NudgeCommand::new(engine, timestep * 10 + engine))
                .unwrap();
            let id = PackageId::new(timestep, EngineId::new(engine));
            feeder.queue_commands(ChannelTag::EVENTS, id, &[nudge]);
        }
        feeder.flush_all().unwrap();
        clock.advance(1);
        host.think().unwrap();
    }

    clock.jump_to(clock.delayed().max(last));
    host.think().unwrap();
    host.think().unwrap();
    assert_eq!(host.complete_timestep(), Some(last));
    host.complete_state().unwrap().encode()
}

const LAST: Timestep = 20;

fn packages() -> Vec<(Timestep, i32)> {
    (0..=LAST)
        .flat_map(|t| [(t, 1), (t, 2)])
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_arrival_order_does_not_matter(
        order in Just(packages()).prop_shuffle(),
        chunk in 1usize..8,
    ) {
        let baseline = feed(&packages(), 1, LAST);
        prop_assert_eq!(feed(&order, chunk, LAST), baseline);
    }
}
