//! Network chaos for lockstep sessions
//!
//! The synchronizer expects a reliable, ordered stream per peer, so chaos
//! here means latency and jitter only:
//! - Every packet is held for a base latency plus sampled jitter
//! - A packet is never delivered before an earlier packet on the same link
//!
//! Time is virtual and advances by `ChaosConfig::tick` on every
//! `Transport::think`, so scenarios stay reproducible for a given seed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use tandem_core::{TandemError, TandemResult};
use tandem_transport::{HostAdvert, Link, Transport};

/// Jitter distribution type
#[derive(Clone, Debug)]
pub enum JitterDistribution {
    /// Uniform distribution
    Uniform { min_ms: u32, max_ms: u32 },
    /// Pareto distribution (heavy tail)
    Pareto { scale_ms: f64, shape: f64 },
}

impl JitterDistribution {
    /// Sample a jitter value
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        match self {
            JitterDistribution::Uniform { min_ms, max_ms } => {
                let dist = Uniform::new_inclusive(*min_ms, *max_ms);
                Duration::from_millis(dist.sample(rng) as u64)
            }
            JitterDistribution::Pareto { scale_ms, shape } => {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                let value = scale_ms / u.powf(1.0 / shape);
                // Cap at 1 second
                Duration::from_millis(value.min(1000.0) as u64)
            }
        }
    }
}

/// Network chaos configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Base latency
    pub base_latency: Duration,
    /// Jitter distribution
    pub jitter: JitterDistribution,
    /// Virtual time per transport think
    pub tick: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(30),
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 40,
            },
            tick: Duration::from_millis(33),
        }
    }
}

impl ChaosConfig {
    /// Good network conditions
    pub fn good() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(5),
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 10,
            },
            tick: Duration::from_millis(33),
        }
    }

    /// Poor network conditions
    pub fn poor() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(120),
            jitter: JitterDistribution::Pareto {
                scale_ms: 40.0,
                shape: 1.5,
            },
            tick: Duration::from_millis(33),
        }
    }

    /// Fixed latency, no jitter
    pub fn fixed(latency: Duration) -> Self {
        ChaosConfig {
            base_latency: latency,
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 0,
            },
            tick: Duration::from_millis(33),
        }
    }
}

/// Packet in the chaos network
#[derive(Clone, Debug)]
struct ChaosPacket {
    data: Bytes,
    delivery_time: Duration,
    send_time: Duration,
}

/// Chaos network statistics
#[derive(Clone, Debug, Default)]
pub struct ChaosStats {
    pub packets_sent: u64,
    pub packets_delivered: u64,
    /// Packets held back behind a slower packet on the same link
    pub packets_held: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl ChaosStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.packets_delivered == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.packets_delivered as f64
        }
    }
}

/// Per-link delay queues in virtual time
pub struct ChaosNetwork {
    config: ChaosConfig,
    rng: StdRng,
    links: HashMap<SocketAddr, VecDeque<ChaosPacket>>,
    current_time: Duration,
    stats: ChaosStats,
}

impl ChaosNetwork {
    /// Create a new chaos network with seed
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        ChaosNetwork {
            config,
            rng: StdRng::seed_from_u64(seed),
            links: HashMap::new(),
            current_time: Duration::ZERO,
            stats: ChaosStats::default(),
        }
    }

    /// Queue a packet for `address`
    pub fn send(&mut self, address: SocketAddr, data: Bytes) {
        self.stats.packets_sent += 1;

        let jitter = self.config.jitter.sample(&mut self.rng);
        let mut delivery_time = self.current_time + self.config.base_latency + jitter;

        let queue = self.links.entry(address).or_default();
        if let Some(last) = queue.back() {
            if last.delivery_time > delivery_time {
                delivery_time = last.delivery_time;
                self.stats.packets_held += 1;
            }
        }
        queue.push_back(ChaosPacket {
            data,
            delivery_time,
            send_time: self.current_time,
        });
    }

    /// Advance time and collect delivered packets, oldest first per link
    pub fn tick(&mut self, dt: Duration) -> Vec<(SocketAddr, Bytes)> {
        self.current_time += dt;
        let now = self.current_time;

        let mut delivered = Vec::new();
        for (address, queue) in self.links.iter_mut() {
            while queue
                .front()
                .map_or(false, |packet| packet.delivery_time <= now)
            {
                let Some(packet) = queue.pop_front() else {
                    break;
                };
                let latency = (packet.delivery_time - packet.send_time).as_millis() as u64;
                self.stats.packets_delivered += 1;
                self.stats.total_latency_ms += latency;
                self.stats.max_latency_ms = self.stats.max_latency_ms.max(latency);
                delivered.push((*address, packet.data));
            }
        }
        delivered
    }

    /// Forget everything queued for `address`
    pub fn drop_link(&mut self, address: SocketAddr) {
        self.links.remove(&address);
    }

    pub fn in_flight(&self) -> usize {
        self.links.values().map(VecDeque::len).sum()
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Get current statistics
    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Get current time
    pub fn current_time(&self) -> Duration {
        self.current_time
    }
}

/// Transport that delays outgoing data through a [`ChaosNetwork`]
pub struct ChaosTransport<T> {
    inner: T,
    network: ChaosNetwork,
}

impl<T: Transport> ChaosTransport<T> {
    pub fn new(inner: T, config: ChaosConfig, seed: u64) -> Self {
        ChaosTransport {
            inner,
            network: ChaosNetwork::new(config, seed),
        }
    }

    pub fn network(&self) -> &ChaosNetwork {
        &self.network
    }
}

impl<T: Transport> Transport for ChaosTransport<T> {
    fn startup(&mut self, port: u16) -> TandemResult<()> {
        self.inner.startup(port)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn start_hosting(&mut self, message: &str) -> TandemResult<()> {
        self.inner.start_hosting(message)
    }

    fn stop_hosting(&mut self) {
        self.inner.stop_hosting()
    }

    fn find_hosts(&mut self, port: u16) -> TandemResult<()> {
        self.inner.find_hosts(port)
    }

    fn clear_hosts(&mut self) {
        self.inner.clear_hosts()
    }

    fn available_hosts(&self) -> Vec<HostAdvert> {
        self.inner.available_hosts()
    }

    fn connect(&mut self, address: SocketAddr) -> TandemResult<()> {
        self.inner.connect(address)
    }

    fn disconnect(&mut self, address: SocketAddr) {
        self.network.drop_link(address);
        self.inner.disconnect(address)
    }

    fn connections(&self) -> Vec<SocketAddr> {
        self.inner.connections()
    }

    fn send(&mut self, address: SocketAddr, data: Bytes) -> TandemResult<()> {
        if !self.inner.connections().contains(&address) {
            return Err(TandemError::TransportError(format!(
                "not connected to {}",
                address
            )));
        }
        self.network.send(address, data);
        Ok(())
    }

    fn receive(&mut self, address: SocketAddr) -> Option<Bytes> {
        self.inner.receive(address)
    }

    fn think(&mut self) {
        let tick = self.network.config().tick;
        for (address, data) in self.network.tick(tick) {
            if let Err(e) = self.inner.send(address, data) {
                debug!(%address, error = %e, "chaos delivery dropped");
                self.network.drop_link(address);
            }
        }
        self.inner.think();
    }
}

#[derive(Default)]
struct GateState {
    queue: VecDeque<Bytes>,
    held: VecDeque<Bytes>,
    closed: bool,
}

/// One direction of a [`GatedLink`] pair
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<Mutex<GateState>>,
}

impl Gate {
    /// Hold everything sent from now on
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Deliver held data, in order, and stop holding
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        let held = std::mem::take(&mut state.held);
        state.queue.extend(held);
    }

    /// Deliver only the oldest held blob
    pub fn release_one(&self) -> bool {
        let mut state = self.state.lock();
        match state.held.pop_front() {
            Some(blob) => {
                state.queue.push_back(blob);
                true
            }
            None => false,
        }
    }

    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }
}

/// In-process link whose outgoing direction can be held back
pub struct GatedLink {
    outgoing: Gate,
    incoming: Gate,
}

impl GatedLink {
    /// Two connected links plus the gates for `a -> b` and `b -> a`
    pub fn pair() -> (GatedLink, GatedLink, Gate, Gate) {
        let a_to_b = Gate::default();
        let b_to_a = Gate::default();
        let a = GatedLink {
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
        };
        let b = GatedLink {
            outgoing: b_to_a.clone(),
            incoming: a_to_b.clone(),
        };
        (a, b, a_to_b, b_to_a)
    }
}

impl Link for GatedLink {
    fn send(&mut self, data: Bytes) -> TandemResult<()> {
        let mut state = self.outgoing.state.lock();
        if state.closed {
            state.held.push_back(data);
        } else {
            state.queue.push_back(data);
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Bytes> {
        self.incoming.state.lock().queue.pop_front()
    }
}
