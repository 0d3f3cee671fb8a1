//! In-memory transport
//!
//! A [`MockRouter`] stands in for the network. Every started
//! [`MockTransport`] gets its own address `10.x.y.z:port`, so several
//! endpoints can share one port number the way separate machines would.
//! Delivery is immediate and ordered per link.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use tandem_core::{TandemError, TandemResult};

use crate::{HostAdvert, Transport};

#[derive(Default)]
struct Endpoint {
    hosting: Option<String>,
    connections: BTreeSet<SocketAddr>,
    inbox: HashMap<SocketAddr, VecDeque<Bytes>>,
}

#[derive(Default)]
struct RouterState {
    endpoints: HashMap<SocketAddr, Endpoint>,
    /// Connects to these succeed but never establish
    blackholes: HashSet<SocketAddr>,
    next_host: u32,
}

impl RouterState {
    fn allocate(&mut self, port: u16) -> SocketAddr {
        self.next_host += 1;
        let ip = Ipv4Addr::from(0x0a00_0000 + self.next_host);
        let port = if port == 0 { 40_000 } else { port };
        SocketAddr::V4(SocketAddrV4::new(ip, port))
    }

    fn link(&mut self, a: SocketAddr, b: SocketAddr) {
        if let Some(endpoint) = self.endpoints.get_mut(&a) {
            endpoint.connections.insert(b);
            endpoint.inbox.entry(b).or_default();
        }
        if let Some(endpoint) = self.endpoints.get_mut(&b) {
            endpoint.connections.insert(a);
            endpoint.inbox.entry(a).or_default();
        }
    }

    fn unlink(&mut self, a: SocketAddr, b: SocketAddr) {
        if let Some(endpoint) = self.endpoints.get_mut(&a) {
            endpoint.connections.remove(&b);
            endpoint.inbox.remove(&b);
        }
        if let Some(endpoint) = self.endpoints.get_mut(&b) {
            endpoint.connections.remove(&a);
            endpoint.inbox.remove(&a);
        }
    }
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MockRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this router
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            router: self.clone(),
            address: None,
            discovered: Vec::new(),
        }
    }

    /// Make connects to `address` hang forever
    pub fn blackhole(&self, address: SocketAddr) {
        self.state.lock().blackholes.insert(address);
    }

    /// Cut the link between two endpoints
    pub fn sever(&self, a: SocketAddr, b: SocketAddr) {
        self.state.lock().unlink(a, b);
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

/// Endpoint on a [`MockRouter`]
pub struct MockTransport {
    router: MockRouter,
    address: Option<SocketAddr>,
    discovered: Vec<HostAdvert>,
}

impl MockTransport {
    fn address(&self) -> TandemResult<SocketAddr> {
        self.address.ok_or(TandemError::NotStarted)
    }
}

impl Transport for MockTransport {
    fn startup(&mut self, port: u16) -> TandemResult<()> {
        if self.address.is_some() {
            return Err(TandemError::TransportError("already started".into()));
        }
        let mut state = self.router.state.lock();
        let address = state.allocate(port);
        state.endpoints.insert(address, Endpoint::default());
        debug!(%address, "mock endpoint started");
        self.address = Some(address);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.address
    }

    fn start_hosting(&mut self, message: &str) -> TandemResult<()> {
        let address = self.address()?;
        if let Some(endpoint) = self.router.state.lock().endpoints.get_mut(&address) {
            endpoint.hosting = Some(message.to_string());
        }
        Ok(())
    }

    fn stop_hosting(&mut self) {
        if let Some(address) = self.address {
            if let Some(endpoint) = self.router.state.lock().endpoints.get_mut(&address) {
                endpoint.hosting = None;
            }
        }
    }

    fn find_hosts(&mut self, port: u16) -> TandemResult<()> {
        let me = self.address()?;
        let state = self.router.state.lock();
        for (address, endpoint) in &state.endpoints {
            if *address == me || address.port() != port {
                continue;
            }
            if let Some(message) = &endpoint.hosting {
                let advert = HostAdvert {
                    address: *address,
                    message: message.clone(),
                };
                if !self.discovered.contains(&advert) {
                    self.discovered.push(advert);
                }
            }
        }
        Ok(())
    }

    fn clear_hosts(&mut self) {
        self.discovered.clear();
    }

    fn available_hosts(&self) -> Vec<HostAdvert> {
        self.discovered.clone()
    }

    fn connect(&mut self, address: SocketAddr) -> TandemResult<()> {
        let me = self.address()?;
        let mut state = self.router.state.lock();
        if state.blackholes.contains(&address) {
            debug!(%address, "connect swallowed");
            return Ok(());
        }
        if address == me || !state.endpoints.contains_key(&address) {
            return Err(TandemError::TransportError(format!(
                "connection refused by {}",
                address
            )));
        }
        state.link(me, address);
        Ok(())
    }

    fn disconnect(&mut self, address: SocketAddr) {
        if let Some(me) = self.address {
            self.router.state.lock().unlink(me, address);
        }
    }

    fn connections(&self) -> Vec<SocketAddr> {
        let Some(me) = self.address else {
            return Vec::new();
        };
        self.router
            .state
            .lock()
            .endpoints
            .get(&me)
            .map(|endpoint| endpoint.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send(&mut self, address: SocketAddr, data: Bytes) -> TandemResult<()> {
        let me = self.address()?;
        let mut state = self.router.state.lock();
        let connected = state
            .endpoints
            .get(&me)
            .map_or(false, |endpoint| endpoint.connections.contains(&address));
        let inbox = state
            .endpoints
            .get_mut(&address)
            .and_then(|peer| peer.inbox.get_mut(&me))
            .filter(|_| connected)
            .ok_or_else(|| TandemError::TransportError(format!("not connected to {}", address)))?;
        inbox.push_back(data);
        Ok(())
    }

    fn receive(&mut self, address: SocketAddr) -> Option<Bytes> {
        let me = self.address?;
        self.router
            .state
            .lock()
            .endpoints
            .get_mut(&me)?
            .inbox
            .get_mut(&address)?
            .pop_front()
    }

    fn think(&mut self) {}
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Some(me) = self.address.take() {
            let mut state = self.router.state.lock();
            let peers: Vec<SocketAddr> = state
                .endpoints
                .get(&me)
                .map(|endpoint| endpoint.connections.iter().copied().collect())
                .unwrap_or_default();
            for peer in peers {
                state.unlink(me, peer);
            }
            state.endpoints.remove(&me);
        }
    }
}
