//! Transport contract

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use tandem_core::TandemResult;

/// A host found by discovery
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostAdvert {
    /// Address to pass to [`Transport::connect`]
    pub address: SocketAddr,
    /// Message the host advertises with
    pub message: String,
}

/// Byte transport between peers.
///
/// Blobs handed to [`send`](Transport::send) arrive whole and in order at
/// the peer's [`receive`](Transport::receive) for the same link. Nothing
/// here blocks for longer than the transport's own connect timeout.
pub trait Transport: Send {
    /// Bind the local endpoint. Port 0 picks any free port.
    fn startup(&mut self, port: u16) -> TandemResult<()>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Answer discovery probes with `message`
    fn start_hosting(&mut self, message: &str) -> TandemResult<()>;

    fn stop_hosting(&mut self);

    /// Probe for hosts listening on `port`. Results show up in
    /// [`available_hosts`](Transport::available_hosts) after later `think` calls.
    fn find_hosts(&mut self, port: u16) -> TandemResult<()>;

    fn clear_hosts(&mut self);

    fn available_hosts(&self) -> Vec<HostAdvert>;

    /// Open a connection to `address`
    fn connect(&mut self, address: SocketAddr) -> TandemResult<()>;

    fn disconnect(&mut self, address: SocketAddr);

    /// Currently established links, both accepted and initiated
    fn connections(&self) -> Vec<SocketAddr>;

    fn send(&mut self, address: SocketAddr, data: Bytes) -> TandemResult<()>;

    /// Next blob received from `address`, if any
    fn receive(&mut self, address: SocketAddr) -> Option<Bytes>;

    /// Pump the transport's own event loop
    fn think(&mut self);
}

/// Transport shared between a synchronizer and its network channels
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing
pub fn shared<T: Transport + 'static>(transport: T) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

