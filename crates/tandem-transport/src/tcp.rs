//! TCP transport
//!
//! Each link is one TCP stream carrying `[len: u32 LE][blob]` frames. The
//! transport owns a tokio runtime: an accept loop and per-peer reader and
//! writer tasks run in the background and report through a channel that
//! [`Transport::think`] drains, so the synchronizer itself never awaits.
//!
//! Host discovery uses UDP on the same port number as the listener. A probe
//! is broadcast (and sent to localhost); hosting endpoints answer with their
//! TCP port and advertised message.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tandem_core::{TandemError, TandemResult};
use tandem_wire::{write_frame, MAX_FRAME_LEN};

use crate::{HostAdvert, Transport};

const PROBE: &[u8] = b"TNDM?";
const ADVERT_MAGIC: &[u8] = b"TNDM!";

/// TCP transport configuration
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Address the listener and discovery socket bind to
    pub bind_ip: IpAddr,
    /// Upper bound on a blocking connect
    pub connect_timeout: Duration,
    /// Runtime worker threads
    pub worker_threads: usize,
    /// Answer and send discovery probes
    pub discovery: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: Duration::from_secs(3),
            worker_threads: 2,
            discovery: true,
        }
    }
}

impl TcpConfig {
    /// Loopback only, for tests and local sessions
    pub fn localhost() -> Self {
        TcpConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(1),
            worker_threads: 1,
            discovery: true,
        }
    }
}

enum NetEvent {
    Accepted {
        address: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
    },
    Data {
        address: SocketAddr,
        data: Bytes,
    },
    Closed {
        address: SocketAddr,
    },
    Advert(HostAdvert),
}

struct Peer {
    writer: mpsc::UnboundedSender<Bytes>,
    inbox: VecDeque<Bytes>,
    open: bool,
}

impl Peer {
    fn new(writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Peer {
            writer,
            inbox: VecDeque::new(),
            open: true,
        }
    }
}

/// Tokio-backed TCP transport
pub struct TcpTransport {
    config: TcpConfig,
    runtime: Option<Runtime>,
    local_addr: Option<SocketAddr>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    events_rx: mpsc::UnboundedReceiver<NetEvent>,
    peers: HashMap<SocketAddr, Peer>,
    hosting: Arc<Mutex<Option<String>>>,
    discovered: Vec<HostAdvert>,
    discovery: Option<Arc<UdpSocket>>,
}

fn io_error(e: std::io::Error) -> TandemError {
    TandemError::TransportError(e.to_string())
}

impl TcpTransport {
    pub fn new() -> TandemResult<Self> {
        Self::with_config(TcpConfig::default())
    }

    pub fn with_config(config: TcpConfig) -> TandemResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("tandem-tcp")
            .enable_all()
            .build()
            .map_err(io_error)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(TcpTransport {
            config,
            runtime: Some(runtime),
            local_addr: None,
            events_tx,
            events_rx,
            peers: HashMap::new(),
            hosting: Arc::new(Mutex::new(None)),
            discovered: Vec::new(),
            discovery: None,
        })
    }

    fn runtime(&self) -> TandemResult<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| TandemError::TransportError("runtime shut down".into()))
    }

    fn spawn_peer(&self, stream: TcpStream, address: SocketAddr) -> TandemResult<Peer> {
        let runtime = self.runtime()?;
        let (writer, outgoing) = mpsc::unbounded_channel();
        let (read, write) = stream.into_split();
        runtime.spawn(write_loop(write, outgoing));
        runtime.spawn(read_loop(read, address, self.events_tx.clone()));
        Ok(Peer::new(writer))
    }
}

impl Transport for TcpTransport {
    fn startup(&mut self, port: u16) -> TandemResult<()> {
        if self.local_addr.is_some() {
            return Err(TandemError::TransportError("already started".into()));
        }
        let events = self.events_tx.clone();
        let hosting = Arc::clone(&self.hosting);
        let bind_ip = self.config.bind_ip;
        let runtime = self.runtime()?;

        let listener = runtime
            .block_on(TcpListener::bind(SocketAddr::new(bind_ip, port)))
            .map_err(io_error)?;
        let local = listener.local_addr().map_err(io_error)?;
        runtime.spawn(accept_loop(listener, events.clone()));

        let mut discovery = None;
        if self.config.discovery {
            match runtime.block_on(UdpSocket::bind(SocketAddr::new(bind_ip, local.port()))) {
                Ok(socket) => {
                    if let Err(e) = socket.set_broadcast(true) {
                        debug!(error = %e, "broadcast unavailable");
                    }
                    let socket = Arc::new(socket);
                    runtime.spawn(discovery_loop(
                        Arc::clone(&socket),
                        hosting,
                        local.port(),
                        events,
                    ));
                    discovery = Some(socket);
                }
                Err(e) => warn!(port = local.port(), error = %e, "discovery socket unavailable"),
            }
        }

        info!(address = %local, "tcp transport started");
        self.discovery = discovery;
        self.local_addr = Some(local);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn start_hosting(&mut self, message: &str) -> TandemResult<()> {
        if self.local_addr.is_none() {
            return Err(TandemError::NotStarted);
        }
        *self.hosting.lock() = Some(message.to_string());
        Ok(())
    }

    fn stop_hosting(&mut self) {
        *self.hosting.lock() = None;
    }

    fn find_hosts(&mut self, port: u16) -> TandemResult<()> {
        let socket = self.discovery.as_ref().ok_or(TandemError::NotStarted)?;
        let runtime = self.runtime()?;
        let targets = [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        ];
        for target in targets {
            if let Err(e) = runtime.block_on(socket.send_to(PROBE, target)) {
                debug!(%target, error = %e, "discovery probe failed");
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
        if self.local_addr.is_none() {
            return Err(TandemError::NotStarted);
        }
        let limit = self.config.connect_timeout;
        let stream = self
            .runtime()?
            .block_on(tokio::time::timeout(limit, TcpStream::connect(address)))
            .map_err(|_| TandemError::TransportError(format!("connect to {} timed out", address)))?
            .map_err(io_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "nodelay unavailable");
        }
        let peer = self.spawn_peer(stream, address)?;
        self.peers.insert(address, peer);
        info!(%address, "connected");
        Ok(())
    }

    fn disconnect(&mut self, address: SocketAddr) {
        if self.peers.remove(&address).is_some() {
            debug!(%address, "disconnected");
        }
    }

    fn connections(&self) -> Vec<SocketAddr> {
        let mut open: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.open)
            .map(|(address, _)| *address)
            .collect();
        open.sort();
        open
    }

    fn send(&mut self, address: SocketAddr, data: Bytes) -> TandemResult<()> {
        let peer = self
            .peers
            .get(&address)
            .filter(|peer| peer.open)
            .ok_or_else(|| TandemError::TransportError(format!("not connected to {}", address)))?;
        peer.writer
            .send(data)
            .map_err(|_| TandemError::TransportError(format!("link to {} closed", address)))
    }

    fn receive(&mut self, address: SocketAddr) -> Option<Bytes> {
        self.peers.get_mut(&address)?.inbox.pop_front()
    }

    fn think(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                NetEvent::Accepted { address, writer } => {
                    info!(%address, "accepted connection");
                    self.peers.insert(address, Peer::new(writer));
                }
                NetEvent::Data { address, data } => match self.peers.get_mut(&address) {
                    Some(peer) => peer.inbox.push_back(data),
                    None => debug!(%address, "data from unknown peer"),
                },
                NetEvent::Closed { address } => {
                    if let Some(peer) = self.peers.get_mut(&address) {
                        info!(%address, "connection closed");
                        peer.open = false;
                    }
                }
                NetEvent::Advert(advert) => {
                    if !self.discovered.contains(&advert) {
                        debug!(address = %advert.address, "host discovered");
                        self.discovered.push(advert);
                    }
                }
            }
        }
        // Closed peers linger until their inbox is drained
        self.peers.retain(|_, peer| peer.open || !peer.inbox.is_empty());
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "nodelay unavailable");
                }
                let (writer, outgoing) = mpsc::unbounded_channel();
                let (read, write) = stream.into_split();
                // Register before the reader can report data
                if events.send(NetEvent::Accepted { address, writer }).is_err() {
                    break;
                }
                tokio::spawn(write_loop(write, outgoing));
                tokio::spawn(read_loop(read, address, events.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    address: SocketAddr,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    loop {
        let len = match reader.read_u32_le().await {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        if len > MAX_FRAME_LEN {
            warn!(%address, len, "oversized frame, closing link");
            break;
        }
        let mut data = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut data).await {
            debug!(%address, error = %e, "read failed");
            break;
        }
        let data = Bytes::from(data);
        if events.send(NetEvent::Data { address, data }).is_err() {
            return;
        }
    }
    let _ = events.send(NetEvent::Closed { address });
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = outgoing.recv().await {
        let mut frame = BytesMut::new();
        write_frame(&mut frame, &data);
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
}

async fn discovery_loop(
    socket: Arc<UdpSocket>,
    hosting: Arc<Mutex<Option<String>>>,
    tcp_port: u16,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "discovery receive failed");
                continue;
            }
        };
        let packet = &buf[..len];
        if packet == PROBE {
            let reply = hosting
                .lock()
                .as_deref()
                .map(|message| encode_advert(tcp_port, message));
            if let Some(reply) = reply {
                if let Err(e) = socket.send_to(&reply, from).await {
                    debug!(%from, error = %e, "discovery reply failed");
                }
            }
        } else if let Some(advert) = decode_advert(packet, from) {
            if events.send(NetEvent::Advert(advert)).is_err() {
                break;
            }
        }
    }
}

fn encode_advert(tcp_port: u16, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(ADVERT_MAGIC.len() + 2 + message.len());
    out.extend_from_slice(ADVERT_MAGIC);
    out.extend_from_slice(&tcp_port.to_le_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

fn decode_advert(packet: &[u8], from: SocketAddr) -> Option<HostAdvert> {
    let rest = packet.strip_prefix(ADVERT_MAGIC)?;
    if rest.len() < 2 {
        return None;
    }
    let port = u16::from_le_bytes([rest[0], rest[1]]);
    let message = String::from_utf8_lossy(&rest[2..]).into_owned();
    Some(HostAdvert {
        address: SocketAddr::new(from.ip(), port),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn started() -> TcpTransport {
        let mut transport = TcpTransport::with_config(TcpConfig::localhost()).unwrap();
        transport.startup(0).unwrap();
        transport
    }

    fn loopback(transport: &TcpTransport) -> SocketAddr {
        let port = transport.local_addr().unwrap().port();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn poll_until(transport: &mut TcpTransport, mut done: impl FnMut(&mut TcpTransport) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            transport.think();
            if done(transport) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_advert_encoding() {
        let from: SocketAddr = "192.168.1.20:9999".parse().unwrap();
        let advert = decode_advert(&encode_advert(7777, "lobby"), from).unwrap();
        assert_eq!(advert.address, "192.168.1.20:7777".parse().unwrap());
        assert_eq!(advert.message, "lobby");
        assert!(decode_advert(b"TNDM!", from).is_none());
        assert!(decode_advert(PROBE, from).is_none());
    }

    #[test]
    fn test_startup_binds() {
        let transport = started();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_not_started() {
        let mut transport = TcpTransport::with_config(TcpConfig::localhost()).unwrap();
        assert_eq!(
            transport.connect("127.0.0.1:1".parse().unwrap()).unwrap_err(),
            TandemError::NotStarted
        );
        assert_eq!(transport.find_hosts(1).unwrap_err(), TandemError::NotStarted);
    }

    #[test]
    fn test_connect_and_exchange() {
        let mut host = started();
        let mut peer = started();
        let host_addr = loopback(&host);

        peer.connect(host_addr).unwrap();
        assert_eq!(peer.connections(), vec![host_addr]);
        poll_until(&mut host, |h| !h.connections().is_empty());
        let peer_addr = host.connections()[0];

        peer.send(host_addr, Bytes::from_static(b"first")).unwrap();
        peer.send(host_addr, Bytes::from_static(b"second")).unwrap();
        let mut got = Vec::new();
        poll_until(&mut host, |h| {
            while let Some(blob) = h.receive(peer_addr) {
                got.push(blob);
            }
            got.len() == 2
        });
        assert_eq!(got[0], Bytes::from_static(b"first"));
        assert_eq!(got[1], Bytes::from_static(b"second"));

        host.send(peer_addr, Bytes::from_static(b"")).unwrap();
        host.send(peer_addr, Bytes::from(vec![7u8; 100_000])).unwrap();
        let mut back = Vec::new();
        poll_until(&mut peer, |p| {
            while let Some(blob) = p.receive(host_addr) {
                back.push(blob);
            }
            back.len() == 2
        });
        assert!(back[0].is_empty());
        assert_eq!(back[1].len(), 100_000);
    }

    #[test]
    fn test_connect_refused() {
        let unused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut peer = started();
        assert!(matches!(
            peer.connect(unused),
            Err(TandemError::TransportError(_))
        ));
        assert!(peer.connections().is_empty());
    }

    #[test]
    fn test_disconnect_reaches_peer() {
        let mut host = started();
        let mut peer = started();
        let host_addr = loopback(&host);
        peer.connect(host_addr).unwrap();
        poll_until(&mut host, |h| !h.connections().is_empty());

        peer.disconnect(host_addr);
        assert!(peer.connections().is_empty());
        assert!(peer.send(host_addr, Bytes::from_static(b"x")).is_err());
        poll_until(&mut host, |h| h.connections().is_empty());
    }

    #[test]
    fn test_discovery_on_loopback() {
        let mut host = started();
        host.start_hosting("tandem lobby").unwrap();
        let host_port = host.local_addr().unwrap().port();

        let mut seeker = started();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut found = None;
        while found.is_none() && Instant::now() < deadline {
            seeker.find_hosts(host_port).unwrap();
            thread::sleep(Duration::from_millis(20));
            seeker.think();
            found = seeker
                .available_hosts()
                .into_iter()
                .find(|advert| advert.address.port() == host_port);
        }
        let advert = found.expect("host not discovered");
        assert_eq!(advert.message, "tandem lobby");

        seeker.clear_hosts();
        assert!(seeker.available_hosts().is_empty());
    }
}
