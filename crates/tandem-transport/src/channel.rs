//! Peer channels
//!
//! A channel talks to exactly one peer. Outgoing packages accumulate in a
//! buffer per [`ChannelTag`] and leave as one blob on [`Channel::flush`].
//! Package order is preserved across flushes of the same link; order
//! between tags flushed close together is not.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{trace, warn};

use tandem_core::{Command, CommandRegistry, TandemResult};
use tandem_wire::{serialize_framed, split_frames, write_frame, EventPackage, PackageId};

use crate::SharedTransport;

/// Logical stream inside a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelTag(pub u8);

impl ChannelTag {
    /// Event packages and relays
    pub const EVENTS: ChannelTag = ChannelTag(0);
    /// Join snapshots
    pub const SNAPSHOT: ChannelTag = ChannelTag(1);
}

/// Raw blob mover underneath a channel
pub trait Link: Send {
    fn send(&mut self, data: Bytes) -> TandemResult<()>;

    fn receive(&mut self) -> Option<Bytes>;

    /// Remote address for network links
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

/// Link over a shared [`Transport`](crate::Transport)
pub struct NetworkLink {
    address: SocketAddr,
    transport: SharedTransport,
}

impl NetworkLink {
    pub fn new(address: SocketAddr, transport: SharedTransport) -> Self {
        NetworkLink { address, transport }
    }
}

impl Link for NetworkLink {
    fn send(&mut self, data: Bytes) -> TandemResult<()> {
        self.transport.lock().send(self.address, data)
    }

    fn receive(&mut self) -> Option<Bytes> {
        self.transport.lock().receive(self.address)
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.address)
    }
}

/// Link to ourselves. Everything sent is received back in order.
#[derive(Default)]
pub struct LoopbackLink {
    queue: VecDeque<Bytes>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Link for LoopbackLink {
    fn send(&mut self, data: Bytes) -> TandemResult<()> {
        self.queue.push_back(data);
        Ok(())
    }

    fn receive(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }
}

type Queue = Arc<Mutex<VecDeque<Bytes>>>;

/// One end of an in-process link pair
pub struct PairedLink {
    inbound: Queue,
    outbound: Queue,
}

impl PairedLink {
    /// Two connected ends
    pub fn pair() -> (PairedLink, PairedLink) {
        let a: Queue = Arc::default();
        let b: Queue = Arc::default();
        (
            PairedLink {
                inbound: Arc::clone(&a),
                outbound: Arc::clone(&b),
            },
            PairedLink {
                inbound: b,
                outbound: a,
            },
        )
    }
}

impl Link for PairedLink {
    fn send(&mut self, data: Bytes) -> TandemResult<()> {
        self.outbound.lock().push_back(data);
        Ok(())
    }

    fn receive(&mut self) -> Option<Bytes> {
        self.inbound.lock().pop_front()
    }
}

/// A package as received, with its encoding kept for relaying
#[derive(Debug)]
pub struct ReceivedPackage<S> {
    pub package: EventPackage<S>,
    /// Package bytes without the length frame
    pub raw: Bytes,
}

/// Batched package exchange with one peer
pub struct Channel<S> {
    registry: Arc<CommandRegistry<S>>,
    link: Box<dyn Link>,
    outgoing: BTreeMap<ChannelTag, BytesMut>,
    malformed: u64,
}

impl<S: 'static> Channel<S> {
    pub fn new(registry: Arc<CommandRegistry<S>>, link: Box<dyn Link>) -> Self {
        Channel {
            registry,
            link,
            outgoing: BTreeMap::new(),
            malformed: 0,
        }
    }

    /// Channel to a transport peer
    pub fn network(
        registry: Arc<CommandRegistry<S>>,
        address: SocketAddr,
        transport: SharedTransport,
    ) -> Self {
        Self::new(registry, Box::new(NetworkLink::new(address, transport)))
    }

    /// Channel that receives what it sends
    pub fn loopback(registry: Arc<CommandRegistry<S>>) -> Self {
        Self::new(registry, Box::new(LoopbackLink::new()))
    }

    /// Two channels wired to each other in-process
    pub fn pair(registry: Arc<CommandRegistry<S>>) -> (Self, Self) {
        let (a, b) = PairedLink::pair();
        (
            Self::new(Arc::clone(&registry), Box::new(a)),
            Self::new(registry, Box::new(b)),
        )
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.link.peer()
    }

    /// Append one encoded package to the `tag` buffer
    pub fn queue_commands(&mut self, tag: ChannelTag, id: PackageId, commands: &[Command<S>]) {
        let buf = self.outgoing.entry(tag).or_default();
        serialize_framed(&self.registry, id, commands, buf);
    }

    /// Append an already encoded package (relay path)
    pub fn queue_encoded(&mut self, tag: ChannelTag, raw: &[u8]) {
        write_frame(self.outgoing.entry(tag).or_default(), raw);
    }

    pub fn pending_bytes(&self, tag: ChannelTag) -> usize {
        self.outgoing.get(&tag).map_or(0, BytesMut::len)
    }

    /// Hand the `tag` buffer to the link as one blob
    pub fn flush(&mut self, tag: ChannelTag) -> TandemResult<()> {
        let Some(buf) = self.outgoing.get_mut(&tag) else {
            return Ok(());
        };
        if buf.is_empty() {
            return Ok(());
        }
        let blob = buf.split().freeze();
        trace!(tag = tag.0, bytes = blob.len(), "channel flush");
        self.link.send(blob)
    }

    pub fn flush_all(&mut self) -> TandemResult<()> {
        let tags: Vec<ChannelTag> = self.outgoing.keys().copied().collect();
        for tag in tags {
            self.flush(tag)?;
        }
        Ok(())
    }

    /// Drain everything the link has received, in arrival order.
    ///
    /// Malformed packages are dropped and counted; a blob whose framing is
    /// broken is dropped whole.
    pub fn receive(&mut self) -> Vec<ReceivedPackage<S>> {
        let mut received = Vec::new();
        while let Some(blob) = self.link.receive() {
            let frames = match split_frames(&blob) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(peer = ?self.peer(), error = %e, bytes = blob.len(), "dropping malformed blob");
                    self.malformed += 1;
                    continue;
                }
            };
            for frame in frames {
                match EventPackage::parse(&self.registry, frame) {
                    Ok(package) => received.push(ReceivedPackage {
                        package,
                        raw: blob.slice_ref(frame),
                    }),
                    Err(e) => {
                        warn!(peer = ?self.peer(), error = %e, "dropping malformed package");
                        self.malformed += 1;
                    }
                }
            }
        }
        received
    }

    /// Malformed packages seen since the last call
    pub fn take_malformed(&mut self) -> u64 {
        std::mem::take(&mut self.malformed)
    }
}

impl<S> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.link.peer())
            .field("tags", &self.outgoing.keys().collect::<Vec<_>>())
            .finish()
    }
}
