use super::{Envelope, Log, Message, Node, Options, ReplicaId, State, BROADCAST, TICK_INTERVAL};
use crate::encoding::Value as _;
use crate::error::Result;

use log::{debug, error};
use std::collections::HashSet;
use std::net::UdpSocket;
use std::time::Instant;

/// The maximum size of a wire datagram.
const MAX_DATAGRAM: usize = 65535;

/// A replica server. Drives a Raft node with a single-threaded event loop
/// over the shared UDP datagram transport: all replicas and clients exchange
/// datagrams through one port, demultiplexed by destination id. The loop
/// owns all replica state, so there are no locks and no concurrent handlers.
pub struct Server {
    node: Node,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    socket: UdpSocket,
}

impl Server {
    /// Creates a new replica server connected to the shared transport port.
    pub fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        port: u16,
        state: Box<dyn State>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        socket.connect(("127.0.0.1", port))?;
        socket.set_read_timeout(Some(TICK_INTERVAL))?;
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, peers, Log::new(), state, node_tx, Options::default())?;
        Ok(Self { node, node_rx, socket })
    }

    /// Serves requests until the process exits. Each loop iteration receives
    /// and steps inbound datagrams, flushes staged writes as a replication
    /// burst, advances due timers, and transmits outbound messages.
    pub fn serve(mut self) -> Result<()> {
        // Announce ourselves to the transport.
        self.transmit(Envelope {
            src: self.node.id().clone(),
            dst: BROADCAST.into(),
            leader: BROADCAST.into(),
            message: Message::Hello,
        });

        let mut buf = vec![0; MAX_DATAGRAM];
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        loop {
            // Wait for a datagram, then drain whatever else is already
            // queued so a burst of writes coalesces into one append.
            if let Some(msg) = self.receive(&mut buf, true)? {
                self.node = self.node.step(msg)?;
                while let Some(msg) = self.receive(&mut buf, false)? {
                    self.node = self.node.step(msg)?;
                }
            }

            self.node = self.node.flush()?;

            while Instant::now() >= next_tick {
                self.node = self.node.tick()?;
                next_tick += TICK_INTERVAL;
            }

            while let Ok(msg) = self.node_rx.try_recv() {
                self.transmit(msg);
            }
        }
    }

    /// Receives and decodes a single datagram, either waiting for the read
    /// timeout or returning immediately. Malformed datagrams are logged and
    /// ignored; they must not advance replica state.
    fn receive(&self, buf: &mut [u8], wait: bool) -> Result<Option<Envelope>> {
        self.socket.set_nonblocking(!wait)?;
        match self.socket.recv(buf) {
            Ok(len) => match Envelope::decode(&buf[..len]) {
                Ok(msg) => Ok(Some(msg)),
                Err(err) => {
                    error!("Ignoring malformed datagram: {err}");
                    Ok(None)
                }
            },
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Transmits a message. Send errors are logged and dropped: datagrams
    /// are best-effort, and the protocol heals via heartbeats and
    /// retransmission.
    fn transmit(&self, msg: Envelope) {
        debug!("Transmitting {msg:?}");
        match msg.encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send(&bytes) {
                    error!("Failed to send message: {err}");
                }
            }
            Err(err) => error!("Failed to encode message: {err}"),
        }
    }
}
