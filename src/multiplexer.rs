//! Owns the datagram socket abstraction and fans inbound datagrams out to
//! per-peer [`Connection`]s. See [`Multiplexer`].

use ahash::AHashMap;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::{
    addr::PeerAddr,
    connection::{Connection, ConnectionConfig, State},
    handler::{ConnectionFactory, Handler, OutboundSink},
    packet::{DecodeError, Packet},
};

/// Maps remote address to connection, dispatches inbound datagrams, and
/// optionally relays datagrams addressed elsewhere.
///
/// Generic over a [`ConnectionFactory`] `F`: every connection this
/// multiplexer creates uses `F::Handler` as its upstream sink.
pub struct Multiplexer<F: ConnectionFactory> {
    public_ip: String,
    local_port: u16,
    relaying: bool,
    config: ConnectionConfig,
    factory: F,
    connections: AHashMap<PeerAddr, (Connection, F::Handler)>,
}

impl<F: ConnectionFactory> Multiplexer<F> {
    /// Creates a new multiplexer.
    ///
    /// `public_ip` is the address datagrams must be addressed to for this
    /// node to be considered the intended destination (see
    /// [`Multiplexer::receive_datagram`]); `relaying` controls whether
    /// datagrams addressed elsewhere are forwarded verbatim or dropped.
    pub fn new(
        public_ip: impl Into<String>,
        local_port: u16,
        relaying: bool,
        config: ConnectionConfig,
        factory: F,
    ) -> Self {
        Self {
            public_ip: public_ip.into(),
            local_port,
            relaying,
            config,
            factory,
            connections: AHashMap::new(),
        }
    }

    /// Number of currently tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// `true` if no connections are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// `true` if a connection for `addr` is tracked.
    #[must_use]
    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.connections.contains_key(addr)
    }

    /// Iterates over tracked `(peer address, connection)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddr, &Connection)> {
        self.connections.iter().map(|(addr, (con, _))| (addr, con))
    }

    /// Inserts a connection at `addr`, shutting down any connection it
    /// displaces first.
    pub fn insert(
        &mut self,
        addr: PeerAddr,
        connection: Connection,
        handler: F::Handler,
        now: Instant,
        out: &mut dyn OutboundSink,
    ) {
        self.remove(&addr, now, out);
        self.connections.insert(addr, (connection, handler));
    }

    /// Removes and shuts down the connection at `addr`, if any.
    pub fn remove(&mut self, addr: &PeerAddr, now: Instant, out: &mut dyn OutboundSink) {
        if let Some((mut connection, mut handler)) = self.connections.remove(addr) {
            connection.shutdown(now, out, &mut handler);
        }
    }

    /// Advances every tracked connection's timers.
    pub fn poll(&mut self, now: Instant, out: &mut dyn OutboundSink) {
        let mut dead = Vec::new();
        for (addr, (connection, handler)) in &mut self.connections {
            connection.poll(now, out, handler);
            if connection.state() == State::Shutdown {
                dead.push(addr.clone());
            }
        }
        for addr in dead {
            self.connections.remove(&addr);
        }
    }

    /// Handles one inbound datagram observed on the socket at `source_addr`
    /// (the datagram's physical origin, which may differ from the packet's
    /// claimed `source_addr` when relayed).
    #[tracing::instrument(skip(self, bytes, out), fields(source = %source_addr))]
    pub fn receive_datagram(
        &mut self,
        bytes: &[u8],
        source_addr: PeerAddr,
        now: Instant,
        out: &mut dyn OutboundSink,
    ) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(DecodeError::MalformedFormat(reason)) => {
                warn!(%reason, "dropping malformed datagram");
                return;
            }
            Err(DecodeError::InvalidStructure(reason)) => {
                warn!(%reason, "dropping datagram with invalid packet structure");
                return;
            }
        };

        if packet.dest_addr.ip != self.public_ip || packet.dest_addr.port != self.local_port {
            if self.relaying {
                trace!(dest = %packet.dest_addr, "relaying datagram");
                out.send_datagram(bytes.to_vec(), packet.dest_addr.clone());
            } else {
                warn!(dest = %packet.dest_addr, "dropping misrouted datagram: relaying disabled");
            }
            return;
        }

        let peer = packet.source_addr.clone();
        let relay_addr = (source_addr != peer).then_some(source_addr);

        if !self.connections.contains_key(&peer) {
            debug!(%peer, "creating new connection");
            let own_addr = PeerAddr::new(self.public_ip.clone(), self.local_port);
            let (connection, handler) = self.factory.make_new_connection(
                own_addr,
                peer.clone(),
                relay_addr,
                self.config,
            );
            self.connections.insert(peer.clone(), (connection, handler));
        }

        if let Some((connection, handler)) = self.connections.get_mut(&peer) {
            connection.receive_packet(packet, now, out, handler);
            if connection.state() == State::Shutdown {
                self.connections.remove(&peer);
            }
        }
    }

    /// Shuts down every tracked connection. Idempotent per connection.
    pub fn shutdown_all(&mut self, now: Instant, out: &mut dyn OutboundSink) {
        let addrs: Vec<PeerAddr> = self.connections.keys().cloned().collect();
        for addr in addrs {
            self.remove(&addr, now, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::Seq;

    struct NullHandler;
    impl Handler for NullHandler {
        fn receive_message(&mut self, _payload: Vec<u8>) {}
        fn handle_shutdown(&mut self) {}
    }

    struct NullFactory;
    impl ConnectionFactory for NullFactory {
        type Handler = NullHandler;

        fn make_new_connection(
            &mut self,
            own_addr: PeerAddr,
            peer_addr: PeerAddr,
            relay_addr: Option<PeerAddr>,
            config: ConnectionConfig,
        ) -> (Connection, Self::Handler) {
            (
                Connection::new(own_addr, peer_addr, relay_addr, config, Seq(1)),
                NullHandler,
            )
        }
    }

    fn addr(ip: &str, port: u16) -> PeerAddr {
        PeerAddr::new(ip, port)
    }

    #[test]
    fn relay_passthrough_writes_exact_bytes_and_creates_no_connection() {
        let mut mux = Multiplexer::new(
            "1.1.1.1",
            9000,
            true,
            ConnectionConfig::default(),
            NullFactory,
        );
        let packet = Packet {
            sequence_number: Seq(1),
            dest_addr: addr("3.3.3.3", 7777),
            source_addr: addr("5.5.5.5", 1234),
            payload: vec![1, 2, 3],
            more_fragments: 0,
            ack: 0,
            fin: false,
            syn: false,
        };
        let bytes = packet.encode();
        let mut out: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        mux.receive_datagram(&bytes, addr("5.5.5.5", 1234), Instant::now(), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, bytes);
        assert_eq!(out[0].1, addr("3.3.3.3", 7777));
        assert!(mux.is_empty());
    }

    #[test]
    fn misrouted_datagram_dropped_when_not_relaying() {
        let mut mux = Multiplexer::new(
            "1.1.1.1",
            9000,
            false,
            ConnectionConfig::default(),
            NullFactory,
        );
        let packet = Packet {
            sequence_number: Seq(1),
            dest_addr: addr("3.3.3.3", 7777),
            source_addr: addr("5.5.5.5", 1234),
            payload: vec![],
            more_fragments: 0,
            ack: 0,
            fin: false,
            syn: false,
        };
        let bytes = packet.encode();
        let mut out: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        mux.receive_datagram(&bytes, addr("5.5.5.5", 1234), Instant::now(), &mut out);
        assert!(out.is_empty());
        assert!(mux.is_empty());
    }

    #[test]
    fn locally_destined_datagram_creates_a_connection() {
        let mut mux = Multiplexer::new(
            "1.1.1.1",
            9000,
            true,
            ConnectionConfig::default(),
            NullFactory,
        );
        let packet = Packet {
            sequence_number: Seq(7),
            dest_addr: addr("1.1.1.1", 9000),
            source_addr: addr("2.2.2.2", 4000),
            payload: vec![],
            more_fragments: 0,
            ack: 0,
            fin: false,
            syn: true,
        };
        let bytes = packet.encode();
        let mut out: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        mux.receive_datagram(&bytes, addr("2.2.2.2", 4000), Instant::now(), &mut out);
        assert!(mux.contains(&addr("2.2.2.2", 4000)));
    }

    #[test]
    fn displaced_connection_is_shut_down_exactly_once() {
        struct CountingFactory {
            created: u32,
        }
        struct CountingHandler;
        impl Handler for CountingHandler {
            fn receive_message(&mut self, _payload: Vec<u8>) {}
            fn handle_shutdown(&mut self) {}
        }
        impl ConnectionFactory for CountingFactory {
            type Handler = CountingHandler;
            fn make_new_connection(
                &mut self,
                own_addr: PeerAddr,
                peer_addr: PeerAddr,
                relay_addr: Option<PeerAddr>,
                config: ConnectionConfig,
            ) -> (Connection, Self::Handler) {
                self.created += 1;
                (
                    Connection::new(own_addr, peer_addr, relay_addr, config, Seq(self.created as u16)),
                    CountingHandler,
                )
            }
        }

        let mut mux = Multiplexer::new(
            "1.1.1.1",
            9000,
            true,
            ConnectionConfig::default(),
            CountingFactory { created: 0 },
        );
        let mut out: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        let now = Instant::now();
        let first = Connection::new(
            addr("1.1.1.1", 9000),
            addr("2.2.2.2", 1),
            None,
            ConnectionConfig::default(),
            Seq(1),
        );
        mux.insert(addr("2.2.2.2", 1), first, CountingHandler, now, &mut out);
        assert_eq!(mux.len(), 1);

        let second = Connection::new(
            addr("1.1.1.1", 9000),
            addr("2.2.2.2", 1),
            None,
            ConnectionConfig::default(),
            Seq(2),
        );
        mux.insert(addr("2.2.2.2", 1), second, CountingHandler, now, &mut out);
        assert_eq!(mux.len(), 1);
    }
}
