//! Upstream application callbacks, connection-factory wiring, and the
//! narrow outbound capability a [`Connection`](crate::connection::Connection)
//! uses to write datagrams.

use crate::{addr::PeerAddr, connection::{Connection, ConnectionConfig}};

/// Receives reassembled messages and the terminal shutdown notification for
/// a single connection.
///
/// Supplied by the embedding program; the crate places no restriction on how
/// a `Handler` is implemented beyond this capability.
pub trait Handler {
    /// Called once per fully reassembled message, in sequence-number order.
    fn receive_message(&mut self, payload: Vec<u8>);

    /// Called exactly once, when the owning connection reaches `SHUTDOWN`.
    fn handle_shutdown(&mut self);
}

/// Produces a fresh [`Handler`] for each newly created connection.
///
/// A plain factory and a crypto-aware one can coexist side by side, so the
/// embedder wires a handler once per factory rather than per connection.
pub trait ConnectionFactory {
    /// Concrete handler type this factory produces.
    type Handler: Handler;

    /// Builds a new connection and its paired handler.
    ///
    /// `relay_addr` is `Some` only when the multiplexer observed the
    /// datagram's physical source differ from the packet's claimed
    /// `source_addr` (genuine NAT relay); otherwise the connection's relay
    /// address defaults to `peer_addr`.
    fn make_new_connection(
        &mut self,
        own_addr: PeerAddr,
        peer_addr: PeerAddr,
        relay_addr: Option<PeerAddr>,
        config: ConnectionConfig,
    ) -> (Connection, Self::Handler);
}

/// Narrow outbound capability a [`Connection`] writes datagrams through.
///
/// Passed in explicitly by the driving loop (typically a
/// [`Multiplexer`](crate::multiplexer::Multiplexer)) rather than stored on
/// the connection, which is what breaks the otherwise-cyclic
/// Connection/Multiplexer ownership.
pub trait OutboundSink {
    /// Sends `bytes` to `addr`. Implementations decide how (and whether) to
    /// actually touch a socket; the core only ever calls this method.
    fn send_datagram(&mut self, bytes: Vec<u8>, addr: PeerAddr);
}

impl OutboundSink for Vec<(Vec<u8>, PeerAddr)> {
    fn send_datagram(&mut self, bytes: Vec<u8>, addr: PeerAddr) {
        self.push((bytes, addr));
    }
}
