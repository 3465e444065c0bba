//! Sans-IO reliable UDP transport: multiplexed, connection-oriented,
//! in-order, at-least-once message delivery over a single datagram socket.
//!
//! The core protocol engine ([`connection::Connection`]) and the socket
//! dispatcher ([`multiplexer::Multiplexer`]) perform no I/O themselves —
//! the embedding program drives them with an explicit clock and an
//! [`handler::OutboundSink`], and supplies a [`handler::Handler`] per
//! connection. An optional [`crypto`] layer adds Curve25519 key exchange and
//! authenticated encryption on top of a plain connection.

pub mod addr;
pub mod connection;
#[cfg(feature = "crypto")]
pub mod crypto;
pub mod handler;
pub mod heap;
pub mod multiplexer;
pub mod packet;
pub mod seq;
