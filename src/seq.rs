//! See [`Seq`].

use std::ops::{Add, AddAssign};

use arbitrary::Arbitrary;
use serde::{Deserialize, Serialize};

/// Sequence number identifying a single packet sent on a [`Connection`](crate::connection::Connection).
///
/// Values live in `0..2^16` on the wire (see [`crate::packet`]), and are
/// generated starting at a random value in `1..2^16` so that a passive
/// observer cannot infer how many connections a peer has made.
///
/// Unlike protocols that must tolerate wraparound comparisons (TCP, QUIC),
/// this transport defines [`Ord`] on [`Seq`] as a plain numeric order,
/// relying on `MAX_RETRANSMISSIONS` / `MAX_PACKET_DELAY` to bound a
/// connection's lifetime well before `u16` wraparound becomes a practical
/// concern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Arbitrary)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number reserved for bare ACK packets (see [`crate::packet`]).
    pub const BARE_ACK: Seq = Seq(0);

    /// Wrapping-adds `rhs` to this sequence number.
    #[must_use]
    pub const fn wrapping_add(self, rhs: u16) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Add<u16> for Seq {
    type Output = Seq;

    fn add(self, rhs: u16) -> Self::Output {
        self.wrapping_add(rhs)
    }
}

impl AddAssign<u16> for Seq {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl From<u16> for Seq {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Seq> for u16 {
    fn from(value: Seq) -> Self {
        value.0
    }
}

impl Serialize for Seq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u16::deserialize(deserializer).map(Seq)
    }
}
