//! Per-peer protocol engine. See [`Connection`].

use std::{collections::BTreeMap, time::Duration};

use web_time::Instant;

use crate::{
    addr::PeerAddr,
    handler::{Handler, OutboundSink},
    heap::ReorderHeap,
    packet::Packet,
    seq::Seq,
};

/// Tunable timing and sizing constants for a [`Connection`].
///
/// Grouped into a struct (rather than bare module constants) so an
/// embedding program can override them — for tests, or for networks with
/// unusual loss/latency characteristics — without touching crate internals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionConfig {
    /// Per-packet retransmission interval.
    pub packet_timeout: Duration,
    /// Delay before sending a standalone (bare) ACK.
    pub bare_ack_timeout: Duration,
    /// Upper bound on how long an un-ACKed packet is retried before the
    /// connection gives up and shuts down.
    pub max_packet_delay: Duration,
    /// Number of retransmission attempts tolerated before giving up.
    pub max_retransmissions: u32,
    /// Fragmentation threshold, in bytes, for outbound message payloads.
    pub udp_safe_segment_size: usize,
    /// Maximum number of outstanding unacknowledged payload packets.
    pub window_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let packet_timeout = Duration::from_millis(700);
        let max_packet_delay = Duration::from_secs(20);
        let udp_safe_segment_size = 1000;
        #[allow(clippy::cast_possible_truncation)]
        let max_retransmissions =
            (max_packet_delay.as_secs_f64() / packet_timeout.as_secs_f64()).floor() as u32;
        Self {
            packet_timeout,
            bare_ack_timeout: Duration::from_millis(300),
            max_packet_delay,
            max_retransmissions,
            udp_safe_segment_size,
            window_size: 65535 / udp_safe_segment_size,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Entered on construction; exists only so construction and first-send
    /// are decoupled from the driving loop. Left on the first [`Connection::poll`].
    Initial,
    /// Local side has sent a SYN and awaits a matching SYN-ACK.
    Connecting,
    /// A peer SYN was received first; we replied SYN-ACK and await
    /// confirmation.
    HalfConnected,
    /// Both sides confirmed; normal data transfer.
    Connected,
    /// Terminal. All timers cancelled; inbound and outbound traffic dropped.
    Shutdown,
}

/// Transform hooks a [`Connection`] invokes around encoding and decoding.
///
/// The default, [`NoopHooks`], is the identity. [`crate::crypto`] supplies a
/// non-default implementation that layers key exchange and authenticated
/// encryption on top, without the core needing to know encryption exists.
pub trait PacketHooks {
    /// Called on a packet about to be sent, immediately before encoding.
    /// May rewrite `packet.payload` in place (e.g. to encrypt it, or to
    /// carry a public key on a SYN).
    fn on_finalize_outbound(&mut self, packet: &mut Packet);

    /// Called on a packet immediately after decoding, before the state
    /// machine observes it. Returning `None` drops the packet silently,
    /// with no other state change.
    fn on_receive_inbound(&mut self, packet: Packet) -> Option<Packet>;
}

/// Identity [`PacketHooks`] used by a plain, unencrypted [`Connection`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PacketHooks for NoopHooks {
    fn on_finalize_outbound(&mut self, _packet: &mut Packet) {}

    fn on_receive_inbound(&mut self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }
}

#[derive(Debug, Clone)]
struct SentPacket {
    bytes: Vec<u8>,
    deadline: Instant,
    retries: u32,
}

/// Per-peer RUDP protocol engine.
///
/// Owns no socket and performs no I/O directly: the driving loop calls
/// [`Connection::poll`] with the current time and an [`OutboundSink`] to
/// collect outbound datagrams, and feeds inbound datagrams to
/// [`Connection::receive_packet`]. This makes the engine deterministically
/// testable without a real clock or socket.
#[derive(Debug)]
pub struct Connection<H: PacketHooks = NoopHooks> {
    own_addr: PeerAddr,
    dest_addr: PeerAddr,
    relay_addr: PeerAddr,
    config: ConnectionConfig,
    state: State,
    hooks: H,

    next_sequence_number: Seq,
    next_expected_seqnum: Option<Seq>,
    own_handshake_seq: Option<Seq>,
    peer_syn_seq: Option<Seq>,

    send_window: BTreeMap<Seq, SentPacket>,
    receive_heap: ReorderHeap,
    pending_message_queue: Vec<Vec<u8>>,
    bare_ack_deadline: Option<Instant>,
    shutdown_notified: bool,
}

impl Connection<NoopHooks> {
    /// Creates a new, unencrypted connection in [`State::Initial`].
    ///
    /// `relay_addr` defaults to `dest_addr` when `None`; pass `Some` only
    /// when the physical source of the triggering datagram differed from
    /// its claimed source address.
    #[must_use]
    pub fn new(
        own_addr: PeerAddr,
        dest_addr: PeerAddr,
        relay_addr: Option<PeerAddr>,
        config: ConnectionConfig,
        initial_sequence_number: Seq,
    ) -> Self {
        Self::with_hooks(
            own_addr,
            dest_addr,
            relay_addr,
            config,
            initial_sequence_number,
            NoopHooks,
        )
    }
}

impl<H: PacketHooks> Connection<H> {
    /// Creates a new connection using a custom [`PacketHooks`] (used by
    /// [`crate::crypto`] to layer encryption on top).
    ///
    /// `initial_sequence_number` should be drawn uniformly from `1..2^16` by
    /// the caller; kept as an explicit parameter (rather than generated
    /// internally) so handshake scenarios are exactly reproducible in tests.
    pub fn with_hooks(
        own_addr: PeerAddr,
        dest_addr: PeerAddr,
        relay_addr: Option<PeerAddr>,
        config: ConnectionConfig,
        initial_sequence_number: Seq,
        hooks: H,
    ) -> Self {
        let relay_addr = relay_addr.unwrap_or_else(|| dest_addr.clone());
        Self {
            own_addr,
            dest_addr,
            relay_addr,
            config,
            state: State::Initial,
            hooks,
            next_sequence_number: initial_sequence_number,
            next_expected_seqnum: None,
            own_handshake_seq: None,
            peer_syn_seq: None,
            send_window: BTreeMap::new(),
            receive_heap: ReorderHeap::new(),
            pending_message_queue: Vec::new(),
            bare_ack_deadline: None,
            shutdown_notified: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// `true` once the handshake has completed in either direction.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// The address this connection physically sends datagrams to.
    #[must_use]
    pub fn relay_addr(&self) -> &PeerAddr {
        &self.relay_addr
    }

    /// Advances timers: resends un-ACKed packets whose retransmission
    /// deadline has elapsed, fires a due bare-ACK, and (on first call)
    /// leaves [`State::Initial`] by sending the opening SYN.
    ///
    /// Must be called periodically by the driving loop with a
    /// monotonically non-decreasing `now`.
    pub fn poll(&mut self, now: Instant, out: &mut dyn OutboundSink, handler: &mut dyn Handler) {
        if self.state == State::Shutdown {
            return;
        }
        if self.state == State::Initial {
            self.state = State::Connecting;
            self.send_syn(now, out);
        }

        let expired: Vec<Seq> = self
            .send_window
            .iter()
            .filter(|(_, sent)| sent.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect();

        for seq in expired {
            let sent = self
                .send_window
                .get_mut(&seq)
                .expect("seq was just collected from this same map");
            sent.retries += 1;
            if sent.retries > self.config.max_retransmissions {
                self.send_fin_and_shutdown(now, out, handler);
                return;
            }
            out.send_datagram(sent.bytes.clone(), self.relay_addr.clone());
            sent.deadline = now + self.config.packet_timeout;
        }

        if let Some(deadline) = self.bare_ack_deadline {
            if now >= deadline {
                self.send_bare_ack(out);
                self.bare_ack_deadline = None;
            }
        }
    }

    /// Feeds one inbound, already-demultiplexed packet to the state
    /// machine. See `SPEC_FULL.md` §4.4 for the receive algorithm.
    pub fn receive_packet(
        &mut self,
        packet: Packet,
        now: Instant,
        out: &mut dyn OutboundSink,
        handler: &mut dyn Handler,
    ) {
        if self.state == State::Shutdown {
            return;
        }
        let Some(packet) = self.hooks.on_receive_inbound(packet) else {
            return;
        };

        if packet.fin {
            self.enter_shutdown(handler);
            return;
        }

        if packet.syn {
            match self.state {
                State::Initial | State::Connecting => {
                    self.receive_syn_while_connecting(packet, now, out);
                    return;
                }
                State::HalfConnected => {
                    if Some(packet.sequence_number) == self.peer_syn_seq {
                        self.resend_syn_ack(out);
                    }
                    return;
                }
                State::Connected | State::Shutdown => {
                    // stray/duplicate handshake packet once established;
                    // fall through and let it be treated as data below.
                }
            }
        }

        if packet.ack > 0 {
            self.cancel_acked(packet.ack);
            if self.state == State::HalfConnected && self.acks_our_handshake(packet.ack) {
                self.state = State::Connected;
                self.drain_pending(now, out);
            }
        }

        if packet.sequence_number != Seq::BARE_ACK {
            self.deliver_or_buffer(packet, now, handler);
        }
    }

    /// Submits a message for transmission.
    ///
    /// Silently dropped if [`State::Shutdown`]; queued until the handshake
    /// completes if [`State::Initial`] or [`State::Connecting`].
    pub fn send_message(&mut self, message: Vec<u8>, now: Instant, out: &mut dyn OutboundSink) {
        match self.state {
            State::Shutdown => {}
            State::Initial | State::Connecting => self.pending_message_queue.push(message),
            State::HalfConnected | State::Connected => self.transmit_message(&message, now, out),
        }
    }

    /// Application-initiated shutdown: sends a FIN and transitions to
    /// [`State::Shutdown`]. A no-op if already shut down.
    pub fn shutdown(&mut self, now: Instant, out: &mut dyn OutboundSink, handler: &mut dyn Handler) {
        self.send_fin_and_shutdown(now, out, handler);
    }

    fn acks_our_handshake(&self, ack: u32) -> bool {
        self.own_handshake_seq
            .is_some_and(|seq| u32::from(seq.wrapping_add(1).0) == ack)
    }

    fn receive_syn_while_connecting(
        &mut self,
        packet: Packet,
        now: Instant,
        out: &mut dyn OutboundSink,
    ) {
        self.next_expected_seqnum = Some(packet.sequence_number.wrapping_add(1));
        self.peer_syn_seq = Some(packet.sequence_number);

        if packet.ack > 0 && self.acks_our_handshake(packet.ack) {
            self.state = State::Connected;
            self.drain_pending(now, out);
        } else {
            self.state = State::HalfConnected;
            self.send_syn_ack(now, out);
        }
    }

    fn cancel_acked(&mut self, ack: u32) {
        let acked: Vec<Seq> = self
            .send_window
            .keys()
            .copied()
            .filter(|seq| u32::from(seq.0) < ack)
            .collect();
        for seq in acked {
            self.send_window.remove(&seq);
        }
    }

    fn deliver_or_buffer(&mut self, packet: Packet, now: Instant, handler: &mut dyn Handler) {
        let next_expected = self.next_expected_seqnum.unwrap_or(Seq(0));
        match packet.sequence_number.cmp(&next_expected) {
            std::cmp::Ordering::Less => {
                self.schedule_bare_ack(now);
            }
            std::cmp::Ordering::Equal => {
                self.receive_heap.push(packet);
                self.drain_in_order(now, handler);
            }
            std::cmp::Ordering::Greater => {
                self.receive_heap.push(packet);
                self.schedule_bare_ack(now);
            }
        }
    }

    fn drain_in_order(&mut self, now: Instant, handler: &mut dyn Handler) {
        loop {
            let next = self.next_expected_seqnum.unwrap_or(Seq(0));
            let Some(group) = self.receive_heap.try_pop_fragment_group(next) else {
                break;
            };
            let group_len = u16::try_from(group.len()).expect("fragment groups are bounded");
            let message = group.into_iter().fold(Vec::new(), |mut acc, p| {
                acc.extend_from_slice(&p.payload);
                acc
            });
            handler.receive_message(message);
            self.next_expected_seqnum = Some(next.wrapping_add(group_len));
        }
        self.schedule_bare_ack(now);
    }

    fn transmit_message(&mut self, message: &[u8], now: Instant, out: &mut dyn OutboundSink) {
        let seg = self.config.udp_safe_segment_size;
        let chunks: Vec<&[u8]> = if message.is_empty() {
            vec![&message[..0]]
        } else {
            message.chunks(seg).collect()
        };
        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let more_fragments = u32::try_from(total - 1 - i).expect("fragment count is bounded");
            let seq = self.next_sequence_number;
            self.next_sequence_number = seq.wrapping_add(1);
            let mut packet = Packet {
                sequence_number: seq,
                dest_addr: self.dest_addr.clone(),
                source_addr: self.own_addr.clone(),
                payload: chunk.to_vec(),
                more_fragments,
                ack: self.piggyback_ack(),
                fin: false,
                syn: false,
            };
            self.hooks.on_finalize_outbound(&mut packet);
            self.send_and_track(packet, now, out);
        }
    }

    fn drain_pending(&mut self, now: Instant, out: &mut dyn OutboundSink) {
        let pending = std::mem::take(&mut self.pending_message_queue);
        for message in pending {
            self.transmit_message(&message, now, out);
        }
    }

    fn send_syn(&mut self, now: Instant, out: &mut dyn OutboundSink) {
        let seq = self.next_sequence_number;
        self.next_sequence_number = seq.wrapping_add(1);
        self.own_handshake_seq = Some(seq);
        let mut packet = Packet {
            sequence_number: seq,
            dest_addr: self.dest_addr.clone(),
            source_addr: self.own_addr.clone(),
            payload: Vec::new(),
            more_fragments: 0,
            ack: 0,
            fin: false,
            syn: true,
        };
        self.hooks.on_finalize_outbound(&mut packet);
        self.send_and_track(packet, now, out);
    }

    fn send_syn_ack(&mut self, now: Instant, out: &mut dyn OutboundSink) {
        let seq = self.next_sequence_number;
        self.next_sequence_number = seq.wrapping_add(1);
        self.own_handshake_seq = Some(seq);
        let mut packet = Packet {
            sequence_number: seq,
            dest_addr: self.dest_addr.clone(),
            source_addr: self.own_addr.clone(),
            payload: Vec::new(),
            more_fragments: 0,
            ack: self.piggyback_ack(),
            fin: false,
            syn: true,
        };
        self.hooks.on_finalize_outbound(&mut packet);
        self.send_and_track(packet, now, out);
    }

    fn resend_syn_ack(&mut self, out: &mut dyn OutboundSink) {
        if let Some(seq) = self.own_handshake_seq {
            if let Some(sent) = self.send_window.get(&seq) {
                out.send_datagram(sent.bytes.clone(), self.relay_addr.clone());
            }
        }
    }

    fn send_bare_ack(&mut self, out: &mut dyn OutboundSink) {
        let mut packet = Packet {
            sequence_number: Seq::BARE_ACK,
            dest_addr: self.dest_addr.clone(),
            source_addr: self.own_addr.clone(),
            payload: Vec::new(),
            more_fragments: 0,
            ack: self.piggyback_ack(),
            fin: false,
            syn: false,
        };
        self.hooks.on_finalize_outbound(&mut packet);
        out.send_datagram(packet.encode(), self.relay_addr.clone());
    }

    fn send_and_track(&mut self, packet: Packet, now: Instant, out: &mut dyn OutboundSink) {
        let bytes = packet.encode();
        out.send_datagram(bytes.clone(), self.relay_addr.clone());
        self.send_window.insert(
            packet.sequence_number,
            SentPacket {
                bytes,
                deadline: now + self.config.packet_timeout,
                retries: 0,
            },
        );
        self.bare_ack_deadline = None;
    }

    fn schedule_bare_ack(&mut self, now: Instant) {
        self.bare_ack_deadline.get_or_insert(now + self.config.bare_ack_timeout);
    }

    fn piggyback_ack(&self) -> u32 {
        self.next_expected_seqnum.map_or(0, |s| u32::from(s.0))
    }

    fn send_fin_and_shutdown(
        &mut self,
        _now: Instant,
        out: &mut dyn OutboundSink,
        handler: &mut dyn Handler,
    ) {
        if self.state == State::Shutdown {
            return;
        }
        let mut packet = Packet {
            sequence_number: self.next_sequence_number,
            dest_addr: self.dest_addr.clone(),
            source_addr: self.own_addr.clone(),
            payload: Vec::new(),
            more_fragments: 0,
            ack: self.piggyback_ack(),
            fin: true,
            syn: false,
        };
        self.hooks.on_finalize_outbound(&mut packet);
        out.send_datagram(packet.encode(), self.relay_addr.clone());
        self.enter_shutdown(handler);
    }

    fn enter_shutdown(&mut self, handler: &mut dyn Handler) {
        if self.state == State::Shutdown {
            return;
        }
        self.state = State::Shutdown;
        self.send_window.clear();
        self.bare_ack_deadline = None;
        if !self.shutdown_notified {
            self.shutdown_notified = true;
            handler.handle_shutdown();
        }
    }
}
