//! Optional confidential-channel layer. See [`CryptoHooks`].
//!
//! Decorates a plain [`Connection`] via [`PacketHooks`] rather than
//! inheritance: the SYN carries a Curve25519 public key instead of an empty
//! payload, and every other packet's payload is replaced with ciphertext
//! once the peer's key is known.

use crypto_box::{aead::Aead, PublicKey, SalsaBox, SecretKey};
use rand_core::{CryptoRng, RngCore};
use tracing::trace;

use crate::{
    connection::{Connection, ConnectionConfig, PacketHooks},
    packet::Packet,
    seq::Seq,
};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// [`PacketHooks`] implementing Curve25519 key exchange in the SYN and
/// authenticated encryption of every other packet's payload.
///
/// A packet encrypted under the wrong key, or simply noise, decrypts to an
/// `Err` and is dropped by [`CryptoHooks::on_receive_inbound`] with no state
/// change — indistinguishable, from the outside, to the upstream handler.
pub struct CryptoHooks {
    secret_key: SecretKey,
    public_key: PublicKey,
    /// Half-nonce fixed for the lifetime of the connection; the other half
    /// is derived from each packet's sequence number. Guarantees per-session
    /// nonce uniqueness without a shared counter between peers.
    nonce_prefix: [u8; NONCE_LEN / 2],
    peer_box: Option<SalsaBox>,
}

impl std::fmt::Debug for CryptoHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoHooks")
            .field("public_key", &self.public_key.as_bytes())
            .field("established", &self.peer_box.is_some())
            .finish()
    }
}

impl CryptoHooks {
    /// Generates a fresh keypair and nonce prefix using `rng`.
    pub fn new(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let secret_key = SecretKey::generate(rng);
        let public_key = secret_key.public_key();
        let mut nonce_prefix = [0u8; NONCE_LEN / 2];
        rng.fill_bytes(&mut nonce_prefix);
        Self {
            secret_key,
            public_key,
            nonce_prefix,
            peer_box: None,
        }
    }

    /// `true` once a peer public key has been absorbed and the box is
    /// usable for encryption/decryption.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.peer_box.is_some()
    }

    fn nonce_for(&self, seq: Seq) -> crypto_box::Nonce {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[..NONCE_LEN / 2].copy_from_slice(&self.nonce_prefix);
        bytes[NONCE_LEN / 2..NONCE_LEN / 2 + 2].copy_from_slice(&seq.0.to_be_bytes());
        bytes.into()
    }
}

impl PacketHooks for CryptoHooks {
    fn on_finalize_outbound(&mut self, packet: &mut Packet) {
        if packet.syn {
            packet.payload = self.public_key.as_bytes().to_vec();
            return;
        }
        let Some(peer_box) = &self.peer_box else {
            return;
        };
        let nonce = self.nonce_for(packet.sequence_number);
        match peer_box.encrypt(&nonce, packet.payload.as_slice()) {
            Ok(ciphertext) => packet.payload = ciphertext,
            Err(_) => {
                trace!(seq = packet.sequence_number.0, "failed to encrypt outbound payload");
            }
        }
    }

    fn on_receive_inbound(&mut self, mut packet: Packet) -> Option<Packet> {
        if packet.syn {
            let key_bytes: [u8; KEY_LEN] = packet.payload.as_slice().try_into().ok()?;
            let peer_public = PublicKey::from(key_bytes);
            self.peer_box = Some(SalsaBox::new(&peer_public, &self.secret_key));
            return Some(packet);
        }

        let peer_box = self.peer_box.as_ref()?;
        let nonce = self.nonce_for(packet.sequence_number);
        let plaintext = peer_box.decrypt(&nonce, packet.payload.as_slice()).ok()?;
        packet.payload = plaintext;
        Some(packet)
    }
}

/// A [`Connection`] decorated with [`CryptoHooks`].
pub type CryptoConnection = Connection<CryptoHooks>;

/// Creates a new encrypted connection in `State::Initial`.
pub fn new_crypto_connection(
    own_addr: crate::addr::PeerAddr,
    dest_addr: crate::addr::PeerAddr,
    relay_addr: Option<crate::addr::PeerAddr>,
    config: ConnectionConfig,
    initial_sequence_number: Seq,
    rng: &mut (impl RngCore + CryptoRng),
) -> CryptoConnection {
    Connection::with_hooks(
        own_addr,
        dest_addr,
        relay_addr,
        config,
        initial_sequence_number,
        CryptoHooks::new(rng),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addr::PeerAddr,
        handler::{Handler, OutboundSink},
    };
    use rand::thread_rng;
    use web_time::Instant;

    #[derive(Default)]
    struct RecordingHandler {
        messages: Vec<Vec<u8>>,
    }

    impl Handler for RecordingHandler {
        fn receive_message(&mut self, payload: Vec<u8>) {
            self.messages.push(payload);
        }
        fn handle_shutdown(&mut self) {}
    }

    fn addr(ip: &str, port: u16) -> PeerAddr {
        PeerAddr::new(ip, port)
    }

    #[test]
    fn session_key_round_trips_a_message() {
        let mut rng = thread_rng();
        let now = Instant::now();
        let cfg = ConnectionConfig::default();
        let mut a = new_crypto_connection(
            addr("1.1.1.1", 1),
            addr("2.2.2.2", 1),
            None,
            cfg,
            Seq(1),
            &mut rng,
        );
        let mut b = new_crypto_connection(
            addr("2.2.2.2", 1),
            addr("1.1.1.1", 1),
            None,
            cfg,
            Seq(100),
            &mut rng,
        );
        let mut out_a: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        let mut out_b: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
        let mut handler_a = RecordingHandler::default();
        let mut handler_b = RecordingHandler::default();

        a.poll(now, &mut out_a, &mut handler_a);
        let syn = Packet::decode(&out_a.remove(0).0).unwrap();
        b.receive_packet(syn, now, &mut out_b, &mut handler_b);
        let syn_ack = Packet::decode(&out_b.remove(0).0).unwrap();
        a.receive_packet(syn_ack, now, &mut out_a, &mut handler_a);
        assert!(a.is_connected());

        a.send_message(b"top secret".to_vec(), now, &mut out_a);
        let data = Packet::decode(&out_a.remove(0).0).unwrap();
        assert_ne!(data.payload, b"top secret");
        b.receive_packet(data, now, &mut out_b, &mut handler_b);
        assert_eq!(handler_b.messages, vec![b"top secret".to_vec()]);
    }

    #[test]
    fn ciphertext_from_wrong_key_is_dropped_silently() {
        let mut rng = thread_rng();
        let mut hooks = CryptoHooks::new(&mut rng);
        let stranger = CryptoHooks::new(&mut rng);
        hooks.peer_box = Some(SalsaBox::new(&stranger.public_key, &hooks.secret_key));

        let forged = Packet {
            sequence_number: Seq(5),
            dest_addr: PeerAddr::new("1.1.1.1", 1),
            source_addr: PeerAddr::new("2.2.2.2", 1),
            payload: vec![0u8; 40],
            more_fragments: 0,
            ack: 1,
            fin: false,
            syn: false,
        };
        assert!(hooks.on_receive_inbound(forged).is_none());
    }
}
