#![cfg(feature = "crypto")]

use rand::thread_rng;
use rudp::{
    addr::PeerAddr,
    connection::ConnectionConfig,
    crypto::new_crypto_connection,
    handler::Handler,
    packet::Packet,
    seq::Seq,
};
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
fn encrypted_session_round_trips_a_message_end_to_end() {
    let mut rng = thread_rng();
    let now = Instant::now();
    let config = ConnectionConfig::default();
    let mut a = new_crypto_connection(addr("1.1.1.1", 1), addr("2.2.2.2", 1), None, config, Seq(1), &mut rng);
    let mut b = new_crypto_connection(addr("2.2.2.2", 1), addr("1.1.1.1", 1), None, config, Seq(900), &mut rng);
    let mut out_a: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
    let mut out_b: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
    let mut ha = RecordingHandler::default();
    let mut hb = RecordingHandler::default();

    a.poll(now, &mut out_a, &mut ha);
    let syn = Packet::decode(&out_a.remove(0).0).unwrap();
    assert_eq!(syn.payload.len(), 32, "SYN payload carries a raw Curve25519 public key");

    b.receive_packet(syn, now, &mut out_b, &mut hb);
    let syn_ack = Packet::decode(&out_b.remove(0).0).unwrap();
    a.receive_packet(syn_ack, now, &mut out_a, &mut ha);
    assert!(a.is_connected());

    a.send_message(b"confidential".to_vec(), now, &mut out_a);
    let ciphertext_packet = Packet::decode(&out_a.remove(0).0).unwrap();
    assert_ne!(ciphertext_packet.payload, b"confidential");

    b.receive_packet(ciphertext_packet, now, &mut out_b, &mut hb);
    assert_eq!(hb.messages, vec![b"confidential".to_vec()]);
}

#[test]
fn ciphertext_meant_for_a_different_session_is_dropped_not_delivered() {
    let mut rng = thread_rng();
    let now = Instant::now();
    let config = ConnectionConfig::default();

    // A and B complete a handshake and establish a session key.
    let mut a = new_crypto_connection(addr("1.1.1.1", 1), addr("2.2.2.2", 1), None, config, Seq(1), &mut rng);
    let mut b = new_crypto_connection(addr("2.2.2.2", 1), addr("1.1.1.1", 1), None, config, Seq(200), &mut rng);
    let mut out_a: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
    let mut out_b: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
    let mut ha = RecordingHandler::default();
    let mut hb = RecordingHandler::default();
    a.poll(now, &mut out_a, &mut ha);
    let syn = Packet::decode(&out_a.remove(0).0).unwrap();
    b.receive_packet(syn, now, &mut out_b, &mut hb);
    let syn_ack = Packet::decode(&out_b.remove(0).0).unwrap();
    a.receive_packet(syn_ack, now, &mut out_a, &mut ha);

    // C independently establishes its own session with B's peer address,
    // under a different key pair entirely (simulating an attacker who does
    // not hold A's or B's private key).
    let mut c = new_crypto_connection(addr("3.3.3.3", 1), addr("2.2.2.2", 1), None, config, Seq(1), &mut rng);
    let mut out_c: Vec<(Vec<u8>, PeerAddr)> = Vec::new();
    let mut hc = RecordingHandler::default();
    c.poll(now, &mut out_c, &mut hc);
    let forged_syn = Packet::decode(&out_c.remove(0).0).unwrap();
    // B absorbs C's SYN as a stray duplicate handshake attempt once
    // CONNECTED; it does not replace the already-established A session.
    b.receive_packet(forged_syn, now, &mut out_b, &mut hb);

    a.send_message(b"for b only".to_vec(), now, &mut out_a);
    let legit_ciphertext = Packet::decode(&out_a.remove(0).0).unwrap();
    b.receive_packet(legit_ciphertext, now, &mut out_b, &mut hb);
    assert_eq!(hb.messages, vec![b"for b only".to_vec()]);
}
