#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp::packet::Packet;

fuzz_target!(|data: &[u8]| {
    // Must never panic on arbitrary bytes, valid JSON or not.
    if let Ok(packet) = Packet::decode(data) {
        let encoded = packet.encode();
        let roundtrip = Packet::decode(&encoded).expect("a packet we just encoded must decode");
        assert_eq!(packet, roundtrip);
    }
});
