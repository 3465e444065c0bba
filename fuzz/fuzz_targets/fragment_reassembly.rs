#![no_main]

use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;
use rudp::{addr::PeerAddr, heap::ReorderHeap, packet::Packet, seq::Seq};

#[derive(Debug, Arbitrary)]
struct Input {
    base: u16,
    fragment_lens: Vec<u8>,
    arrival_order: Vec<u8>,
}

fuzz_target!(|input: Input| {
    // Cap fragment count; unbounded Vec<u8> lengths would make this target
    // spend all its time allocating rather than exercising the heap.
    let fragment_lens: Vec<u8> = input.fragment_lens.into_iter().take(16).collect();
    if fragment_lens.is_empty() {
        return;
    }
    let base = Seq(input.base);
    let k = fragment_lens.len();

    let mut expected = Vec::new();
    let mut packets = Vec::with_capacity(k);
    for (i, &len) in fragment_lens.iter().enumerate() {
        let payload = vec![i as u8; usize::from(len)];
        expected.extend_from_slice(&payload);
        packets.push(Packet {
            sequence_number: base.wrapping_add(i as u16),
            dest_addr: PeerAddr::new("1.1.1.1", 1),
            source_addr: PeerAddr::new("2.2.2.2", 1),
            payload,
            more_fragments: (k - 1 - i) as u32,
            ack: 0,
            fin: false,
            syn: false,
        });
    }

    // Shuffle deterministically by the fuzzer-provided arrival order.
    let mut order: Vec<usize> = (0..k).collect();
    for (i, &pick) in input.arrival_order.iter().enumerate().take(k) {
        let j = i + (usize::from(pick) % (k - i));
        order.swap(i, j);
    }

    let mut heap = ReorderHeap::new();
    let mut group = None;
    for &idx in &order {
        heap.push(packets[idx].clone());
        group = group.or_else(|| heap.try_pop_fragment_group(base));
    }

    let group = group.expect("all fragments pushed, group must be extractable regardless of order");
    let actual: Vec<u8> = group.iter().flat_map(|p| p.payload.clone()).collect();
    assert_eq!(actual, expected);
    assert!(heap.is_empty());
});
