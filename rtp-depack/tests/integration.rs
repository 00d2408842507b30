//! Crate-level integration suite, per `SPEC_FULL.md`'s ambient test-tooling
//! section. Drives the whole reassembly pipeline — wire bytes through
//! `parse_rtp_header`, `SequenceTracker`, `RawQueue`, a `Depacketizer`, and
//! `ReorderList` — the way `rtsp-client`'s session loop actually chains
//! them, rather than exercising any one module in isolation.

use rtp_depack::{AmrKind, Depacketizer, PacketFlags, RawQueue, ReassembledPacket, ReorderList, SequenceTracker};

/// Builds one minimal RTP/UDP payload: version 2, no padding/extension/CSRC.
fn build_rtp_packet(seq: u16, ts: u32, marker: bool, payload_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.push(0b1000_0000); // V=2, P=0, X=0, CC=0
    buf.push(((marker as u8) << 7) | (payload_type & 0x7f));
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // SSRC, unused by this layer
    buf.extend_from_slice(payload);
    buf
}

/// One AMR-NB frame, FT=2 (15-byte payload), as a single-frame TOC + data.
fn amr_nb_datagram(seq: u16, ts: u32) -> Vec<u8> {
    let mut payload = vec![0x00 | (2 << 3)]; // F=0, FT=2
    payload.extend(std::iter::repeat(seq as u8).take(15));
    build_rtp_packet(seq, ts, false, 96, &payload)
}

/// End to end: five AMR-NB RTP datagrams arrive out of order (as UDP would
/// deliver them), get parsed, sequence-extended, absorbed by the raw reorder
/// queue, depacketized, and land in final ascending order with their
/// payloads intact.
#[test]
fn reassembles_out_of_order_amr_stream_in_order() {
    let seqs: [u16; 5] = [100, 101, 102, 103, 104];
    let arrival_order = [2, 0, 4, 1, 3]; // shuffled indices into `seqs`

    let mut tracker = SequenceTracker::new();
    let mut raw_queue = RawQueue::new(20);

    for &i in &arrival_order {
        let seq = seqs[i];
        let datagram = amr_nb_datagram(seq, seq as u32 * 160);
        let pkt = rtp_depack::parse_rtp_header(&datagram).expect("valid RTP header");
        assert_eq!(pkt.payload_type, 96);
        let ext_seq = tracker.extend(pkt.seq);
        raw_queue.insert(ext_seq, pkt);
    }

    assert_eq!(raw_queue.len(), seqs.len());

    let mut depack = Depacketizer::AmrNbWb(AmrKind::Nb);
    let mut reorder = ReorderList::new(true);
    for (ext_seq, pkt, lost) in raw_queue.drain_all() {
        assert!(!lost, "no packet was actually dropped in this run");
        for reassembled in depack.process(&pkt.payload, pkt.ts, ext_seq, pkt.marker).unwrap() {
            reorder.insert_in_order(reassembled);
        }
    }

    assert_eq!(reorder.len(), seqs.len());
    let mut last_seq = None;
    while let Some(p) = reorder.pop_front() {
        if let Some(last) = last_seq {
            assert!(p.ext_seq > last, "reorder list must yield ascending extended sequence");
        }
        // The AMR frame body (everything after the 1-byte TOC) was filled
        // with the original wire sequence number as a marker byte.
        let expected_seq = seqs[(p.ext_seq - 100) as usize];
        assert!(p.data[1..].iter().all(|&b| b == expected_seq as u8));
        last_seq = Some(p.ext_seq);
    }
}

/// A packet lost in transit is reported by the raw queue's gap detector at
/// the point the following packet is drained, and depacketization simply
/// proceeds on what did arrive (§4.D.6: loss does not stall the pipeline).
#[test]
fn raw_queue_reports_gap_when_a_datagram_never_arrives() {
    let seqs: [u16; 4] = [10, 11, 13, 14]; // seq 12 never arrives

    let mut tracker = SequenceTracker::new();
    let mut raw_queue = RawQueue::new(20);
    for &seq in &seqs {
        let datagram = amr_nb_datagram(seq, seq as u32 * 160);
        let pkt = rtp_depack::parse_rtp_header(&datagram).unwrap();
        let ext_seq = tracker.extend(pkt.seq);
        raw_queue.insert(ext_seq, pkt);
    }

    let drained = raw_queue.drain_all();
    assert_eq!(drained.len(), 4);
    let lost_flags: Vec<bool> = drained.iter().map(|(_, _, lost)| *lost).collect();
    assert_eq!(lost_flags, vec![false, false, true, false]);
}

/// A raw packet that depacketizes into several reassembled frames (AMR can
/// pack multiple frames per RTP payload) all carry the same extended
/// sequence and a `ReorderList` configured with `allow_same_seq` keeps them
/// together and in emission order.
#[test]
fn multi_frame_payload_keeps_frames_in_emission_order_under_shared_seq() {
    // TOC: F=1 FT=2 (15 bytes), F=0 FT=4 (19 bytes) -> two frames, one RTP
    // packet, matching the depacketizer's own multi-frame unit test.
    let mut payload = vec![0x80 | (2 << 3), 0x00 | (4 << 3)];
    payload.extend(vec![0xAA; 15]);
    payload.extend(vec![0xBB; 19]);
    let datagram = build_rtp_packet(500, 1000, false, 96, &payload);

    let pkt = rtp_depack::parse_rtp_header(&datagram).unwrap();
    let mut tracker = SequenceTracker::new();
    let ext_seq = tracker.extend(pkt.seq);

    let mut depack = Depacketizer::AmrNbWb(AmrKind::Nb);
    let frames = depack.process(&pkt.payload, pkt.ts, ext_seq, pkt.marker).unwrap();
    assert_eq!(frames.len(), 2);

    let mut reorder = ReorderList::new(true);
    for f in frames {
        reorder.insert_in_order(f);
    }
    assert_eq!(reorder.len(), 2);
    let first = reorder.pop_front().unwrap();
    let second = reorder.pop_front().unwrap();
    assert_eq!(first.ext_seq, ext_seq);
    assert_eq!(second.ext_seq, ext_seq);
    assert!(second.ts > first.ts, "later frame in the payload gets the later synthetic timestamp");
    assert_eq!(first.data.len(), 16); // 1 TOC byte + 15
    assert_eq!(second.data.len(), 20); // 1 TOC byte + 19
}

/// `PacketFlags` defaults carry through unchanged for codecs that don't set
/// them (most of §4.C); only H.264's loss handling and a few others touch
/// `skip`/`end_of_packet` explicitly.
#[test]
fn default_flags_pass_through_for_plain_codecs() {
    let datagram = build_rtp_packet(1, 0, true, 97, &[0xDE, 0xAD, 0xBE, 0xEF]);
    let pkt = rtp_depack::parse_rtp_header(&datagram).unwrap();
    let mut depack = Depacketizer::Mpeg4Visual;
    let out = depack.process(&pkt.payload, pkt.ts, 1, pkt.marker).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].flags, PacketFlags::default());
}
