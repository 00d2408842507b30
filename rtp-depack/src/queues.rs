// §4.B reorder list and the raw-packet queue of §4.D.4, both rewritten per
// §9 as an ordered multimap keyed by extended sequence rather than a
// mutex-guarded linked list — the mutex itself is left to the caller
// (`rtsp-client` holds one queue pair per stream behind its session lock).

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::packet::RtpPacket;

/// Packet-level flags carried alongside a reassembled packet, mirroring
/// the NEM `flags` bitfield (§6) plus the internal loss marker from
/// §4.D.6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub end_of_packet: bool,
    pub skip: bool,
}

#[derive(Debug, Clone)]
pub struct ReassembledPacket {
    pub ext_seq: u64,
    pub ts: u32,
    pub marker: bool,
    pub flags: PacketFlags,
    pub data: SmallVec<[u8; 1460]>,
}

/// §4.B: "a singly-linked list sorted ascending by sequence;
/// `InsertInOrder` rejects same-key inserts unless the list was created
/// with `allow-same-seq`." A `BTreeMap` keyed by extended sequence gives
/// the same ordering and rejection behavior without a hand-rolled list;
/// `allow_same_seq` degrades the value to a small vec of collisions.
pub struct ReorderList {
    allow_same_seq: bool,
    entries: BTreeMap<u64, SmallVec<[ReassembledPacket; 1]>>,
    len: usize,
}

impl ReorderList {
    pub fn new(allow_same_seq: bool) -> Self {
        Self {
            allow_same_seq,
            entries: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `false` (and drops the packet) on a duplicate key when the
    /// list disallows same-sequence entries.
    pub fn insert_in_order(&mut self, pkt: ReassembledPacket) -> bool {
        let bucket = self.entries.entry(pkt.ext_seq).or_default();
        if !bucket.is_empty() && !self.allow_same_seq {
            return false;
        }
        bucket.push(pkt);
        self.len += 1;
        true
    }

    /// Removes the `n`th packet from the head (0-indexed), matching
    /// `RemoveListElement(n)`.
    pub fn remove_at(&mut self, n: usize) -> Option<ReassembledPacket> {
        let (&key, bucket) = self.entries.iter_mut().nth(n)?;
        let pkt = bucket.remove(0);
        if bucket.is_empty() {
            self.entries.remove(&key);
        }
        self.len -= 1;
        Some(pkt)
    }

    pub fn pop_front(&mut self) -> Option<ReassembledPacket> {
        self.remove_at(0)
    }

    /// `PeekListElement(n)`.
    pub fn peek_at(&self, n: usize) -> Option<&ReassembledPacket> {
        self.entries.iter().nth(n).and_then(|(_, bucket)| bucket.first())
    }
}

/// §4.D.4 raw-queue drain thresholds.
pub const RAW_QUEUE_THRESHOLD_DEFAULT: usize = 20;
pub const RAW_QUEUE_THRESHOLD_AMR: usize = 5;
pub const RAW_QUEUE_THRESHOLD_AAC: usize = 5;

/// The per-stream queue of raw RTP packets awaiting depacketization,
/// keyed by extended sequence so reordering within a short window is
/// absorbed before the codec ever sees a packet.
pub struct RawQueue {
    threshold: usize,
    entries: BTreeMap<u64, RtpPacket>,
    last_seq: Option<u64>,
}

impl RawQueue {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            entries: BTreeMap::new(),
            last_seq: None,
        }
    }

    pub fn insert(&mut self, ext_seq: u64, pkt: RtpPacket) {
        self.entries.insert(ext_seq, pkt);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn should_drain(&self) -> bool {
        self.entries.len() > self.threshold
    }

    /// Pops the lowest extended sequence, reporting whether a gap was
    /// detected against the previously drained sequence (§4.D.4:
    /// `raw_last_seq + 1 ≠ current`).
    pub fn drain_one(&mut self) -> Option<(u64, RtpPacket, bool)> {
        let (&ext_seq, _) = self.entries.iter().next()?;
        let pkt = self.entries.remove(&ext_seq).unwrap();
        let lost = match self.last_seq {
            Some(last) => last + 1 != ext_seq,
            None => false,
        };
        self.last_seq = Some(ext_seq);
        Some((ext_seq, pkt, lost))
    }

    /// Drains everything regardless of threshold, for EOS flush.
    pub fn drain_all(&mut self) -> Vec<(u64, RtpPacket, bool)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(item) = self.drain_one() {
            out.push(item);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(ext_seq: u64) -> ReassembledPacket {
        ReassembledPacket {
            ext_seq,
            ts: 0,
            marker: false,
            flags: PacketFlags::default(),
            data: SmallVec::new(),
        }
    }

    #[test]
    fn rejects_duplicate_seq_by_default() {
        let mut list = ReorderList::new(false);
        assert!(list.insert_in_order(pkt(5)));
        assert!(!list.insert_in_order(pkt(5)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn allows_duplicate_seq_when_configured() {
        let mut list = ReorderList::new(true);
        assert!(list.insert_in_order(pkt(5)));
        assert!(list.insert_in_order(pkt(5)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn removes_in_ascending_order() {
        let mut list = ReorderList::new(false);
        list.insert_in_order(pkt(9));
        list.insert_in_order(pkt(3));
        list.insert_in_order(pkt(6));
        assert_eq!(list.pop_front().unwrap().ext_seq, 3);
        assert_eq!(list.pop_front().unwrap().ext_seq, 6);
        assert_eq!(list.pop_front().unwrap().ext_seq, 9);
        assert!(list.is_empty());
    }

    #[test]
    fn raw_queue_detects_gap_on_drain() {
        use smallvec::smallvec;
        let mut q = RawQueue::new(1);
        let mk = |ts| RtpPacket {
            seq: 0,
            ts,
            marker: false,
            payload_type: 0,
            payload: smallvec![],
        };
        q.insert(0, mk(0));
        q.insert(2, mk(2));
        let (_, _, lost0) = q.drain_one().unwrap();
        assert!(!lost0);
        let (_, _, lost2) = q.drain_one().unwrap();
        assert!(lost2);
    }
}
