//! Reliability engine (§4.E): wait-ack tracking, selective ack/nak application,
//! and timeout-driven retransmission.

use std::collections::VecDeque;

use crate::rtt::RttEstimator;
use crate::wire::ack_range::{seq_le, seq_lt};
use crate::wire::header::Opcode;
use crate::wire::{AckHeader, AckRangeList};

/// Rewrites the leading opcode byte of a stored `Data` packet to `Retrans` before
/// it goes back out (§4.E: "changing the opcode from `DATA` to `RETRANS`"). Every
/// packet tracked here was encoded by `DataHeader::encode`, whose first byte is
/// always the opcode, so this never needs to touch anything past byte 0.
fn as_retransmit(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if let Some(opcode_byte) = out.first_mut() {
        *opcode_byte = Opcode::Retrans as u8;
    }
    out
}

#[derive(Debug, Clone)]
struct SentPacket {
    seq: u32,
    data: Vec<u8>,
    sent_at_ms: i64,
    retries: u32,
}

/// Tracks tunnel-level packets awaiting the peer's ack and retransmits them on
/// timeout, up to `max_retries` (§9 open question: defaults to 1).
pub struct ReliabilitySender {
    next_seq: u32,
    sent: VecDeque<SentPacket>,
    cumulative_ack: u32,
    rtt: RttEstimator,
    max_retries: u32,
    peer_recv_window: i32,
}

impl ReliabilitySender {
    pub fn new(max_retries: u32) -> Self {
        ReliabilitySender {
            next_seq: 0,
            sent: VecDeque::new(),
            cumulative_ack: 0,
            rtt: RttEstimator::new(),
            max_retries,
            peer_recv_window: i32::MAX,
        }
    }

    pub fn cumulative_ack(&self) -> u32 {
        self.cumulative_ack
    }

    pub fn bytes_waiting_ack(&self) -> usize {
        self.sent.iter().map(|p| p.data.len()).sum()
    }

    /// The sequence number `on_send` will assign next, so callers can encode it into
    /// the header before the bytes going on the wire are known.
    pub fn peek_next_seq(&self) -> u32 {
        self.next_seq.wrapping_add(1)
    }

    /// Queues `data` for send under the sequence number `peek_next_seq` reported.
    /// `None` if sending it would exceed the peer's advertised receive window (§5
    /// flow control); the caller must not have sent anything else in between.
    pub fn on_send(&mut self, data: Vec<u8>, now_ms: i64) -> Option<u32> {
        let window = self.peer_recv_window.max(0) as usize;
        if self.bytes_waiting_ack() + data.len() > window {
            return None;
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        let seq = self.next_seq;
        self.sent.push_back(SentPacket { seq, data, sent_at_ms: now_ms, retries: 0 });
        Some(seq)
    }

    /// Applies the peer's ack header: drops everything covered by the cumulative
    /// point or an explicit ack range, and immediately retransmits anything the
    /// peer nak'd and we still hold.
    pub fn on_ack(&mut self, ack: &AckHeader, now_ms: i64) -> Vec<Vec<u8>> {
        self.peer_recv_window = ack.recv_window_size;
        self.cumulative_ack = ack.cumulative_seq;
        self.sent.retain(|p| !(seq_le(p.seq, ack.cumulative_seq) || ack.ack_ranges.contains(p.seq)));

        let mut retransmits = Vec::new();
        for p in self.sent.iter_mut() {
            if ack.nak_ranges.contains(p.seq) {
                let sample = (now_ms - p.sent_at_ms).max(0) as u64;
                self.rtt.update(std::time::Duration::from_millis(sample));
                p.retries += 1;
                p.sent_at_ms = now_ms;
                retransmits.push(as_retransmit(&p.data));
            }
        }
        retransmits
    }

    /// Packets whose RTO has elapsed without an ack. Returns `(retransmits,
    /// failed_seqs)`; a packet that has already used its retry budget is dropped
    /// and reported as failed instead of retransmitted again.
    pub fn process_timer(&mut self, now_ms: i64) -> (Vec<Vec<u8>>, Vec<u32>) {
        let mut retransmits = Vec::new();
        let mut failed = Vec::new();
        let mut keep = VecDeque::with_capacity(self.sent.len());
        while let Some(mut p) = self.sent.pop_front() {
            let rto = self.rtt.rto_with_backoff(p.retries).as_millis() as i64;
            if now_ms.saturating_sub(p.sent_at_ms) >= rto {
                if p.retries >= self.max_retries {
                    failed.push(p.seq);
                    continue;
                }
                p.retries += 1;
                p.sent_at_ms = now_ms;
                retransmits.push(as_retransmit(&p.data));
            }
            keep.push_back(p);
        }
        self.sent = keep;
        (retransmits, failed)
    }
}

/// Tracks inbound tunnel-level sequence numbers and builds the ack/nak ranges
/// reported back to the peer.
#[derive(Debug, Default)]
pub struct ReliabilityReceiver {
    cumulative: u32,
    out_of_order: AckRangeList,
}

impl ReliabilityReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an inbound packet. Returns `true` if this is the first time it has
    /// been seen (a retransmitted duplicate returns `false`).
    pub fn on_packet(&mut self, seq: u32) -> bool {
        if seq_le(seq, self.cumulative) || self.out_of_order.contains(seq) {
            return false;
        }
        self.out_of_order.insert(seq);
        while self.out_of_order.contains(self.cumulative.wrapping_add(1)) {
            self.cumulative = self.cumulative.wrapping_add(1);
        }
        self.out_of_order.retain_above(self.cumulative);
        true
    }

    pub fn build_ack(&self, recv_window_size: i32) -> AckHeader {
        let mut nak_ranges = AckRangeList::new();
        if let Some(&(lo, _)) = self.out_of_order.ranges().first() {
            if seq_lt(self.cumulative, lo) {
                nak_ranges.insert_range(self.cumulative.wrapping_add(1), lo);
            }
        }
        AckHeader {
            flags: 0,
            cumulative_seq: self.cumulative,
            nak_ranges,
            ack_ranges: self.out_of_order.clone(),
            recv_window_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_ack_drops_acked_packets() {
        let mut s = ReliabilitySender::new(1);
        s.on_send(vec![1], 0);
        s.on_send(vec![2], 0);
        assert_eq!(s.bytes_waiting_ack(), 2);
        let ack = AckHeader { cumulative_seq: 2, recv_window_size: 1000, ..Default::default() };
        s.on_ack(&ack, 10);
        assert_eq!(s.bytes_waiting_ack(), 0);
    }

    #[test]
    fn nak_triggers_immediate_retransmit_with_the_opcode_rewritten() {
        let mut s = ReliabilitySender::new(1);
        let original = vec![Opcode::Data as u8, 9, 9];
        let seq = s.on_send(original.clone(), 0).unwrap();
        let mut nak = AckRangeList::new();
        nak.insert(seq);
        let ack = AckHeader { cumulative_seq: 0, nak_ranges: nak, recv_window_size: 1000, ..Default::default() };
        let retransmits = s.on_ack(&ack, 50);
        assert_eq!(retransmits.len(), 1);
        assert_eq!(retransmits[0][0], Opcode::Retrans as u8);
        assert_eq!(retransmits[0][1..], original[1..]);
    }

    #[test]
    fn window_full_rejects_send() {
        let mut s = ReliabilitySender::new(1);
        s.peer_recv_window = 4;
        assert!(s.on_send(vec![0; 4], 0).is_some());
        assert!(s.on_send(vec![0; 1], 0).is_none());
    }

    #[test]
    fn exhausted_retries_reports_failure_not_retransmit() {
        let mut s = ReliabilitySender::new(0);
        s.on_send(vec![1, 2, 3], 0);
        let (retransmits, failed) = s.process_timer(100_000);
        assert!(retransmits.is_empty());
        assert_eq!(failed, vec![1]);
    }

    #[test]
    fn receiver_tracks_cumulative_and_gap_as_nak() {
        let mut r = ReliabilityReceiver::new();
        assert!(r.on_packet(1));
        assert!(r.on_packet(3));
        assert!(!r.on_packet(1));
        let ack = r.build_ack(1000);
        assert_eq!(ack.cumulative_seq, 1);
        assert!(ack.nak_ranges.contains(2));
        assert!(ack.ack_ranges.contains(3));
    }
}
