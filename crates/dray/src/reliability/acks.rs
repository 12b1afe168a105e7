// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acknowledgement bookkeeping for reliable ray packets.
//!
//! Three per-address structures plus the outstanding FIFO:
//! - `to_be_acked`: sequence numbers received from a source since the last
//!   ack scan (duplicates included, so the sender can stop retrying)
//! - `received_seqnos`: every sequence number ever delivered from a source;
//!   grows only, drives duplicate suppression
//! - `received_acks`: every sequence number a destination has acked
//!
//! An ack frame is a concatenation of `{u64 seq_no, u8 tracked, u16 attempt}`
//! triples packed to at most the UDP MTU.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::UDP_MTU_BYTES;
use crate::error::Result;
use crate::protocol::wire::{put_u16, put_u64, put_u8, Chunk};

use super::packet::RayPacket;

/// One acknowledged delivery: (sequence number, tracked, attempt).
pub type AckEntry = (u64, bool, u16);

/// The worker's reliable-delivery ledger.
#[derive(Debug, Default)]
pub struct AckLedger {
    to_be_acked: HashMap<SocketAddr, Vec<AckEntry>>,
    received_seqnos: HashMap<SocketAddr, HashSet<u64>>,
    received_acks: HashMap<SocketAddr, HashSet<u64>>,
    outstanding: VecDeque<(Instant, RayPacket)>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a reliable message from `source`. The ack entry is recorded
    /// unconditionally (duplicates must still be re-acked); the return value
    /// is false when the sequence number was already delivered.
    pub fn note_reliable(&mut self, source: SocketAddr, entry: AckEntry) -> bool {
        self.to_be_acked.entry(source).or_default().push(entry);
        self.received_seqnos
            .entry(source)
            .or_default()
            .insert(entry.0)
    }

    /// Whether `(source, seq_no)` has already been delivered.
    pub fn already_delivered(&self, source: SocketAddr, seq_no: u64) -> bool {
        self.received_seqnos
            .get(&source)
            .is_some_and(|set| set.contains(&seq_no))
    }

    /// Record an ack from `source` for one of our packets.
    pub fn record_ack(&mut self, source: SocketAddr, seq_no: u64) {
        self.received_acks.entry(source).or_default().insert(seq_no);
    }

    /// Liveness gate for the retransmit scan: at least one ack has ever
    /// arrived from anywhere.
    pub fn any_acks(&self) -> bool {
        !self.received_acks.is_empty()
    }

    pub fn is_acked(&self, destination: SocketAddr, seq_no: u64) -> bool {
        self.received_acks
            .get(&destination)
            .is_some_and(|set| set.contains(&seq_no))
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.to_be_acked.is_empty()
    }

    /// Track a sent reliable packet until acked or re-queued.
    pub fn push_outstanding(&mut self, deadline: Instant, packet: RayPacket) {
        self.outstanding.push_back((deadline, packet));
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Deadline of the oldest outstanding packet.
    pub fn front_deadline(&self) -> Option<Instant> {
        self.outstanding.front().map(|(deadline, _)| *deadline)
    }

    /// Pop the front packet if its deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<RayPacket> {
        if self.outstanding.front()?.0 > now {
            return None;
        }
        self.outstanding.pop_front().map(|(_, packet)| packet)
    }

    /// Drain all pending acks into MTU-bounded ack frames per source.
    pub fn drain_pending_acks(&mut self) -> Vec<(SocketAddr, Vec<Vec<u8>>)> {
        let mut frames = Vec::with_capacity(self.to_be_acked.len());

        for (source, entries) in self.to_be_acked.drain() {
            let mut per_source = Vec::new();
            let mut current = Vec::new();

            for (seq_no, tracked, attempt) in entries {
                if current.len() + ACK_ENTRY_BYTES > UDP_MTU_BYTES {
                    per_source.push(std::mem::take(&mut current));
                }
                put_u64(&mut current, seq_no);
                put_u8(&mut current, tracked as u8);
                put_u16(&mut current, attempt);
            }
            if !current.is_empty() {
                per_source.push(current);
            }
            frames.push((source, per_source));
        }
        frames
    }
}

/// Encoded size of one ack triple.
pub const ACK_ENTRY_BYTES: usize = 8 + 1 + 2;

/// Parse an ack frame back into its triples.
pub fn parse_ack_payload(payload: &[u8]) -> Result<Vec<AckEntry>> {
    let mut chunk = Chunk::new(payload);
    let mut entries = Vec::with_capacity(payload.len() / ACK_ENTRY_BYTES);
    while !chunk.is_empty() {
        let seq_no = chunk.u64()?;
        let tracked = chunk.u8()? != 0;
        let attempt = chunk.u16()?;
        entries.push((seq_no, tracked, attempt));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, OpCode};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn packet(seq: u64) -> RayPacket {
        let message = Message::with_transport(1, OpCode::SendRays, vec![0; 4], true, seq, false);
        RayPacket::new(addr(5000), 2, 3, 1, &message, Vec::new())
    }

    #[test]
    fn test_note_reliable_detects_duplicates() {
        let mut ledger = AckLedger::new();
        assert!(ledger.note_reliable(addr(1), (7, false, 0)));
        assert!(!ledger.note_reliable(addr(1), (7, false, 1)), "duplicate");
        assert!(
            ledger.note_reliable(addr(2), (7, false, 0)),
            "per-source spaces are independent"
        );
        assert!(ledger.already_delivered(addr(1), 7));
        assert!(!ledger.already_delivered(addr(1), 8));
    }

    #[test]
    fn test_duplicates_still_get_acked() {
        let mut ledger = AckLedger::new();
        ledger.note_reliable(addr(1), (7, false, 0));
        ledger.note_reliable(addr(1), (7, false, 1));

        let frames = ledger.drain_pending_acks();
        assert_eq!(frames.len(), 1);
        let (_, per_source) = &frames[0];
        let entries = parse_ack_payload(&per_source[0]).unwrap();
        assert_eq!(entries.len(), 2, "both receipts are acked");
    }

    #[test]
    fn test_drain_empties_ledger() {
        let mut ledger = AckLedger::new();
        ledger.note_reliable(addr(1), (1, true, 0));
        assert!(ledger.has_pending_acks());

        ledger.drain_pending_acks();
        assert!(!ledger.has_pending_acks());
    }

    #[test]
    fn test_ack_frames_packed_to_mtu() {
        let mut ledger = AckLedger::new();
        let entries = UDP_MTU_BYTES / ACK_ENTRY_BYTES + 10;
        for seq in 0..entries as u64 {
            ledger.note_reliable(addr(1), (seq, false, 0));
        }

        let frames = ledger.drain_pending_acks();
        let (_, per_source) = &frames[0];
        assert_eq!(per_source.len(), 2, "overflow starts a second frame");
        assert!(per_source.iter().all(|f| f.len() <= UDP_MTU_BYTES));

        let total: usize = per_source
            .iter()
            .map(|f| parse_ack_payload(f).unwrap().len())
            .sum();
        assert_eq!(total, entries, "nothing lost at the frame boundary");
    }

    #[test]
    fn test_ack_payload_round_trip() {
        let mut payload = Vec::new();
        put_u64(&mut payload, 99);
        put_u8(&mut payload, 1);
        put_u16(&mut payload, 4);

        let entries = parse_ack_payload(&payload).unwrap();
        assert_eq!(entries, vec![(99, true, 4)]);
    }

    #[test]
    fn test_truncated_ack_payload_rejected() {
        let mut payload = Vec::new();
        put_u64(&mut payload, 99);
        assert!(parse_ack_payload(&payload).is_err());
    }

    #[test]
    fn test_outstanding_fifo_pops_in_deadline_order() {
        let mut ledger = AckLedger::new();
        let now = Instant::now();
        ledger.push_outstanding(now, packet(1));
        ledger.push_outstanding(now + std::time::Duration::from_secs(60), packet(2));

        let due = ledger.pop_due(now).expect("front is due");
        assert_eq!(due.sequence_number, 1);
        assert!(
            ledger.pop_due(now).is_none(),
            "second packet's deadline is in the future"
        );
        assert_eq!(ledger.outstanding_len(), 1);
    }

    #[test]
    fn test_ack_gate_and_lookup() {
        let mut ledger = AckLedger::new();
        assert!(!ledger.any_acks());

        ledger.record_ack(addr(5000), 9);
        assert!(ledger.any_acks());
        assert!(ledger.is_acked(addr(5000), 9));
        assert!(!ledger.is_acked(addr(5000), 10));
        assert!(!ledger.is_acked(addr(5001), 9));
    }
}
