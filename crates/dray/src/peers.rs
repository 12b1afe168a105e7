// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer table and connection state machine.
//!
//! Peers are learned from the coordinator (`ConnectTo`/`MultipleConnect`)
//! and start `Connecting`. A dual-address handshake (one `ConnectionRequest`
//! + `ConnectionResponse` per interface, matched by seed echo) advances a
//! peer to `Connected` only once *both* interfaces confirmed. Connected
//! peers receive keep-alive pings; connecting peers get their handshake
//! requests re-sent every peer tick.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::KEEP_ALIVE_INTERVAL;
use crate::ray::{TreeletId, WorkerId};
use crate::transport::NUM_INTERFACES;

/// Connection progress; monotonic per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// One remote worker (or the coordinator, as peer 0).
#[derive(Debug)]
pub struct Peer {
    pub id: WorkerId,
    pub addresses: [SocketAddr; NUM_INTERFACES],
    pub connected: [bool; NUM_INTERFACES],
    /// The peer's handshake seed, learned from its responses.
    pub seed: u32,
    pub state: PeerState,
    /// Treelets this peer announced ownership of.
    pub treelets: HashSet<TreeletId>,
    pub next_keep_alive: Instant,
    /// Handshake attempts so far.
    pub tries: u32,
}

impl Peer {
    /// A peer announced with one address per interface. A single-address
    /// announcement uses that address for both interfaces.
    pub fn new(id: WorkerId, addresses: &[SocketAddr]) -> Option<Self> {
        let first = *addresses.first()?;
        let second = addresses.get(1).copied().unwrap_or(first);
        Some(Self {
            id,
            addresses: [first, second],
            connected: [false; NUM_INTERFACES],
            seed: 0,
            state: PeerState::Connecting,
            treelets: HashSet::new(),
            next_keep_alive: Instant::now(),
            tries: 0,
        })
    }

    /// Record a seed-matched `ConnectionResponse` for one interface.
    /// Returns true when this response completed the handshake.
    pub fn record_connected(&mut self, address_no: usize) -> bool {
        if self.state == PeerState::Connected || address_no >= NUM_INTERFACES {
            return false;
        }
        self.connected[address_no] = true;

        if self.connected.iter().all(|c| *c) {
            self.state = PeerState::Connected;
            self.next_keep_alive = Instant::now() + KEEP_ALIVE_INTERVAL;
            log::info!("[PEER] worker {} connected on both interfaces", self.id);
            true
        } else {
            false
        }
    }

    /// Whether a keep-alive is due, advancing the deadline if so.
    pub fn keep_alive_due(&mut self, now: Instant) -> bool {
        if self.state != PeerState::Connected || self.next_keep_alive > now {
            return false;
        }
        self.next_keep_alive += KEEP_ALIVE_INTERVAL;
        true
    }
}

/// All peers known to this worker, with an address reverse index.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<WorkerId, Peer>,
    address_to_worker: HashMap<SocketAddr, WorkerId>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly announced peer. Re-announcements of a known peer are
    /// ignored (the FSM is monotonic).
    pub fn insert(&mut self, id: WorkerId, addresses: &[SocketAddr]) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        let Some(peer) = Peer::new(id, addresses) else {
            return false;
        };
        for addr in peer.addresses {
            self.address_to_worker.insert(addr, id);
        }
        log::debug!(
            "[PEER] learned worker {} addresses={:?}",
            id,
            peer.addresses
        );
        self.peers.insert(id, peer);
        true
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Worker that owns a source address, if known.
    pub fn worker_for_address(&self, addr: SocketAddr) -> Option<WorkerId> {
        self.address_to_worker.get(&addr).copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of peers still completing the handshake.
    pub fn connecting_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connecting)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_insert_builds_reverse_index() {
        let mut table = PeerTable::new();
        assert!(table.insert(4, &[addr(9000), addr(9001)]));
        assert_eq!(table.worker_for_address(addr(9000)), Some(4));
        assert_eq!(table.worker_for_address(addr(9001)), Some(4));
        assert_eq!(table.worker_for_address(addr(9002)), None);
    }

    #[test]
    fn test_reinsert_is_ignored() {
        let mut table = PeerTable::new();
        assert!(table.insert(4, &[addr(9000)]));
        assert!(!table.insert(4, &[addr(9100)]), "known peers stay put");
        assert_eq!(table.get(4).unwrap().addresses[0], addr(9000));
    }

    #[test]
    fn test_single_address_fills_both_interfaces() {
        let mut table = PeerTable::new();
        table.insert(1, &[addr(7000)]);
        let peer = table.get(1).unwrap();
        assert_eq!(peer.addresses, [addr(7000), addr(7000)]);
    }

    #[test]
    fn test_handshake_requires_both_interfaces() {
        let mut peer = Peer::new(2, &[addr(8000), addr(8001)]).unwrap();
        assert_eq!(peer.state, PeerState::Connecting);

        assert!(!peer.record_connected(1), "one interface is not enough");
        assert_eq!(peer.state, PeerState::Connecting);

        assert!(peer.record_connected(0), "second interface completes it");
        assert_eq!(peer.state, PeerState::Connected);
    }

    #[test]
    fn test_duplicate_response_is_idempotent() {
        let mut peer = Peer::new(2, &[addr(8000), addr(8001)]).unwrap();
        assert!(!peer.record_connected(0));
        assert!(!peer.record_connected(0), "same interface again: no change");
        assert_eq!(peer.state, PeerState::Connecting);
    }

    #[test]
    fn test_out_of_range_interface_rejected() {
        let mut peer = Peer::new(2, &[addr(8000)]).unwrap();
        assert!(!peer.record_connected(5));
        assert_eq!(peer.connected, [false, false]);
    }

    #[test]
    fn test_keep_alive_only_when_connected_and_due() {
        let mut peer = Peer::new(2, &[addr(8000), addr(8001)]).unwrap();
        let now = Instant::now();
        assert!(!peer.keep_alive_due(now), "connecting peers get no pings");

        peer.record_connected(0);
        peer.record_connected(1);
        assert!(
            !peer.keep_alive_due(now),
            "deadline starts one interval out"
        );

        let later = now + KEEP_ALIVE_INTERVAL + KEEP_ALIVE_INTERVAL;
        assert!(peer.keep_alive_due(later));
    }

    #[test]
    fn test_connecting_count() {
        let mut table = PeerTable::new();
        table.insert(1, &[addr(9000)]);
        table.insert(2, &[addr(9010)]);
        assert_eq!(table.connecting_count(), 2);

        let peer = table.get_mut(1).unwrap();
        peer.record_connected(0);
        peer.record_connected(1);
        assert_eq!(table.connecting_count(), 1);
    }
}
