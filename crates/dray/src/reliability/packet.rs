// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound packet types.
//!
//! A [`RayPacket`] is an MTU-bounded `SendRays` frame addressed to one peer;
//! reliable ray packets live in the outstanding FIFO until acked or
//! re-queued. A [`ServicePacket`] is a single-shot control datagram
//! (handshakes, pings, acks) that always drains ahead of ray packets.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::protocol::Message;
use crate::ray::{RayState, TreeletId, WorkerId};

/// Per-destination-address monotonic sequence numbers.
///
/// Retransmissions reuse the sequence number they were first sent with;
/// only fresh packets draw from this space.
#[derive(Debug, Default)]
pub struct SequenceSpace {
    next: HashMap<SocketAddr, u64>,
}

impl SequenceSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number for a destination.
    pub fn next(&mut self, dest: SocketAddr) -> u64 {
        let counter = self.next.entry(dest).or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    /// The next number that would be allocated (for telemetry and tests).
    pub fn peek(&self, dest: SocketAddr) -> u64 {
        self.next.get(&dest).copied().unwrap_or(0)
    }
}

/// One assembled `SendRays` frame in flight to a peer.
#[derive(Debug)]
pub struct RayPacket {
    pub destination: SocketAddr,
    pub destination_id: WorkerId,
    pub target_treelet: TreeletId,
    pub ray_count: usize,
    pub sequence_number: u64,
    pub attempt: u16,
    pub reliable: bool,
    pub tracked: bool,
    pub retransmission: bool,
    frame: Vec<u8>,
    /// Lightweight co-owned copies of the traced rays, kept for the per-ray
    /// action log only (never a back-pointer into the queues).
    pub tracked_rays: Vec<RayState>,
}

impl RayPacket {
    pub fn new(
        destination: SocketAddr,
        destination_id: WorkerId,
        target_treelet: TreeletId,
        ray_count: usize,
        message: &Message,
        tracked_rays: Vec<RayState>,
    ) -> Self {
        Self {
            destination,
            destination_id,
            target_treelet,
            ray_count,
            sequence_number: message.sequence_number,
            attempt: message.attempt,
            reliable: message.reliable,
            tracked: message.tracked,
            retransmission: false,
            frame: message.encode(),
            tracked_rays,
        }
    }

    /// The encoded wire frame.
    pub fn data(&self) -> &[u8] {
        &self.frame
    }

    /// Bump the attempt counter, patching the frame header in place so the
    /// receiver sees the retry count (frame offset 20..22, big-endian).
    pub fn increment_attempt(&mut self) {
        self.attempt += 1;
        self.frame[20..22].copy_from_slice(&self.attempt.to_be_bytes());
    }
}

/// A single-shot control datagram.
#[derive(Debug)]
pub struct ServicePacket {
    pub destination: SocketAddr,
    pub destination_id: WorkerId,
    pub data: Vec<u8>,
    /// Which interface must carry this packet.
    pub iface: usize,
    /// Set when this packet carries an ack frame.
    pub is_ack: bool,
    pub ack_id: u64,
    pub tracked: bool,
}

impl ServicePacket {
    pub fn new(
        destination: SocketAddr,
        destination_id: WorkerId,
        data: Vec<u8>,
        iface: usize,
    ) -> Self {
        Self {
            destination,
            destination_id,
            data,
            iface,
            is_ack: false,
            ack_id: 0,
            tracked: false,
        }
    }

    pub fn ack(
        destination: SocketAddr,
        destination_id: WorkerId,
        data: Vec<u8>,
        ack_id: u64,
        tracked: bool,
    ) -> Self {
        Self {
            destination,
            destination_id,
            data,
            iface: crate::transport::RAY_INTERFACE,
            is_ack: true,
            ack_id,
            tracked,
        }
    }
}
