// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link benchmark bookkeeping.
//!
//! In benchmark mode the worker blasts fixed-size ping packets at full pace
//! on one interface and tallies what arrives on the other. A one-second
//! checkpoint timer snapshots the rolling counters; the duration timer ends
//! the run. Checkpoints and totals are logged on the `bench` target when the
//! worker shuts down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use crate::ray::WorkerId;
use crate::transport::NUM_INTERFACES;

/// Rolling network counters for one checkpoint window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetCheckpoint {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Milliseconds since the benchmark started.
    pub at_ms: u64,
}

impl NetCheckpoint {
    pub fn merge(&mut self, other: &NetCheckpoint) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
    }
}

/// State of one benchmark run.
#[derive(Debug)]
pub struct BenchmarkData {
    pub destination_id: WorkerId,
    /// The destination peer's address per interface.
    pub destination_addrs: [SocketAddr; NUM_INTERFACES],
    pub send_iface: usize,
    pub recv_iface: usize,
    /// Pre-encoded ping frame blasted on every send activation.
    pub frame: Vec<u8>,
    pub checkpoint: NetCheckpoint,
    pub checkpoints: Vec<NetCheckpoint>,
    pub totals: NetCheckpoint,
    pub started: Instant,
    pub ended: Option<Instant>,
}

impl BenchmarkData {
    pub fn new(destination_id: WorkerId, send_iface: usize, frame: Vec<u8>) -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            destination_id,
            destination_addrs: [unspecified; NUM_INTERFACES],
            send_iface,
            recv_iface: 1 - send_iface,
            frame,
            checkpoint: NetCheckpoint::default(),
            checkpoints: Vec::new(),
            totals: NetCheckpoint::default(),
            started: Instant::now(),
            ended: None,
        }
    }

    /// Snapshot the rolling window into the checkpoint list and totals.
    pub fn take_checkpoint(&mut self) {
        self.checkpoint.at_ms = self.started.elapsed().as_millis() as u64;
        self.totals.merge(&self.checkpoint);
        self.checkpoints.push(self.checkpoint);
        self.checkpoint = NetCheckpoint::default();
    }

    /// Fold any partial window into the totals and mark the run finished.
    pub fn finish(&mut self) {
        if self.ended.is_none() {
            self.totals.merge(&self.checkpoint);
            self.checkpoint = NetCheckpoint::default();
            self.ended = Some(Instant::now());
        }
    }

    /// One log line per checkpoint plus a final totals line.
    pub fn log_summary(&self) {
        for item in &self.checkpoints {
            log::info!(
                target: "bench",
                "checkpoint {} {} {} {} {}",
                item.at_ms,
                item.bytes_sent,
                item.bytes_received,
                item.packets_sent,
                item.packets_received
            );
        }
        log::info!(
            target: "bench",
            "stats {} {} {} {}",
            self.totals.bytes_sent,
            self.totals.bytes_received,
            self.totals.packets_sent,
            self.totals.packets_received
        );
    }
}
