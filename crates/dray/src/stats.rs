// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker telemetry.
//!
//! Rolling ray counters and a queue-depth snapshot, reported to the
//! coordinator every stats tick and reset afterwards; per-ray and per-packet
//! trace records as CSV lines on the `ray` / `packet` log targets; periodic
//! interface diagnostics on the `diag` target.

use std::time::Instant;

use crate::error::Result;
use crate::protocol::wire::{put_u64, Chunk};
use crate::ray::{RayState, WorkerId};

/// Rolling ray counters since the last stats report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RayCounters {
    pub waiting: u64,
    pub processed: u64,
    pub demanded: u64,
    pub sending: u64,
    pub pending: u64,
    pub sent: u64,
    pub resent: u64,
    pub received: u64,
    pub finished_paths: u64,
}

/// Queue depths at one stats tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ray: u64,
    pub finished: u64,
    pub pending: u64,
    pub out: u64,
    pub connecting: u64,
    pub connected: u64,
    pub outstanding_udp: u64,
    pub queued_udp: u64,
}

/// The `WorkerStats` message body.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsReport {
    pub rays: RayCounters,
    pub queues: QueueStats,
    pub timestamp_us: u64,
}

impl WorkerStatsReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 * 8);
        let r = &self.rays;
        for v in [
            r.waiting, r.processed, r.demanded, r.sending, r.pending, r.sent, r.resent,
            r.received, r.finished_paths,
        ] {
            put_u64(&mut buf, v);
        }
        let q = &self.queues;
        for v in [
            q.ray,
            q.finished,
            q.pending,
            q.out,
            q.connecting,
            q.connected,
            q.outstanding_udp,
            q.queued_udp,
        ] {
            put_u64(&mut buf, v);
        }
        put_u64(&mut buf, self.timestamp_us);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            rays: RayCounters {
                waiting: chunk.u64()?,
                processed: chunk.u64()?,
                demanded: chunk.u64()?,
                sending: chunk.u64()?,
                pending: chunk.u64()?,
                sent: chunk.u64()?,
                resent: chunk.u64()?,
                received: chunk.u64()?,
                finished_paths: chunk.u64()?,
            },
            queues: QueueStats {
                ray: chunk.u64()?,
                finished: chunk.u64()?,
                pending: chunk.u64()?,
                out: chunk.u64()?,
                connecting: chunk.u64()?,
                connected: chunk.u64()?,
                outstanding_udp: chunk.u64()?,
                queued_udp: chunk.u64()?,
            },
            timestamp_us: chunk.u64()?,
        })
    }
}

/// Rolling stats owner; reset after every report.
#[derive(Debug)]
pub struct WorkerStats {
    pub rays: RayCounters,
    pub start_time: Instant,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            rays: RayCounters::default(),
            start_time: Instant::now(),
        }
    }

    /// Snapshot the rolling window into a report and reset it.
    pub fn take_report(&mut self, queues: QueueStats) -> WorkerStatsReport {
        let report = WorkerStatsReport {
            rays: self.rays,
            queues,
            timestamp_us: self.start_time.elapsed().as_micros() as u64,
        };
        self.rays = RayCounters::default();
        report
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface-0 byte counters between diagnostics ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiagnosticsWindow {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// What happened to a ray, for the trace log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayAction {
    Generated,
    Traced,
    Queued,
    Pending,
    Sent,
    Received,
    Finished,
}

impl RayAction {
    fn name(self) -> &'static str {
        match self {
            RayAction::Generated => "Generated",
            RayAction::Traced => "Traced",
            RayAction::Queued => "Queued",
            RayAction::Pending => "Pending",
            RayAction::Sent => "Sent",
            RayAction::Received => "Received",
            RayAction::Finished => "Finished",
        }
    }
}

/// What happened to a packet, for the trace log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAction {
    Queued,
    Sent,
    Received,
    Acked,
    AckSent,
    AckReceived,
}

impl PacketAction {
    fn name(self) -> &'static str {
        match self {
            PacketAction::Queued => "Queued",
            PacketAction::Sent => "Sent",
            PacketAction::Received => "Received",
            PacketAction::Acked => "Acked",
            PacketAction::AckSent => "AckSent",
            PacketAction::AckReceived => "AckReceived",
        }
    }

    fn is_inbound(self) -> bool {
        matches!(self, PacketAction::Received | PacketAction::AckReceived)
    }
}

/// CSV header documented once at startup when ray tracing logs are enabled:
/// `x,y,sample,bounce,hop,tick,shadowRay,workerID,otherPartyID,treeletID,size,action`
pub fn log_ray_action(
    worker_id: WorkerId,
    ray: &RayState,
    action: RayAction,
    other_party: WorkerId,
    max_depth: u32,
) {
    let other = match action {
        RayAction::Sent | RayAction::Received => other_party,
        _ => worker_id,
    };
    log::info!(
        target: "ray",
        "{},{},{},{},{},{},{},{},{},{},{},{}",
        ray.sample.pixel.0,
        ray.sample.pixel.1,
        ray.sample.num,
        max_depth.saturating_sub(ray.remaining_bounces),
        ray.hop,
        ray.tick,
        ray.is_shadow_ray as u8,
        worker_id,
        other,
        ray.current_treelet(),
        ray.serialized_size(),
        action.name()
    );
}

/// CSV header: `sourceID,destinationID,seqNo,attempt,size,rayCount,action`
pub fn log_packet_action(
    worker_id: WorkerId,
    other_party: WorkerId,
    seq_no: u64,
    attempt: u16,
    size: usize,
    ray_count: usize,
    action: PacketAction,
) {
    let (source, dest) = if action.is_inbound() {
        (other_party, worker_id)
    } else {
        (worker_id, other_party)
    };
    log::info!(
        target: "packet",
        "{},{},{},{},{},{},{}",
        source,
        dest,
        seq_no,
        attempt,
        size,
        ray_count,
        action.name()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trip() {
        let report = WorkerStatsReport {
            rays: RayCounters {
                waiting: 1,
                processed: 2,
                demanded: 3,
                sending: 4,
                pending: 5,
                sent: 6,
                resent: 7,
                received: 8,
                finished_paths: 9,
            },
            queues: QueueStats {
                ray: 10,
                finished: 11,
                pending: 12,
                out: 13,
                connecting: 1,
                connected: 2,
                outstanding_udp: 14,
                queued_udp: 15,
            },
            timestamp_us: 123_456,
        };
        assert_eq!(WorkerStatsReport::decode(&report.encode()).unwrap(), report);
    }

    #[test]
    fn test_take_report_resets_window() {
        let mut stats = WorkerStats::new();
        stats.rays.processed = 40;
        stats.rays.sent = 7;

        let report = stats.take_report(QueueStats::default());
        assert_eq!(report.rays.processed, 40);
        assert_eq!(report.rays.sent, 7);
        assert_eq!(stats.rays, RayCounters::default(), "window resets");
    }

    #[test]
    fn test_truncated_report_rejected() {
        let report = WorkerStatsReport::default();
        let payload = report.encode();
        assert!(WorkerStatsReport::decode(&payload[..payload.len() - 4]).is_err());
    }
}
