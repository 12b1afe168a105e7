// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DRAY Global Configuration - Single Source of Truth
//!
//! This module centralizes all protocol constants and the runtime worker
//! configuration. **Never hardcode elsewhere!**
//!
//! - **Level 1 (Static)**: compile-time constants (wire limits, timer periods)
//! - **Level 2 (Dynamic)**: [`WorkerConfig`] populated from the CLI

use std::time::Duration;

/// Largest UDP payload a ray packet may occupy on the wire.
///
/// Chosen to stay under typical path MTUs with headroom for IP/UDP headers.
pub const UDP_MTU_BYTES: usize = 1350;

/// Bytes reserved per ray packet for the message frame before any ray is
/// appended.
pub const PACKET_HEADER_RESERVE: usize = 25;

/// How long a reliable ray packet may remain unacknowledged before it is
/// eligible for retransmission. Must exceed one round-trip estimate.
pub const PACKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between keep-alive pings to connected peers.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on rays traced in a single ray-queue activation.
pub const MAX_RAYS_PER_ACTIVATION: usize = 20_000;

/// Finished-queue depth above which the `Discard` policy clears the queue.
pub const FINISHED_DISCARD_WATERMARK: usize = 5_000;

/// Period of the out-queue flush timer.
pub const OUT_QUEUE_INTERVAL: Duration = Duration::from_millis(10);

/// Period of the acknowledgement scan timer.
///
/// Bounds worst-case retransmit latency at `PACKET_TIMEOUT` plus one period.
pub const ACK_SCAN_INTERVAL: Duration = Duration::from_millis(200);

/// Period of the peer connection/keep-alive timer.
pub const PEER_INTERVAL: Duration = Duration::from_millis(250);

/// Period of the worker-stats report to the coordinator.
pub const WORKER_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Period of the local diagnostics record.
pub const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(2);

/// Period of the finished-path flush to the coordinator.
pub const FINISHED_PATHS_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed payload size of benchmark ping packets.
pub const BENCHMARK_PAYLOAD_BYTES: usize = 1300;

/// Benchmark checkpoint period.
pub const BENCHMARK_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable whose value is forwarded in the initial `Hey`
/// request (set by the AWS Lambda runtime).
pub const LOG_STREAM_ENVAR: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

/// Default UDP pace when the CLI does not override it, in megabits/s.
pub const DEFAULT_MAX_UDP_RATE_MBPS: u64 = 80;

/// What the worker does with rays whose contribution is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedRayAction {
    /// Drop finished rays once the queue crosses the discard watermark.
    Discard,
    /// Frame finished rays as a `FinishedRays` message to the coordinator.
    SendBack,
    /// Placeholder for direct upload to the storage backend.
    Upload,
}

impl FinishedRayAction {
    /// Decode the CLI encoding (0 = discard, 1 = send, 2 = upload).
    pub fn from_cli(value: u8) -> Option<Self> {
        match value {
            0 => Some(FinishedRayAction::Discard),
            1 => Some(FinishedRayAction::SendBack),
            2 => Some(FinishedRayAction::Upload),
            _ => None,
        }
    }
}

/// Runtime worker configuration, populated from the CLI.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Send ray packets reliably (ack + retransmit).
    pub send_reliably: bool,
    /// Token-bucket pace per interface, in megabits/s.
    pub max_udp_rate_mbps: u64,
    /// Samples per pixel override (0 = use the scene's own value).
    pub samples_per_pixel: u32,
    /// Policy for finished rays.
    pub finished_ray_action: FinishedRayAction,
    /// Probability that a generated ray is tagged for action tracing.
    pub ray_log_rate: f64,
    /// Probability that a packet is tagged for packet tracing.
    pub packet_log_rate: f64,
}

impl WorkerConfig {
    /// Validate rates and limits the way the CLI front-end does.
    pub fn validate(&self) -> bool {
        (0.0..=1.0).contains(&self.ray_log_rate)
            && (0.0..=1.0).contains(&self.packet_log_rate)
            && self.max_udp_rate_mbps > 0
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            send_reliably: false,
            max_udp_rate_mbps: DEFAULT_MAX_UDP_RATE_MBPS,
            samples_per_pixel: 0,
            finished_ray_action: FinishedRayAction::Discard,
            ray_log_rate: 0.0,
            packet_log_rate: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_ray_action_from_cli() {
        assert_eq!(
            FinishedRayAction::from_cli(0),
            Some(FinishedRayAction::Discard)
        );
        assert_eq!(
            FinishedRayAction::from_cli(1),
            Some(FinishedRayAction::SendBack)
        );
        assert_eq!(
            FinishedRayAction::from_cli(2),
            Some(FinishedRayAction::Upload)
        );
        assert_eq!(FinishedRayAction::from_cli(3), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(WorkerConfig::default().validate());
    }

    #[test]
    fn test_out_of_range_log_rate_rejected() {
        let mut config = WorkerConfig::default();
        config.ray_log_rate = 1.5;
        assert!(!config.validate(), "log rate above 1.0 must be rejected");

        config.ray_log_rate = 0.5;
        config.packet_log_rate = -0.1;
        assert!(!config.validate(), "negative log rate must be rejected");
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut config = WorkerConfig::default();
        config.max_udp_rate_mbps = 0;
        assert!(!config.validate());
    }
}
