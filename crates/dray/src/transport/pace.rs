// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send-rate pacer.
//!
//! Tracks a reference instant that advances by the wire time of every sent
//! byte. The channel is within pace while the reference does not run ahead
//! of the wall clock. The pacer is advisory: callers check [`within_pace`]
//! before sending, and the event loop sleeps for [`micros_ahead_of_pace`]
//! when nothing else is eligible.
//!
//! [`within_pace`]: Pacer::within_pace
//! [`micros_ahead_of_pace`]: Pacer::micros_ahead_of_pace

use std::time::{Duration, Instant};

/// Token-bucket pacer in wire-time units.
///
/// No burst credit accumulates while idle: the reference is clamped to the
/// present before each charge, so a quiet channel may send exactly one
/// packet before pacing engages again.
#[derive(Debug)]
pub struct Pacer {
    rate_mbps: u64,
    reference: Instant,
}

impl Pacer {
    pub fn new(rate_mbps: u64) -> Self {
        Self {
            rate_mbps: rate_mbps.max(1),
            reference: Instant::now(),
        }
    }

    /// Charge `bytes` of wire time against the pace.
    pub fn record_send(&mut self, bytes: usize) {
        let now = Instant::now();
        if self.reference < now {
            self.reference = now;
        }
        // bits / (Mbit/s) = microseconds
        let micros = (bytes as u64 * 8) / self.rate_mbps;
        self.reference += Duration::from_micros(micros);
    }

    /// True when sending now would not exceed the configured rate.
    pub fn within_pace(&self) -> bool {
        self.reference <= Instant::now()
    }

    /// Microseconds until the channel is back within pace (0 when it
    /// already is).
    pub fn micros_ahead_of_pace(&self) -> i64 {
        let now = Instant::now();
        if self.reference <= now {
            return 0;
        }
        (self.reference - now).as_micros().min(i64::MAX as u128) as i64
    }

    /// Change the pace for subsequent charges.
    pub fn set_rate(&mut self, rate_mbps: u64) {
        self.rate_mbps = rate_mbps.max(1);
    }

    pub fn rate(&self) -> u64 {
        self.rate_mbps
    }

    /// Forgive accumulated debt (used when swapping loop configurations).
    pub fn reset_reference(&mut self) {
        self.reference = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fresh_pacer_within_pace() {
        let pacer = Pacer::new(80);
        assert!(pacer.within_pace());
        assert_eq!(pacer.micros_ahead_of_pace(), 0);
    }

    #[test]
    fn test_send_pushes_ahead_of_pace() {
        // 1 Mbit/s: 1350 bytes cost 10.8 ms of wire time.
        let mut pacer = Pacer::new(1);
        pacer.record_send(1350);

        assert!(!pacer.within_pace());
        let ahead = pacer.micros_ahead_of_pace();
        assert!(
            (9_000..=10_800).contains(&ahead),
            "expected ~10.8ms of debt, got {}us",
            ahead
        );
    }

    #[test]
    fn test_debt_drains_with_time() {
        let mut pacer = Pacer::new(1000); // 1350 bytes => 10.8us
        pacer.record_send(1350);
        thread::sleep(Duration::from_millis(2));
        assert!(pacer.within_pace());
    }

    #[test]
    fn test_no_burst_credit_accumulates() {
        let mut pacer = Pacer::new(1);
        thread::sleep(Duration::from_millis(5));

        // Despite 5ms idle, two packets still owe one packet of wire time.
        pacer.record_send(1350);
        pacer.record_send(1350);
        assert!(pacer.micros_ahead_of_pace() > 10_000);
    }

    #[test]
    fn test_set_rate_applies_to_next_charge() {
        let mut pacer = Pacer::new(1);
        pacer.set_rate(1000);
        pacer.record_send(1350);
        assert!(pacer.micros_ahead_of_pace() <= 11);
    }

    #[test]
    fn test_reset_reference_clears_debt() {
        let mut pacer = Pacer::new(1);
        pacer.record_send(100_000);
        assert!(!pacer.within_pace());

        pacer.reset_reference();
        assert!(pacer.within_pace());
    }

    #[test]
    fn test_zero_rate_clamped() {
        let mut pacer = Pacer::new(0);
        pacer.record_send(8);
        // Clamped to 1 Mbit/s: 64 bits => 64us of debt, not a division panic.
        assert!(pacer.micros_ahead_of_pace() <= 64);
    }
}
