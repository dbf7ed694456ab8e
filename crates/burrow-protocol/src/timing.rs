//! Tunnel timing -- the timing and sizing parameters both sides of a tunnel
//! rely on.
//!
//! Values are milliseconds unless the field name says otherwise. Nodes may
//! override individual fields from their config file; anything left out falls
//! back to [`DEFAULT_TIMING`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelTiming {
    // -- Dialing --
    /// Base timeout for a single dial or stream open.
    pub dial_timeout_ms: u64,
    /// Ceiling for the escalating per-factory dial timeout.
    pub max_dial_timeout_ms: u64,
    /// How far past its nominal deadline an aborted operation may still run.
    pub abort_grace_ms: u64,
    /// Retry delay growth per failed dial.
    pub retry_step_ms: u64,
    /// Retry delay cap; the delay resets to one step after passing it.
    pub retry_cap_ms: u64,
    /// Timeout for hanging up the server connection before a redial.
    pub hang_up_timeout_ms: u64,

    // -- Liveness --
    /// Interval of the connection liveness loop.
    pub liveness_interval_ms: u64,
    /// Consecutive ping failures that demote a connection.
    pub ping_failure_limit: u32,
    /// Time in CONNECTING before the status falls to OFFLINE.
    pub connecting_watchdog_ms: u64,
    /// Stream factory retry delay at which the status is reported OFFLINE.
    pub offline_threshold_ms: u64,

    // -- Address registry --
    /// Default probe timeout for announced addresses.
    pub stats_timeout_ms: u64,
    /// Probe timeout for the local address returned by a direct query.
    pub local_probe_timeout_ms: u64,
    /// Fallback probe timeout when no latency has been measured.
    pub fallback_probe_timeout_ms: u64,
    /// Addresses not seen within this window are evicted.
    pub stale_window_secs: u64,
    /// Ranked address lists are cut to this many entries.
    pub address_limit: usize,
    /// Re-probe interval of the whole registry once connected.
    pub stats_refresh_ms: u64,

    // -- Request attempts --
    /// Initial timeout budget of a request attempt.
    pub attempt_timeout_ms: u64,
    /// Budget added per request body chunk after a failed attempt.
    pub per_chunk_budget_ms: u64,
    /// Minimum inter-chunk gap treated as a stall.
    pub chunk_gap_floor_ms: u64,
    /// Stall threshold as a multiple of the longest gap seen so far.
    pub chunk_gap_multiplier: u32,
    /// Attempt supervision tick.
    pub attempt_tick_ms: u64,

    // -- Heartbeat and relays --
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Minimum spacing between relay announcement stream opens.
    pub relay_debounce_ms: u64,
    /// Liveness poll of an activated relay.
    pub active_relay_poll_ms: u64,

    // -- Framing --
    /// Slice size for chunked packets and typed-chunk bodies.
    pub chunk_size: usize,
}

impl TunnelTiming {
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub const fn max_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.max_dial_timeout_ms)
    }

    pub const fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub const fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub const fn stats_refresh(&self) -> Duration {
        Duration::from_millis(self.stats_refresh_ms)
    }

    pub const fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for TunnelTiming {
    fn default() -> Self {
        DEFAULT_TIMING
    }
}

pub const DEFAULT_TIMING: TunnelTiming = TunnelTiming {
    // Dialing
    dial_timeout_ms: 3_000,
    max_dial_timeout_ms: 5 * 60 * 1_000,
    abort_grace_ms: 1_000,
    retry_step_ms: 1_000,
    retry_cap_ms: 30_000,
    hang_up_timeout_ms: 7_000,

    // Liveness
    liveness_interval_ms: 5_000,
    ping_failure_limit: 2,
    connecting_watchdog_ms: 30_000,
    offline_threshold_ms: 5_000,

    // Address registry
    stats_timeout_ms: 10_000,
    local_probe_timeout_ms: 3_000,
    fallback_probe_timeout_ms: 1_000,
    stale_window_secs: 7 * 24 * 3600,
    address_limit: 10,
    stats_refresh_ms: 30 * 60 * 1_000,

    // Request attempts
    attempt_timeout_ms: 60_000,
    per_chunk_budget_ms: 5_000,
    chunk_gap_floor_ms: 500,
    chunk_gap_multiplier: 4,
    attempt_tick_ms: 100,

    // Heartbeat and relays
    heartbeat_interval_ms: 5_000,
    heartbeat_timeout_ms: 10_000,
    relay_debounce_ms: 60_000,
    active_relay_poll_ms: 10_000,

    // Framing
    chunk_size: 64 * 1024,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_invariants() {
        let t = &DEFAULT_TIMING;
        // Escalation must have room to grow
        assert!(t.dial_timeout_ms < t.max_dial_timeout_ms);
        assert!(t.retry_step_ms < t.retry_cap_ms);
        // A beat must be able to arrive before the receiver gives up
        assert!(t.heartbeat_interval_ms < t.heartbeat_timeout_ms);
        // Supervision must tick well inside the stall floor
        assert!(t.attempt_tick_ms < t.chunk_gap_floor_ms);
        assert!(t.connecting_watchdog_ms > t.dial_timeout_ms + t.retry_step_ms);
    }

    #[test]
    fn test_stale_window_is_7_days() {
        assert_eq!(DEFAULT_TIMING.stale_window(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let t: TunnelTiming = serde_json::from_str(r#"{"dial_timeout_ms": 500}"#).unwrap();
        assert_eq!(t.dial_timeout_ms, 500);
        assert_eq!(t.retry_cap_ms, DEFAULT_TIMING.retry_cap_ms);
        assert_eq!(t.chunk_size, 64 * 1024);
    }
}
