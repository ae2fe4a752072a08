//! Tunables for one replica's consensus instance

use serde::Deserialize;
use std::time::Duration;

/// Consensus configuration. Missing fields in a config file take the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Base view timeout (ms)
    pub pacemaker_timeout_ms: u64,
    /// Multiplier applied per consecutive timeout; 1.0 keeps the timeout fixed
    pub timeout_backoff_rate: f64,
    /// Cap on the backoff exponent
    pub max_timeout_exponent: u32,
    /// Views remembered by the leader schedule cache
    pub proposer_cache_size: usize,
    /// Events parked per sender while waiting for sync
    pub sync_queue_capacity: usize,
    /// Re-requests before an outstanding vertex sync is abandoned
    pub max_sync_attempts: u32,
    /// Future-epoch events held before new ones are dropped
    pub max_queued_epoch_events: usize,
    /// How far ahead of the local epoch an event may be and still be queued
    pub max_future_epochs: u64,
    /// Allowed backwards drift between consecutive QC timestamps (ms)
    pub timestamp_tolerance_ms: u64,
    /// Verified QC digests remembered
    pub qc_cache_size: usize,
    /// Largest `count` served for a GetVertices request
    pub get_vertices_max: usize,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            pacemaker_timeout_ms: 1000,
            timeout_backoff_rate: 1.0,
            max_timeout_exponent: 6,
            proposer_cache_size: 10,
            sync_queue_capacity: 32,
            max_sync_attempts: 5,
            max_queued_epoch_events: 1024,
            max_future_epochs: 2,
            timestamp_tolerance_ms: 1000,
            qc_cache_size: 64,
            get_vertices_max: 16,
        }
    }
}

impl BftConfig {
    /// Timeout after `consecutive_timeouts` views ended without a QC
    pub fn timeout_for(&self, consecutive_timeouts: u32) -> Duration {
        let base = self.pacemaker_timeout_ms;
        if self.timeout_backoff_rate <= 1.0 || consecutive_timeouts == 0 {
            return Duration::from_millis(base);
        }
        let exponent = consecutive_timeouts.min(self.max_timeout_exponent);
        let scaled = base as f64 * self.timeout_backoff_rate.powi(exponent as i32);
        Duration::from_millis(scaled.min(u64::MAX as f64) as u64)
    }
}
