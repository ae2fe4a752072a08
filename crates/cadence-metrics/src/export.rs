//! Snapshot export

use crate::{CounterType, SystemCounters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of every counter, keyed by metric name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Counter values
    pub counters: BTreeMap<String, u64>,
}

impl CountersSnapshot {
    /// Read all counters
    pub fn capture(counters: &SystemCounters) -> Self {
        let counters = CounterType::ALL
            .iter()
            .map(|c| (c.name().to_string(), counters.get(*c)))
            .collect();
        Self { counters }
    }

    /// Look up a counter by kind
    pub fn get(&self, counter: CounterType) -> u64 {
        self.counters.get(counter.name()).copied().unwrap_or(0)
    }

    /// Export as pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export as compact JSON
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Emit the snapshot as a single info line
    pub fn log(&self, node: &str) {
        match self.to_json_compact() {
            Ok(json) => tracing::info!(node, counters = %json, "counters snapshot"),
            Err(e) => tracing::warn!(node, error = %e, "failed to encode counters"),
        }
    }
}
