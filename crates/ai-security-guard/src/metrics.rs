//! Counters emitted by the guard.

use crate::host::Phase;
use std::collections::HashMap;
use std::sync::Mutex;

pub const REQUEST_DENY: &str = "ai_sec_request_deny";
pub const RESPONSE_DENY: &str = "ai_sec_response_deny";
pub const REQUEST_ERROR: &str = "ai_sec_request_error";
pub const RESPONSE_ERROR: &str = "ai_sec_response_error";

pub fn deny_counter(phase: Phase) -> &'static str {
    match phase {
        Phase::Request => REQUEST_DENY,
        Phase::Response => RESPONSE_DENY,
    }
}

pub fn error_counter(phase: Phase) -> &'static str {
    match phase {
        Phase::Request => REQUEST_ERROR,
        Phase::Response => RESPONSE_ERROR,
    }
}

/// Keyed, additive counter registry supplied by the host.
pub trait MetricSink: Send + Sync {
    fn increment(&self, name: &'static str, value: u64);
}

/// Forwards to whatever recorder is installed for the `metrics` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacade;

impl MetricSink for MetricsFacade {
    fn increment(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }
}

/// Counters kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

impl MetricSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += value;
        }
    }
}
