use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the statistics kept by
/// [`RequestStatistics`](crate::RequestStatistics).
///
/// All figures cover the configured rolling window, except
/// `total_completed` which is cumulative and monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Identity of the service these statistics belong to
    pub service_name: String,
    /// Identity of the reporting process
    pub client_name: String,
    /// Rolling window length in milliseconds
    pub window_ms: u64,
    /// Requests completed since construction (monotonic)
    pub total_completed: u64,
    /// Per message-name statistics over the window
    pub messages: HashMap<String, MessageStatistics>,
}

/// Windowed statistics for a single message name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageStatistics {
    /// Completions observed in the window
    pub count: u64,
    /// Completions that failed in the handler
    pub handler_errors: u64,
    /// Completions shed or abandoned on a deadline
    pub timeouts: u64,
    /// Completions per second over the window
    pub rate: f64,
    /// Fraction of completions that were errors or timeouts
    pub error_rate: f64,
    /// Mean time spent in the admission queue, in microseconds
    pub avg_queue_us: u64,
    /// Service-time percentiles, in microseconds
    pub p50_service_us: u64,
    pub p90_service_us: u64,
    pub p99_service_us: u64,
}
