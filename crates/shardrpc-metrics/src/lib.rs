//! Rolling Request Statistics
//!
//! Per-message-name statistics over a configurable time window: queue wait,
//! service time, and outcome counts, summarized as rates and percentiles.
//!
//! # Design
//!
//! Writers append timestamped samples to one of a fixed set of shards,
//! selected by the recording thread, so request workers rarely contend on
//! the same lock. Each shard prunes itself as it records, keeping memory
//! proportional to the window. [`RequestStatistics::snapshot`] merges the
//! shards into a [`StatisticsSnapshot`]; writers are only ever blocked for
//! the duration of one shard copy, and the cumulative completion count is
//! monotonic under quiescence.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use shardrpc_metrics::{RequestOutcome, RequestStatistics};
//!
//! let stats = RequestStatistics::new("search", "search-node-1", 60_000);
//! stats.record(
//!     "echo",
//!     Duration::from_micros(120),
//!     Duration::from_micros(950),
//!     RequestOutcome::Ok,
//! );
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.messages["echo"].count, 1);
//! ```

mod snapshot;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use snapshot::{MessageStatistics, StatisticsSnapshot};

/// Number of independently locked sample buffers.
const SHARD_COUNT: usize = 8;

/// How a request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    Timeout,
    HandlerError,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    queue_us: u64,
    service_us: u64,
    outcome: RequestOutcome,
}

#[derive(Default)]
struct Shard {
    samples: HashMap<String, VecDeque<Sample>>,
}

/// Rolling time-window counters for queue latency, service latency, and
/// error counts, per message name.
pub struct RequestStatistics {
    service_name: String,
    client_name: String,
    window: Duration,
    shards: Vec<Mutex<Shard>>,
    total_completed: AtomicU64,
}

impl RequestStatistics {
    /// Creates statistics with the given rolling window, in milliseconds.
    pub fn new(
        service_name: impl Into<String>,
        client_name: impl Into<String>,
        window_ms: u64,
    ) -> Self {
        RequestStatistics {
            service_name: service_name.into(),
            client_name: client_name.into(),
            window: Duration::from_millis(window_ms.max(1)),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            total_completed: AtomicU64::new(0),
        }
    }

    /// Records one request completion.
    ///
    /// Called by request workers just before the completion callback runs;
    /// the shard is picked from the calling thread so concurrent workers
    /// spread over the shard set.
    pub fn record(
        &self,
        message_name: &str,
        queue_wait: Duration,
        service_time: Duration,
        outcome: RequestOutcome,
    ) {
        let sample = Sample {
            at: Instant::now(),
            queue_us: queue_wait.as_micros() as u64,
            service_us: service_time.as_micros() as u64,
            outcome,
        };

        let mut shard = self.shards[self.shard_index()].lock().unwrap();
        let samples = shard.samples.entry(message_name.to_string()).or_default();
        samples.push_back(sample);
        while let Some(front) = samples.front() {
            if sample.at.duration_since(front.at) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
        drop(shard);

        self.total_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Merges all shards into a point-in-time snapshot.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let now = Instant::now();
        let mut merged: HashMap<String, Vec<Sample>> = HashMap::new();

        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for (name, samples) in &shard.samples {
                let live = samples
                    .iter()
                    .filter(|s| now.duration_since(s.at) <= self.window)
                    .copied();
                merged.entry(name.clone()).or_default().extend(live);
            }
        }

        let window_secs = self.window.as_secs_f64();
        let messages = merged
            .into_iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, mut samples)| {
                let count = samples.len() as u64;
                let handler_errors = samples
                    .iter()
                    .filter(|s| s.outcome == RequestOutcome::HandlerError)
                    .count() as u64;
                let timeouts = samples
                    .iter()
                    .filter(|s| s.outcome == RequestOutcome::Timeout)
                    .count() as u64;
                let avg_queue_us = samples.iter().map(|s| s.queue_us).sum::<u64>() / count;

                samples.sort_unstable_by_key(|s| s.service_us);
                let len = samples.len();
                let stats = MessageStatistics {
                    count,
                    handler_errors,
                    timeouts,
                    rate: count as f64 / window_secs,
                    error_rate: (handler_errors + timeouts) as f64 / count as f64,
                    avg_queue_us,
                    p50_service_us: samples[len * 50 / 100].service_us,
                    p90_service_us: samples[len * 90 / 100].service_us,
                    p99_service_us: samples[len * 99 / 100].service_us,
                };
                (name, stats)
            })
            .collect();

        StatisticsSnapshot {
            service_name: self.service_name.clone(),
            client_name: self.client_name.clone(),
            window_ms: self.window.as_millis() as u64,
            total_completed: self.total_completed.load(Ordering::Relaxed),
            messages,
        }
    }

    fn shard_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn record_ok(stats: &RequestStatistics, name: &str, service_us: u64) {
        stats.record(
            name,
            Duration::from_micros(10),
            Duration::from_micros(service_us),
            RequestOutcome::Ok,
        );
    }

    #[test]
    fn test_counts_and_error_rate() {
        let stats = RequestStatistics::new("svc", "client", 60_000);
        record_ok(&stats, "echo", 100);
        record_ok(&stats, "echo", 200);
        stats.record(
            "echo",
            Duration::from_micros(10),
            Duration::from_micros(50),
            RequestOutcome::HandlerError,
        );
        stats.record(
            "echo",
            Duration::from_micros(10),
            Duration::ZERO,
            RequestOutcome::Timeout,
        );

        let snapshot = stats.snapshot();
        let echo = &snapshot.messages["echo"];
        assert_eq!(echo.count, 4);
        assert_eq!(echo.handler_errors, 1);
        assert_eq!(echo.timeouts, 1);
        assert!((echo.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.total_completed, 4);
    }

    #[test]
    fn test_percentiles() {
        let stats = RequestStatistics::new("svc", "client", 60_000);
        for i in 0..1000 {
            record_ok(&stats, "p", i);
        }

        let p = &stats.snapshot().messages["p"];
        assert!(p.p50_service_us >= 400 && p.p50_service_us <= 600);
        assert!(p.p90_service_us >= 850 && p.p90_service_us <= 950);
        assert!(p.p99_service_us >= 980 && p.p99_service_us <= 999);
    }

    #[test]
    fn test_window_prunes_old_samples() {
        let stats = RequestStatistics::new("svc", "client", 20);
        record_ok(&stats, "echo", 100);
        thread::sleep(Duration::from_millis(40));

        let snapshot = stats.snapshot();
        assert!(snapshot.messages.get("echo").is_none());
        // The cumulative count is unaffected by pruning.
        assert_eq!(snapshot.total_completed, 1);
    }

    #[test]
    fn test_names_tracked_separately() {
        let stats = RequestStatistics::new("svc", "client", 60_000);
        record_ok(&stats, "a", 100);
        record_ok(&stats, "a", 100);
        record_ok(&stats, "b", 100);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages["a"].count, 2);
        assert_eq!(snapshot.messages["b"].count, 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(RequestStatistics::new("svc", "client", 60_000));
        let mut handles = vec![];
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    record_ok(&stats, "concurrent", 100);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages["concurrent"].count, 8000);
        assert_eq!(snapshot.total_completed, 8000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RequestStatistics::new("svc", "client", 60_000);
        record_ok(&stats, "echo", 100);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"service_name\":\"svc\""));
        assert!(json.contains("echo"));
    }
}
