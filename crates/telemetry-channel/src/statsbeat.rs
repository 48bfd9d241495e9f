// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-monitoring of delivery health.
//!
//! The orchestrator and replay task increment per-destination counters on
//! every attempt; a periodic task snapshots them (read-and-reset), turns the
//! non-zero ones into ordinary telemetry records and enqueues them on the
//! dedicated statsbeat channel. Those records then travel through the same
//! queue/orchestrator machinery they monitor, pointed at a separate fixed
//! destination with its own overflow store.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::QueueHandle;
use crate::record::{ChannelKind, TelemetryRecord};

pub const DEFAULT_STATSBEAT_INTERVAL: Duration = Duration::from_secs(900);

/// Delivery counters for one destination key over the current interval.
///
/// Increments are lock-free; they sit on the hot path of every send attempt.
/// The periodic flush reads and resets each counter with an atomic swap so
/// increments landing during the flush are never lost, only deferred to the
/// next interval.
#[derive(Debug, Default)]
pub struct StatCounters {
    success: AtomicU64,
    failure: AtomicU64,
    retry: AtomicU64,
    throttle: AtomicU64,
    exception: AtomicU64,
    store_write_failure: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl StatCounters {
    pub fn record_success(&self, duration: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exception(&self) {
        self.exception.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_write_failure(&self) {
        self.store_write_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatSnapshot {
        StatSnapshot {
            success: self.success.swap(0, Ordering::Relaxed),
            failure: self.failure.swap(0, Ordering::Relaxed),
            retry: self.retry.swap(0, Ordering::Relaxed),
            throttle: self.throttle.swap(0, Ordering::Relaxed),
            exception: self.exception.swap(0, Ordering::Relaxed),
            store_write_failure: self.store_write_failure.swap(0, Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub success: u64,
    pub failure: u64,
    pub retry: u64,
    pub throttle: u64,
    pub exception: u64,
    pub store_write_failure: u64,
    pub total_duration_ms: u64,
}

impl StatSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.success == 0
            && self.failure == 0
            && self.retry == 0
            && self.throttle == 0
            && self.exception == 0
            && self.store_write_failure == 0
    }

    /// Running average send duration over the interval, in milliseconds.
    #[must_use]
    pub fn average_duration_ms(&self) -> f64 {
        if self.success == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.success as f64
    }
}

/// Counter map keyed by destination. The mutex only guards handle lookup;
/// the counters themselves are atomics shared via `Arc`.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    counters: Mutex<HashMap<String, Arc<StatCounters>>>,
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(&self, key: &str) -> Arc<StatCounters> {
        #[allow(clippy::expect_used)]
        let mut counters = self.counters.lock().expect("lock poisoned");
        Arc::clone(
            counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(StatCounters::default())),
        )
    }

    pub fn snapshot_and_reset(&self) -> Vec<(String, StatSnapshot)> {
        #[allow(clippy::expect_used)]
        let counters = self.counters.lock().expect("lock poisoned");
        let mut snapshots: Vec<(String, StatSnapshot)> = counters
            .iter()
            .map(|(key, c)| (key.clone(), c.snapshot_and_reset()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }
}

/// Turns one interval snapshot into metric records addressed to the fixed
/// statsbeat destination. Zero-valued counters are skipped.
#[must_use]
pub fn snapshot_records(
    monitored_key: &str,
    snapshot: &StatSnapshot,
    statsbeat_key: &str,
) -> Vec<TelemetryRecord> {
    let mut records = Vec::new();
    let mut push = |name: &str, value: f64| {
        let payload = json!({
            "name": name,
            "value": value,
            "properties": { "destination": monitored_key },
        });
        records.push(TelemetryRecord::new(
            statsbeat_key,
            payload.to_string().into_bytes(),
            ChannelKind::Statsbeat,
        ));
    };

    if snapshot.success > 0 {
        push("request.success.count", snapshot.success as f64);
        push("request.duration.avg", snapshot.average_duration_ms());
    }
    if snapshot.failure > 0 {
        push("request.failure.count", snapshot.failure as f64);
    }
    if snapshot.retry > 0 {
        push("retry.count", snapshot.retry as f64);
    }
    if snapshot.throttle > 0 {
        push("throttle.count", snapshot.throttle as f64);
    }
    if snapshot.exception > 0 {
        push("exception.count", snapshot.exception as f64);
    }
    if snapshot.store_write_failure > 0 {
        push("store.write.failure.count", snapshot.store_write_failure as f64);
    }
    records
}

/// Periodic statsbeat emitter.
#[derive(Clone)]
pub struct Statsbeat {
    registry: Arc<StatsRegistry>,
    queue: QueueHandle,
    statsbeat_key: String,
    interval: Duration,
}

impl Statsbeat {
    #[must_use]
    pub fn new(
        registry: Arc<StatsRegistry>,
        queue: QueueHandle,
        statsbeat_key: String,
        interval: Duration,
    ) -> Self {
        Statsbeat {
            registry,
            queue,
            statsbeat_key,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!("Statsbeat task started, interval {:?}", self.interval);
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => self.emit(),
                () = cancel.cancelled() => {
                    // final snapshot so the last interval is not lost
                    self.emit();
                    debug!("Statsbeat task stopped");
                    break;
                }
            }
        }
    }

    /// Snapshots all counters and enqueues the non-zero ones as records.
    /// Called on the interval, and once more synchronously at shutdown so
    /// the last interval makes it into the final flush.
    pub fn emit(&self) {
        for (key, snapshot) in self.registry.snapshot_and_reset() {
            if snapshot.is_empty() {
                continue;
            }
            for record in snapshot_records(&key, &snapshot, &self.statsbeat_key) {
                self.queue.enqueue(record);
            }
        }
    }
}
