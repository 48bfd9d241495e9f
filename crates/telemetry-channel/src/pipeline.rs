// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery orchestration.
//!
//! `send` partitions a batch by destination key, resolves each partition's
//! endpoint, compresses and posts it, and acts on the classified outcome:
//! follow a redirect at most once per call, persist retryable failures to
//! the overflow store, drop permanent ones. Delivery confirmation is at the
//! transport layer: the aggregate result says whether every partition was
//! delivered, never anything about individual records.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::endpoints::EndpointResolver;
use crate::record::{partition_by_key, Partition, TelemetryRecord};
use crate::statsbeat::{StatCounters, StatsRegistry};
use crate::storage::{OverflowStore, StorageError};
use crate::transmitter::{compress, DeliveryOutcome, Transmitter};

/// Shared backoff armed by a throttle response and honored by the replay
/// task, so replay never fires before the server-provided wait hint.
#[derive(Debug, Default)]
pub struct ThrottleGate {
    until: Mutex<Option<Instant>>,
}

impl ThrottleGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        #[allow(clippy::expect_used)]
        let mut until = self.until.lock().expect("lock poisoned");
        // a later deadline never shrinks under concurrent throttles
        if until.map_or(true, |u| deadline > u) {
            *until = Some(deadline);
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        #[allow(clippy::expect_used)]
        let until = self.until.lock().expect("lock poisoned");
        until.map_or(true, |u| Instant::now() >= u)
    }
}

/// Aggregate result of one `send` call, counted in partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub delivered: usize,
    /// Written to the overflow store for later replay.
    pub persisted: usize,
    pub dropped: usize,
}

impl BatchResult {
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.persisted == 0 && self.dropped == 0
    }
}

enum Disposition {
    Delivered,
    Persisted,
    Dropped,
}

pub struct DeliveryPipeline {
    resolver: Arc<EndpointResolver>,
    transmitter: Arc<Transmitter>,
    store: Option<Arc<OverflowStore>>,
    stats: Arc<StatsRegistry>,
    gate: Arc<ThrottleGate>,
}

impl DeliveryPipeline {
    #[must_use]
    pub fn new(
        resolver: Arc<EndpointResolver>,
        transmitter: Arc<Transmitter>,
        store: Option<Arc<OverflowStore>>,
        stats: Arc<StatsRegistry>,
        gate: Arc<ThrottleGate>,
    ) -> Self {
        DeliveryPipeline {
            resolver,
            transmitter,
            store,
            stats,
            gate,
        }
    }

    pub async fn send(&self, batch: Vec<TelemetryRecord>) -> BatchResult {
        let mut result = BatchResult::default();
        // Partitions are handled independently: a failed or rejected one
        // does not roll back its already-persisted siblings.
        for partition in partition_by_key(batch) {
            match self.send_partition(&partition).await {
                Disposition::Delivered => result.delivered += 1,
                Disposition::Persisted => result.persisted += 1,
                Disposition::Dropped => result.dropped += 1,
            }
        }
        result
    }

    async fn send_partition(&self, partition: &Partition) -> Disposition {
        let counters = self.stats.for_key(&partition.key);

        let compressed = match compress(&partition.encode_body()) {
            Ok(compressed) => compressed,
            Err(e) => {
                error!("Failed to compress partition for {}: {e}", partition.key);
                counters.record_exception();
                counters.record_failure();
                return Disposition::Dropped;
            }
        };

        let started = Instant::now();
        let outcome = attempt_with_redirect(
            &self.resolver,
            &self.transmitter,
            &partition.key,
            compressed.clone(),
        )
        .await;

        match outcome {
            DeliveryOutcome::Success => {
                debug!(
                    "Delivered {} records for {}",
                    partition.records.len(),
                    partition.key
                );
                counters.record_success(started.elapsed());
                Disposition::Delivered
            }
            DeliveryOutcome::Throttled(wait) => {
                debug!("Throttled for {}, backing off {wait:?}", partition.key);
                counters.record_throttle();
                self.gate.arm(wait);
                self.persist_or_drop(&partition.key, &compressed, &counters)
            }
            DeliveryOutcome::Redirect(_) | DeliveryOutcome::RetryableFailure(_) => {
                counters.record_retry();
                self.persist_or_drop(&partition.key, &compressed, &counters)
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                warn!("Dropping partition for {}: {reason}", partition.key);
                counters.record_failure();
                Disposition::Dropped
            }
        }
    }

    fn persist_or_drop(&self, key: &str, compressed: &[u8], counters: &StatCounters) -> Disposition {
        let Some(store) = &self.store else {
            counters.record_failure();
            return Disposition::Dropped;
        };
        match store.persist(key, compressed) {
            Ok(()) => Disposition::Persisted,
            Err(StorageError::Full { .. }) => {
                counters.record_failure();
                Disposition::Dropped
            }
            Err(StorageError::Io(e)) => {
                error!("Failed to persist partition for {key}: {e}");
                counters.record_store_write_failure();
                Disposition::Dropped
            }
        }
    }
}

/// One transmission attempt with a single transparent redirect follow.
///
/// A redirect rebinds the key and retries immediately against the new
/// endpoint; a second redirect in the same call is surfaced as a retryable
/// failure instead of being followed, which bounds every send to two
/// requests per partition.
pub(crate) async fn attempt_with_redirect(
    resolver: &EndpointResolver,
    transmitter: &Transmitter,
    key: &str,
    compressed: Vec<u8>,
) -> DeliveryOutcome {
    let url = resolver.resolve(key);
    match transmitter.attempt(url, compressed.clone()).await {
        DeliveryOutcome::Redirect(target) => {
            resolver.update_binding(key, target.clone());
            match transmitter.attempt(target, compressed).await {
                DeliveryOutcome::Redirect(_) => DeliveryOutcome::RetryableFailure(
                    "redirected more than once in a single send".to_string(),
                ),
                outcome => outcome,
            }
        }
        outcome => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChannelKind, TelemetryRecord};
    use reqwest::Url;
    use tempfile::TempDir;

    fn record(key: &str, payload: &str) -> TelemetryRecord {
        TelemetryRecord::new(key, payload.as_bytes().to_vec(), ChannelKind::General)
    }

    fn pipeline_for(
        endpoint: &str,
        store: Option<Arc<OverflowStore>>,
    ) -> (DeliveryPipeline, Arc<StatsRegistry>, Arc<ThrottleGate>) {
        let resolver = Arc::new(EndpointResolver::new(Url::parse(endpoint).unwrap(), 100));
        let transmitter = Arc::new(
            Transmitter::new(Duration::from_secs(5), Duration::from_secs(60)).unwrap(),
        );
        let stats = Arc::new(StatsRegistry::new());
        let gate = Arc::new(ThrottleGate::new());
        (
            DeliveryPipeline::new(resolver, transmitter, store, Arc::clone(&stats), Arc::clone(&gate)),
            stats,
            gate,
        )
    }

    #[tokio::test]
    async fn test_send_success_increments_success_counter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/track")
            .with_status(200)
            .create_async()
            .await;
        let (pipeline, stats, _gate) = pipeline_for(&format!("{}/track", server.url()), None);

        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert!(result.is_complete_success());
        assert_eq!(result.delivered, 1);
        mock.assert_async().await;
        let snapshot = stats.for_key("k").snapshot_and_reset();
        assert_eq!(snapshot.success, 1);
    }

    #[tokio::test]
    async fn test_one_request_per_destination_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/track")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let (pipeline, _stats, _gate) = pipeline_for(&format!("{}/track", server.url()), None);

        let result = pipeline
            .send(vec![
                record("a", "{\"n\":1}"),
                record("b", "{\"n\":2}"),
                record("a", "{\"n\":3}"),
            ])
            .await;

        assert_eq!(result.delivered, 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirect_followed_once_and_binding_updated() {
        let mut server = mockito::Server::new_async().await;
        let redirect_target = format!("{}/redirected", server.url());
        let first = server
            .mock("POST", "/track")
            .with_status(307)
            .with_header("Location", &redirect_target)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/redirected")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let (pipeline, stats, _gate) = pipeline_for(&format!("{}/track", server.url()), None);

        let result = pipeline.send(vec![record("k", "{}")]).await;
        assert!(result.is_complete_success());

        // a later batch for the same key goes straight to the new endpoint
        let result = pipeline.send(vec![record("k", "{}")]).await;
        assert!(result.is_complete_success());

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(stats.for_key("k").snapshot_and_reset().success, 2);
    }

    #[tokio::test]
    async fn test_second_redirect_not_followed() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let hop_one = format!("{}/hop-one", server.url());
        let hop_two = format!("{}/hop-two", server.url());
        let first = server
            .mock("POST", "/track")
            .with_status(307)
            .with_header("Location", &hop_one)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/hop-one")
            .with_status(307)
            .with_header("Location", &hop_two)
            .create_async()
            .await;
        let third = server.mock("POST", "/hop-two").expect(0).create_async().await;
        let store = Arc::new(OverflowStore::open(dir.path(), 1024, true).unwrap());
        let (pipeline, stats, _gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(store));

        let result = pipeline.send(vec![record("k", "{}")]).await;

        // two requests at most, then treated as a retryable failure
        assert_eq!(result.persisted, 1);
        first.assert_async().await;
        second.assert_async().await;
        third.assert_async().await;
        assert_eq!(stats.for_key("k").snapshot_and_reset().retry, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_persists_compressed_partition() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(500)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path(), 4096, true).unwrap());
        let (pipeline, stats, _gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(Arc::clone(&store)));

        let result = pipeline.send(vec![record("k", "{\"a\":1}")]).await;

        assert_eq!(result.persisted, 1);
        assert!(!result.is_complete_success());
        let entry = store.peek_oldest().unwrap().unwrap();
        assert_eq!(entry.key, "k");
        // stored bytes are the gzipped request body, replayable as-is
        let expected = compress(b"[{\"a\":1}]").unwrap();
        assert_eq!(entry.body, expected);
        assert_eq!(stats.for_key("k").snapshot_and_reset().retry, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_without_store_drops() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(500)
            .create_async()
            .await;
        let (pipeline, stats, _gate) = pipeline_for(&format!("{}/track", server.url()), None);

        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert_eq!(result.dropped, 1);
        let snapshot = stats.for_key("k").snapshot_and_reset();
        assert_eq!(snapshot.retry, 1);
        assert_eq!(snapshot.failure, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_without_persisting() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(400)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path(), 4096, true).unwrap());
        let (pipeline, stats, _gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(Arc::clone(&store)));

        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert_eq!(result.dropped, 1);
        assert!(store.peek_oldest().unwrap().is_none());
        assert_eq!(stats.for_key("k").snapshot_and_reset().failure, 1);
    }

    #[tokio::test]
    async fn test_throttle_arms_gate_and_persists() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(429)
            .with_header("Retry-After", "30")
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path(), 4096, true).unwrap());
        let (pipeline, stats, gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(store));

        assert!(gate.is_open());
        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert_eq!(result.persisted, 1);
        assert!(!gate.is_open());
        assert_eq!(stats.for_key("k").snapshot_and_reset().throttle, 1);
    }

    #[tokio::test]
    async fn test_store_full_counts_as_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(500)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path(), 1, true).unwrap());
        let (pipeline, stats, _gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(store));

        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert_eq!(result.dropped, 1);
        let snapshot = stats.for_key("k").snapshot_and_reset();
        assert_eq!(snapshot.failure, 1);
        assert_eq!(snapshot.store_write_failure, 0);
    }

    #[tokio::test]
    async fn test_store_io_failure_counts_write_failure() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(500)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        let store = Arc::new(OverflowStore::open(&store_dir, 4096, true).unwrap());
        // the directory disappears out from under the store
        std::fs::remove_dir_all(&store_dir).unwrap();
        let (pipeline, stats, _gate) =
            pipeline_for(&format!("{}/track", server.url()), Some(store));

        let result = pipeline.send(vec![record("k", "{}")]).await;

        assert_eq!(result.dropped, 1);
        let snapshot = stats.for_key("k").snapshot_and_reset();
        assert_eq!(snapshot.store_write_failure, 1);
        assert_eq!(snapshot.failure, 0);
        assert_eq!(snapshot.retry, 1);
    }

    #[test]
    fn test_throttle_gate_longer_deadline_wins() {
        let gate = ThrottleGate::new();
        gate.arm(Duration::from_secs(60));
        gate.arm(Duration::from_millis(1));
        assert!(!gate.is_open());
    }
}
