// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable telemetry delivery pipeline.
//!
//! Producers hand records to a [`TelemetryClient`]; everything after that is
//! asynchronous and fire-and-forget: bounded per-channel queues decouple
//! producers from the network, a background flush loop batches and posts
//! records grouped by destination key, retryable failures spill to a
//! size-capped on-disk store, and a replay task drains that store oldest
//! first once the backend recovers. The pipeline reports its own delivery
//! health (statsbeat) through a dedicated instance of the same machinery.
//!
//! One client is constructed at process start and passed by reference to
//! every producer; nothing here is a global.

pub mod aggregator;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod flusher;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod replay;
pub mod statsbeat;
pub mod storage;
pub mod transmitter;

pub use config::Config;
pub use error::ChannelError;
pub use pipeline::BatchResult;
pub use record::{ChannelKind, TelemetryRecord};
pub use transmitter::DeliveryOutcome;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoints::EndpointResolver;
use crate::flusher::ChannelFlusher;
use crate::pipeline::{DeliveryPipeline, ThrottleGate};
use crate::queue::{QueueHandle, QueueService};
use crate::replay::ReplayTask;
use crate::statsbeat::{Statsbeat, StatsRegistry};
use crate::storage::OverflowStore;
use crate::transmitter::Transmitter;

/// Handle to one running pipeline.
///
/// Must be constructed inside a tokio runtime; `new` spawns the queue
/// services, flush loops, replay tasks and the statsbeat emitter.
pub struct TelemetryClient {
    general_queue: QueueHandle,
    metrics_queue: QueueHandle,
    statsbeat_queue: QueueHandle,
    flushers: Vec<ChannelFlusher>,
    statsbeat: Statsbeat,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TelemetryClient {
    pub fn new(config: Config) -> Result<Self, ChannelError> {
        let default_url = parse_endpoint(&config.default_endpoint)?;
        let statsbeat_url = parse_endpoint(&config.statsbeat_endpoint)?;

        let transmitter = Arc::new(Transmitter::new(
            config.request_timeout,
            config.default_retry_after,
        )?);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Live telemetry side: resolver and throttle gate are shared
        // between the flush loops and the replay task.
        let resolver = Arc::new(EndpointResolver::new(
            default_url,
            config.redirect_cache_capacity,
        ));
        let stats = Arc::new(StatsRegistry::new());
        let gate = Arc::new(ThrottleGate::new());
        let store = match &config.storage_dir {
            Some(dir) => Some(Arc::new(OverflowStore::open(
                dir,
                config.max_storage_bytes,
                true,
            )?)),
            None => None,
        };
        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::clone(&resolver),
            Arc::clone(&transmitter),
            store.clone(),
            Arc::clone(&stats),
            Arc::clone(&gate),
        ));
        if let Some(store) = &store {
            let replay = ReplayTask::new(
                Arc::clone(store),
                Arc::clone(&resolver),
                Arc::clone(&transmitter),
                Arc::clone(&stats),
                Arc::clone(&gate),
                config.replay_interval,
            );
            tasks.push(tokio::spawn(replay.run(cancel.child_token())));
        }

        // Statsbeat side: its own resolver (fixed endpoint), store, gate
        // and counter registry, so the pipeline's health telemetry never
        // shares a disk cap or redirect binding with user telemetry.
        let sb_resolver = Arc::new(EndpointResolver::new(
            statsbeat_url,
            config.redirect_cache_capacity,
        ));
        let sb_stats = Arc::new(StatsRegistry::new());
        let sb_gate = Arc::new(ThrottleGate::new());
        let sb_store = match &config.statsbeat_storage_dir {
            Some(dir) => Some(Arc::new(OverflowStore::open(
                dir,
                config.max_statsbeat_storage_bytes,
                false,
            )?)),
            None => None,
        };
        let sb_pipeline = Arc::new(DeliveryPipeline::new(
            Arc::clone(&sb_resolver),
            Arc::clone(&transmitter),
            sb_store.clone(),
            Arc::clone(&sb_stats),
            Arc::clone(&sb_gate),
        ));
        if let Some(store) = &sb_store {
            let replay = ReplayTask::new(
                Arc::clone(store),
                Arc::clone(&sb_resolver),
                Arc::clone(&transmitter),
                Arc::clone(&sb_stats),
                Arc::clone(&sb_gate),
                config.replay_interval,
            );
            tasks.push(tokio::spawn(replay.run(cancel.child_token())));
        }

        let mut flushers = Vec::new();
        let mut spawn_channel = |capacity: usize, pipeline: &Arc<DeliveryPipeline>| {
            let (service, handle, signal) = QueueService::new(capacity, config.max_batch_entries);
            tasks.push(tokio::spawn(service.run()));
            let flusher = ChannelFlusher::new(
                handle.clone(),
                Arc::clone(pipeline),
                config.flush_interval,
                signal,
            );
            tasks.push(tokio::spawn(flusher.clone().run(cancel.child_token())));
            flushers.push(flusher);
            handle
        };

        let general_queue = spawn_channel(config.general_queue_capacity, &pipeline);
        let metrics_queue = spawn_channel(config.metrics_queue_capacity, &pipeline);
        let statsbeat_queue = spawn_channel(config.statsbeat_queue_capacity, &sb_pipeline);

        let statsbeat = Statsbeat::new(
            Arc::clone(&stats),
            statsbeat_queue.clone(),
            config.statsbeat_key.clone(),
            config.statsbeat_interval,
        );
        tasks.push(tokio::spawn(statsbeat.clone().run(cancel.child_token())));

        Ok(TelemetryClient {
            general_queue,
            metrics_queue,
            statsbeat_queue,
            flushers,
            statsbeat,
            cancel,
            tasks,
        })
    }

    /// Hands one record to its channel's queue. O(1), non-blocking, and
    /// infallible toward the producer; delivery problems are only visible
    /// through the statsbeat counters.
    pub fn submit(&self, record: TelemetryRecord) {
        match record.channel {
            ChannelKind::General => self.general_queue.enqueue(record),
            ChannelKind::Metrics => self.metrics_queue.enqueue(record),
            ChannelKind::Statsbeat => self.statsbeat_queue.enqueue(record),
        }
    }

    /// Drains all queues and sends everything currently buffered, waiting
    /// up to `timeout`. On timeout the flush is abandoned with partial
    /// success; already-persisted data stays on disk for the next start.
    pub async fn flush_and_wait(&self, timeout: Duration) -> Result<(), ChannelError> {
        let flush_all = async {
            for flusher in &self.flushers {
                flusher.flush_available().await;
            }
        };
        tokio::time::timeout(timeout, flush_all)
            .await
            .map_err(|_| ChannelError::FlushTimeout)
    }

    /// Stops all background tasks and performs one final bounded flush.
    /// Never hangs process exit: whatever cannot be sent in time is either
    /// already durable on disk or accepted as lost.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ChannelError> {
        debug!("Telemetry client shutting down");
        let deadline = Instant::now() + timeout;
        // drain the last interval's counters onto the statsbeat queue before
        // the flush below; the cancelled task's own final emit then finds
        // them already reset
        self.statsbeat.emit();
        self.cancel.cancel();

        let result = self.flush_and_wait(timeout).await;

        self.general_queue.shutdown();
        self.metrics_queue.shutdown();
        self.statsbeat_queue.shutdown();
        for task in self.tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining, task).await;
        }
        result
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ChannelError> {
    Url::parse(endpoint).map_err(|e| ChannelError::InvalidEndpoint(format!("{endpoint}: {e}")))
}
