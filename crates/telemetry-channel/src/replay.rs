// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background replay of the overflow store.
//!
//! One replay task runs per store. Each pass drains entries oldest first
//! through the same transmitter/resolver path as live sends and deletes an
//! entry only after its successful retransmission. The pass stops at the
//! first retryable failure so a dead backend is probed once per interval
//! instead of being hammered, and the backlog never floods the backend in
//! one burst after recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::endpoints::EndpointResolver;
use crate::pipeline::{attempt_with_redirect, ThrottleGate};
use crate::statsbeat::StatsRegistry;
use crate::storage::OverflowStore;
use crate::transmitter::{DeliveryOutcome, Transmitter};

pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(30);

pub struct ReplayTask {
    store: Arc<OverflowStore>,
    resolver: Arc<EndpointResolver>,
    transmitter: Arc<Transmitter>,
    stats: Arc<StatsRegistry>,
    gate: Arc<ThrottleGate>,
    interval: Duration,
}

impl ReplayTask {
    #[must_use]
    pub fn new(
        store: Arc<OverflowStore>,
        resolver: Arc<EndpointResolver>,
        transmitter: Arc<Transmitter>,
        stats: Arc<StatsRegistry>,
        gate: Arc<ThrottleGate>,
        interval: Duration,
    ) -> Self {
        ReplayTask {
            store,
            resolver,
            transmitter,
            stats,
            gate,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!("Replay task started, interval {:?}", self.interval);
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = cancel.cancelled() => {
                    debug!("Replay task stopped");
                    break;
                }
            }
            if !self.gate.is_open() {
                debug!("Replay pass skipped, throttle gate still armed");
                continue;
            }
            self.drain_pass().await;
        }
    }

    /// Replays entries oldest first until the store is empty or an attempt
    /// fails. On-disk data survives any failure; only delivered (or
    /// permanently rejected) entries are deleted.
    pub async fn drain_pass(&self) {
        loop {
            let entry = match self.store.peek_oldest() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read overflow store: {e}");
                    break;
                }
            };

            let counters = self.stats.for_key(&entry.key);
            let started = Instant::now();
            let outcome = attempt_with_redirect(
                &self.resolver,
                &self.transmitter,
                &entry.key,
                entry.body.clone(),
            )
            .await;

            match outcome {
                DeliveryOutcome::Success => {
                    counters.record_success(started.elapsed());
                    if let Err(e) = self.store.remove(&entry) {
                        error!("Failed to remove replayed entry: {e}");
                        break;
                    }
                    debug!("Replayed persisted batch for {}", entry.key);
                }
                DeliveryOutcome::PermanentFailure(reason) => {
                    warn!("Discarding persisted batch for {}: {reason}", entry.key);
                    counters.record_failure();
                    if self.store.remove(&entry).is_err() {
                        break;
                    }
                }
                DeliveryOutcome::Throttled(wait) => {
                    counters.record_throttle();
                    self.gate.arm(wait);
                    break;
                }
                DeliveryOutcome::Redirect(_) | DeliveryOutcome::RetryableFailure(_) => {
                    counters.record_retry();
                    break;
                }
            }
        }
    }
}
