// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor wrapper around the aggregator.
//!
//! Producers talk to a cloneable [`QueueHandle`]; a single service task owns
//! the aggregator, so no lock is held across enqueue and drain. `enqueue` is
//! a plain channel send: O(1), non-blocking, and it never surfaces delivery
//! problems back to the producer.
//!
//! When the number of queued records crosses the batch threshold the service
//! pings the flush signal so the flush loop can run ahead of its timer.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error};

use crate::aggregator::Aggregator;
use crate::record::TelemetryRecord;

#[derive(Debug)]
pub enum QueueCommand {
    Enqueue(TelemetryRecord),
    /// Drain the next batch (bounded by the aggregator's batch size).
    NextBatch(oneshot::Sender<Vec<TelemetryRecord>>),
    Shutdown,
}

/// Cloneable producer-side handle to a queue service.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    /// Non-blocking enqueue. A closed queue (service shut down) only logs;
    /// the pipeline is fire-and-forget from the producer's perspective.
    pub fn enqueue(&self, record: TelemetryRecord) {
        if self.tx.send(QueueCommand::Enqueue(record)).is_err() {
            debug!("Telemetry queue is shut down, record discarded");
        }
    }

    /// Drains the next batch from the aggregator. Empty vec when the queue
    /// has nothing pending or the service is gone.
    pub async fn next_batch(&self) -> Vec<TelemetryRecord> {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(QueueCommand::NextBatch(response_tx)).is_err() {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
    }
}

/// Owns the aggregator and processes commands sequentially.
pub struct QueueService {
    aggregator: Aggregator,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    flush_signal: Arc<Notify>,
}

impl QueueService {
    /// Returns the service (to be spawned), a producer handle, and the
    /// signal the flush loop should listen on for size-triggered flushes.
    #[must_use]
    pub fn new(max_queue_size: usize, max_batch_entries: usize) -> (Self, QueueHandle, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flush_signal = Arc::new(Notify::new());
        let service = QueueService {
            aggregator: Aggregator::new(max_queue_size, max_batch_entries),
            rx,
            flush_signal: Arc::clone(&flush_signal),
        };
        (service, QueueHandle { tx }, flush_signal)
    }

    pub async fn run(mut self) {
        debug!("Queue service started");
        while let Some(command) = self.rx.recv().await {
            match command {
                QueueCommand::Enqueue(record) => {
                    self.aggregator.add(record);
                    if self.aggregator.len() >= self.aggregator.max_batch_entries() {
                        self.flush_signal.notify_one();
                    }
                }
                QueueCommand::NextBatch(response_tx) => {
                    let batch = self.aggregator.next_batch();
                    if response_tx.send(batch).is_err() {
                        error!("Failed to send batch, requester dropped");
                    }
                }
                QueueCommand::Shutdown => {
                    debug!("Queue service shutting down");
                    break;
                }
            }
        }
    }
}
