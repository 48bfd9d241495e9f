// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-channel background flush loop.
//!
//! Each logical channel runs one of these: it wakes on whichever comes
//! first, the flush interval elapsing or the queue signalling that a full
//! batch is waiting, then drains the queue batch by batch into the delivery
//! pipeline. The same object doubles as the force-flush entry point used at
//! shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::DeliveryPipeline;
use crate::queue::QueueHandle;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ChannelFlusher {
    queue: QueueHandle,
    pipeline: Arc<DeliveryPipeline>,
    interval: Duration,
    flush_signal: Arc<Notify>,
}

impl ChannelFlusher {
    #[must_use]
    pub fn new(
        queue: QueueHandle,
        pipeline: Arc<DeliveryPipeline>,
        interval: Duration,
        flush_signal: Arc<Notify>,
    ) -> Self {
        ChannelFlusher {
            queue,
            pipeline,
            interval,
            flush_signal,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!("Flush loop started, interval {:?}", self.interval);
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = self.flush_signal.notified() => {}
                () = cancel.cancelled() => {
                    debug!("Flush loop stopped");
                    break;
                }
            }
            self.flush_available().await;
        }
    }

    /// Drains every currently queued batch through the pipeline. Records
    /// enqueued while a send is in flight are picked up by the next pass.
    pub async fn flush_available(&self) {
        loop {
            let batch = self.queue.next_batch().await;
            if batch.is_empty() {
                break;
            }
            debug!("Flushing batch of {} records", batch.len());
            self.pipeline.send(batch).await;
        }
    }
}
