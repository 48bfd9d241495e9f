// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory record queue with FIFO eviction.
//!
//! Each logical channel owns one aggregator. Producers append at the back;
//! when the queue is at capacity the oldest record is evicted so `add` never
//! blocks or fails toward the producer. The flush loop drains records in
//! batches of at most `max_batch_entries`.

use std::collections::VecDeque;
use tracing::warn;

use crate::record::TelemetryRecord;

#[derive(Debug)]
pub struct Aggregator {
    records: VecDeque<TelemetryRecord>,
    max_queue_size: usize,
    max_batch_entries: usize,
    /// Records evicted because the queue was full, since creation.
    dropped: u64,
}

impl Aggregator {
    #[must_use]
    pub fn new(max_queue_size: usize, max_batch_entries: usize) -> Self {
        Aggregator {
            records: VecDeque::with_capacity(max_queue_size.min(1024)),
            max_queue_size,
            max_batch_entries,
            dropped: 0,
        }
    }

    /// Appends a record, evicting the oldest one first when the queue is at
    /// capacity. O(1), never fails.
    pub fn add(&mut self, record: TelemetryRecord) {
        if self.records.len() >= self.max_queue_size {
            self.records.pop_front();
            self.dropped += 1;
            warn!(
                "Telemetry queue full ({} records), dropping oldest record",
                self.max_queue_size
            );
        }
        self.records.push_back(record);
    }

    /// Drains up to `max_batch_entries` records in enqueue order. Returns an
    /// empty vec when nothing is queued.
    pub fn next_batch(&mut self) -> Vec<TelemetryRecord> {
        let n = self.records.len().min(self.max_batch_entries);
        self.records.drain(..n).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn max_batch_entries(&self) -> usize {
        self.max_batch_entries
    }
}
