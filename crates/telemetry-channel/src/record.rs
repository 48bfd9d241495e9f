// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry records, batches and per-destination partitioning.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical channel a record travels on. Each channel has its own bounded
/// queue and flush loop so high-volume metrics cannot starve general
/// telemetry, and the pipeline's own health records never mix with either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    General,
    Metrics,
    Statsbeat,
}

/// One observable event handed to the pipeline by a producer.
///
/// The payload is an opaque, already-serialized JSON object; the pipeline
/// never inspects it. Records are immutable once created.
#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    /// Routing/tenant identifier deciding which endpoint and credentials
    /// the record is delivered under.
    pub destination_key: String,
    /// Producer-side creation time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Serialized JSON object bytes.
    pub payload: Vec<u8>,
    pub channel: ChannelKind,
}

impl TelemetryRecord {
    pub fn new(destination_key: impl Into<String>, payload: Vec<u8>, channel: ChannelKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        TelemetryRecord {
            destination_key: destination_key.into(),
            timestamp_ms,
            payload,
            channel,
        }
    }
}

/// The subset of a batch sharing one destination key: the unit of a single
/// network request.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: String,
    pub records: Vec<TelemetryRecord>,
}

impl Partition {
    /// Assembles the request body: a JSON array of the raw payloads, in
    /// enqueue order.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let total: usize = self.records.iter().map(|r| r.payload.len() + 1).sum();
        let mut body = Vec::with_capacity(total + 2);
        body.push(b'[');
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(&record.payload);
        }
        body.push(b']');
        body
    }
}

/// Splits a batch by destination key. Partitions come out in the order each
/// key first appears, and records keep their enqueue order within a
/// partition.
#[must_use]
pub fn partition_by_key(batch: Vec<TelemetryRecord>) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in batch {
        match index.get(&record.destination_key) {
            Some(&i) => partitions[i].records.push(record),
            None => {
                index.insert(record.destination_key.clone(), partitions.len());
                partitions.push(Partition {
                    key: record.destination_key.clone(),
                    records: vec![record],
                });
            }
        }
    }
    partitions
}
