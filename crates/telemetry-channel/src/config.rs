// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::flusher::DEFAULT_FLUSH_INTERVAL;
use crate::replay::DEFAULT_REPLAY_INTERVAL;
use crate::statsbeat::DEFAULT_STATSBEAT_INTERVAL;
use crate::storage::DEFAULT_MAX_STORE_BYTES;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default ingestion endpoint for destination keys without a redirect
    /// binding.
    pub default_endpoint: String,
    /// Fixed endpoint the self-monitor reports to, independent of any
    /// redirect the user telemetry may have picked up.
    pub statsbeat_endpoint: String,
    /// Destination key statsbeat records are emitted under.
    pub statsbeat_key: String,

    /// Queue capacity for general telemetry (traces, logs, events).
    pub general_queue_capacity: usize,
    /// Queue capacity for metrics; sized larger since metric volume
    /// typically dwarfs everything else.
    pub metrics_queue_capacity: usize,
    pub statsbeat_queue_capacity: usize,
    /// Records per batch; a full batch triggers an early flush.
    pub max_batch_entries: usize,

    pub flush_interval: Duration,
    pub replay_interval: Duration,
    pub statsbeat_interval: Duration,

    pub request_timeout: Duration,
    /// Throttle backoff applied when a 429/503 carries no Retry-After.
    pub default_retry_after: Duration,

    /// Overflow store directory for user telemetry. `None` disables disk
    /// persistence entirely; retryable failures are then dropped.
    pub storage_dir: Option<PathBuf>,
    pub max_storage_bytes: u64,
    /// Separate store for statsbeat so the pipeline's own telemetry never
    /// competes with user telemetry for the disk cap.
    pub statsbeat_storage_dir: Option<PathBuf>,
    pub max_statsbeat_storage_bytes: u64,

    pub redirect_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_endpoint: "https://ingest.example.com/v2/track".to_string(),
            statsbeat_endpoint: "https://ingest.example.com/v2/track".to_string(),
            statsbeat_key: "statsbeat".to_string(),
            general_queue_capacity: 4096,
            metrics_queue_capacity: 16384,
            statsbeat_queue_capacity: 1024,
            max_batch_entries: 512,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            replay_interval: DEFAULT_REPLAY_INTERVAL,
            statsbeat_interval: DEFAULT_STATSBEAT_INTERVAL,
            request_timeout: Duration::from_secs(10),
            default_retry_after: Duration::from_secs(60),
            storage_dir: None,
            max_storage_bytes: DEFAULT_MAX_STORE_BYTES,
            statsbeat_storage_dir: None,
            max_statsbeat_storage_bytes: 10 * 1024 * 1024,
            redirect_cache_capacity: 100,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(endpoint) = env::var("TELEMETRY_ENDPOINT") {
            config.default_endpoint = endpoint.clone();
            config.statsbeat_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("TELEMETRY_STATSBEAT_ENDPOINT") {
            config.statsbeat_endpoint = endpoint;
        }
        if let Ok(dir) = env::var("TELEMETRY_STORAGE_DIR") {
            let base = PathBuf::from(dir);
            config.statsbeat_storage_dir = Some(base.join("statsbeat"));
            config.storage_dir = Some(base);
        }
        if let Some(secs) = env_u64("TELEMETRY_FLUSH_INTERVAL_SECS") {
            config.flush_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("TELEMETRY_REPLAY_INTERVAL_SECS") {
            config.replay_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("TELEMETRY_MAX_STORAGE_BYTES") {
            config.max_storage_bytes = bytes;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok()?.parse().ok()
}
