// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination key to endpoint resolution with a bounded redirect cache.

use lru::LruCache;
use reqwest::Url;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_REDIRECT_CACHE_CAPACITY: usize = 100;

/// Maps destination keys to ingestion URLs.
///
/// A key resolves to the process-wide default endpoint until a redirect
/// response installs a binding for it. Bindings live in an LRU cache; when
/// the cache is full the least-recently-used binding is evicted and its key
/// falls back to the default endpoint.
pub struct EndpointResolver {
    default_endpoint: Url,
    bindings: Mutex<LruCache<String, Url>>,
}

impl EndpointResolver {
    #[must_use]
    pub fn new(default_endpoint: Url, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_REDIRECT_CACHE_CAPACITY).unwrap());
        EndpointResolver {
            default_endpoint,
            bindings: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached binding for `key`, or the default endpoint if none
    /// exists. A hit refreshes the entry's recency.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Url {
        #[allow(clippy::expect_used)]
        let mut bindings = self.bindings.lock().expect("lock poisoned");
        bindings
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_endpoint.clone())
    }

    /// Installs a new binding for `key`, superseding any previous one.
    ///
    /// Concurrent updates for the same key are last-write-wins; a stale
    /// redirect can briefly override a fresher one, which is accepted
    /// behavior for the short window two redirects can race.
    pub fn update_binding(&self, key: &str, url: Url) {
        debug!("Endpoint binding for {key} updated to {url}");
        #[allow(clippy::expect_used)]
        let mut bindings = self.bindings.lock().expect("lock poisoned");
        bindings.put(key.to_string(), url);
    }

    #[must_use]
    pub fn default_endpoint(&self) -> &Url {
        &self.default_endpoint
    }
}
