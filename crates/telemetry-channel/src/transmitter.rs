// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-shot HTTP transmission and response classification.
//!
//! The transmitter performs exactly one POST per call and maps the response
//! to a [`DeliveryOutcome`]. It holds no retry logic at all; retries,
//! redirect follows and disk persistence are the orchestrator's business,
//! which keeps this layer a pure request-to-outcome function.

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use std::io::Write;
use std::time::Duration;
use tracing::debug;

use crate::error::ChannelError;

/// Result of a single transmission attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Success,
    /// 307/308 with a usable `Location` header. Not a failure; the
    /// orchestrator rebinds the destination key and retries once.
    Redirect(Url),
    /// 429/503. Retryable, but no sooner than the contained wait hint.
    Throttled(Duration),
    /// Network errors and remaining 5xx. Eligible for disk persistence.
    RetryableFailure(String),
    /// Remaining 4xx (and anything else unusable). Dropped, never retried.
    PermanentFailure(String),
}

pub struct Transmitter {
    client: reqwest::Client,
    default_retry_after: Duration,
}

impl Transmitter {
    pub fn new(
        request_timeout: Duration,
        default_retry_after: Duration,
    ) -> Result<Self, ChannelError> {
        // Redirects are classified, never followed by the HTTP layer; the
        // orchestrator owns the rebind-and-retry-once step.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChannelError::HttpClient(e.to_string()))?;
        Ok(Transmitter {
            client,
            default_retry_after,
        })
    }

    /// Posts one gzip-encoded body and classifies the response.
    pub async fn attempt(&self, url: Url, compressed_body: Vec<u8>) -> DeliveryOutcome {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))
            .body(compressed_body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!("Transmission to {url} failed: {e}");
                return DeliveryOutcome::RetryableFailure(format!("request error: {e}"));
            }
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryOutcome::Success;
        }

        match status {
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
                match redirect_target(&url, &response) {
                    Some(target) => DeliveryOutcome::Redirect(target),
                    // A redirect we cannot act on; the endpoint may answer
                    // properly once the backend settles.
                    None => DeliveryOutcome::RetryableFailure(format!(
                        "{status} response without usable location header"
                    )),
                }
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let wait = retry_after(&response).unwrap_or(self.default_retry_after);
                DeliveryOutcome::Throttled(wait)
            }
            s if s.is_server_error() => {
                DeliveryOutcome::RetryableFailure(format!("server error: {s}"))
            }
            s => DeliveryOutcome::PermanentFailure(format!("rejected with status {s}")),
        }
    }
}

fn redirect_target(request_url: &Url, response: &reqwest::Response) -> Option<Url> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    // Location may be absolute or relative to the request URL.
    request_url.join(location).ok()
}

// Only the delta-seconds form of Retry-After is handled; the HTTP-date
// form yields None and the caller falls back to the default backoff.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let seconds = response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(seconds))
}

/// Gzip-compresses a request body.
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn transmitter() -> Transmitter {
        Transmitter::new(Duration::from_secs(5), Duration::from_secs(60)).unwrap()
    }

    async fn attempt_status(status: usize) -> DeliveryOutcome {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(status)
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/track", server.url())).unwrap();
        transmitter().attempt(url, compress(b"[{}]").unwrap()).await
    }

    #[test]
    fn test_compress_roundtrip() {
        let body = b"[{\"name\":\"metric\"}]";
        let compressed = compress(body).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);
    }

    #[tokio::test]
    async fn test_2xx_is_success() {
        assert!(matches!(attempt_status(200).await, DeliveryOutcome::Success));
        assert!(matches!(attempt_status(202).await, DeliveryOutcome::Success));
    }

    #[tokio::test]
    async fn test_5xx_is_retryable() {
        assert!(matches!(
            attempt_status(500).await,
            DeliveryOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_4xx_is_permanent() {
        assert!(matches!(
            attempt_status(400).await,
            DeliveryOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            attempt_status(404).await,
            DeliveryOutcome::PermanentFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_throttle_reads_retry_after_hint() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(429)
            .with_header("Retry-After", "17")
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/track", server.url())).unwrap();

        let outcome = transmitter().attempt(url, compress(b"[]").unwrap()).await;

        match outcome {
            DeliveryOutcome::Throttled(wait) => assert_eq!(wait, Duration::from_secs(17)),
            other => panic!("expected Throttled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_throttle_http_date_hint_falls_back_to_default() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(429)
            .with_header("Retry-After", "Wed, 21 Oct 2026 07:28:00 GMT")
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/track", server.url())).unwrap();

        let outcome = transmitter().attempt(url, compress(b"[]").unwrap()).await;

        match outcome {
            DeliveryOutcome::Throttled(wait) => assert_eq!(wait, Duration::from_secs(60)),
            other => panic!("expected Throttled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_throttle_defaults_without_hint() {
        match attempt_status(503).await {
            DeliveryOutcome::Throttled(wait) => assert_eq!(wait, Duration::from_secs(60)),
            other => panic!("expected Throttled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_carries_location() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/track")
            .with_status(307)
            .with_header("Location", "https://redirect.example/")
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/track", server.url())).unwrap();

        let outcome = transmitter().attempt(url, compress(b"[]").unwrap()).await;

        match outcome {
            DeliveryOutcome::Redirect(target) => {
                assert_eq!(target.as_str(), "https://redirect.example/");
            }
            other => panic!("expected Redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_retryable() {
        assert!(matches!(
            attempt_status(308).await,
            DeliveryOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_error_is_retryable() {
        // nothing listens on this port
        let url = Url::parse("http://127.0.0.1:9/track").unwrap();
        let outcome = transmitter().attempt(url, compress(b"[]").unwrap()).await;
        assert!(matches!(outcome, DeliveryOutcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn test_request_body_is_gzip_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/track")
            .match_header("content-encoding", "gzip")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/track", server.url())).unwrap();

        let outcome = transmitter()
            .attempt(url, compress(b"[{\"a\":1}]").unwrap())
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Success));
        mock.assert_async().await;
    }
}
