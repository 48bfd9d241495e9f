// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::storage::StorageError;

/// Errors surfaced while constructing or shutting down the pipeline.
///
/// Delivery failures never appear here: the pipeline is fire-and-forget
/// toward producers, and all failure information is only observable through
/// the statsbeat counters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("failed to open overflow store: {0}")]
    Storage(#[from] StorageError),

    #[error("flush did not complete within the timeout")]
    FlushTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ChannelError::InvalidEndpoint("not a url".to_string());
        assert_eq!(error.to_string(), "invalid endpoint URL: not a url");
    }

    #[test]
    fn test_storage_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: ChannelError = StorageError::Io(io).into();
        assert!(matches!(error, ChannelError::Storage(_)));
    }
}
