//! Error types surfaced to callers of the request coordinator
//!
//! Only executor failures and offline-with-no-data ever reach application
//! code. Storage-layer failures are absorbed inside the persistence adapter.

use thiserror::Error;

/// Errors returned from [`RequestCoordinator::request`](crate::RequestCoordinator::request)
///
/// The error is `Clone` because a single failure is delivered to every caller
/// that coalesced onto the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The executor raised or returned a failure status
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The executor's result could not be validated or decoded
    #[error("Failed to parse response: {0}")]
    ResponseParseError(String),

    /// Offline and no entry of any freshness exists for the key
    #[error("Offline and no cached data available for '{key}'")]
    OfflineNoCache {
        /// The fully-qualified cache key that was requested
        key: String,
    },
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CacheError::ResponseParseError(err.to_string())
        } else {
            CacheError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::ResponseParseError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_error_names_key() {
        let err = CacheError::OfflineNoCache {
            key: "items:42".to_string(),
        };
        assert!(err.to_string().contains("items:42"));
    }

    #[test]
    fn test_serde_error_maps_to_parse_error() {
        let parse_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: CacheError = parse_err.into();
        assert!(matches!(err, CacheError::ResponseParseError(_)));
    }
}
