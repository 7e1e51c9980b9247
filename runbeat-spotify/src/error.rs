use runbeat_core::ServiceError;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for all Spotify-related operations.
///
/// Everything the orchestrator sees is converted into [`ServiceError`] so the recovery
/// policy can classify it.
#[derive(Debug, Error)]
pub enum SpotifyError {
    /// Transport-level failure from the HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Spotify or the token backend answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    /// Failed to parse or serialize JSON data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The request did not finish within its deadline.
    #[error("Request timed out")]
    Timeout,

    /// Already classified.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Convenience type alias for Results with `SpotifyError`.
pub type Result<T> = std::result::Result<T, SpotifyError>;

impl From<SpotifyError> for ServiceError {
    fn from(err: SpotifyError) -> Self {
        match err {
            SpotifyError::Http(e) if e.is_timeout() => Self::NetworkTimeout,
            SpotifyError::Http(e) if e.is_decode() => Self::DecodeFailure {
                reason: e.to_string(),
            },
            SpotifyError::Http(e) => Self::NetworkUnavailable {
                reason: e.to_string(),
            },
            SpotifyError::Status {
                status: 400,
                message,
                ..
            } if message.contains("invalid_grant") => Self::AuthRevoked { reason: message },
            SpotifyError::Status {
                status,
                retry_after,
                message,
            } => Self::from_status(status, retry_after).unwrap_or(Self::InvalidResponse {
                reason: format!("unexpected success status with error: {message}"),
            }),
            SpotifyError::Json(e) => Self::DecodeFailure {
                reason: e.to_string(),
            },
            SpotifyError::Url(e) => Self::InvalidResponse {
                reason: e.to_string(),
            },
            SpotifyError::Timeout => Self::NetworkTimeout,
            SpotifyError::Service(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, message: &str) -> SpotifyError {
        SpotifyError::Status {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::from(status(401, "The access token expired")),
            ServiceError::TokenExpired
        );
        assert_eq!(
            ServiceError::from(status(503, "")),
            ServiceError::ServiceUnavailable
        );
        assert_eq!(
            ServiceError::from(status(400, "{\"error\":\"invalid_grant\"}")),
            ServiceError::AuthRevoked {
                reason: "{\"error\":\"invalid_grant\"}".into()
            }
        );
        assert!(matches!(
            ServiceError::from(status(400, "bad request")),
            ServiceError::InvalidResponse { .. }
        ));
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let err = SpotifyError::Status {
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
            message: String::new(),
        };
        assert_eq!(
            ServiceError::from(err),
            ServiceError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn test_passthrough_and_json() {
        assert_eq!(
            ServiceError::from(SpotifyError::Service(ServiceError::NoData)),
            ServiceError::NoData
        );
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(
            ServiceError::from(SpotifyError::from(json_err)),
            ServiceError::DecodeFailure { .. }
        ));
        assert_eq!(
            ServiceError::from(SpotifyError::Timeout),
            ServiceError::NetworkTimeout
        );
    }
}
