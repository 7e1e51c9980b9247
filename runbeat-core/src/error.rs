use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please edit it with your Spotify settings and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Credential storage errors
    #[error("Failed to encode stored credential: {0}")]
    CredentialEncoding(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad family an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connectivity,
    Authorization,
    RateOrService,
    Data,
    UserActionable,
}

/// Failures reported by either playback channel or by token acquisition.
///
/// Every variant is cloneable so errors can be carried inside connection states and
/// broadcast to several observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    // Connectivity
    #[error("Real-time channel disconnected")]
    RealtimeDisconnected,

    #[error("Real-time channel connection failed: {reason}")]
    RealtimeConnectionFailed { reason: String },

    #[error("Connection to the companion app was lost")]
    ConnectionLost,

    #[error("App moved to the background")]
    AppBackgrounded,

    #[error("Network request timed out")]
    NetworkTimeout,

    #[error("Network unavailable: {reason}")]
    NetworkUnavailable { reason: String },

    // Authorization
    #[error("Spotify access token expired")]
    TokenExpired,

    #[error("Spotify authorization revoked: {reason}")]
    AuthRevoked { reason: String },

    #[error("Insufficient permissions for this operation")]
    InsufficientPermissions,

    // Rate / service
    #[error("Spotify API rate limited, retry after {}s", .retry_after.map_or(0, |d| d.as_secs()))]
    RateLimited { retry_after: Option<Duration> },

    #[error("Spotify server error (HTTP {status})")]
    ServerError { status: u16 },

    #[error("Spotify service unavailable")]
    ServiceUnavailable,

    // Data
    #[error("No playback data available")]
    NoData,

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Failed to decode response: {reason}")]
    DecodeFailure { reason: String },

    // User actionable
    #[error("Spotify app is not installed or not reachable")]
    AppNotInstalled,

    #[error("Content not found: {uri}")]
    ContentNotFound { uri: String },

    #[error("No playback device found")]
    DeviceNotFound,
}

impl ServiceError {
    /// Map an HTTP status from the request API onto the error taxonomy.
    ///
    /// Returns `None` for success statuses.
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(Self::TokenExpired),
            403 => Some(Self::InsufficientPermissions),
            404 => Some(Self::DeviceNotFound),
            408 => Some(Self::NetworkTimeout),
            429 => Some(Self::RateLimited { retry_after }),
            502..=504 => Some(Self::ServiceUnavailable),
            500..=599 => Some(Self::ServerError { status }),
            _ => Some(Self::InvalidResponse {
                reason: format!("unexpected HTTP status {status}"),
            }),
        }
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::RealtimeDisconnected
            | Self::RealtimeConnectionFailed { .. }
            | Self::ConnectionLost
            | Self::AppBackgrounded
            | Self::NetworkTimeout
            | Self::NetworkUnavailable { .. } => ErrorCategory::Connectivity,
            Self::TokenExpired | Self::AuthRevoked { .. } | Self::InsufficientPermissions => {
                ErrorCategory::Authorization
            }
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::ServiceUnavailable => {
                ErrorCategory::RateOrService
            }
            Self::NoData | Self::InvalidResponse { .. } | Self::DecodeFailure { .. } => {
                ErrorCategory::Data
            }
            Self::AppNotInstalled | Self::ContentNotFound { .. } | Self::DeviceNotFound => {
                ErrorCategory::UserActionable
            }
        }
    }

    /// Errors the OS produces when it suspends the app; not a connectivity fault.
    #[must_use]
    pub const fn is_background_class(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout | Self::ConnectionLost | Self::AppBackgrounded
        )
    }
}
