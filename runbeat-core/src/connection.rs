//! Connection state machine for Spotify authentication and the real-time channel.
//!
//! The machine only records facts reported by the orchestrator. It never retries;
//! recovery policy lives in [`crate::recovery`].

use crate::error::{CoreError, ServiceError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const LOG_TARGET: &str = "runbeat::connection";

/// A Spotify access token with its refresh token and absolute expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Create a token expiring `expires_in` from now.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Duration,
    ) -> Self {
        let lifetime = TimeDelta::from_std(expires_in).unwrap_or_else(|_| TimeDelta::zero());
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: Utc::now() + lifetime,
        }
    }

    /// Whether the token expires within `margin` from now (or already has).
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or_else(|_| TimeDelta::zero());
        self.expires_at - Utc::now() <= margin
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }

    /// Keep the previous refresh token when a refresh response omits one.
    #[must_use]
    pub fn inherit_refresh_token(mut self, previous: Option<&Self>) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.and_then(|p| p.refresh_token.clone());
        }
        self
    }

    /// Serialize for an opaque credential store.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn to_stored(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a value previously produced by [`Self::to_stored`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value is not a valid token.
    pub fn from_stored(stored: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(stored)?)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exactly one of these is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Authenticating,
    AuthFailed(ServiceError),
    Authenticated(AccessToken),
    ConnectingRealtime(AccessToken),
    Connected(AccessToken),
    RealtimeError(AccessToken, ServiceError),
}

impl ConnectionState {
    #[must_use]
    pub const fn token(&self) -> Option<&AccessToken> {
        match self {
            Self::Authenticated(token)
            | Self::ConnectingRealtime(token)
            | Self::Connected(token)
            | Self::RealtimeError(token, _) => Some(token),
            Self::Disconnected | Self::Authenticating | Self::AuthFailed(_) => None,
        }
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    #[must_use]
    pub const fn is_realtime_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// The request API only needs a valid token.
    #[must_use]
    pub const fn can_use_request_api(&self) -> bool {
        self.is_authenticated()
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::AuthFailed(_) => "auth_failed",
            Self::Authenticated(_) => "authenticated",
            Self::ConnectingRealtime(_) => "connecting_realtime",
            Self::Connected(_) => "connected",
            Self::RealtimeError(..) => "realtime_error",
        }
    }

    /// Pure transition function. Returns `None` when the event does not change the state.
    #[must_use]
    pub fn next(&self, event: ConnectionEvent) -> Option<Self> {
        let next = match (self, event) {
            (Self::Disconnected | Self::AuthFailed(_), ConnectionEvent::StartAuth) => {
                Self::Authenticating
            }
            (Self::Authenticating, ConnectionEvent::AuthSucceeded(token)) => {
                Self::Authenticated(token)
            }
            (Self::Authenticating, ConnectionEvent::AuthFailed(err)) => Self::AuthFailed(err),
            (
                Self::Authenticated(token) | Self::RealtimeError(token, _),
                ConnectionEvent::StartRealtimeConnect,
            ) => Self::ConnectingRealtime(token.clone()),
            (
                Self::ConnectingRealtime(token)
                | Self::Authenticated(token)
                | Self::RealtimeError(token, _),
                ConnectionEvent::RealtimeConnected,
            ) => Self::Connected(token.clone()),
            (state, ConnectionEvent::RealtimeFailed(err)) => match state.token() {
                Some(token) => Self::RealtimeError(token.clone(), err),
                None => Self::Disconnected,
            },
            (state, ConnectionEvent::RealtimeDisconnected(err)) => match (state.token(), err) {
                (None, _) => Self::Disconnected,
                (Some(token), Some(err)) if err.is_background_class() => {
                    Self::Authenticated(token.clone())
                }
                (Some(token), err) => Self::RealtimeError(
                    token.clone(),
                    err.unwrap_or(ServiceError::RealtimeDisconnected),
                ),
            },
            (Self::Authenticating, ConnectionEvent::TokenRefreshed(token)) => {
                Self::Authenticated(token)
            }
            (state, ConnectionEvent::TokenRefreshed(token)) => match state {
                Self::Authenticated(_) => Self::Authenticated(token),
                Self::ConnectingRealtime(_) => Self::ConnectingRealtime(token),
                Self::Connected(_) => Self::Connected(token),
                Self::RealtimeError(_, err) => Self::RealtimeError(token, err.clone()),
                _ => return None,
            },
            (_, ConnectionEvent::TokenExpired | ConnectionEvent::Disconnect) => Self::Disconnected,
            _ => return None,
        };

        (next != *self).then_some(next)
    }
}

/// Named facts fed into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StartAuth,
    AuthSucceeded(AccessToken),
    AuthFailed(ServiceError),
    StartRealtimeConnect,
    RealtimeConnected,
    RealtimeFailed(ServiceError),
    RealtimeDisconnected(Option<ServiceError>),
    TokenRefreshed(AccessToken),
    TokenExpired,
    Disconnect,
}

impl ConnectionEvent {
    const fn name(&self) -> &'static str {
        match self {
            Self::StartAuth => "start_auth",
            Self::AuthSucceeded(_) => "auth_succeeded",
            Self::AuthFailed(_) => "auth_failed",
            Self::StartRealtimeConnect => "start_realtime_connect",
            Self::RealtimeConnected => "realtime_connected",
            Self::RealtimeFailed(_) => "realtime_failed",
            Self::RealtimeDisconnected(_) => "realtime_disconnected",
            Self::TokenRefreshed(_) => "token_refreshed",
            Self::TokenExpired => "token_expired",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Owner of the current [`ConnectionState`].
///
/// Every named transition returns the new state when it changed, so the caller can
/// publish it; `None` means the event was a no-op in the current state.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    #[must_use]
    pub const fn is_realtime_connected(&self) -> bool {
        self.state.is_realtime_connected()
    }

    #[must_use]
    pub const fn can_use_request_api(&self) -> bool {
        self.state.can_use_request_api()
    }

    #[must_use]
    pub const fn token(&self) -> Option<&AccessToken> {
        self.state.token()
    }

    /// Apply an event, returning the new state if it changed.
    pub fn apply(&mut self, event: ConnectionEvent) -> Option<ConnectionState> {
        let event_name = event.name();
        match self.state.next(event) {
            Some(next) => {
                debug!(
                    target: LOG_TARGET,
                    "{} -> {} ({})",
                    self.state.name(),
                    next.name(),
                    event_name
                );
                self.state = next;
                Some(self.state.clone())
            }
            None => {
                debug!(
                    target: LOG_TARGET,
                    "Ignoring {} in state {}", event_name, self.state.name()
                );
                None
            }
        }
    }

    pub fn start_auth(&mut self) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::StartAuth)
    }

    pub fn auth_succeeded(&mut self, token: AccessToken) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::AuthSucceeded(token))
    }

    pub fn auth_failed(&mut self, err: ServiceError) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::AuthFailed(err))
    }

    pub fn start_realtime_connect(&mut self) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::StartRealtimeConnect)
    }

    pub fn realtime_connected(&mut self) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::RealtimeConnected)
    }

    pub fn realtime_failed(&mut self, err: ServiceError) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::RealtimeFailed(err))
    }

    pub fn realtime_disconnected(&mut self, err: Option<ServiceError>) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::RealtimeDisconnected(err))
    }

    pub fn token_refreshed(&mut self, token: AccessToken) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::TokenRefreshed(token))
    }

    pub fn token_expired(&mut self) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::TokenExpired)
    }

    pub fn disconnect(&mut self) -> Option<ConnectionState> {
        self.apply(ConnectionEvent::Disconnect)
    }
}
