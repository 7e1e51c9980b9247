//! Seams to the streaming service.
//!
//! The service itself is a black box reached through two channels: a push-based
//! real-time control channel and a request/response API. Token acquisition and
//! credential storage are separate collaborators so the orchestrator can be driven by
//! mocks in tests.

use crate::connection::AccessToken;
use crate::error::{Result, ServiceError};
use crate::track::TrackSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Result type for channel and token operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// A playback device as reported by the request API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackDevice {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub is_restricted: bool,
}

/// Messages pushed by the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    PlayerState(TrackSnapshot),
    /// The channel dropped; `None` when no cause was reported
    Disconnected { error: Option<ServiceError> },
}

/// Push-based control channel (the companion app SDK on mobile hosts).
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Connect using `token`. Implementations do not enforce a timeout; callers do.
    async fn connect(&self, token: &AccessToken) -> ServiceResult<()>;

    async fn disconnect(&self);

    async fn play(&self, uri: &str) -> ServiceResult<()>;

    async fn pause(&self) -> ServiceResult<()>;

    async fn resume(&self) -> ServiceResult<()>;

    async fn player_state(&self) -> ServiceResult<TrackSnapshot>;

    /// Subscribe to pushed player state and disconnect notifications.
    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent>;
}

/// Request/response web API channel.
#[async_trait]
pub trait RequestApiChannel: Send + Sync {
    /// `Ok(None)` when nothing is playing.
    async fn currently_playing(&self, token: &AccessToken) -> ServiceResult<Option<TrackSnapshot>>;

    async fn play(
        &self,
        token: &AccessToken,
        context_uri: &str,
        device_id: Option<&str>,
    ) -> ServiceResult<()>;

    async fn pause(&self, token: &AccessToken, device_id: Option<&str>) -> ServiceResult<()>;

    async fn resume(&self, token: &AccessToken, device_id: Option<&str>) -> ServiceResult<()>;

    async fn devices(&self, token: &AccessToken) -> ServiceResult<Vec<PlaybackDevice>>;

    async fn transfer_playback(
        &self,
        token: &AccessToken,
        device_id: &str,
        play: bool,
    ) -> ServiceResult<()>;

    /// Cheap authenticated call used to check that a token is still accepted.
    async fn validate_token(&self, token: &AccessToken) -> ServiceResult<()>;
}

/// One way of obtaining a fresh access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `current` is the token being replaced, if any; sources that refresh locally need
    /// its refresh token.
    async fn fetch_token(&self, current: Option<&AccessToken>) -> ServiceResult<AccessToken>;
}

/// Opaque secret storage (keychain on mobile, a file on desktop).
pub trait CredentialStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}
