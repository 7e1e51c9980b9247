//! Real-time channel for hosts without the companion-app SDK.

use async_trait::async_trait;
use runbeat_core::{
    AccessToken, RealtimeChannel, RealtimeEvent, ServiceError, ServiceResult, TrackSnapshot,
};
use tokio::sync::broadcast;
use tracing::debug;

const LOG_TARGET: &str = "runbeat::spotify::realtime";

/// Reports [`ServiceError::AppNotInstalled`] for every command, which the recovery
/// policy answers by degrading to the request API.
pub struct UnavailableRealtimeChannel {
    events: broadcast::Sender<RealtimeEvent>,
}

impl UnavailableRealtimeChannel {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for UnavailableRealtimeChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeChannel for UnavailableRealtimeChannel {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn connect(&self, _token: &AccessToken) -> ServiceResult<()> {
        debug!(target: LOG_TARGET, "No real-time channel on this host");
        Err(ServiceError::AppNotInstalled)
    }

    async fn disconnect(&self) {}

    async fn play(&self, _uri: &str) -> ServiceResult<()> {
        Err(ServiceError::AppNotInstalled)
    }

    async fn pause(&self) -> ServiceResult<()> {
        Err(ServiceError::AppNotInstalled)
    }

    async fn resume(&self) -> ServiceResult<()> {
        Err(ServiceError::AppNotInstalled)
    }

    async fn player_state(&self) -> ServiceResult<TrackSnapshot> {
        Err(ServiceError::AppNotInstalled)
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}
