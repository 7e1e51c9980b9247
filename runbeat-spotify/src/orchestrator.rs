//! Playback orchestration on top of the Spotify channels.
//!
//! [`SpotifyOrchestrator`] owns the connection state machine, the track coordinator and
//! the recovery engine. It routes commands to the real-time channel while it is live
//! and to the request API otherwise, and feeds every failure into recovery.

use crate::config::SpotifyProviderConfig;
use crate::credentials::{FileCredentialStore, SPOTIFY_TOKEN_KEY};
use crate::error::Result;
use crate::poller::NowPlayingPoller;
use crate::realtime::UnavailableRealtimeChannel;
use crate::token::{BackendTokenClient, LocalTokenRefresher};
use crate::web_api::SpotifyWebApi;
use async_trait::async_trait;
use runbeat_core::{
    AccessToken, ConnectionState, ConnectionStateMachine, CredentialStore, DisplayedError,
    ErrorRecoveryEngine, ExecuteOutcome, FallbackStrategy, Intent, IntentTransition,
    IntervalPhase, PlaybackDevice, RealtimeChannel, RealtimeEvent, RecoveryConfig,
    RecoveryHandler, RecoveryOperation, RequestApiChannel, ServiceError, ServiceResult,
    SnapshotSource, TokenSource, TrackDataCoordinator, TrackSnapshot, TrackUpdate,
    TrainingPlayback,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "runbeat::spotify::orchestrator";

/// Tunables taken from the provider and recovery config sections.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub high_intensity_playlist: String,
    pub rest_playlist: String,
    pub poll_interval: Duration,
    pub token_refresh_margin: Duration,
    pub realtime_connect_timeout: Duration,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn new(spotify: &SpotifyProviderConfig, recovery: &RecoveryConfig) -> Self {
        Self {
            high_intensity_playlist: spotify.high_intensity_playlist.clone(),
            rest_playlist: spotify.rest_playlist.clone(),
            poll_interval: spotify.poll_interval(),
            token_refresh_margin: spotify.token_refresh_margin(),
            realtime_connect_timeout: recovery.realtime_connect_timeout(),
        }
    }
}

/// External collaborators of the orchestrator.
pub struct SpotifyChannels {
    pub realtime: Arc<dyn RealtimeChannel>,
    pub request_api: Arc<dyn RequestApiChannel>,
    /// Tried in order until one returns a token
    pub token_sources: Vec<Arc<dyn TokenSource>>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl SpotifyChannels {
    /// Production wiring: Web API, backend and local token sources, the file credential
    /// store, and no real-time channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the backend URL is invalid.
    pub fn from_config(spotify: &SpotifyProviderConfig, recovery: &RecoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(recovery.request_timeout())
            .build()?;

        let mut token_sources: Vec<Arc<dyn TokenSource>> = Vec::new();
        if let (Some(backend_url), Some(user_id)) = (&spotify.backend_url, &spotify.user_id) {
            token_sources.push(Arc::new(BackendTokenClient::new(
                http.clone(),
                backend_url,
                user_id,
            )?));
        }
        token_sources.push(Arc::new(LocalTokenRefresher::new(
            http,
            spotify.accounts_url.clone(),
            spotify.client_id.clone(),
            spotify.client_secret.clone(),
        )));

        Ok(Self {
            realtime: Arc::new(UnavailableRealtimeChannel::new()),
            request_api: Arc::new(SpotifyWebApi::new(
                recovery.request_timeout(),
                recovery.validation_timeout(),
            )),
            token_sources,
            credentials: Arc::new(FileCredentialStore::at_default_path()),
        })
    }
}

/// Forwards recovery callbacks to the orchestrator without keeping it alive.
struct RecoveryBridge {
    orchestrator: Weak<SpotifyOrchestrator>,
}

#[async_trait]
impl RecoveryHandler for RecoveryBridge {
    async fn recover(&self, operation: &RecoveryOperation) -> ServiceResult<()> {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.recover(operation).await,
            None => Ok(()),
        }
    }

    async fn apply_fallback(
        &self,
        strategy: FallbackStrategy,
        operation: &RecoveryOperation,
        error: &ServiceError,
    ) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.apply_fallback(strategy, operation, error).await;
        }
    }
}

pub struct SpotifyOrchestrator {
    this: Weak<Self>,
    settings: OrchestratorSettings,
    channels: SpotifyChannels,
    connection: tokio::sync::Mutex<ConnectionStateMachine>,
    connection_tx: watch::Sender<ConnectionState>,
    intent_tx: watch::Sender<Intent>,
    coordinator: Arc<TrackDataCoordinator>,
    recovery: Arc<ErrorRecoveryEngine>,
    /// Device chosen by the last activation
    device: Mutex<Option<String>>,
    realtime_task: Mutex<Option<CancellationToken>>,
    poller_task: Mutex<Option<CancellationToken>>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl SpotifyOrchestrator {
    #[must_use]
    pub fn new(
        settings: OrchestratorSettings,
        recovery: &RecoveryConfig,
        channels: SpotifyChannels,
    ) -> Arc<Self> {
        let (intent_tx, intent_rx) = watch::channel(Intent::Idle);
        let (connection_tx, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|this: &Weak<Self>| {
            let handler = Arc::new(RecoveryBridge {
                orchestrator: this.clone(),
            });
            Self {
                this: this.clone(),
                settings,
                channels,
                connection: tokio::sync::Mutex::new(ConnectionStateMachine::new()),
                connection_tx,
                intent_tx,
                coordinator: TrackDataCoordinator::new(),
                recovery: ErrorRecoveryEngine::new(recovery, intent_rx, handler),
                device: Mutex::new(None),
                realtime_task: Mutex::new(None),
                poller_task: Mutex::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }
        })
    }

    /// Build with production channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the channels cannot be constructed.
    pub fn from_config(
        spotify: &SpotifyProviderConfig,
        recovery: &RecoveryConfig,
    ) -> Result<Arc<Self>> {
        let channels = SpotifyChannels::from_config(spotify, recovery)?;
        Ok(Self::new(
            OrchestratorSettings::new(spotify, recovery),
            recovery,
            channels,
        ))
    }

    // Observers

    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection_tx.borrow().clone()
    }

    #[must_use]
    pub fn current_track(&self) -> broadcast::Receiver<TrackUpdate> {
        self.coordinator.subscribe()
    }

    #[must_use]
    pub fn intent(&self) -> watch::Receiver<Intent> {
        self.intent_tx.subscribe()
    }

    #[must_use]
    pub fn current_intent(&self) -> Intent {
        *self.intent_tx.borrow()
    }

    #[must_use]
    pub fn displayed_errors(&self) -> watch::Receiver<Option<DisplayedError>> {
        self.recovery.displayed_errors()
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<TrackDataCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub const fn recovery(&self) -> &Arc<ErrorRecoveryEngine> {
        &self.recovery
    }

    #[must_use]
    pub fn activated_device(&self) -> Option<String> {
        lock(&self.device).clone()
    }

    /// Whether the now-playing poller should fetch on its next tick: authenticated, not
    /// disconnected by intent, and without a live real-time subscription.
    #[must_use]
    pub fn should_poll(&self) -> bool {
        let state = self.connection_tx.borrow();
        let subscribed = state.is_realtime_connected() && self.realtime_subscribed();
        state.is_authenticated() && !subscribed && self.current_intent() != Intent::Disconnected
    }

    fn realtime_subscribed(&self) -> bool {
        lock(&self.realtime_task)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    // Connection lifecycle

    /// Authenticate (stored credential, then token sources in order) and bring up the
    /// real-time channel. Real-time failures are handed to recovery and do not fail the
    /// call.
    ///
    /// # Errors
    ///
    /// Returns the error of the last token source when no token could be obtained.
    pub async fn connect(&self) -> ServiceResult<()> {
        if self.current_intent() == Intent::Disconnected {
            self.set_intent(Intent::Idle).await;
        }

        if !self.state().is_authenticated() {
            if self
                .transition(ConnectionStateMachine::start_auth)
                .await
                .is_none()
            {
                debug!(target: LOG_TARGET, "Authentication already in progress");
                return Ok(());
            }

            match self.acquire_token().await {
                Ok(token) => {
                    self.transition(|machine| machine.auth_succeeded(token))
                        .await;
                    self.recovery.dismiss_error();
                    info!(target: LOG_TARGET, "Authenticated with Spotify");
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Authentication failed: {}", e);
                    self.transition(|machine| machine.auth_failed(e.clone()))
                        .await;
                    self.report(e.clone(), RecoveryOperation::RefreshToken);
                    return Err(e);
                }
            }
        }

        self.ensure_poller();
        if !self.state().is_realtime_connected() {
            if let Err(e) = self.connect_realtime().await {
                self.report(e, RecoveryOperation::ReconnectRealtime);
            }
        }
        Ok(())
    }

    /// Close both channels and cancel all recovery. Credentials are kept. A no-op when
    /// the intent is already `Disconnected`.
    pub async fn disconnect(&self) {
        self.set_intent(Intent::Disconnected).await;
    }

    /// Disconnect and forget the stored credential.
    pub async fn logout(&self) {
        self.disconnect().await;
        if let Err(e) = self.channels.credentials.delete(SPOTIFY_TOKEN_KEY) {
            warn!(target: LOG_TARGET, "Failed to delete stored credentials: {}", e);
        }
        self.recovery.dismiss_error();
        info!(target: LOG_TARGET, "Logged out of Spotify");
    }

    /// Publish a new intent and apply its side effects.
    pub async fn set_intent(&self, next: Intent) -> IntentTransition {
        let previous = self.intent_tx.send_replace(next);
        let transition = self.recovery.on_intent_changed(previous, next);
        match transition {
            IntentTransition::Activate => {
                let state = self.state();
                if state.is_realtime_connected() {
                    self.start_realtime_forwarder();
                } else if state.is_authenticated() {
                    if let Err(e) = self.connect_realtime().await {
                        self.report(e, RecoveryOperation::ReconnectRealtime);
                    }
                }
            }
            IntentTransition::Deactivate => self.drop_realtime().await,
            IntentTransition::Disconnect => self.close_channels().await,
            IntentTransition::NoOp => {}
        }
        transition
    }

    /// Obtain a new token from the token sources and store it.
    ///
    /// From an unauthenticated state a successful refresh completes authentication.
    ///
    /// # Errors
    ///
    /// Returns the last token source's error.
    pub async fn refresh_token(&self) -> ServiceResult<AccessToken> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.state().token().cloned().or_else(|| self.stored_token());
        let token = self.fetch_from_sources(current.as_ref()).await?;
        self.persist(&token);

        let was_authenticated = self.state().is_authenticated();
        let refreshed = token.clone();
        self.transition(move |machine| {
            if machine.token().is_some()
                || matches!(machine.state(), ConnectionState::Authenticating)
            {
                machine.token_refreshed(refreshed)
            } else {
                machine.start_auth();
                machine.auth_succeeded(refreshed)
            }
        })
        .await;

        info!(target: LOG_TARGET, "Spotify token refreshed");
        if !was_authenticated {
            self.ensure_poller();
        }
        Ok(token)
    }

    // Playback facade

    /// Activate a playback device and start `playlist` on it.
    ///
    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn activate_for_training(&self, playlist: &str) -> ServiceResult<()> {
        let result = self.activate_device(playlist).await;
        self.settle(
            RecoveryOperation::ActivateDevice {
                uri: playlist.to_string(),
            },
            result,
        )
    }

    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn play_high_intensity(&self) -> ServiceResult<()> {
        self.play_context(&self.settings.high_intensity_playlist).await
    }

    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn play_rest(&self) -> ServiceResult<()> {
        self.play_context(&self.settings.rest_playlist).await
    }

    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn pause(&self) -> ServiceResult<()> {
        self.predict_playing(false).await;
        let result = self.send_pause().await;
        self.settle(RecoveryOperation::PausePlayback, result)
    }

    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn resume(&self) -> ServiceResult<()> {
        self.predict_playing(true).await;
        let result = self.send_resume().await;
        self.settle(RecoveryOperation::ResumePlayback, result)
    }

    /// Fetch the current track and feed it to the coordinator. `Ok(None)` means
    /// nothing is playing.
    ///
    /// # Errors
    ///
    /// Returns the failure after handing it to recovery.
    pub async fn fetch_now_playing(&self) -> ServiceResult<Option<TrackSnapshot>> {
        let result = self.poll_now_playing().await;
        match &result {
            Ok(_) => self.recovery.record_success(&RecoveryOperation::FetchNowPlaying),
            Err(e) => {
                self.report(e.clone(), RecoveryOperation::FetchNowPlaying);
            }
        }
        result
    }

    /// Stop background tasks. Further calls still work but nothing runs on its own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // Channel operations. These never report to recovery themselves, so recovery can
    // re-run them.

    async fn recover(&self, operation: &RecoveryOperation) -> ServiceResult<()> {
        match operation {
            RecoveryOperation::ReconnectRealtime => self.connect_realtime().await,
            RecoveryOperation::RefreshToken => self.refresh_token().await.map(|_| ()),
            RecoveryOperation::FetchNowPlaying => self.poll_now_playing().await.map(|_| ()),
            RecoveryOperation::StartPlayback { uri } => self.send_play(uri).await,
            RecoveryOperation::PausePlayback => self.send_pause().await,
            RecoveryOperation::ResumePlayback => self.send_resume().await,
            RecoveryOperation::ActivateDevice { uri } => self.activate_device(uri).await,
        }
    }

    async fn apply_fallback(
        &self,
        strategy: FallbackStrategy,
        operation: &RecoveryOperation,
        error: &ServiceError,
    ) {
        match (strategy, operation) {
            (FallbackStrategy::NotifyUser, RecoveryOperation::RefreshToken)
                if self.refresh_exhausted(error) =>
            {
                self.hard_reset(error).await;
            }
            (FallbackStrategy::DegradeToRequestApi, _) => {
                info!(
                    target: LOG_TARGET,
                    "Using the request API for playback data after {}: {}", operation, error
                );
                self.ensure_poller();
            }
            _ => {}
        }
    }

    async fn connect_realtime(&self) -> ServiceResult<()> {
        let state = self.state();
        if state.is_realtime_connected() {
            return Ok(());
        }
        let token = state.token().cloned().ok_or(ServiceError::TokenExpired)?;

        self.transition(ConnectionStateMachine::start_realtime_connect)
            .await;
        self.start_realtime_forwarder();

        let limit = self.settings.realtime_connect_timeout;
        debug!(
            target: LOG_TARGET,
            "Connecting {} real-time channel", self.channels.realtime.name()
        );
        let result = tokio::time::timeout(limit, self.channels.realtime.connect(&token))
            .await
            .unwrap_or_else(|_| {
                Err(ServiceError::RealtimeConnectionFailed {
                    reason: format!("no connection within {limit:?}"),
                })
            });

        match result {
            Ok(()) => {
                self.transition(ConnectionStateMachine::realtime_connected)
                    .await;
                info!(target: LOG_TARGET, "Real-time channel connected");
                Ok(())
            }
            Err(e) => {
                self.stop_realtime_forwarder();
                self.transition(|machine| machine.realtime_failed(e.clone()))
                    .await;
                Err(e)
            }
        }
    }

    async fn acquire_token(&self) -> ServiceResult<AccessToken> {
        let stored = self.stored_token();
        if let Some(token) = &stored {
            if !token.expires_within(self.settings.token_refresh_margin) {
                match self.channels.request_api.validate_token(token).await {
                    Ok(()) => return Ok(token.clone()),
                    Err(ServiceError::TokenExpired | ServiceError::AuthRevoked { .. }) => {
                        debug!(target: LOG_TARGET, "Stored token was rejected");
                    }
                    Err(e) => {
                        // Offline start: keep the token and let later calls decide
                        debug!(target: LOG_TARGET, "Could not validate stored token: {}", e);
                        return Ok(token.clone());
                    }
                }
            }
        }

        let token = self.fetch_from_sources(stored.as_ref()).await?;
        self.persist(&token);
        Ok(token)
    }

    async fn fetch_from_sources(&self, current: Option<&AccessToken>) -> ServiceResult<AccessToken> {
        let mut last_error = ServiceError::AuthRevoked {
            reason: "no token source configured".into(),
        };
        for source in &self.channels.token_sources {
            match source.fetch_token(current).await {
                Ok(token) => {
                    debug!(target: LOG_TARGET, "Token obtained from {}", source.name());
                    return Ok(token);
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Token source {} failed: {}", source.name(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Current token, refreshed first when it expires within the margin.
    async fn fresh_token(&self) -> ServiceResult<AccessToken> {
        let token = self
            .state()
            .token()
            .cloned()
            .ok_or(ServiceError::TokenExpired)?;
        if token.expires_within(self.settings.token_refresh_margin) {
            self.refresh_token().await
        } else {
            Ok(token)
        }
    }

    async fn activate_device(&self, playlist: &str) -> ServiceResult<()> {
        if self.state().is_realtime_connected() {
            match self.channels.realtime.play(playlist).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(target: LOG_TARGET, "Real-time play failed: {}", e),
            }
        }

        let token = self.fresh_token().await?;
        let devices = self.channels.request_api.devices(&token).await?;
        let device = choose_device(&devices).ok_or(ServiceError::DeviceNotFound)?;

        if !device.is_active {
            info!(target: LOG_TARGET, "Transferring playback to {}", device.name);
            self.channels
                .request_api
                .transfer_playback(&token, &device.id, false)
                .await?;
        }
        self.channels
            .request_api
            .play(&token, playlist, Some(&device.id))
            .await?;

        *lock(&self.device) = Some(device.id.clone());
        info!(target: LOG_TARGET, "Training playback active on {}", device.name);
        Ok(())
    }

    async fn play_context(&self, uri: &str) -> ServiceResult<()> {
        self.predict_playing(true).await;
        let result = self.send_play(uri).await;
        self.settle(
            RecoveryOperation::StartPlayback {
                uri: uri.to_string(),
            },
            result,
        )
    }

    async fn send_play(&self, uri: &str) -> ServiceResult<()> {
        if self.state().is_realtime_connected() {
            match self.channels.realtime.play(uri).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(target: LOG_TARGET, "Real-time play failed: {}", e),
            }
        }
        let token = self.fresh_token().await?;
        let device = self.activated_device();
        self.channels
            .request_api
            .play(&token, uri, device.as_deref())
            .await
    }

    async fn send_pause(&self) -> ServiceResult<()> {
        if self.state().is_realtime_connected() {
            match self.channels.realtime.pause().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(target: LOG_TARGET, "Real-time pause failed: {}", e),
            }
        }
        let token = self.fresh_token().await?;
        let device = self.activated_device();
        self.channels
            .request_api
            .pause(&token, device.as_deref())
            .await
    }

    async fn send_resume(&self) -> ServiceResult<()> {
        if self.state().is_realtime_connected() {
            match self.channels.realtime.resume().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(target: LOG_TARGET, "Real-time resume failed: {}", e),
            }
        }
        let token = self.fresh_token().await?;
        let device = self.activated_device();
        self.channels
            .request_api
            .resume(&token, device.as_deref())
            .await
    }

    async fn poll_now_playing(&self) -> ServiceResult<Option<TrackSnapshot>> {
        if self.state().is_realtime_connected() {
            match self.channels.realtime.player_state().await {
                Ok(snapshot) => {
                    self.coordinator.update_from_realtime(snapshot.clone()).await;
                    return Ok(Some(snapshot));
                }
                Err(e) => debug!(target: LOG_TARGET, "Real-time player state failed: {}", e),
            }
        }

        let token = self.fresh_token().await?;
        let snapshot = self.channels.request_api.currently_playing(&token).await?;
        match &snapshot {
            Some(snapshot) => {
                self.coordinator
                    .update_from_request_api(snapshot.clone())
                    .await;
            }
            None => {
                self.coordinator
                    .clear_source(SnapshotSource::RequestApi)
                    .await;
            }
        }
        if !self.coordinator.validate_consistency().await {
            debug!(target: LOG_TARGET, "Playback sources disagree on the current track");
        }
        Ok(snapshot)
    }

    /// Show the expected playing flag until a channel reports back.
    async fn predict_playing(&self, is_playing: bool) {
        if let Some(current) = self.coordinator.current().await {
            self.coordinator
                .update_optimistic(
                    current
                        .with_playing(is_playing)
                        .with_source(SnapshotSource::Optimistic),
                )
                .await;
        }
    }

    // Bookkeeping

    async fn transition<F>(&self, apply: F) -> Option<ConnectionState>
    where
        F: FnOnce(&mut ConnectionStateMachine) -> Option<ConnectionState>,
    {
        let mut machine = self.connection.lock().await;
        let changed = apply(&mut machine);
        if changed.is_some() {
            self.connection_tx.send_replace(machine.state().clone());
        }
        changed
    }

    fn settle(&self, operation: RecoveryOperation, result: ServiceResult<()>) -> ServiceResult<()> {
        match &result {
            Ok(()) => self.recovery.record_success(&operation),
            Err(e) => {
                self.report(e.clone(), operation);
            }
        }
        result
    }

    /// Hand a failure to recovery. Authorization failures are recovered by refreshing
    /// the token, whatever operation hit them. Calls made while the intent is
    /// `Disconnected` fail without recovery.
    fn report(&self, error: ServiceError, operation: RecoveryOperation) -> Option<ExecuteOutcome> {
        if self.current_intent() == Intent::Disconnected {
            debug!(
                target: LOG_TARGET,
                "{} failed while disconnected, not recovering: {}", operation, error
            );
            return None;
        }
        let operation = match error {
            ServiceError::TokenExpired | ServiceError::AuthRevoked { .. } => {
                RecoveryOperation::RefreshToken
            }
            _ => operation,
        };
        Some(self.recovery.handle_error(error, operation))
    }

    /// A refresh give-up means the credential is unusable only when the refresh itself
    /// was rejected or ran out of attempts, never when recovery is off by intent.
    fn refresh_exhausted(&self, error: &ServiceError) -> bool {
        self.current_intent() != Intent::Disconnected
            && matches!(
                error,
                ServiceError::TokenExpired | ServiceError::AuthRevoked { .. }
            )
    }

    fn stored_token(&self) -> Option<AccessToken> {
        match self.channels.credentials.get(SPOTIFY_TOKEN_KEY) {
            Ok(stored) => stored.and_then(|stored| match AccessToken::from_stored(&stored) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(target: LOG_TARGET, "Ignoring unreadable stored token: {}", e);
                    None
                }
            }),
            Err(e) => {
                warn!(target: LOG_TARGET, "Failed to read stored credentials: {}", e);
                None
            }
        }
    }

    fn persist(&self, token: &AccessToken) {
        let stored = token
            .to_stored()
            .and_then(|stored| self.channels.credentials.put(SPOTIFY_TOKEN_KEY, &stored));
        if let Err(e) = stored {
            warn!(target: LOG_TARGET, "Failed to store token: {}", e);
        }
    }

    /// Refresh is exhausted or revoked: forget the token and the stored credential.
    async fn hard_reset(&self, error: &ServiceError) {
        warn!(
            target: LOG_TARGET,
            "Spotify credentials are no longer usable, signing out: {}", error
        );
        self.stop_poller();
        self.stop_realtime_forwarder();
        self.channels.realtime.disconnect().await;
        self.transition(ConnectionStateMachine::token_expired).await;
        self.coordinator.clear_all().await;
        *lock(&self.device) = None;
        if let Err(e) = self.channels.credentials.delete(SPOTIFY_TOKEN_KEY) {
            warn!(target: LOG_TARGET, "Failed to delete stored credentials: {}", e);
        }
    }

    /// Drop the real-time subscription handle. The channel stays connected and the
    /// poller takes over track data until training resumes.
    async fn drop_realtime(&self) {
        if !self.realtime_subscribed() {
            return;
        }
        self.stop_realtime_forwarder();
        self.coordinator.clear_source(SnapshotSource::Realtime).await;
        debug!(target: LOG_TARGET, "Real-time subscription dropped");
    }

    async fn close_channels(&self) {
        self.stop_poller();
        self.stop_realtime_forwarder();
        self.channels.realtime.disconnect().await;
        self.transition(ConnectionStateMachine::disconnect).await;
        self.coordinator.clear_all().await;
        *lock(&self.device) = None;
        info!(target: LOG_TARGET, "Disconnected from Spotify");
    }

    fn ensure_poller(&self) {
        let mut slot = lock(&self.poller_task);
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = self.shutdown.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let poller = NowPlayingPoller::new(self.this.clone(), self.settings.poll_interval, token);
        Arc::new(poller).start();
    }

    fn stop_poller(&self) {
        if let Some(token) = lock(&self.poller_task).take() {
            token.cancel();
        }
    }

    fn start_realtime_forwarder(&self) {
        let mut slot = lock(&self.realtime_task);
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = self.shutdown.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let mut events = self.channels.realtime.subscribe();
        let this = self.this.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(orchestrator) = this.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => orchestrator.on_realtime_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: LOG_TARGET, "Skipped {} real-time events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn stop_realtime_forwarder(&self) {
        if let Some(token) = lock(&self.realtime_task).take() {
            token.cancel();
        }
    }

    async fn on_realtime_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::PlayerState(snapshot) => {
                self.coordinator.update_from_realtime(snapshot).await;
            }
            RealtimeEvent::Disconnected { error } => {
                self.transition(|machine| machine.realtime_disconnected(error.clone()))
                    .await;
                self.coordinator.clear_source(SnapshotSource::Realtime).await;
                match error {
                    Some(e) if e.is_background_class() => {
                        debug!(target: LOG_TARGET, "Real-time channel paused: {}", e);
                    }
                    other => {
                        self.report(
                            other.unwrap_or(ServiceError::RealtimeDisconnected),
                            RecoveryOperation::ReconnectRealtime,
                        );
                    }
                }
            }
        }
    }
}

impl Drop for SpotifyOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TrainingPlayback for SpotifyOrchestrator {
    async fn start_session(&self) -> ServiceResult<()> {
        self.set_intent(Intent::Training).await;
        self.activate_for_training(&self.settings.high_intensity_playlist)
            .await
    }

    async fn play_phase(&self, phase: IntervalPhase) -> ServiceResult<()> {
        match phase {
            IntervalPhase::HighIntensity => self.play_high_intensity().await,
            IntervalPhase::Rest => self.play_rest().await,
            IntervalPhase::NotStarted | IntervalPhase::Completed => Ok(()),
        }
    }

    async fn pause_playback(&self) -> ServiceResult<()> {
        self.pause().await
    }

    async fn resume_playback(&self) -> ServiceResult<()> {
        self.resume().await
    }

    async fn end_session(&self) -> ServiceResult<()> {
        *lock(&self.device) = None;
        self.set_intent(Intent::Idle).await;
        self.pause().await
    }
}

/// The active unrestricted device, else the first unrestricted one.
fn choose_device(devices: &[PlaybackDevice]) -> Option<&PlaybackDevice> {
    devices
        .iter()
        .find(|device| device.is_active && !device.is_restricted)
        .or_else(|| devices.iter().find(|device| !device.is_restricted))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, is_active: bool, is_restricted: bool) -> PlaybackDevice {
        PlaybackDevice {
            id: id.into(),
            name: id.into(),
            is_active,
            is_restricted,
        }
    }

    #[test]
    fn test_choose_device_prefers_active() {
        let devices = [
            device("phone", false, false),
            device("speaker", true, false),
        ];
        assert_eq!(choose_device(&devices).unwrap().id, "speaker");
    }

    #[test]
    fn test_choose_device_skips_restricted() {
        let devices = [device("tv", true, true), device("laptop", false, false)];
        assert_eq!(choose_device(&devices).unwrap().id, "laptop");
        assert!(choose_device(&[device("tv", false, true)]).is_none());
        assert!(choose_device(&[]).is_none());
    }
}
