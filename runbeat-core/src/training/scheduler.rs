use super::interval::{IntervalPhase, IntervalState, TrainingProtocol};
use crate::config::TrainingConfig;
use crate::error::ServiceError;
use crate::time::DurationExt;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "runbeat::training";

/// Delay before the single corrective retry of a failed playback command.
const COMMAND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Playback side effects of the training session.
#[async_trait]
pub trait TrainingPlayback: Send + Sync {
    /// Activate a device for training and start high-intensity music.
    async fn start_session(&self) -> Result<(), ServiceError>;

    /// Switch to the playlist of `phase`.
    async fn play_phase(&self, phase: IntervalPhase) -> Result<(), ServiceError>;

    async fn pause_playback(&self) -> Result<(), ServiceError>;

    /// Continue whatever was playing before the last pause.
    async fn resume_playback(&self) -> Result<(), ServiceError>;

    /// Pause playback and forget device activation.
    async fn end_session(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackCommand {
    StartSession,
    PlayPhase(IntervalPhase),
    Pause,
    Resume,
    EndSession,
}

impl PlaybackCommand {
    async fn run(self, playback: &dyn TrainingPlayback) -> Result<(), ServiceError> {
        match self {
            Self::StartSession => playback.start_session().await,
            Self::PlayPhase(phase) => playback.play_phase(phase).await,
            Self::Pause => playback.pause_playback().await,
            Self::Resume => playback.resume_playback().await,
            Self::EndSession => playback.end_session().await,
        }
    }
}

/// Snapshot for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainingStatus {
    pub phase: IntervalPhase,
    pub interval: u32,
    pub total_intervals: u32,
    pub remaining_secs: u32,
    pub is_paused: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    interval: IntervalState,
    ticker: Option<CancellationToken>,
    /// Interval index in which a resume already restarted the phase playlist
    replayed_interval: Option<u32>,
    commands: Option<mpsc::UnboundedSender<PlaybackCommand>>,
}

/// Drives the interval protocol from the wall clock and switches playlists at phase
/// boundaries. Playback failures are logged and never block the workout.
pub struct IntervalTrainingScheduler {
    protocol: TrainingProtocol,
    tick_period: Duration,
    playback: Arc<dyn TrainingPlayback>,
    state: Mutex<SchedulerState>,
    status_tx: watch::Sender<TrainingStatus>,
}

impl IntervalTrainingScheduler {
    #[must_use]
    pub fn new(config: &TrainingConfig, playback: Arc<dyn TrainingPlayback>) -> Arc<Self> {
        Self::with_protocol(
            TrainingProtocol::from(config),
            Duration::from_millis(config.tick_ms),
            playback,
        )
    }

    #[must_use]
    pub fn with_protocol(
        protocol: TrainingProtocol,
        tick_period: Duration,
        playback: Arc<dyn TrainingPlayback>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TrainingStatus {
            total_intervals: protocol.total_intervals,
            ..TrainingStatus::default()
        });
        Arc::new(Self {
            protocol,
            tick_period,
            playback,
            state: Mutex::new(SchedulerState::default()),
            status_tx,
        })
    }

    /// Observe phase, interval index, remaining seconds and the paused flag.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TrainingStatus> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> TrainingStatus {
        *self.status_tx.borrow()
    }

    #[must_use]
    pub const fn protocol(&self) -> &TrainingProtocol {
        &self.protocol
    }

    /// Begin interval 1 (high intensity) now. Only a `NotStarted` scheduler starts;
    /// a completed session must be stopped first.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.interval.phase != IntervalPhase::NotStarted {
            warn!(
                target: LOG_TARGET,
                "Training is {}, ignoring start", state.interval.phase
            );
            return;
        }

        state.interval = IntervalState::begin(&self.protocol, Instant::now());
        state.replayed_interval = None;
        info!(
            target: LOG_TARGET,
            "Training started: {} intervals", self.protocol.total_intervals
        );
        self.send(&mut state, PlaybackCommand::StartSession);
        self.start_ticker(&mut state);
        self.publish(&state);
    }

    /// Recompute the current phase from the wall clock.
    pub async fn tick(&self) {
        let mut state = self.state.lock().await;
        if !state.interval.phase.is_running() || state.interval.is_paused() {
            return;
        }

        if state.interval.advance(&self.protocol, Instant::now()) {
            let phase = state.interval.phase;
            let interval = state.interval.interval;
            if phase == IntervalPhase::Completed {
                info!(target: LOG_TARGET, "Training completed");
                if let Some(ticker) = state.ticker.take() {
                    ticker.cancel();
                }
                self.send(&mut state, PlaybackCommand::Pause);
            } else {
                // `advance` only moves forward, so each index gets one switch
                info!(target: LOG_TARGET, "Interval {}: {}", interval, phase);
                self.send(&mut state, PlaybackCommand::PlayPhase(phase));
            }
        }

        self.publish(&state);
    }

    /// Freeze the countdown and pause playback.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if !state.interval.pause(Instant::now()) {
            return;
        }
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
        debug!(target: LOG_TARGET, "Training paused");
        self.send(&mut state, PlaybackCommand::Pause);
        self.publish(&state);
    }

    /// Continue where the countdown was frozen. The first resume in an interval
    /// re-issues the phase playlist; later ones within the same interval only resume.
    pub async fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if !state.interval.resume(Instant::now()) {
            return;
        }
        let phase = state.interval.phase;
        let interval = state.interval.interval;
        let command = if state.replayed_interval == Some(interval) {
            PlaybackCommand::Resume
        } else {
            state.replayed_interval = Some(interval);
            PlaybackCommand::PlayPhase(phase)
        };
        debug!(target: LOG_TARGET, "Training resumed in {}", phase);
        self.send(&mut state, command);
        self.start_ticker(&mut state);
        self.publish(&state);
    }

    /// Halt the session and reset to `NotStarted`.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.interval.phase == IntervalPhase::NotStarted {
            return;
        }
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
        state.interval = IntervalState::default();
        state.replayed_interval = None;
        info!(target: LOG_TARGET, "Training stopped");
        self.send(&mut state, PlaybackCommand::EndSession);
        self.publish(&state);
    }

    fn start_ticker(self: &Arc<Self>, state: &mut SchedulerState) {
        if let Some(previous) = state.ticker.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        state.ticker = Some(token.clone());

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => scheduler.tick().await,
                }
            }
        });
    }

    fn send(&self, state: &mut SchedulerState, command: PlaybackCommand) {
        let sender = state
            .commands
            .get_or_insert_with(|| spawn_command_worker(Arc::clone(&self.playback)));
        if sender.send(command).is_err() {
            warn!(target: LOG_TARGET, "Playback worker gone, dropping {:?}", command);
        }
    }

    fn publish(&self, state: &SchedulerState) {
        let status = TrainingStatus {
            phase: state.interval.phase,
            interval: state.interval.interval,
            total_intervals: self.protocol.total_intervals,
            remaining_secs: state.interval.remaining(Instant::now()).as_secs_u32(),
            is_paused: state.interval.is_paused(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Run playback commands in order, off the tick path.
fn spawn_command_worker(
    playback: Arc<dyn TrainingPlayback>,
) -> mpsc::UnboundedSender<PlaybackCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PlaybackCommand>();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if let Err(e) = command.run(playback.as_ref()).await {
                warn!(target: LOG_TARGET, "{:?} failed, retrying once: {}", command, e);
                tokio::time::sleep(COMMAND_RETRY_DELAY).await;
                if let Err(e) = command.run(playback.as_ref()).await {
                    warn!(target: LOG_TARGET, "{:?} failed again: {}", command, e);
                }
            }
        }
    });
    tx
}
