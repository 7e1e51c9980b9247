//! Request-API now-playing polling while the real-time channel is down.

use crate::orchestrator::SpotifyOrchestrator;
use runbeat_core::RecoveryOperation;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "runbeat::spotify::poller";

/// Polls `currently-playing` every `poll_interval` and feeds the coordinator through
/// the orchestrator. Ticks are skipped while a real-time subscription is live, while
/// the intent is `Disconnected`, and while recovery has a fetch retry scheduled.
pub struct NowPlayingPoller {
    orchestrator: Weak<SpotifyOrchestrator>,
    poll_interval: Duration,
    cancel_token: CancellationToken,
}

impl NowPlayingPoller {
    #[must_use]
    pub const fn new(
        orchestrator: Weak<SpotifyOrchestrator>,
        poll_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            poll_interval,
            cancel_token,
        }
    }

    /// Start polling in a background task
    #[must_use = "the handle can be awaited to wait for the poller to stop"]
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        info!(target: LOG_TARGET, "Starting now-playing poller");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: LOG_TARGET, "Poller shutting down");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let Some(orchestrator) = self.orchestrator.upgrade() else {
                break;
            };
            if !orchestrator.should_poll() {
                continue;
            }
            // Retries of a failed fetch belong to the recovery engine
            if orchestrator
                .recovery()
                .has_task(&RecoveryOperation::FetchNowPlaying)
            {
                debug!(target: LOG_TARGET, "Fetch recovery pending, skipping poll");
                continue;
            }

            match orchestrator.fetch_now_playing().await {
                Ok(snapshot) => debug!(
                    target: LOG_TARGET,
                    "Polled now playing: {:?}",
                    snapshot.as_ref().map(|s| &s.name)
                ),
                Err(e) => warn!(target: LOG_TARGET, "Poll failed: {}", e),
            }
        }
    }
}
