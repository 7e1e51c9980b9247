//! Merges now-playing snapshots from the real-time channel, the request API and local
//! optimistic predictions into a single current value.

use crate::track::{SnapshotSource, TrackSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

const LOG_TARGET: &str = "runbeat::coordinator";

/// Identical snapshots from one source are dropped for this long, and a published value
/// this old is republished even when unchanged.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(30);

/// Published whenever `current` changes or is refreshed after going stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackUpdate {
    /// `None` once every source has been cleared
    pub track: Option<TrackSnapshot>,
    pub source: Option<SnapshotSource>,
}

#[derive(Debug, Clone)]
struct SourceSlot {
    snapshot: TrackSnapshot,
    accepted_at: Instant,
}

#[derive(Debug, Default)]
struct CoordinatorInner {
    slots: [Option<SourceSlot>; 3],
    current: Option<TrackSnapshot>,
    last_updated: Option<Instant>,
}

impl CoordinatorInner {
    fn best(&self) -> Option<&TrackSnapshot> {
        SnapshotSource::BY_PRIORITY
            .iter()
            .filter_map(|source| self.slots[source.index()].as_ref())
            .map(|slot| &slot.snapshot)
            .find(|snapshot| !snapshot.is_empty())
    }

    fn is_consistent(&self) -> bool {
        let populated: Vec<&TrackSnapshot> = self
            .slots
            .iter()
            .flatten()
            .map(|slot| &slot.snapshot)
            .filter(|snapshot| !snapshot.is_empty())
            .collect();

        populated.windows(2).all(|pair| {
            pair[0].same_track(pair[1]) && pair[0].is_playing == pair[1].is_playing
        })
    }

    /// Recompute `current`; returns the update to publish, if any.
    fn reconcile(&mut self, now: Instant) -> Option<TrackUpdate> {
        let candidate = self.best().cloned();

        let changed = match (&self.current, &candidate) {
            (None, None) => false,
            (Some(current), Some(next)) => {
                current.source != next.source || !current.same_content(next)
            }
            _ => true,
        };
        let stale = self
            .last_updated
            .is_some_and(|at| now.duration_since(at) >= STALENESS_WINDOW);

        if changed || (stale && candidate.is_some()) {
            self.last_updated = Some(now);
            self.current = candidate;
            Some(TrackUpdate {
                source: self.current.as_ref().map(|t| t.source),
                track: self.current.clone(),
            })
        } else {
            None
        }
    }
}

/// Reconciles track snapshots by source priority first and recency second.
///
/// Consumers only ever see the reconciled value through [`Self::current`] and
/// [`Self::subscribe`].
pub struct TrackDataCoordinator {
    inner: RwLock<CoordinatorInner>,
    update_tx: broadcast::Sender<TrackUpdate>,
}

impl TrackDataCoordinator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to published changes of the current track
    pub fn subscribe(&self) -> broadcast::Receiver<TrackUpdate> {
        self.update_tx.subscribe()
    }

    /// Returns true when a new current value was published.
    pub async fn update_from_realtime(&self, snapshot: TrackSnapshot) -> bool {
        self.update(snapshot.with_source(SnapshotSource::Realtime))
            .await
    }

    /// Returns true when a new current value was published.
    pub async fn update_from_request_api(&self, snapshot: TrackSnapshot) -> bool {
        self.update(snapshot.with_source(SnapshotSource::RequestApi))
            .await
    }

    /// Returns true when a new current value was published.
    pub async fn update_optimistic(&self, snapshot: TrackSnapshot) -> bool {
        self.update(snapshot.with_source(SnapshotSource::Optimistic))
            .await
    }

    async fn update(&self, snapshot: TrackSnapshot) -> bool {
        let now = Instant::now();
        let source = snapshot.source;
        let mut inner = self.inner.write().await;

        if let Some(previous) = &inner.slots[source.index()] {
            if previous.snapshot.same_content(&snapshot)
                && now.duration_since(previous.accepted_at) < STALENESS_WINDOW
            {
                return false;
            }
        }

        debug!(
            target: LOG_TARGET,
            "Accepted {} snapshot: {} - {} (playing: {})",
            source,
            snapshot.artist,
            snapshot.name,
            snapshot.is_playing
        );
        inner.slots[source.index()] = Some(SourceSlot {
            snapshot,
            accepted_at: now,
        });

        if !inner.is_consistent() {
            warn!(target: LOG_TARGET, "Track sources disagree on what is playing");
        }

        self.publish(inner.reconcile(now))
    }

    /// Forget the last snapshot from one source.
    pub async fn clear_source(&self, source: SnapshotSource) -> bool {
        let mut inner = self.inner.write().await;
        if inner.slots[source.index()].take().is_none() {
            return false;
        }
        debug!(target: LOG_TARGET, "Cleared {} source", source);
        let update = inner.reconcile(Instant::now());
        self.publish(update)
    }

    /// Forget every source and the current value.
    pub async fn clear_all(&self) {
        let mut inner = self.inner.write().await;
        let had_current = inner.current.is_some();
        *inner = CoordinatorInner::default();
        if had_current {
            debug!(target: LOG_TARGET, "Cleared all track sources");
            self.publish(Some(TrackUpdate {
                track: None,
                source: None,
            }));
        }
    }

    /// False when two populated sources disagree on the track or the playing flag.
    pub async fn validate_consistency(&self) -> bool {
        self.inner.read().await.is_consistent()
    }

    pub async fn current(&self) -> Option<TrackSnapshot> {
        self.inner.read().await.current.clone()
    }

    pub async fn source_in_use(&self) -> Option<SnapshotSource> {
        self.inner.read().await.current.as_ref().map(|t| t.source)
    }

    /// When `current` was last published.
    pub async fn last_updated(&self) -> Option<Instant> {
        self.inner.read().await.last_updated
    }

    fn publish(&self, update: Option<TrackUpdate>) -> bool {
        match update {
            Some(update) => {
                // No subscribers is fine
                let _ = self.update_tx.send(update);
                true
            }
            None => false,
        }
    }
}

impl Default for TrackDataCoordinator {
    fn default() -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(CoordinatorInner::default()),
            update_tx,
        }
    }
}
