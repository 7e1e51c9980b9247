use std::time::Duration;
use tokio::time::Instant;

/// Channel a snapshot came from. Higher priority wins regardless of recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotSource {
    Optimistic = 1,
    RequestApi = 2,
    Realtime = 3,
}

impl SnapshotSource {
    /// All sources, highest priority first.
    pub const BY_PRIORITY: [Self; 3] = [Self::Realtime, Self::RequestApi, Self::Optimistic];

    #[must_use]
    pub const fn priority(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::RequestApi => "request_api",
            Self::Optimistic => "optimistic",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Realtime => 0,
            Self::RequestApi => 1,
            Self::Optimistic => 2,
        }
    }
}

impl std::fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of what is playing, as reported by one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSnapshot {
    pub name: String,
    pub artist: String,
    /// Spotify URI of the track or episode
    pub uri: String,
    /// Artwork URL, empty when unknown
    pub artwork: String,
    pub duration: Duration,
    pub position: Duration,
    pub is_playing: bool,
    pub source: SnapshotSource,
    /// When the position was sampled (for interpolation)
    pub captured_at: Instant,
}

/// Durations within this distance are considered the same track length.
const DURATION_TOLERANCE: Duration = Duration::from_secs(1);

impl TrackSnapshot {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        artist: impl Into<String>,
        uri: impl Into<String>,
        duration: Duration,
        source: SnapshotSource,
    ) -> Self {
        Self {
            name: name.into(),
            artist: artist.into(),
            uri: uri.into(),
            artwork: String::new(),
            duration,
            position: Duration::ZERO,
            is_playing: false,
            source,
            captured_at: Instant::now(),
        }
    }

    /// Sentinel meaning "no data yet" for `source`.
    #[must_use]
    pub fn empty(source: SnapshotSource) -> Self {
        Self::new("", "", "", Duration::ZERO, source)
    }

    #[must_use]
    pub fn with_artwork(mut self, artwork: impl Into<String>) -> Self {
        self.artwork = artwork.into();
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: Duration) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub const fn with_playing(mut self, is_playing: bool) -> Self {
        self.is_playing = is_playing;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: SnapshotSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uri.is_empty() && self.name.is_empty()
    }

    /// Whether both snapshots describe the same track, ignoring playback state.
    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        self.uri == other.uri && self.name == other.name && self.artist == other.artist
    }

    /// Dedup equality: identity, playing flag, artwork when both sides know it, and
    /// duration within one second. Position and source are ignored.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let artwork_matches =
            self.artwork.is_empty() || other.artwork.is_empty() || self.artwork == other.artwork;
        self.same_track(other)
            && self.is_playing == other.is_playing
            && artwork_matches
            && self.duration.abs_diff(other.duration) <= DURATION_TOLERANCE
    }

    /// Position advanced by the time elapsed since capture while playing.
    #[must_use]
    pub fn interpolated_position(&self) -> Duration {
        if !self.is_playing {
            return self.position;
        }

        let interpolated = self.position + self.captured_at.elapsed();
        if self.duration.is_zero() {
            interpolated
        } else {
            interpolated.min(self.duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(source: SnapshotSource) -> TrackSnapshot {
        TrackSnapshot::new(
            "Song",
            "Artist",
            "spotify:track:abc",
            Duration::from_secs(180),
            source,
        )
        .with_playing(true)
    }

    #[test]
    fn test_priority_order() {
        assert!(SnapshotSource::Realtime.priority() > SnapshotSource::RequestApi.priority());
        assert!(SnapshotSource::RequestApi.priority() > SnapshotSource::Optimistic.priority());
        assert_eq!(SnapshotSource::BY_PRIORITY[0], SnapshotSource::Realtime);
    }

    #[test]
    fn test_empty_sentinel() {
        assert!(TrackSnapshot::empty(SnapshotSource::Realtime).is_empty());
        assert!(!song(SnapshotSource::Realtime).is_empty());
    }

    #[test]
    fn test_same_content_ignores_position_and_source() {
        let a = song(SnapshotSource::Realtime).with_position(Duration::from_secs(10));
        let b = song(SnapshotSource::RequestApi).with_position(Duration::from_secs(90));
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_same_content_duration_tolerance() {
        let a = song(SnapshotSource::Realtime);
        let mut b = a.clone();
        b.duration = Duration::from_millis(180_900);
        assert!(a.same_content(&b));
        b.duration = Duration::from_millis(181_500);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_same_content_artwork_only_when_both_known() {
        let a = song(SnapshotSource::Realtime);
        let b = a.clone().with_artwork("https://i.scdn.co/image/1");
        assert!(a.same_content(&b));
        let c = a.clone().with_artwork("https://i.scdn.co/image/2");
        assert!(!b.same_content(&c));
    }

    #[test]
    fn test_same_content_playing_flag() {
        let a = song(SnapshotSource::Realtime);
        let b = a.clone().with_playing(false);
        assert!(a.same_track(&b));
        assert!(!a.same_content(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interpolated_position() {
        let playing = song(SnapshotSource::Realtime).with_position(Duration::from_secs(175));
        let paused = playing.clone().with_playing(false);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(playing.interpolated_position(), Duration::from_secs(178));
        assert_eq!(paused.interpolated_position(), Duration::from_secs(175));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(playing.interpolated_position(), Duration::from_secs(180));
    }
}
