use super::decision::ChannelKind;

/// Operations the recovery engine knows how to re-run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecoveryOperation {
    ReconnectRealtime,
    RefreshToken,
    FetchNowPlaying,
    StartPlayback { uri: String },
    PausePlayback,
    ResumePlayback,
    ActivateDevice { uri: String },
}

impl RecoveryOperation {
    /// Arena key. At most one recovery task exists per key.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::ReconnectRealtime => "reconnect_realtime",
            Self::RefreshToken => "refresh_token",
            Self::FetchNowPlaying => "fetch_now_playing",
            Self::StartPlayback { .. } => "start_playback",
            Self::PausePlayback => "pause_playback",
            Self::ResumePlayback => "resume_playback",
            Self::ActivateDevice { .. } => "activate_device",
        }
    }

    /// Channel whose failure this operation recovers from.
    #[must_use]
    pub const fn channel(&self) -> ChannelKind {
        match self {
            Self::ReconnectRealtime => ChannelKind::Realtime,
            Self::RefreshToken => ChannelKind::Auth,
            Self::FetchNowPlaying
            | Self::StartPlayback { .. }
            | Self::PausePlayback
            | Self::ResumePlayback
            | Self::ActivateDevice { .. } => ChannelKind::RequestApi,
        }
    }
}

impl std::fmt::Display for RecoveryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}
