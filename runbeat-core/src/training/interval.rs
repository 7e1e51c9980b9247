//! Wall-clock anchored interval state.
//!
//! Remaining time is always recomputed from the anchor instant, never decremented, so a
//! missed tick or a suspended process costs nothing but one recomputation.

use crate::config::TrainingConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IntervalPhase {
    #[default]
    NotStarted,
    HighIntensity,
    Rest,
    Completed,
}

impl IntervalPhase {
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::HighIntensity | Self::Rest)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::HighIntensity => "high_intensity",
            Self::Rest => "rest",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for IntervalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase lengths and interval count. Odd intervals are high intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingProtocol {
    pub high_intensity: Duration,
    pub rest: Duration,
    pub total_intervals: u32,
}

impl Default for TrainingProtocol {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

impl From<&TrainingConfig> for TrainingProtocol {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            high_intensity: Duration::from_secs(config.high_intensity_secs),
            rest: Duration::from_secs(config.rest_secs),
            total_intervals: config.total_intervals,
        }
    }
}

impl TrainingProtocol {
    /// Phase of the 1-based `interval`.
    #[must_use]
    pub const fn phase_for(&self, interval: u32) -> IntervalPhase {
        if interval == 0 {
            IntervalPhase::NotStarted
        } else if interval > self.total_intervals {
            IntervalPhase::Completed
        } else if interval % 2 == 1 {
            IntervalPhase::HighIntensity
        } else {
            IntervalPhase::Rest
        }
    }

    #[must_use]
    pub const fn duration_of(&self, phase: IntervalPhase) -> Duration {
        match phase {
            IntervalPhase::HighIntensity => self.high_intensity,
            IntervalPhase::Rest => self.rest,
            IntervalPhase::NotStarted | IntervalPhase::Completed => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntervalState {
    pub phase: IntervalPhase,
    /// 1-based; 0 before the session starts
    pub interval: u32,
    pub started_at: Option<Instant>,
    pub duration: Duration,
    pub paused_at: Option<Instant>,
}

impl IntervalState {
    /// First high-intensity interval anchored at `now`.
    #[must_use]
    pub const fn begin(protocol: &TrainingProtocol, now: Instant) -> Self {
        let phase = protocol.phase_for(1);
        Self {
            phase,
            interval: 1,
            started_at: Some(now),
            duration: protocol.duration_of(phase),
            paused_at: None,
        }
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let until = self.paused_at.unwrap_or(now);
        until.saturating_duration_since(started_at)
    }

    /// Time left in the current phase. Frozen while paused.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        if !self.phase.is_running() {
            return Duration::ZERO;
        }
        self.duration.saturating_sub(self.elapsed(now))
    }

    /// Returns false when not running or already paused.
    pub fn pause(&mut self, now: Instant) -> bool {
        if !self.phase.is_running() || self.is_paused() {
            return false;
        }
        self.paused_at = Some(now);
        true
    }

    /// Shift the anchor forward by the pause length. Returns false when not paused.
    pub fn resume(&mut self, now: Instant) -> bool {
        let Some(paused_at) = self.paused_at.take() else {
            return false;
        };
        if let Some(started_at) = self.started_at.as_mut() {
            *started_at += now.saturating_duration_since(paused_at);
        }
        true
    }

    /// Cross every phase boundary that has passed by `now`, re-anchoring each new phase
    /// at the previous boundary. Returns true when the interval changed.
    pub fn advance(&mut self, protocol: &TrainingProtocol, now: Instant) -> bool {
        let starting_interval = self.interval;

        while self.phase.is_running() && !self.is_paused() {
            let Some(started_at) = self.started_at else {
                break;
            };
            if now.saturating_duration_since(started_at) < self.duration {
                break;
            }

            self.interval += 1;
            self.phase = protocol.phase_for(self.interval);
            if self.phase == IntervalPhase::Completed {
                self.started_at = None;
                self.duration = Duration::ZERO;
                break;
            }
            self.started_at = Some(started_at + self.duration);
            self.duration = protocol.duration_of(self.phase);
        }

        self.interval != starting_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn test_phase_parity() {
        let protocol = TrainingProtocol::default();
        assert_eq!(protocol.phase_for(1), IntervalPhase::HighIntensity);
        assert_eq!(protocol.phase_for(2), IntervalPhase::Rest);
        assert_eq!(protocol.phase_for(7), IntervalPhase::HighIntensity);
        assert_eq!(protocol.phase_for(8), IntervalPhase::Rest);
        assert_eq!(protocol.phase_for(9), IntervalPhase::Completed);
        assert_eq!(protocol.duration_of(IntervalPhase::HighIntensity), secs(240));
        assert_eq!(protocol.duration_of(IntervalPhase::Rest), secs(180));
    }

    #[test]
    fn test_pause_resume_shifts_anchor() {
        let protocol = TrainingProtocol::default();
        let t0 = Instant::now();
        let mut state = IntervalState::begin(&protocol, t0);

        assert!(state.pause(t0 + secs(90)));
        assert_eq!(state.remaining(t0 + secs(400)), secs(150));
        assert!(state.resume(t0 + secs(590)));
        assert_eq!(state.remaining(t0 + secs(590)), secs(150));
        assert_eq!(state.started_at, Some(t0 + secs(500)));
        assert!(!state.resume(t0 + secs(600)));
    }

    #[test]
    fn test_advance_reanchors_at_boundary() {
        let protocol = TrainingProtocol::default();
        let t0 = Instant::now();
        let mut state = IntervalState::begin(&protocol, t0);

        assert!(!state.advance(&protocol, t0 + secs(239)));
        assert!(state.advance(&protocol, t0 + secs(241)));
        assert_eq!(state.phase, IntervalPhase::Rest);
        assert_eq!(state.interval, 2);
        assert_eq!(state.started_at, Some(t0 + secs(240)));
        assert_eq!(state.remaining(t0 + secs(241)), secs(179));
    }

    #[test]
    fn test_advance_catches_up_after_suspension() {
        let protocol = TrainingProtocol::default();
        let t0 = Instant::now();
        let mut state = IntervalState::begin(&protocol, t0);

        // 240 + 180 + 240 = 660s covers three intervals; land 10s into the fourth
        assert!(state.advance(&protocol, t0 + secs(670)));
        assert_eq!(state.interval, 4);
        assert_eq!(state.phase, IntervalPhase::Rest);
        assert_eq!(state.remaining(t0 + secs(670)), secs(170));
    }

    #[test]
    fn test_advance_to_completion() {
        let protocol = TrainingProtocol {
            high_intensity: secs(4),
            rest: secs(3),
            total_intervals: 8,
        };
        let t0 = Instant::now();
        let mut state = IntervalState::begin(&protocol, t0);

        assert!(state.advance(&protocol, t0 + secs(28)));
        assert_eq!(state.phase, IntervalPhase::Completed);
        assert_eq!(state.interval, 9);
        assert_eq!(state.remaining(t0 + secs(28)), Duration::ZERO);
        assert!(!state.advance(&protocol, t0 + secs(100)));
    }

    #[test]
    fn test_paused_state_does_not_advance() {
        let protocol = TrainingProtocol::default();
        let t0 = Instant::now();
        let mut state = IntervalState::begin(&protocol, t0);
        state.pause(t0 + secs(10));
        assert!(!state.advance(&protocol, t0 + secs(1000)));
        assert_eq!(state.interval, 1);
        assert!(!state.pause(t0 + secs(20)));
    }

    #[test]
    fn test_not_started() {
        let state = IntervalState::default();
        assert_eq!(state.phase, IntervalPhase::NotStarted);
        assert_eq!(state.remaining(Instant::now()), Duration::ZERO);
    }
}
