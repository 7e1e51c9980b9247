//! Pure recovery policy: `(error, context) -> RecoveryDecision`.

use crate::error::ServiceError;
use crate::intent::Intent;
use crate::time::DurationExt;
use std::time::Duration;

/// Concurrency class of a recovery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Needed for the workout to work at all
    Critical,
    /// Improves the experience during training
    Enhancing,
    Background,
}

impl Priority {
    pub const ALL: [Self; 3] = [Self::Critical, Self::Enhancing, Self::Background];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Enhancing => "enhancing",
            Self::Background => "background",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when an operation will not be retried (or cannot be scheduled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackStrategy {
    DegradeToRequestApi,
    ContinueWithoutData,
    NotifyUser,
    SilentFailure,
}

impl FallbackStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DegradeToRequestApi => "degrade_to_request_api",
            Self::ContinueWithoutData => "continue_without_data",
            Self::NotifyUser => "notify_user",
            Self::SilentFailure => "silent_failure",
        }
    }
}

impl std::fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Realtime,
    RequestApi,
    Auth,
}

/// Inputs to [`decide`] besides the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryContext {
    pub intent: Intent,
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    pub channel: ChannelKind,
}

impl RecoveryContext {
    #[must_use]
    pub const fn new(intent: Intent, attempt: u32, channel: ChannelKind) -> Self {
        Self {
            intent,
            attempt,
            channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub should_retry: bool,
    pub suggested_delay: Duration,
    pub priority: Priority,
    pub fallback: FallbackStrategy,
    /// Token refresh must run even when the intent would not admit its priority
    pub bypasses_intent: bool,
    pub reasoning: String,
}

impl RecoveryDecision {
    fn retry(delay: Duration, priority: Priority, fallback: FallbackStrategy, reasoning: String) -> Self {
        Self {
            should_retry: true,
            suggested_delay: delay,
            priority,
            fallback,
            bypasses_intent: false,
            reasoning,
        }
    }

    fn give_up(priority: Priority, fallback: FallbackStrategy, reasoning: String) -> Self {
        Self {
            should_retry: false,
            suggested_delay: Duration::ZERO,
            priority,
            fallback,
            bypasses_intent: false,
            reasoning,
        }
    }

    /// Turn a retry into a give-up, keeping priority and fallback.
    fn unless(mut self, allowed: bool, reasoning: impl FnOnce() -> String) -> Self {
        if !allowed {
            self.should_retry = false;
            self.suggested_delay = Duration::ZERO;
            self.reasoning = reasoning();
        }
        self
    }
}

const REALTIME_BACKOFF_STEP: Duration = Duration::from_secs(1);
const NETWORK_BACKOFF_STEP: Duration = Duration::from_secs(2);
const NETWORK_BACKOFF_CAP: Duration = Duration::from_secs(8);
const NETWORK_MAX_ATTEMPTS: u32 = 2;
const RATE_LIMIT_DEFAULT_DELAY: Duration = Duration::from_secs(5);
const RATE_LIMIT_MAX_ATTEMPTS: u32 = 3;
const SERVER_BACKOFF_BASE: Duration = Duration::from_secs(2);
const SERVER_BACKOFF_CAP: Duration = Duration::from_secs(30);
const SERVER_MAX_ATTEMPTS: u32 = 3;
const MALFORMED_MAX_ATTEMPTS: u32 = 1;
const TOKEN_REFRESH_MAX_ATTEMPTS: u32 = 3;

/// Tunable limits of the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Real-time reconnects stop once this many attempts have failed
    pub max_realtime_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_realtime_attempts: 3,
        }
    }
}

impl RecoveryPolicy {
    /// Decide how to react to `error` under `context`.
    #[must_use]
    pub fn decide(&self, error: &ServiceError, context: &RecoveryContext) -> RecoveryDecision {
        let mut decision = self
            .decide_for_error(error, context)
            .unless(context.intent != Intent::Disconnected, || {
                format!("{error}: not retrying while disconnected")
            });
        decision.bypasses_intent &= decision.should_retry;
        decision
    }

    fn decide_for_error(&self, error: &ServiceError, context: &RecoveryContext) -> RecoveryDecision {
        let attempt = context.attempt.max(1);
        let training = context.intent == Intent::Training;
        let intent_priority = if training {
            Priority::Enhancing
        } else {
            Priority::Background
        };

        match error {
            ServiceError::RealtimeDisconnected | ServiceError::RealtimeConnectionFailed { .. }
                if !training =>
            {
                RecoveryDecision::give_up(
                    Priority::Background,
                    FallbackStrategy::SilentFailure,
                    format!("{error}: real-time channel is not needed outside training"),
                )
            }
            ServiceError::RealtimeDisconnected | ServiceError::RealtimeConnectionFailed { .. } => {
                RecoveryDecision::retry(
                    REALTIME_BACKOFF_STEP.mul_capped(attempt, Duration::MAX),
                    Priority::Critical,
                    FallbackStrategy::DegradeToRequestApi,
                    format!("{error}: reconnecting during training (attempt {attempt})"),
                )
                .unless(attempt < self.max_realtime_attempts, || {
                    format!("{error}: reconnect attempts exhausted, using request API")
                })
            }
            ServiceError::TokenExpired => {
                let mut decision = RecoveryDecision::retry(
                    Duration::ZERO,
                    Priority::Critical,
                    FallbackStrategy::NotifyUser,
                    format!("{error}: refreshing token (attempt {attempt})"),
                )
                .unless(attempt <= TOKEN_REFRESH_MAX_ATTEMPTS, || {
                    format!("{error}: token refresh keeps failing")
                });
                decision.bypasses_intent = decision.should_retry;
                decision
            }
            ServiceError::AuthRevoked { .. } => RecoveryDecision::give_up(
                Priority::Critical,
                FallbackStrategy::NotifyUser,
                format!("{error}: user must sign in again"),
            ),
            ServiceError::NetworkTimeout
            | ServiceError::NetworkUnavailable { .. }
            | ServiceError::ConnectionLost
            | ServiceError::AppBackgrounded => RecoveryDecision::retry(
                NETWORK_BACKOFF_STEP.mul_capped(attempt, NETWORK_BACKOFF_CAP),
                intent_priority,
                FallbackStrategy::ContinueWithoutData,
                format!("{error}: transient network failure (attempt {attempt})"),
            )
            .unless(attempt <= NETWORK_MAX_ATTEMPTS, || {
                format!("{error}: network still failing, continuing without data")
            }),
            ServiceError::RateLimited { retry_after } => RecoveryDecision::retry(
                retry_after.unwrap_or(RATE_LIMIT_DEFAULT_DELAY),
                intent_priority,
                FallbackStrategy::DegradeToRequestApi,
                format!("{error}: backing off (attempt {attempt})"),
            )
            .unless(attempt <= RATE_LIMIT_MAX_ATTEMPTS, || {
                format!("{error}: still rate limited")
            }),
            ServiceError::ContentNotFound { .. }
            | ServiceError::DeviceNotFound
            | ServiceError::InsufficientPermissions => RecoveryDecision::give_up(
                Priority::Background,
                FallbackStrategy::NotifyUser,
                format!("{error}: needs user action"),
            ),
            ServiceError::NoData => RecoveryDecision::give_up(
                Priority::Background,
                FallbackStrategy::ContinueWithoutData,
                format!("{error}: nothing playing"),
            ),
            ServiceError::AppNotInstalled => RecoveryDecision::give_up(
                Priority::Background,
                FallbackStrategy::DegradeToRequestApi,
                format!("{error}: using request API only"),
            ),
            ServiceError::ServerError { .. } | ServiceError::ServiceUnavailable => {
                let fallback = if context.channel == ChannelKind::Realtime {
                    FallbackStrategy::DegradeToRequestApi
                } else {
                    FallbackStrategy::ContinueWithoutData
                };
                RecoveryDecision::retry(
                    exponential_backoff(attempt),
                    intent_priority,
                    fallback,
                    format!("{error}: service trouble (attempt {attempt})"),
                )
                .unless(attempt <= SERVER_MAX_ATTEMPTS, || {
                    format!("{error}: service still failing")
                })
            }
            ServiceError::InvalidResponse { .. } | ServiceError::DecodeFailure { .. } => {
                RecoveryDecision::retry(
                    exponential_backoff(attempt),
                    intent_priority,
                    FallbackStrategy::ContinueWithoutData,
                    format!("{error}: retrying once"),
                )
                .unless(attempt <= MALFORMED_MAX_ATTEMPTS, || {
                    format!("{error}: ignoring malformed data")
                })
            }
        }
    }
}

/// Decide with the default policy limits.
#[must_use]
pub fn decide(error: &ServiceError, context: &RecoveryContext) -> RecoveryDecision {
    RecoveryPolicy::default().decide(error, context)
}

/// `base * 2^(attempt - 1)`, capped.
fn exponential_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    SERVER_BACKOFF_BASE.mul_capped(1 << exponent, SERVER_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(intent: Intent, attempt: u32) -> RecoveryContext {
        RecoveryContext::new(intent, attempt, ChannelKind::Realtime)
    }

    #[test]
    fn test_realtime_disconnect_during_training() {
        let decision = decide(&ServiceError::RealtimeDisconnected, &ctx(Intent::Training, 1));
        assert!(decision.should_retry);
        assert_eq!(decision.suggested_delay, Duration::from_secs(1));
        assert_eq!(decision.priority, Priority::Critical);
        assert_eq!(decision.fallback, FallbackStrategy::DegradeToRequestApi);

        let second = decide(&ServiceError::RealtimeDisconnected, &ctx(Intent::Training, 2));
        assert_eq!(second.suggested_delay, Duration::from_secs(2));

        let third = decide(&ServiceError::RealtimeDisconnected, &ctx(Intent::Training, 3));
        assert!(!third.should_retry);
        assert_eq!(third.fallback, FallbackStrategy::DegradeToRequestApi);
    }

    #[test]
    fn test_realtime_disconnect_while_idle() {
        let decision = decide(&ServiceError::RealtimeDisconnected, &ctx(Intent::Idle, 1));
        assert!(!decision.should_retry);
        assert_eq!(decision.priority, Priority::Background);
        assert_eq!(decision.fallback, FallbackStrategy::SilentFailure);
    }

    #[test]
    fn test_disconnected_never_retries() {
        for error in [
            ServiceError::TokenExpired,
            ServiceError::NetworkTimeout,
            ServiceError::ServiceUnavailable,
        ] {
            let decision = decide(&error, &ctx(Intent::Disconnected, 1));
            assert!(!decision.should_retry, "{error}");
            assert!(!decision.bypasses_intent);
        }
    }

    #[test]
    fn test_token_expired() {
        let context = RecoveryContext::new(Intent::Idle, 1, ChannelKind::Auth);
        let decision = decide(&ServiceError::TokenExpired, &context);
        assert!(decision.should_retry);
        assert!(decision.bypasses_intent);
        assert_eq!(decision.suggested_delay, Duration::ZERO);
        assert_eq!(decision.priority, Priority::Critical);
        assert_eq!(decision.fallback, FallbackStrategy::NotifyUser);

        let context = RecoveryContext::new(Intent::Idle, 4, ChannelKind::Auth);
        assert!(!decide(&ServiceError::TokenExpired, &context).should_retry);
    }

    #[test]
    fn test_auth_revoked_notifies() {
        let error = ServiceError::AuthRevoked {
            reason: "invalid_grant".into(),
        };
        let decision = decide(&error, &ctx(Intent::Training, 1));
        assert!(!decision.should_retry);
        assert_eq!(decision.fallback, FallbackStrategy::NotifyUser);
    }

    #[test]
    fn test_network_backoff() {
        let training = decide(&ServiceError::NetworkTimeout, &ctx(Intent::Training, 2));
        assert!(training.should_retry);
        assert_eq!(training.suggested_delay, Duration::from_secs(4));
        assert_eq!(training.priority, Priority::Enhancing);

        let idle = decide(&ServiceError::NetworkTimeout, &ctx(Intent::Idle, 1));
        assert_eq!(idle.priority, Priority::Background);

        let exhausted = decide(&ServiceError::NetworkTimeout, &ctx(Intent::Training, 3));
        assert!(!exhausted.should_retry);
        assert_eq!(exhausted.fallback, FallbackStrategy::ContinueWithoutData);
    }

    #[test]
    fn test_rate_limited_uses_retry_after() {
        let error = ServiceError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(
            decide(&error, &ctx(Intent::Training, 1)).suggested_delay,
            Duration::from_secs(12)
        );
        let error = ServiceError::RateLimited { retry_after: None };
        let decision = decide(&error, &ctx(Intent::Training, 1));
        assert_eq!(decision.suggested_delay, Duration::from_secs(5));
        assert_eq!(decision.fallback, FallbackStrategy::DegradeToRequestApi);
        assert!(!decide(&error, &ctx(Intent::Training, 4)).should_retry);
    }

    #[test]
    fn test_server_error_backoff_and_fallback_by_channel() {
        let error = ServiceError::ServerError { status: 500 };
        let delays: Vec<Duration> = (1..=3)
            .map(|attempt| decide(&error, &ctx(Intent::Training, attempt)).suggested_delay)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert_eq!(exponential_backoff(10), Duration::from_secs(30));

        let request_ctx = RecoveryContext::new(Intent::Training, 1, ChannelKind::RequestApi);
        assert_eq!(
            decide(&error, &request_ctx).fallback,
            FallbackStrategy::ContinueWithoutData
        );
        assert_eq!(
            decide(&error, &ctx(Intent::Training, 1)).fallback,
            FallbackStrategy::DegradeToRequestApi
        );
    }

    #[test]
    fn test_user_actionable_errors() {
        for error in [
            ServiceError::DeviceNotFound,
            ServiceError::InsufficientPermissions,
            ServiceError::ContentNotFound {
                uri: "spotify:playlist:x".into(),
            },
        ] {
            let decision = decide(&error, &ctx(Intent::Training, 1));
            assert!(!decision.should_retry);
            assert_eq!(decision.fallback, FallbackStrategy::NotifyUser);
            assert_eq!(decision.priority, Priority::Background);
        }
        assert_eq!(
            decide(&ServiceError::AppNotInstalled, &ctx(Intent::Training, 1)).fallback,
            FallbackStrategy::DegradeToRequestApi
        );
    }

    #[test]
    fn test_malformed_data_retried_once() {
        let error = ServiceError::DecodeFailure {
            reason: "missing field".into(),
        };
        assert!(decide(&error, &ctx(Intent::Training, 1)).should_retry);
        assert!(!decide(&error, &ctx(Intent::Training, 2)).should_retry);
        assert_eq!(
            decide(&ServiceError::NoData, &ctx(Intent::Training, 1)).fallback,
            FallbackStrategy::ContinueWithoutData
        );
    }

    #[test]
    fn test_custom_realtime_limit() {
        let policy = RecoveryPolicy {
            max_realtime_attempts: 5,
        };
        assert!(
            policy
                .decide(&ServiceError::RealtimeDisconnected, &ctx(Intent::Training, 4))
                .should_retry
        );
    }
}
