//! Intent-aware error recovery.
//!
//! [`decide`] is a pure policy. [`ErrorRecoveryEngine`] tracks attempts per operation,
//! runs decisions as cancellable Tokio tasks under per-priority budgets, and applies
//! fallbacks through a [`RecoveryHandler`].

mod decision;
mod operation;
mod scheduler;

pub use decision::{
    decide, ChannelKind, FallbackStrategy, Priority, RecoveryContext, RecoveryDecision,
    RecoveryPolicy,
};
pub use operation::RecoveryOperation;
pub use scheduler::{admits, RecoveryBudgets, RecoveryScheduler, TaskTicket};

use crate::config::RecoveryConfig;
use crate::error::ServiceError;
use crate::intent::{Intent, IntentTransition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "runbeat::recovery";

/// Performs recovery actions and fallbacks on behalf of the engine.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Re-run `operation`. An error is fed back into the policy as the next attempt.
    async fn recover(&self, operation: &RecoveryOperation) -> Result<(), ServiceError>;

    /// Called once an operation is given up on.
    async fn apply_fallback(
        &self,
        strategy: FallbackStrategy,
        operation: &RecoveryOperation,
        error: &ServiceError,
    );
}

/// Error shown to the user until the operation that caused it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedError {
    pub operation: &'static str,
    pub error: ServiceError,
}

/// What [`ErrorRecoveryEngine::execute`] did with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Scheduled { generation: u64 },
    FallbackApplied(FallbackStrategy),
}

#[derive(Debug, Default)]
struct EngineState {
    scheduler: RecoveryScheduler,
    attempts: HashMap<&'static str, u32>,
}

pub struct ErrorRecoveryEngine {
    policy: RecoveryPolicy,
    intent: watch::Receiver<Intent>,
    handler: Arc<dyn RecoveryHandler>,
    state: Mutex<EngineState>,
    displayed_tx: watch::Sender<Option<DisplayedError>>,
}

impl ErrorRecoveryEngine {
    #[must_use]
    pub fn new(
        config: &RecoveryConfig,
        intent: watch::Receiver<Intent>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Arc<Self> {
        let (displayed_tx, _) = watch::channel(None);
        Arc::new(Self {
            policy: RecoveryPolicy {
                max_realtime_attempts: config.max_realtime_attempts,
            },
            intent,
            handler,
            state: Mutex::new(EngineState {
                scheduler: RecoveryScheduler::new(RecoveryBudgets::from(config)),
                attempts: HashMap::new(),
            }),
            displayed_tx,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_intent(&self) -> Intent {
        *self.intent.borrow()
    }

    /// Latest user-visible error, `None` when nothing needs attention.
    #[must_use]
    pub fn displayed_errors(&self) -> watch::Receiver<Option<DisplayedError>> {
        self.displayed_tx.subscribe()
    }

    /// Record a failure of `operation` and act on the resulting decision.
    pub fn handle_error(
        self: &Arc<Self>,
        error: ServiceError,
        operation: RecoveryOperation,
    ) -> ExecuteOutcome {
        let attempt = {
            let mut state = self.state();
            let attempts = state.attempts.entry(operation.key()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        let context = RecoveryContext::new(self.current_intent(), attempt, operation.channel());
        let decision = self.policy.decide(&error, &context);
        info!(
            target: LOG_TARGET,
            "{} failed (attempt {}, intent {}): {}",
            operation,
            attempt,
            context.intent,
            decision.reasoning
        );

        self.execute(decision, operation, error)
    }

    /// Schedule `decision` for `operation`, or apply its fallback right away when it
    /// does not retry or its priority budget is exhausted.
    pub fn execute(
        self: &Arc<Self>,
        decision: RecoveryDecision,
        operation: RecoveryOperation,
        error: ServiceError,
    ) -> ExecuteOutcome {
        if !decision.should_retry {
            return self.give_up(decision.fallback, operation, error);
        }

        let reserved = self.state().scheduler.reserve(
            operation.key(),
            decision.priority,
            decision.bypasses_intent,
        );
        let Some(ticket) = reserved else {
            warn!(
                target: LOG_TARGET,
                "{} budget exhausted, not retrying {}", decision.priority, operation
            );
            return self.give_up(decision.fallback, operation, error);
        };

        let generation = ticket.generation;
        debug!(
            target: LOG_TARGET,
            "Scheduling {} (generation {}) in {:?}",
            operation,
            generation,
            decision.suggested_delay
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_task(ticket, decision, operation).await;
        });

        ExecuteOutcome::Scheduled { generation }
    }

    async fn run_task(
        self: Arc<Self>,
        ticket: TaskTicket,
        decision: RecoveryDecision,
        operation: RecoveryOperation,
    ) {
        if ticket.token.is_cancelled() {
            self.finish(&ticket);
            return;
        }

        tokio::select! {
            () = ticket.token.cancelled() => {
                debug!(target: LOG_TARGET, "{} cancelled while waiting", operation);
                self.finish(&ticket);
                return;
            }
            () = tokio::time::sleep(decision.suggested_delay) => {}
        }

        if ticket.token.is_cancelled() {
            self.finish(&ticket);
            return;
        }

        let intent = self.current_intent();
        if !admits(intent, decision.priority, decision.bypasses_intent) {
            debug!(
                target: LOG_TARGET,
                "Dropping {} recovery of {}: intent is {}", decision.priority, operation, intent
            );
            self.finish(&ticket);
            return;
        }

        let result = self.handler.recover(&operation).await;
        self.finish(&ticket);

        match result {
            Ok(()) => self.record_success(&operation),
            Err(error) if !ticket.token.is_cancelled() => {
                self.handle_error(error, operation);
            }
            Err(error) => {
                debug!(
                    target: LOG_TARGET,
                    "Ignoring failure of cancelled {}: {}", operation, error
                );
            }
        }
    }

    fn finish(&self, ticket: &TaskTicket) {
        self.state().scheduler.finish(ticket.key, ticket.generation);
    }

    fn give_up(
        self: &Arc<Self>,
        strategy: FallbackStrategy,
        operation: RecoveryOperation,
        error: ServiceError,
    ) -> ExecuteOutcome {
        self.state().attempts.remove(operation.key());

        match strategy {
            FallbackStrategy::NotifyUser => {
                warn!(target: LOG_TARGET, "{} needs attention: {}", operation, error);
                self.displayed_tx.send_replace(Some(DisplayedError {
                    operation: operation.key(),
                    error: error.clone(),
                }));
            }
            FallbackStrategy::SilentFailure => {
                debug!(target: LOG_TARGET, "Giving up on {} silently", operation);
            }
            FallbackStrategy::DegradeToRequestApi | FallbackStrategy::ContinueWithoutData => {
                info!(target: LOG_TARGET, "{} fallback: {}", operation, strategy);
            }
        }

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            handler.apply_fallback(strategy, &operation, &error).await;
        });

        ExecuteOutcome::FallbackApplied(strategy)
    }

    /// Reset the attempt counter for `operation` and clear its displayed error.
    pub fn record_success(&self, operation: &RecoveryOperation) {
        let previous = self.state().attempts.remove(operation.key());
        if previous.is_some() {
            debug!(target: LOG_TARGET, "{} recovered", operation);
        }
        self.displayed_tx.send_if_modified(|displayed| {
            if displayed
                .as_ref()
                .is_some_and(|shown| shown.operation == operation.key())
            {
                *displayed = None;
                true
            } else {
                false
            }
        });
    }

    /// Clear any displayed error, e.g. after the user signs in again.
    pub fn dismiss_error(&self) {
        self.displayed_tx.send_replace(None);
    }

    /// Cancel tasks the new intent no longer admits.
    pub fn on_intent_changed(&self, previous: Intent, next: Intent) -> IntentTransition {
        let transition = previous.transition_to(next);
        match transition {
            IntentTransition::Activate => {
                info!(target: LOG_TARGET, "Intent {} -> {}: full recovery enabled", previous, next);
            }
            IntentTransition::Deactivate => {
                let cancelled = self.state().scheduler.cancel_disallowed(next);
                info!(
                    target: LOG_TARGET,
                    "Intent {} -> {}: cancelled {} recovery task(s)", previous, next, cancelled
                );
            }
            IntentTransition::Disconnect => {
                let mut state = self.state();
                let cancelled = state.scheduler.cancel_all();
                state.attempts.clear();
                info!(
                    target: LOG_TARGET,
                    "Intent {} -> {}: cancelled all {} recovery task(s)", previous, next, cancelled
                );
            }
            IntentTransition::NoOp => {}
        }
        transition
    }

    #[must_use]
    pub fn active_tasks(&self, priority: Priority) -> usize {
        self.state().scheduler.active(priority)
    }

    #[must_use]
    pub fn has_task(&self, operation: &RecoveryOperation) -> bool {
        self.state().scheduler.contains(operation.key())
    }

    #[must_use]
    pub fn attempts(&self, operation: &RecoveryOperation) -> u32 {
        self.state()
            .attempts
            .get(operation.key())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct MockHandler {
        results: Mutex<VecDeque<Result<(), ServiceError>>>,
        recovered: Mutex<Vec<RecoveryOperation>>,
        fallbacks: Mutex<Vec<(FallbackStrategy, &'static str)>>,
    }

    impl MockHandler {
        fn with_results(results: Vec<Result<(), ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                ..Self::default()
            })
        }

        fn recovered(&self) -> Vec<RecoveryOperation> {
            self.recovered.lock().unwrap().clone()
        }

        fn fallbacks(&self) -> Vec<(FallbackStrategy, &'static str)> {
            self.fallbacks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecoveryHandler for MockHandler {
        async fn recover(&self, operation: &RecoveryOperation) -> Result<(), ServiceError> {
            self.recovered.lock().unwrap().push(operation.clone());
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn apply_fallback(
            &self,
            strategy: FallbackStrategy,
            operation: &RecoveryOperation,
            _error: &ServiceError,
        ) {
            self.fallbacks.lock().unwrap().push((strategy, operation.key()));
        }
    }

    fn engine(
        intent: Intent,
        handler: Arc<MockHandler>,
    ) -> (Arc<ErrorRecoveryEngine>, watch::Sender<Intent>) {
        let (intent_tx, intent_rx) = watch::channel(intent);
        let engine = ErrorRecoveryEngine::new(&RecoveryConfig::default(), intent_rx, handler);
        (engine, intent_tx)
    }

    fn critical_retry(delay: Duration) -> RecoveryDecision {
        RecoveryDecision {
            should_retry: true,
            suggested_delay: delay,
            priority: Priority::Critical,
            fallback: FallbackStrategy::DegradeToRequestApi,
            bypasses_intent: false,
            reasoning: "test".into(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_critical_applies_fallback() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, _intent) = engine(Intent::Training, handler.clone());
        let delay = Duration::from_secs(10);

        let first = engine.execute(
            critical_retry(delay),
            RecoveryOperation::ReconnectRealtime,
            ServiceError::RealtimeDisconnected,
        );
        let second = engine.execute(
            critical_retry(delay),
            RecoveryOperation::RefreshToken,
            ServiceError::TokenExpired,
        );
        let third = engine.execute(
            critical_retry(delay),
            RecoveryOperation::StartPlayback {
                uri: "spotify:playlist:hi".into(),
            },
            ServiceError::ServiceUnavailable,
        );

        assert!(matches!(first, ExecuteOutcome::Scheduled { .. }));
        assert!(matches!(second, ExecuteOutcome::Scheduled { .. }));
        assert_eq!(
            third,
            ExecuteOutcome::FallbackApplied(FallbackStrategy::DegradeToRequestApi)
        );
        assert_eq!(engine.active_tasks(Priority::Critical), 2);

        settle().await;
        assert_eq!(
            handler.fallbacks(),
            vec![(FallbackStrategy::DegradeToRequestApi, "start_playback")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_after_delay_and_resets_attempts() {
        let handler = MockHandler::with_results(vec![Ok(())]);
        let (engine, _intent) = engine(Intent::Training, handler.clone());

        let outcome = engine.handle_error(
            ServiceError::RealtimeDisconnected,
            RecoveryOperation::ReconnectRealtime,
        );
        assert!(matches!(outcome, ExecuteOutcome::Scheduled { .. }));
        assert_eq!(engine.attempts(&RecoveryOperation::ReconnectRealtime), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handler.recovered().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(handler.recovered(), vec![RecoveryOperation::ReconnectRealtime]);
        assert_eq!(engine.attempts(&RecoveryOperation::ReconnectRealtime), 0);
        assert!(!engine.has_task(&RecoveryOperation::ReconnectRealtime));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_escalate_to_fallback() {
        let handler = MockHandler::with_results(vec![
            Err(ServiceError::RealtimeDisconnected),
            Err(ServiceError::RealtimeDisconnected),
        ]);
        let (engine, _intent) = engine(Intent::Training, handler.clone());

        engine.handle_error(
            ServiceError::RealtimeDisconnected,
            RecoveryOperation::ReconnectRealtime,
        );
        // 1s for attempt 1, 2s for attempt 2, then attempt 3 gives up
        tokio::time::sleep(Duration::from_secs(4)).await;
        settle().await;

        assert_eq!(handler.recovered().len(), 2);
        assert_eq!(
            handler.fallbacks(),
            vec![(FallbackStrategy::DegradeToRequestApi, "reconnect_realtime")]
        );
        assert_eq!(engine.attempts(&RecoveryOperation::ReconnectRealtime), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_change_cancels_pending_critical() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, intent_tx) = engine(Intent::Training, handler.clone());

        engine.handle_error(
            ServiceError::RealtimeDisconnected,
            RecoveryOperation::ReconnectRealtime,
        );
        assert_eq!(engine.active_tasks(Priority::Critical), 1);

        intent_tx.send_replace(Intent::Idle);
        assert_eq!(
            engine.on_intent_changed(Intent::Training, Intent::Idle),
            IntentTransition::Deactivate
        );
        assert_eq!(engine.active_tasks(Priority::Critical), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert!(handler.recovered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_recheck_after_sleep() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, intent_tx) = engine(Intent::Training, handler.clone());

        engine.handle_error(ServiceError::NetworkTimeout, RecoveryOperation::FetchNowPlaying);
        // Intent changes without notifying the engine; the task re-checks on waking
        intent_tx.send_replace(Intent::Idle);
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert!(handler.recovered().is_empty());
        assert!(!engine.has_task(&RecoveryOperation::FetchNowPlaying));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refresh_survives_idle() {
        let handler = MockHandler::with_results(vec![Ok(())]);
        let (engine, intent_tx) = engine(Intent::Idle, handler.clone());

        engine.handle_error(ServiceError::TokenExpired, RecoveryOperation::RefreshToken);
        engine.on_intent_changed(Intent::Training, Intent::Idle);
        intent_tx.send_replace(Intent::Idle);
        settle().await;

        assert_eq!(handler.recovered(), vec![RecoveryOperation::RefreshToken]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_everything() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, intent_tx) = engine(Intent::Training, handler.clone());

        engine.handle_error(ServiceError::NetworkTimeout, RecoveryOperation::FetchNowPlaying);
        engine.handle_error(
            ServiceError::RealtimeDisconnected,
            RecoveryOperation::ReconnectRealtime,
        );
        intent_tx.send_replace(Intent::Disconnected);
        assert_eq!(
            engine.on_intent_changed(Intent::Training, Intent::Disconnected),
            IntentTransition::Disconnect
        );
        assert_eq!(engine.active_tasks(Priority::Critical), 0);
        assert_eq!(engine.active_tasks(Priority::Enhancing), 0);
        assert_eq!(engine.attempts(&RecoveryOperation::FetchNowPlaying), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(handler.recovered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_task_replaces_older() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, _intent) = engine(Intent::Training, handler.clone());

        let first = engine.execute(
            critical_retry(Duration::from_secs(5)),
            RecoveryOperation::ReconnectRealtime,
            ServiceError::RealtimeDisconnected,
        );
        let second = engine.execute(
            critical_retry(Duration::from_secs(1)),
            RecoveryOperation::ReconnectRealtime,
            ServiceError::RealtimeDisconnected,
        );
        assert_ne!(first, second);
        assert_eq!(engine.active_tasks(Priority::Critical), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        // Only the replacement ran
        assert_eq!(handler.recovered(), vec![RecoveryOperation::ReconnectRealtime]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_user_displays_until_success() {
        let handler = MockHandler::with_results(vec![]);
        let (engine, _intent) = engine(Intent::Training, handler.clone());
        let displayed = engine.displayed_errors();

        let operation = RecoveryOperation::StartPlayback {
            uri: "spotify:playlist:missing".into(),
        };
        engine.handle_error(
            ServiceError::ContentNotFound {
                uri: "spotify:playlist:missing".into(),
            },
            operation.clone(),
        );
        assert_eq!(
            displayed.borrow().as_ref().map(|shown| shown.operation),
            Some("start_playback")
        );

        // Success of an unrelated operation keeps the message
        engine.record_success(&RecoveryOperation::FetchNowPlaying);
        assert!(displayed.borrow().is_some());

        engine.record_success(&operation);
        assert!(displayed.borrow().is_none());
    }
}
