//! Budgeted arena of in-flight recovery tasks.

use super::decision::Priority;
use crate::config::RecoveryConfig;
use crate::intent::Intent;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Maximum concurrent tasks per priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBudgets {
    pub critical: usize,
    pub enhancing: usize,
    pub background: usize,
}

impl RecoveryBudgets {
    #[must_use]
    pub const fn limit(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::Enhancing => self.enhancing,
            Priority::Background => self.background,
        }
    }
}

impl Default for RecoveryBudgets {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for RecoveryBudgets {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            critical: config.critical_budget,
            enhancing: config.enhancing_budget,
            background: config.background_budget,
        }
    }
}

#[derive(Debug)]
struct ActiveTask {
    generation: u64,
    priority: Priority,
    bypasses_intent: bool,
    token: CancellationToken,
}

/// Handle given to a newly reserved task.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub key: &'static str,
    pub generation: u64,
    pub token: CancellationToken,
}

/// Tasks keyed by operation. A newer task for the same key replaces (and cancels) the
/// older one; the generation stops a late cleanup from removing its replacement.
#[derive(Debug, Default)]
pub struct RecoveryScheduler {
    budgets: RecoveryBudgets,
    tasks: HashMap<&'static str, ActiveTask>,
    next_generation: u64,
}

impl RecoveryScheduler {
    #[must_use]
    pub fn new(budgets: RecoveryBudgets) -> Self {
        Self {
            budgets,
            tasks: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Reserve a slot for `key`, or `None` when the priority budget is exhausted.
    ///
    /// The task being replaced does not count against the budget.
    pub fn reserve(
        &mut self,
        key: &'static str,
        priority: Priority,
        bypasses_intent: bool,
    ) -> Option<TaskTicket> {
        let in_use = self
            .tasks
            .iter()
            .filter(|(task_key, task)| **task_key != key && task.priority == priority)
            .count();
        if in_use >= self.budgets.limit(priority) {
            return None;
        }

        self.next_generation += 1;
        let token = CancellationToken::new();
        let replaced = self.tasks.insert(
            key,
            ActiveTask {
                generation: self.next_generation,
                priority,
                bypasses_intent,
                token: token.clone(),
            },
        );
        if let Some(old) = replaced {
            old.token.cancel();
        }

        Some(TaskTicket {
            key,
            generation: self.next_generation,
            token,
        })
    }

    /// Remove the task if it is still the one identified by `generation`.
    pub fn finish(&mut self, key: &str, generation: u64) -> bool {
        match self.tasks.get(key) {
            Some(task) if task.generation == generation => {
                self.tasks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancel every task the new intent no longer admits. Returns how many were cancelled.
    pub fn cancel_disallowed(&mut self, intent: Intent) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            let keep = admits(intent, task.priority, task.bypasses_intent);
            if !keep {
                task.token.cancel();
            }
            keep
        });
        before - self.tasks.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.token.cancel();
        }
        cancelled
    }

    #[must_use]
    pub fn active(&self, priority: Priority) -> usize {
        self.tasks
            .values()
            .filter(|task| task.priority == priority)
            .count()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }
}

/// Whether a task of `priority` may run under `intent`.
#[must_use]
pub const fn admits(intent: Intent, priority: Priority, bypasses_intent: bool) -> bool {
    match intent {
        Intent::Disconnected => false,
        Intent::Training | Intent::Idle => bypasses_intent || intent.permits(priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhaustion() {
        let mut scheduler = RecoveryScheduler::new(RecoveryBudgets::default());
        assert!(scheduler.reserve("a", Priority::Critical, false).is_some());
        assert!(scheduler.reserve("b", Priority::Critical, false).is_some());
        assert!(scheduler.reserve("c", Priority::Critical, false).is_none());
        // Other classes have their own budget
        assert!(scheduler.reserve("d", Priority::Background, false).is_some());
        assert_eq!(scheduler.active(Priority::Critical), 2);
    }

    #[test]
    fn test_replacement_does_not_count_against_budget() {
        let mut scheduler = RecoveryScheduler::new(RecoveryBudgets::default());
        let first = scheduler.reserve("a", Priority::Enhancing, false).unwrap();
        let second = scheduler.reserve("a", Priority::Enhancing, false).unwrap();
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(second.generation > first.generation);
    }

    #[test]
    fn test_stale_generation_cleanup_is_ignored() {
        let mut scheduler = RecoveryScheduler::new(RecoveryBudgets::default());
        let first = scheduler.reserve("a", Priority::Critical, false).unwrap();
        let second = scheduler.reserve("a", Priority::Critical, false).unwrap();

        assert!(!scheduler.finish("a", first.generation));
        assert!(scheduler.contains("a"));
        assert!(scheduler.finish("a", second.generation));
        assert!(!scheduler.contains("a"));
    }

    #[test]
    fn test_cancel_disallowed_keeps_bypassing_tasks() {
        let mut scheduler = RecoveryScheduler::new(RecoveryBudgets::default());
        let reconnect = scheduler
            .reserve("reconnect_realtime", Priority::Critical, false)
            .unwrap();
        let refresh = scheduler
            .reserve("refresh_token", Priority::Critical, true)
            .unwrap();
        let fetch = scheduler
            .reserve("fetch_now_playing", Priority::Background, false)
            .unwrap();

        assert_eq!(scheduler.cancel_disallowed(Intent::Idle), 1);
        assert!(reconnect.token.is_cancelled());
        assert!(!refresh.token.is_cancelled());
        assert!(!fetch.token.is_cancelled());

        assert_eq!(scheduler.cancel_all(), 2);
        assert!(refresh.token.is_cancelled());
    }

    #[test]
    fn test_admits() {
        assert!(admits(Intent::Idle, Priority::Critical, true));
        assert!(!admits(Intent::Idle, Priority::Enhancing, false));
        assert!(!admits(Intent::Disconnected, Priority::Critical, true));
        assert!(admits(Intent::Training, Priority::Critical, false));
    }
}
