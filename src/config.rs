//! Configuration types.

use std::time::Duration;

/// How `start` behaves while a task is already working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Tear down the running worker context and start over in a new generation.
    #[default]
    Supersede,
    /// Re-send the command to the same worker context; the task stays working
    /// until every outstanding request has produced its terminal event.
    Forward,
    /// Refuse the request with `TaskError::Busy`.
    Reject,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum spacing between two progress updates reaching observers.
    pub progress_interval: Duration,
    /// Behavior of `start` while working.
    pub busy_policy: BusyPolicy,
    /// Capacity of the accepted-event broadcast channel.
    pub event_capacity: usize,
    /// Maximum number of state transitions kept in the task history.
    pub max_transitions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(50),
            busy_policy: BusyPolicy::Supersede,
            event_capacity: 256,
            max_transitions: 200,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}
