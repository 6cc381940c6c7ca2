//! Task state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of the solver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No request is being computed.
    #[default]
    Idle,
    /// At least one request is outstanding in the current generation.
    Working,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!((self, target), (Idle, Working) | (Working, Idle))
    }

    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
        };
        write!(f, "{s}")
    }
}

/// What caused a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Started,
    Finished,
    Failed,
    Faulted,
    Aborted,
    /// A new request replaced the running one.
    Superseded,
}

/// A recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub cause: TransitionCause,
    /// Generation current at the time of the transition.
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

/// The single logical unit of background work. Reused across requests.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub state: TaskState,
    /// Generation of the most recently created worker context (0 = none yet).
    pub generation: u64,
    /// Identifier of the latest accepted request.
    pub run_id: Option<Uuid>,
    /// Display label attached by the controller to the latest request.
    pub label: Option<String>,
    /// Requests sent in the current generation still waiting for a terminal event.
    pub outstanding: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
    #[serde(skip)]
    max_transitions: usize,
}

impl Task {
    pub fn new(max_transitions: usize) -> Self {
        Self {
            state: TaskState::Idle,
            generation: 0,
            run_id: None,
            label: None,
            outstanding: 0,
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
            max_transitions: max_transitions.max(1),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        cause: TransitionCause,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {} ({:?})",
                self.state, new_state, cause
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            cause,
            generation: self.generation,
            timestamp: Utc::now(),
        });
        if self.transitions.len() > self.max_transitions {
            let drain_count = self.transitions.len() - self.max_transitions;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;

        match new_state {
            TaskState::Working => {
                self.started_at = Some(Utc::now());
                self.finished_at = None;
            }
            TaskState::Idle => {
                self.finished_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    /// Cause of the most recent transition.
    pub fn last_cause(&self) -> Option<TransitionCause> {
        self.transitions.last().map(|t| t.cause)
    }

    /// Time spent on the latest run, up to now if still working.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new(200)
    }
}
