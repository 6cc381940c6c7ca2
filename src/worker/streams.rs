//! Consumer-facing solution observables.
//!
//! Subscribers clone a `watch::Receiver` and drop it to unsubscribe. Values:
//! - **latest candidate**: replaced on every `solution` event; kept (stale)
//!   after an abort;
//! - **final result**: replaced only on `final`; survives later errors and aborts;
//! - **last error**: set when a request fails, cleared by the next start.

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::Solution;

/// A solution paired with the label the controller attached at start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledSolution {
    pub label: Option<String>,
    pub run_id: Uuid,
    pub generation: u64,
    pub solution: Solution,
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The solver returned an error or panicked.
    Solver,
    /// The worker context itself died.
    Fault,
}

/// A failed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub generation: u64,
    pub run_id: Option<Uuid>,
    pub message: String,
}

/// Holds the solution and error observables.
pub struct SolutionStreams {
    candidate: watch::Sender<Option<LabeledSolution>>,
    final_result: watch::Sender<Option<LabeledSolution>>,
    last_error: watch::Sender<Option<TaskFailure>>,
}

impl SolutionStreams {
    pub fn new() -> Self {
        Self {
            candidate: watch::channel(None).0,
            final_result: watch::channel(None).0,
            last_error: watch::channel(None).0,
        }
    }

    /// A new request was accepted.
    pub fn on_start(&self) {
        self.last_error.send_replace(None);
    }

    pub fn on_candidate(&self, candidate: LabeledSolution) {
        self.candidate.send_replace(Some(candidate));
    }

    pub fn on_final(&self, result: LabeledSolution) {
        self.final_result.send_replace(Some(result));
    }

    /// Records a failure. The final result is left as it was.
    pub fn on_failure(&self, failure: TaskFailure) {
        self.last_error.send_replace(Some(failure));
    }

    pub fn latest_candidate(&self) -> Option<LabeledSolution> {
        self.candidate.borrow().clone()
    }

    pub fn final_result(&self) -> Option<LabeledSolution> {
        self.final_result.borrow().clone()
    }

    pub fn last_error(&self) -> Option<TaskFailure> {
        self.last_error.borrow().clone()
    }

    pub fn watch_candidate(&self) -> watch::Receiver<Option<LabeledSolution>> {
        self.candidate.subscribe()
    }

    pub fn watch_final(&self) -> watch::Receiver<Option<LabeledSolution>> {
        self.final_result.subscribe()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<TaskFailure>> {
        self.last_error.subscribe()
    }
}

impl Default for SolutionStreams {
    fn default() -> Self {
        Self::new()
    }
}
