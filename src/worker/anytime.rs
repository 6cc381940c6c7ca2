//! Anytime mode: give the solver a wall-clock budget and keep the best
//! candidate it found when the budget runs out.

use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::info;

use crate::worker::context::WorkerFactory;
use crate::worker::manager::TaskManager;
use crate::worker::state::TransitionCause;
use crate::worker::streams::{LabeledSolution, TaskFailure};

/// How a budgeted run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AnytimeOutcome {
    /// The solver delivered its final result in time.
    Completed(LabeledSolution),
    /// The solver failed or its worker context died.
    Failed(TaskFailure),
    /// The budget elapsed and the run was aborted. Carries the latest
    /// candidate of that run, if it produced one.
    TimedOut(Option<LabeledSolution>),
    /// No request was running.
    Idle,
}

/// Drive `manager` until the current request finishes or `budget` elapses.
///
/// On expiry the request is aborted, so the manager is idle again when this
/// returns.
pub async fn run_with_budget<F: WorkerFactory>(
    manager: &mut TaskManager<F>,
    budget: Duration,
) -> AnytimeOutcome {
    if !manager.working() {
        return AnytimeOutcome::Idle;
    }

    let deadline = Instant::now() + budget;

    while manager.working() {
        if timeout_at(deadline, manager.process_next()).await.is_err() {
            let run_id = manager.current_run();
            let candidate = manager
                .latest_candidate()
                .filter(|c| Some(c.run_id) == run_id);
            info!(
                ?budget,
                has_candidate = candidate.is_some(),
                "Time budget exhausted, aborting"
            );
            manager.abort();
            return AnytimeOutcome::TimedOut(candidate);
        }
    }

    match manager.task().last_cause() {
        Some(TransitionCause::Finished) => match manager.final_result() {
            Some(result) => AnytimeOutcome::Completed(result),
            None => AnytimeOutcome::Idle,
        },
        Some(TransitionCause::Failed | TransitionCause::Faulted) => match manager.last_error() {
            Some(failure) => AnytimeOutcome::Failed(failure),
            None => AnytimeOutcome::Idle,
        },
        _ => AnytimeOutcome::Idle,
    }
}
