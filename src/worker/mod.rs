//! Background solver orchestration.
//!
//! Core components:
//! - `manager`: TaskManager: start/abort, generation filtering, event pump
//! - `state`: Task state machine (Idle ⇄ Working) and transition history
//! - `throttle`: Progress rate limiting
//! - `streams`: Candidate, final result and error observables
//! - `context`: Worker contexts and the factory seam that creates them
//! - `worker`: Worker-side command loop
//! - `anytime`: Time-budgeted runs

pub mod anytime;
pub mod context;
pub mod manager;
pub mod state;
pub mod streams;
pub mod throttle;
mod worker;

pub use anytime::{AnytimeOutcome, run_with_budget};
pub use context::{
    DEFAULT_DETACHED_LIMIT, ThreadWorker, ThreadWorkerFactory, WorkerContext, WorkerFactory,
    WorkerSignal,
};
pub use manager::TaskManager;
pub use state::{StateTransition, Task, TaskState, TransitionCause};
pub use streams::{FailureKind, LabeledSolution, SolutionStreams, TaskFailure};
pub use throttle::ProgressThrottler;
