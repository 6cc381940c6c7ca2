//! Planner orchestrator: runs a long schedule search off the controller
//! thread and streams its progress and solutions back.

pub mod config;
pub mod error;
pub mod plan;
pub mod protocol;
pub mod solver;
pub mod worker;

pub use config::{BusyPolicy, OrchestratorConfig};
pub use error::{Error, Result};
pub use protocol::{Command, Envelope, Event, Progress, Solution};
pub use solver::{Reporter, SolveInput, Solver, solver_fn};
pub use worker::{AnytimeOutcome, TaskManager, ThreadWorkerFactory, run_with_budget};
