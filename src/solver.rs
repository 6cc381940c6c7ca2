//! Interface to the external schedule solver.
//!
//! The search itself lives outside this crate. A worker context calls
//! [`Solver::solve`] synchronously on its own thread and hands it a
//! [`Reporter`] for streaming progress and intermediate candidates back to
//! the controller.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SolveError;
use crate::protocol::{Envelope, Event, Progress, Solution};
use crate::worker::WorkerSignal;

/// Arguments of one solve request.
#[derive(Debug, Clone, Copy)]
pub struct SolveInput<'a> {
    /// Raw serialized schedule, parsed by the solver.
    pub plan: &'a str,
    /// Subject short names, highest priority first.
    pub subjects: &'a [String],
    /// Per-subject weights; empty lets the solver derive them.
    pub weights: &'a [f64],
    pub excluded_teachers: &'a BTreeSet<String>,
}

/// A long-running, CPU-bound schedule search.
pub trait Solver: Send + Sync + 'static {
    fn solve(
        &self,
        input: &SolveInput<'_>,
        reporter: &mut Reporter,
    ) -> Result<Solution, SolveError>;
}

impl<S: Solver + ?Sized> Solver for Arc<S> {
    fn solve(
        &self,
        input: &SolveInput<'_>,
        reporter: &mut Reporter,
    ) -> Result<Solution, SolveError> {
        (**self).solve(input, reporter)
    }
}

/// Solver backed by a closure. Build with [`solver_fn`].
pub struct FnSolver<F> {
    f: F,
}

/// Wraps a closure as a [`Solver`].
pub fn solver_fn<F>(f: F) -> FnSolver<F>
where
    F: Fn(&SolveInput<'_>, &mut Reporter) -> Result<Solution, SolveError> + Send + Sync + 'static,
{
    FnSolver { f }
}

impl<F> Solver for FnSolver<F>
where
    F: Fn(&SolveInput<'_>, &mut Reporter) -> Result<Solution, SolveError> + Send + Sync + 'static,
{
    fn solve(
        &self,
        input: &SolveInput<'_>,
        reporter: &mut Reporter,
    ) -> Result<Solution, SolveError> {
        (self.f)(input, reporter)
    }
}

/// Emits events for one generation back to the controller.
///
/// Once the owning worker context is terminated every emission is dropped
/// silently; solvers that want to stop early can poll [`Reporter::is_cancelled`].
pub struct Reporter {
    generation: u64,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    terminated: Arc<AtomicBool>,
}

impl Reporter {
    pub(crate) fn new(
        generation: u64,
        signals: mpsc::UnboundedSender<WorkerSignal>,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            generation,
            signals,
            terminated,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the worker context has been terminated or the controller is gone.
    pub fn is_cancelled(&self) -> bool {
        self.terminated.load(Ordering::Acquire) || self.signals.is_closed()
    }

    /// Reports search statistics.
    pub fn progress(&mut self, progress: Progress) -> bool {
        self.emit(Event::Progress { progress })
    }

    /// Reports an intermediate candidate.
    pub fn candidate(&mut self, solution: Solution) -> bool {
        self.emit(Event::Solution { solution })
    }

    /// Sends one event. Returns false when it was not delivered.
    pub(crate) fn emit(&mut self, event: Event) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        let raw = match Envelope::new(self.generation, event).encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(generation = self.generation, error = %e, "Failed to encode worker event");
                return false;
            }
        };
        self.signals.send(WorkerSignal::Message(raw)).is_ok()
    }
}
