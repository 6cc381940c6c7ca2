//! Worker-side loop: decode commands, run the solver, report back.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{Command, Event};
use crate::solver::{Reporter, SolveInput, Solver};
use crate::worker::WorkerSignal;

/// State owned by one worker thread.
pub(crate) struct Worker<S> {
    generation: u64,
    solver: Arc<S>,
    weights: Arc<[f64]>,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    terminated: Arc<AtomicBool>,
    /// Raised while a command is being served.
    busy: Arc<AtomicBool>,
}

impl<S: Solver> Worker<S> {
    pub(crate) fn new(
        generation: u64,
        solver: Arc<S>,
        weights: Arc<[f64]>,
        signals: mpsc::UnboundedSender<WorkerSignal>,
        terminated: Arc<AtomicBool>,
        busy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            generation,
            solver,
            weights,
            signals,
            terminated,
            busy,
        }
    }

    /// Serve commands until the inbox closes or the context is terminated.
    pub(crate) fn run(self, mut commands: mpsc::UnboundedReceiver<String>) {
        debug!(generation = self.generation, "Worker context started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.serve(&mut commands)));

        if let Err(payload) = outcome {
            let reason = panic_message(payload.as_ref());
            error!(generation = self.generation, %reason, "Worker context crashed");
            if !self.terminated.load(Ordering::Acquire) {
                let _ = self.signals.send(WorkerSignal::Fault {
                    generation: self.generation,
                    reason,
                });
            }
        }

        debug!(generation = self.generation, "Worker context exited");
    }

    fn serve(&self, commands: &mut mpsc::UnboundedReceiver<String>) {
        while let Some(raw) = commands.blocking_recv() {
            // Raised before the termination check; `ThreadWorker::drop` does the reverse.
            self.busy.store(true, Ordering::SeqCst);
            if self.terminated.load(Ordering::SeqCst) {
                break;
            }
            match Command::decode(&raw) {
                Ok(Command::Start {
                    plan,
                    subjects,
                    excluded_teachers,
                }) => self.execute(&plan, &subjects, &excluded_teachers),
                Err(e) => {
                    warn!(generation = self.generation, error = %e, "Ignoring unrecognized command");
                }
            }
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    /// Runs one solve and reports exactly one terminal event for it.
    fn execute(&self, plan: &str, subjects: &[String], excluded_teachers: &BTreeSet<String>) {
        let mut reporter = Reporter::new(
            self.generation,
            self.signals.clone(),
            Arc::clone(&self.terminated),
        );
        let input = SolveInput {
            plan,
            subjects,
            weights: &self.weights,
            excluded_teachers,
        };

        info!(
            generation = self.generation,
            subjects = subjects.len(),
            excluded = excluded_teachers.len(),
            "Solving"
        );
        let started = Instant::now();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.solver.solve(&input, &mut reporter)
        }));
        let event = match result {
            Ok(Ok(solution)) => Event::Final { solution },
            Ok(Err(e)) => Event::Error {
                message: e.to_string(),
            },
            Err(payload) => Event::Error {
                message: format!("Solver panicked: {}", panic_message(payload.as_ref())),
            },
        };

        info!(
            generation = self.generation,
            outcome = event.kind(),
            elapsed = ?started.elapsed(),
            "Solve finished"
        );

        if !reporter.emit(event) {
            debug!(generation = self.generation, "Terminal event not delivered");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
