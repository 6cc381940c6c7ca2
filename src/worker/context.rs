//! Worker contexts: isolated execution units that run the solver.
//!
//! A context receives encoded commands through [`WorkerContext::post`] and
//! reports back through the [`WorkerSignal`] channel it was spawned with.
//! The [`WorkerFactory`] trait is the seam the task manager creates contexts
//! through, so tests can substitute scripted contexts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::solver::Solver;
use crate::worker::worker::Worker;

/// Default number of terminated-but-running solver threads tolerated
/// before new contexts are refused.
pub const DEFAULT_DETACHED_LIMIT: usize = 4;

/// Inbound traffic from worker contexts to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    /// An encoded [`Envelope`](crate::protocol::Envelope).
    Message(String),
    /// The context died outside of normal event reporting.
    Fault { generation: u64, reason: String },
}

/// Handle to a running worker context.
pub trait WorkerContext: Send {
    /// Generation this context was created for.
    fn generation(&self) -> u64;

    /// Delivers an encoded command.
    fn post(&mut self, message: String) -> Result<(), WorkerError>;

    /// Tears the context down immediately. Nothing it emits afterwards is
    /// delivered as current.
    fn terminate(self);
}

/// Creates worker contexts.
pub trait WorkerFactory {
    type Context: WorkerContext;

    fn spawn(
        &self,
        generation: u64,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Result<Self::Context, WorkerError>;
}

/// Threads of terminated contexts whose solver has not returned yet.
type DetachedThreads = Arc<Mutex<Vec<(u64, thread::JoinHandle<()>)>>>;

/// Runs each context on a dedicated OS thread.
///
/// Threads cannot be killed. Terminating a context closes its inbox and
/// raises a flag that silences its reporter; a solve already in flight keeps
/// its thread busy until the solver returns. Such threads are tracked, and
/// once `detached_limit` of them are still running, `spawn` fails with
/// [`WorkerError::Saturated`] until some finish. Solvers that poll
/// [`Reporter::is_cancelled`](crate::solver::Reporter::is_cancelled) return
/// promptly and never count against the limit for long.
pub struct ThreadWorkerFactory<S> {
    solver: Arc<S>,
    weights: Arc<[f64]>,
    detached: DetachedThreads,
    detached_limit: usize,
}

impl<S: Solver> ThreadWorkerFactory<S> {
    pub fn new(solver: S) -> Self {
        Self {
            solver: Arc::new(solver),
            weights: Arc::from(Vec::new()),
            detached: Arc::default(),
            detached_limit: DEFAULT_DETACHED_LIMIT,
        }
    }

    /// Per-subject weights passed to every solve. Empty by default.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Arc::from(weights);
        self
    }

    /// Maximum number of terminated solver threads allowed to keep running.
    pub fn with_detached_limit(mut self, limit: usize) -> Self {
        self.detached_limit = limit;
        self
    }

    /// Terminated contexts whose solver is still running.
    pub fn detached_count(&self) -> usize {
        let mut detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        detached.retain(|(generation, handle)| {
            let running = !handle.is_finished();
            if !running {
                debug!(generation, "Detached solver thread finished");
            }
            running
        });
        detached.len()
    }
}

impl<S> Clone for ThreadWorkerFactory<S> {
    fn clone(&self) -> Self {
        Self {
            solver: Arc::clone(&self.solver),
            weights: Arc::clone(&self.weights),
            detached: Arc::clone(&self.detached),
            detached_limit: self.detached_limit,
        }
    }
}

impl<S: Solver> WorkerFactory for ThreadWorkerFactory<S> {
    type Context = ThreadWorker;

    fn spawn(
        &self,
        generation: u64,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Result<ThreadWorker, WorkerError> {
        let detached = self.detached_count();
        if detached >= self.detached_limit {
            warn!(
                generation,
                detached,
                limit = self.detached_limit,
                "Refusing worker context while terminated solvers are still running"
            );
            return Err(WorkerError::Saturated {
                generation,
                detached,
            });
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            generation,
            Arc::clone(&self.solver),
            Arc::clone(&self.weights),
            signals,
            Arc::clone(&terminated),
            Arc::clone(&busy),
        );

        let handle = thread::Builder::new()
            .name(format!("solver-worker-{generation}"))
            .spawn(move || worker.run(commands_rx))
            .map_err(|e| WorkerError::Spawn {
                generation,
                reason: e.to_string(),
            })?;

        debug!(generation, "Spawned worker thread");

        Ok(ThreadWorker {
            generation,
            commands: commands_tx,
            terminated,
            busy,
            handle: Some(handle),
            detached: Arc::clone(&self.detached),
        })
    }
}

/// A worker context backed by an OS thread.
#[derive(Debug)]
pub struct ThreadWorker {
    generation: u64,
    commands: mpsc::UnboundedSender<String>,
    terminated: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    detached: DetachedThreads,
}

impl ThreadWorker {
    /// Whether the backing thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Whether a solve is in flight on the backing thread.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl WorkerContext for ThreadWorker {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn post(&mut self, message: String) -> Result<(), WorkerError> {
        self.commands
            .send(message)
            .map_err(|_| WorkerError::Closed {
                generation: self.generation,
            })
    }

    fn terminate(self) {
        info!(
            generation = self.generation,
            busy = self.is_busy(),
            "Terminating worker context"
        );
        // Dropping closes the inbox and detaches the thread.
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        // Raised before the busy check; the worker loop does the reverse.
        self.terminated.store(true, Ordering::SeqCst);
        if !self.busy.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                return;
            }
            let mut detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
            detached.push((self.generation, handle));
            warn!(
                generation = self.generation,
                detached = detached.len(),
                "Solver still running after termination, detaching its thread"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::protocol::{Command, Solution};
    use crate::solver::solver_fn;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn start_command() -> String {
        Command::start("P", vec!["Chemie".to_string()], Default::default())
            .encode()
            .unwrap()
    }

    #[test]
    fn terminated_solvers_are_tracked_until_they_return() {
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));
        let solver = {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            // Never polls for cancellation.
            solver_fn(move |_, _| {
                started.fetch_add(1, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(Solution::default())
            })
        };
        let factory = ThreadWorkerFactory::new(solver).with_detached_limit(2);
        let (signals, _rx) = mpsc::unbounded_channel();

        for generation in 1..=2u64 {
            let mut ctx = factory.spawn(generation, signals.clone()).unwrap();
            ctx.post(start_command()).unwrap();
            wait_until(|| started.load(Ordering::SeqCst) == generation as usize);
            assert!(ctx.is_busy());
            ctx.terminate();
        }
        assert_eq!(factory.detached_count(), 2);

        let err = factory.spawn(3, signals.clone()).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Saturated {
                generation: 3,
                detached: 2
            }
        ));

        release.store(true, Ordering::SeqCst);
        wait_until(|| factory.detached_count() == 0);
        assert!(factory.spawn(3, signals).is_ok());
    }

    #[test]
    fn idle_contexts_are_not_tracked() {
        let factory = ThreadWorkerFactory::new(solver_fn(|_, _| Ok(Solution::default())))
            .with_detached_limit(1);
        let (signals, _rx) = mpsc::unbounded_channel();

        for generation in 1..=3 {
            let ctx = factory.spawn(generation, signals.clone()).unwrap();
            ctx.terminate();
        }
        assert_eq!(factory.detached_count(), 0);
    }

    #[test]
    fn clones_share_the_detached_registry() {
        let factory = ThreadWorkerFactory::new(solver_fn(|_, _| Ok(Solution::default())));
        let clone = factory.clone();
        clone
            .detached
            .lock()
            .unwrap()
            .push((7, thread::spawn(|| thread::sleep(Duration::from_millis(200)))));
        assert_eq!(factory.detached_count(), 1);
    }
}
