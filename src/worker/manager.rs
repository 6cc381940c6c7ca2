//! Task lifecycle manager: owns the worker context and the task state.
//!
//! The manager lives in the controller context and is driven through
//! `&mut self`: `start`/`abort` from user actions, and one of the
//! `process_*` methods to apply inbound worker signals. Nothing is shared
//! with worker contexts except the signal channel.
//!
//! ```text
//! start() ──► ensure context (generation += 1 on creation) ──► post(Command)
//!                                                                  │
//!   worker context ── Envelope{generation, event} ──► signal channel
//!                                                                  │
//! process_next() ◄─────────────────────────────────────────────────┘
//!   ├─ generation != current context ─► drop (stale)
//!   ├─ progress  ─► ProgressThrottler (50 ms)
//!   ├─ solution  ─► latest candidate
//!   ├─ final     ─► final result, clear progress, Idle when nothing outstanding
//!   └─ error     ─► last error,   clear progress, Idle when nothing outstanding
//!
//! abort() ──► terminate context ─► spawn replacement (generation += 1) ─► Idle
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BusyPolicy, OrchestratorConfig};
use crate::error::{Result, TaskError, WorkerError};
use crate::protocol::{Command, Envelope, Event, Progress, Solution};
use crate::worker::context::{WorkerContext, WorkerFactory, WorkerSignal};
use crate::worker::state::{Task, TaskState, TransitionCause};
use crate::worker::streams::{FailureKind, LabeledSolution, SolutionStreams, TaskFailure};
use crate::worker::throttle::ProgressThrottler;

/// A request posted to the current worker context that has not yet
/// produced its terminal event.
#[derive(Debug, Clone)]
struct Request {
    run_id: Uuid,
    label: Option<String>,
}

/// Orchestrates one background solver task.
pub struct TaskManager<F: WorkerFactory> {
    config: OrchestratorConfig,
    factory: F,
    /// Live worker context, if any.
    worker: Option<F::Context>,
    task: Task,
    /// Outstanding requests in posting order. A worker context serves its
    /// inbox in order, so the front is the one being computed.
    requests: VecDeque<Request>,
    signals_tx: mpsc::UnboundedSender<WorkerSignal>,
    signals_rx: mpsc::UnboundedReceiver<WorkerSignal>,
    throttle: ProgressThrottler,
    streams: SolutionStreams,
    working: watch::Sender<bool>,
    events: broadcast::Sender<Event>,
}

impl<F: WorkerFactory> TaskManager<F> {
    /// Create a manager. No worker context is created until the first `start`.
    pub fn new(factory: F, config: OrchestratorConfig) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events, _rx) = broadcast::channel(config.event_capacity.max(1));
        Self {
            throttle: ProgressThrottler::new(config.progress_interval),
            task: Task::new(config.max_transitions),
            streams: SolutionStreams::new(),
            working: watch::channel(false).0,
            worker: None,
            requests: VecDeque::new(),
            config,
            factory,
            signals_tx,
            signals_rx,
            events,
        }
    }

    /// Request a solve.
    ///
    /// `subjects` must be non-empty; this is not checked here. While already
    /// working, the configured [`BusyPolicy`] decides what happens.
    pub fn start(
        &mut self,
        plan: impl Into<String>,
        subjects: Vec<String>,
        excluded_teachers: BTreeSet<String>,
    ) -> Result<Uuid> {
        self.submit(None, Command::start(plan, subjects, excluded_teachers))
    }

    /// Like [`start`](Self::start), attaching a display label to the
    /// candidates and final result of this request.
    pub fn start_labeled(
        &mut self,
        label: impl Into<String>,
        plan: impl Into<String>,
        subjects: Vec<String>,
        excluded_teachers: BTreeSet<String>,
    ) -> Result<Uuid> {
        self.submit(
            Some(label.into()),
            Command::start(plan, subjects, excluded_teachers),
        )
    }

    fn submit(&mut self, label: Option<String>, command: Command) -> Result<Uuid> {
        if self.task.state.is_working() {
            match self.config.busy_policy {
                BusyPolicy::Reject => {
                    return Err(TaskError::Busy {
                        generation: self.task.generation,
                    }
                    .into());
                }
                BusyPolicy::Supersede => {
                    info!(
                        generation = self.task.generation,
                        "Superseding running solver task"
                    );
                    self.retire_worker(TransitionCause::Superseded);
                }
                BusyPolicy::Forward => {
                    debug!(
                        generation = self.task.generation,
                        outstanding = self.task.outstanding,
                        "Forwarding request to busy worker context"
                    );
                }
            }
        }

        let raw = command.encode()?;
        self.post(raw)?;

        let run_id = Uuid::new_v4();
        self.task.run_id = Some(run_id);
        self.task.label = label.clone();
        self.requests.push_back(Request { run_id, label });
        self.sync_outstanding();

        if !self.task.state.is_working() {
            self.transition(TaskState::Working, TransitionCause::Started);
            self.throttle.reset();
            self.streams.on_start();
            self.working.send_replace(true);
        }

        info!(
            generation = self.task.generation,
            run_id = %run_id,
            outstanding = self.task.outstanding,
            "Solver task started"
        );
        Ok(run_id)
    }

    /// Post to the current context, replacing it once if it turned out to be dead.
    fn post(&mut self, raw: String) -> Result<()> {
        let posted = self.ensure_worker()?.post(raw.clone());
        match posted {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Worker context unreachable, replacing it");
                if let Some(dead) = self.worker.take() {
                    dead.terminate();
                }
                self.ensure_worker()?
                    .post(raw)
                    .map_err(TaskError::NoWorker)?;
                Ok(())
            }
        }
    }

    /// Stop the running request immediately.
    ///
    /// The worker context is terminated without any flush and replaced by a
    /// fresh one in the next generation. Results already published stay
    /// visible. Does nothing while idle. If the replacement cannot be
    /// created, the next `start` retries and reports why.
    pub fn abort(&mut self) {
        if !self.task.state.is_working() {
            debug!(generation = self.task.generation, "Abort while idle ignored");
            return;
        }

        info!(
            generation = self.task.generation,
            run_id = ?self.current_run(),
            "Aborting solver task"
        );
        self.retire_worker(TransitionCause::Aborted);

        if let Err(e) = self.ensure_worker() {
            error!(error = %e, "Failed to prepare replacement worker context");
        }
    }

    /// Terminate the current context and fall back to idle.
    fn retire_worker(&mut self, cause: TransitionCause) {
        if let Some(worker) = self.worker.take() {
            worker.terminate();
        }
        self.requests.clear();
        self.sync_outstanding();
        self.throttle.clear();
        if self.task.state.is_working() {
            self.transition(TaskState::Idle, cause);
            self.working.send_replace(false);
        }
    }

    fn ensure_worker(&mut self) -> std::result::Result<&mut F::Context, WorkerError> {
        if self.worker.is_none() {
            let generation = self.task.generation + 1;
            let context = self.factory.spawn(generation, self.signals_tx.clone())?;
            self.task.generation = generation;
            info!(generation, "Worker context ready");
            self.worker = Some(context);
        }
        self.worker.as_mut().ok_or(WorkerError::Closed {
            generation: self.task.generation,
        })
    }

    fn sync_outstanding(&mut self) {
        self.task.outstanding = u32::try_from(self.requests.len()).unwrap_or(u32::MAX);
    }

    fn transition(&mut self, to: TaskState, cause: TransitionCause) {
        if let Err(reason) = self.task.transition_to(to, cause) {
            warn!(%reason, "Ignoring invalid task transition");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.generation() == generation)
    }

    /// Wait for the next worker signal and apply it.
    ///
    /// Returns the event if it changed observable state; `None` when the signal
    /// was stale, malformed, throttled or otherwise ignored.
    pub async fn process_next(&mut self) -> Option<Event> {
        // The manager keeps a sender alive, so the channel never closes.
        let signal = self.signals_rx.recv().await?;
        self.handle_signal(signal, Instant::now())
    }

    /// Apply every signal already queued, without waiting. Returns how many
    /// changed observable state.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(signal) = self.signals_rx.try_recv() {
            if self.handle_signal(signal, Instant::now()).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Process signals until the task is idle.
    pub async fn run_until_idle(&mut self) {
        while self.task.state.is_working() {
            self.process_next().await;
        }
    }

    pub(crate) fn handle_signal(&mut self, signal: WorkerSignal, now: Instant) -> Option<Event> {
        match signal {
            WorkerSignal::Message(raw) => {
                let envelope = match Envelope::decode(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Ignoring worker message");
                        return None;
                    }
                };
                if !self.is_current(envelope.generation) {
                    debug!(
                        generation = envelope.generation,
                        current = self.task.generation,
                        kind = envelope.event.kind(),
                        "Dropping stale worker event"
                    );
                    return None;
                }
                self.apply(envelope.generation, envelope.event, now)
            }
            WorkerSignal::Fault { generation, reason } => {
                if !self.is_current(generation) {
                    debug!(generation, "Dropping fault from retired worker context");
                    return None;
                }
                warn!(generation, %reason, "Worker context faulted");
                if let Some(worker) = self.worker.take() {
                    worker.terminate();
                }
                let was_working = self.task.state.is_working();
                let run_id = self.current_run();
                self.requests.clear();
                self.sync_outstanding();
                self.throttle.clear();
                if !was_working {
                    return None;
                }
                self.streams.on_failure(TaskFailure {
                    kind: FailureKind::Fault,
                    generation,
                    run_id,
                    message: reason.clone(),
                });
                self.transition(TaskState::Idle, TransitionCause::Faulted);
                self.working.send_replace(false);
                let event = Event::Error { message: reason };
                let _ = self.events.send(event.clone());
                Some(event)
            }
        }
    }

    fn apply(&mut self, generation: u64, event: Event, now: Instant) -> Option<Event> {
        if !self.task.state.is_working() {
            warn!(
                generation,
                kind = event.kind(),
                "Ignoring worker event with no outstanding request"
            );
            return None;
        }

        match &event {
            Event::Progress { progress } => {
                if !self.throttle.offer(*progress, now) {
                    return None;
                }
            }
            Event::Solution { solution } => {
                self.streams.on_candidate(self.labeled(generation, solution.clone()));
            }
            Event::Final { solution } => {
                self.streams.on_final(self.labeled(generation, solution.clone()));
                self.complete_one(TransitionCause::Finished);
            }
            Event::Error { message } => {
                self.streams.on_failure(TaskFailure {
                    kind: FailureKind::Solver,
                    generation,
                    run_id: self.current_run(),
                    message: message.clone(),
                });
                self.complete_one(TransitionCause::Failed);
            }
        }

        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Attach the label and run id of the request being computed.
    fn labeled(&self, generation: u64, solution: Solution) -> LabeledSolution {
        let front = self.requests.front();
        LabeledSolution {
            label: front.and_then(|r| r.label.clone()),
            run_id: front.map_or_else(Uuid::nil, |r| r.run_id),
            generation,
            solution,
        }
    }

    /// The request at the front of the queue produced its terminal event.
    fn complete_one(&mut self, cause: TransitionCause) {
        let done = self.requests.pop_front();
        self.sync_outstanding();
        self.throttle.clear();
        if self.requests.is_empty() {
            self.transition(TaskState::Idle, cause);
            self.working.send_replace(false);
            info!(
                generation = self.task.generation,
                run_id = ?done.map(|r| r.run_id),
                ?cause,
                elapsed = ?self.task.elapsed(),
                "Solver task finished"
            );
        }
    }

    pub fn working(&self) -> bool {
        self.task.state.is_working()
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    /// Generation of the most recently created worker context.
    pub fn generation(&self) -> u64 {
        self.task.generation
    }

    /// Whether a worker context is ready to accept a request.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run id of the request the worker context is computing right now.
    pub fn current_run(&self) -> Option<Uuid> {
        self.requests.front().map(|r| r.run_id)
    }

    pub fn progress(&self) -> Option<Progress> {
        self.throttle.current()
    }

    pub fn latest_candidate(&self) -> Option<LabeledSolution> {
        self.streams.latest_candidate()
    }

    pub fn final_result(&self) -> Option<LabeledSolution> {
        self.streams.final_result()
    }

    pub fn last_error(&self) -> Option<TaskFailure> {
        self.streams.last_error()
    }

    pub fn watch_working(&self) -> watch::Receiver<bool> {
        self.working.subscribe()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Option<Progress>> {
        self.throttle.subscribe()
    }

    pub fn watch_candidate(&self) -> watch::Receiver<Option<LabeledSolution>> {
        self.streams.watch_candidate()
    }

    pub fn watch_final(&self) -> watch::Receiver<Option<LabeledSolution>> {
        self.streams.watch_final()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<TaskFailure>> {
        self.streams.watch_error()
    }

    /// Stream of accepted events (current generation, after throttling).
    /// Worker faults appear as `Event::Error`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

impl<F: WorkerFactory> Drop for TaskManager<F> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.terminate();
        }
    }
}
