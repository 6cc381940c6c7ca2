//! Rate limiting for progress updates.
//!
//! Solvers can report progress thousands of times per second. Observers only
//! see a report when at least `interval` has passed since the last one they
//! saw; everything in between is dropped, not merged.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::protocol::Progress;

/// Publishes throttled progress to a `watch` channel.
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: Option<Instant>,
    tx: watch::Sender<Option<Progress>>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            interval,
            last_emit: None,
            tx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Publishes `progress` if the interval since the last published report
    /// has elapsed. Returns whether it was published.
    pub fn offer(&mut self, progress: Progress, now: Instant) -> bool {
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_emit = Some(now);
        self.tx.send_replace(Some(progress));
        true
    }

    /// Removes any displayed progress, regardless of the throttle window.
    pub fn clear(&mut self) {
        self.tx.send_replace(None);
    }

    /// Forgets the last emission so the next report goes through.
    pub fn reset(&mut self) {
        self.last_emit = None;
    }

    pub fn current(&self) -> Option<Progress> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.tx.subscribe()
    }
}
