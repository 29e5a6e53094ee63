//! Cooperative-stop handles for long-lived engine tasks.
//!
//! Every background task in the engine (pipeline consumer, monitors, timers,
//! job workers) is spawned through [`TaskHandle::spawn`], which hands the
//! task the same `watch`-channel cancel signal the job engine hands
//! maintenance tasks. One cancellation idiom everywhere: select on
//! `stop.changed()` at wait points, or poll `*stop.borrow()` inside loops
//! that do their own pacing.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle owning one long-lived engine task.
///
/// Lifecycle contract:
/// - [`stop`](TaskHandle::stop) flips the cancel signal and awaits the task;
///   this is the graceful path and gives the task a chance to drain.
/// - [`abort`](TaskHandle::abort) cancels the task at its next await point
///   without running its shutdown path.
/// - Dropping the handle flips the cancel signal and then aborts whatever
///   has not finished; the task may not observe the signal before the abort
///   lands.
#[derive(Debug)]
pub struct TaskHandle {
    join: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl TaskHandle {
    /// Spawn a task wired to a fresh cancel signal.
    ///
    /// The closure receives a `watch::Receiver<bool>` whose value flips to
    /// `true` exactly once, when a stop is requested.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            join: Some(tokio::spawn(f(stop_rx))),
            stop,
        }
    }

    /// Whether the underlying task has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Flip the cancel signal without awaiting completion.
    ///
    /// Useful when several tasks should begin shutting down before any of
    /// them is awaited.
    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Gracefully stop the task and await its completion.
    ///
    /// Join errors (the task panicked or was already aborted) are ignored;
    /// a stopped task is stopped either way.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Cancel the task without waiting for its shutdown path.
    ///
    /// Prefer [`stop`](Self::stop) when possible so drains and final flushes
    /// run.
    pub fn abort(mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take()
            && !join.is_finished()
        {
            join.abort();
        }
    }
}
