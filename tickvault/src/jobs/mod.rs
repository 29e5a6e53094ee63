//! Prioritized job execution: worker pool, precondition gates, timeouts,
//! retry with backoff, and durable execution history.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

use tickvault_core::{MaintenanceTask, TaskContext, TaskHandle};
use tickvault_types::{
    AlertCategory, AlertItem, AlertSeverity, Execution, ExecutionStatus, Priority,
    SchedulerConfig, TaskReport, TaskType, VaultError,
};

use crate::alerts::AlertAggregator;
use crate::recon::Counters;
use crate::sched::cron::resolve_tz;
use crate::persist;

/// Execution lifecycle notification, published on a broadcast channel.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    /// Execution id.
    pub id: String,
    /// Parent schedule, when triggered by one.
    pub schedule_id: Option<String>,
    /// Task being executed.
    pub task_type: TaskType,
    /// Status after the transition.
    pub status: ExecutionStatus,
}

struct QueuedExec {
    priority: Priority,
    seq: u64,
    id: String,
}

impl PartialEq for QueuedExec {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedExec {}
impl PartialOrd for QueuedExec {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedExec {
    // BinaryHeap is a max-heap: "greater" means popped first, so urgent
    // priorities and earlier sequence numbers compare greater.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ExecLog {
    map: HashMap<String, Execution>,
    order: VecDeque<String>,
}

/// Worker-pool execution engine over a priority queue.
///
/// The engine dispatches task types to registered [`MaintenanceTask`]
/// implementations; it implements none of them itself. Executions are
/// idempotent by id: non-terminal entries found at startup are re-enqueued
/// and resume from the beginning.
pub struct JobEngine {
    cfg: SchedulerConfig,
    market_tz: Tz,
    registry: RwLock<HashMap<TaskType, Arc<dyn MaintenanceTask>>>,
    queue: Mutex<BinaryHeap<QueuedExec>>,
    wake: Notify,
    execs: Mutex<ExecLog>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    events: broadcast::Sender<ExecutionEvent>,
    seq: AtomicU64,
    history_path: Option<PathBuf>,
    alerts: Option<Arc<AlertAggregator>>,
    counters: Option<Arc<Counters>>,
}

impl JobEngine {
    /// Build an engine, loading persisted history and re-enqueueing any
    /// execution that never reached a terminal status.
    pub fn new(
        cfg: SchedulerConfig,
        history_path: Option<PathBuf>,
        alerts: Option<Arc<AlertAggregator>>,
        counters: Option<Arc<Counters>>,
    ) -> Result<Self, VaultError> {
        let market_tz = resolve_tz(&cfg.market_tz)?;
        let (events, _) = broadcast::channel(128);

        let mut map = HashMap::new();
        let mut order = VecDeque::new();
        let mut resume: Vec<(Priority, String)> = Vec::new();
        if let Some(path) = &history_path {
            let persisted: Vec<Execution> = persist::read_json(path)?.unwrap_or_default();
            for mut execution in persisted {
                if !execution.status.is_terminal() {
                    execution.status = ExecutionStatus::Pending;
                    execution.started_at = None;
                    resume.push((execution.priority, execution.id.clone()));
                }
                order.push_back(execution.id.clone());
                map.insert(execution.id.clone(), execution);
            }
        }

        let engine = Self {
            cfg,
            market_tz,
            registry: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            execs: Mutex::new(ExecLog { map, order }),
            cancels: Mutex::new(HashMap::new()),
            events,
            seq: AtomicU64::new(0),
            history_path,
            alerts,
            counters,
        };
        for (priority, id) in resume {
            info!(execution = %id, "resuming interrupted execution");
            engine.push_queue(priority, id);
        }
        Ok(engine)
    }

    /// Register (or replace) the implementation for a task type.
    pub fn register_task(&self, task_type: TaskType, task: Arc<dyn MaintenanceTask>) {
        self.registry
            .write()
            .expect("lock poisoned")
            .insert(task_type, task);
    }

    /// Subscribe to execution lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Enqueue an execution. The id is the dedup key: a second enqueue with
    /// a known id is ignored.
    pub fn enqueue(&self, execution: Execution) {
        let priority = execution.priority;
        let id = execution.id.clone();
        {
            let mut log = self.execs.lock().expect("mutex poisoned");
            if log.map.contains_key(&id) {
                debug!(execution = %id, "duplicate enqueue ignored");
                return;
            }
            log.order.push_back(id.clone());
            log.map.insert(id.clone(), execution);
            self.trim_locked(&mut log);
            self.persist_locked(&log);
        }
        self.push_queue(priority, id);
    }

    fn push_queue(&self, priority: Priority, id: String) {
        self.queue
            .lock()
            .expect("mutex poisoned")
            .push(QueuedExec {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                id,
            });
        self.wake.notify_one();
    }

    fn pop_next(&self) -> Option<String> {
        self.queue
            .lock()
            .expect("mutex poisoned")
            .pop()
            .map(|q| q.id)
    }

    /// Cancel an execution: queued ones immediately, running ones
    /// cooperatively through the task's cancel signal.
    pub fn cancel(&self, id: &str) -> Result<(), VaultError> {
        let mut log = self.execs.lock().expect("mutex poisoned");
        let Some(execution) = log.map.get_mut(id) else {
            return Err(VaultError::not_found(format!("execution {id}")));
        };
        match execution.status {
            ExecutionStatus::Pending => {
                execution.status = ExecutionStatus::Cancelled;
                execution.completed_at = Some(Utc::now());
                let event = Self::event_of(execution);
                self.persist_locked(&log);
                drop(log);
                let _ = self.events.send(event);
                Ok(())
            }
            ExecutionStatus::Running => {
                let task_type = execution.task_type;
                drop(log);
                let cancellable = self
                    .registry
                    .read()
                    .expect("lock poisoned")
                    .get(&task_type)
                    .is_none_or(|t| t.cancellable());
                if !cancellable {
                    warn!(execution = %id, %task_type, "task does not observe cancellation; it will run out its max duration");
                }
                if let Some(tx) = self.cancels.lock().expect("mutex poisoned").get(id) {
                    let _ = tx.send(true);
                }
                Ok(())
            }
            status => Err(VaultError::invalid_arg(format!(
                "execution {id} already terminal ({status:?})"
            ))),
        }
    }

    /// One execution by id.
    #[must_use]
    pub fn execution(&self, id: &str) -> Option<Execution> {
        self.execs
            .lock()
            .expect("mutex poisoned")
            .map
            .get(id)
            .cloned()
    }

    /// The rolling execution history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Execution> {
        let log = self.execs.lock().expect("mutex poisoned");
        log.order
            .iter()
            .filter_map(|id| log.map.get(id).cloned())
            .collect()
    }

    /// Whether the local market is currently open (weekdays inside the
    /// configured open/close window).
    #[must_use]
    pub fn market_open_now(&self) -> bool {
        market_open_at(&self.cfg, Utc::now().with_timezone(&self.market_tz))
    }

    fn event_of(execution: &Execution) -> ExecutionEvent {
        ExecutionEvent {
            id: execution.id.clone(),
            schedule_id: execution.schedule_id.clone(),
            task_type: execution.task_type,
            status: execution.status,
        }
    }

    fn trim_locked(&self, log: &mut ExecLog) {
        while log.order.len() > self.cfg.execution_history_limit {
            if let Some(old) = log.order.pop_front() {
                log.map.remove(&old);
            }
        }
    }

    fn persist_locked(&self, log: &ExecLog) {
        let Some(path) = &self.history_path else { return };
        let list: Vec<&Execution> = log.order.iter().filter_map(|id| log.map.get(id)).collect();
        if let Err(err) = persist::write_json_atomic(path, &list) {
            warn!(error = %err, "failed to persist execution history");
        }
    }

    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let base_ms = self.cfg.retry_base.as_millis() as u64;
        let cap_ms = self.cfg.retry_cap.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let bounded = exp.min(cap_ms);
        // Full jitter: anywhere in [0, bounded].
        let jittered = rand::rng().random_range(0..=bounded.max(1));
        std::time::Duration::from_millis(jittered)
    }

    /// Run one execution to a terminal status (or a retry re-enqueue).
    async fn run_execution(self: &Arc<Self>, id: &str) {
        let snapshot = {
            let mut log = self.execs.lock().expect("mutex poisoned");
            let Some(execution) = log.map.get_mut(id) else {
                return; // trimmed from history; stale queue entry
            };
            match execution.status {
                ExecutionStatus::Pending => {
                    execution.status = ExecutionStatus::Running;
                    execution.started_at = Some(Utc::now());
                }
                ExecutionStatus::Cancelled => return, // cancelled while queued
                status => {
                    // A queue entry pointing at a non-pending execution is an
                    // invariant violation; account the loss explicitly.
                    error!(execution = %id, ?status, "illegal queue entry for execution state");
                    if let Some(counters) = &self.counters {
                        counters.incr_unaccounted();
                    }
                    return;
                }
            }
            let event = Self::event_of(execution);
            let snapshot = execution.clone();
            self.persist_locked(&log);
            drop(log);
            let _ = self.events.send(event);
            snapshot
        };

        // Precondition gate: some tasks must not touch partitions the
        // collector is actively writing during market hours.
        if snapshot.task_type.requires_market_closed() && self.market_open_now() {
            let mut report = TaskReport::default();
            report
                .warnings
                .push(format!("{} skipped: market open", snapshot.task_type));
            self.finish(id, ExecutionStatus::CompletedWithWarnings, report, None);
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .expect("mutex poisoned")
            .insert(id.to_string(), cancel_tx);

        let work = async {
            if snapshot.task_type == TaskType::FullMaintenance {
                self.run_full_maintenance(&snapshot, cancel_rx.clone()).await
            } else {
                self.dispatch(snapshot.task_type, &snapshot, cancel_rx.clone())
                    .await
            }
        };
        let outcome = tokio::time::timeout(snapshot.max_duration, work).await;

        if let Some(tx) = self.cancels.lock().expect("mutex poisoned").remove(id) {
            // On timeout the task future was dropped, but a cooperative task
            // may have cloned the receiver into a child; flip it regardless.
            let _ = tx.send(true);
        }

        match outcome {
            Err(_elapsed) => {
                warn!(execution = %id, "execution exceeded max duration");
                self.finish(
                    id,
                    ExecutionStatus::TimedOut,
                    TaskReport::default(),
                    Some(format!(
                        "exceeded max duration of {:?}",
                        snapshot.max_duration
                    )),
                );
            }
            Ok(Ok(report)) => {
                let status = if report.warnings.is_empty() {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::CompletedWithWarnings
                };
                self.finish(id, status, report, None);
            }
            Ok(Err(VaultError::Cancelled)) => {
                self.finish(
                    id,
                    ExecutionStatus::Cancelled,
                    TaskReport::default(),
                    Some("cancelled".to_string()),
                );
            }
            Ok(Err(err)) if err.is_transient() && snapshot.attempt < snapshot.max_retries => {
                self.schedule_retry(id, &err);
            }
            Ok(Err(err)) => {
                self.finish(
                    id,
                    ExecutionStatus::Failed,
                    TaskReport::default(),
                    Some(err.to_string()),
                );
            }
        }
    }

    async fn dispatch(
        &self,
        task_type: TaskType,
        execution: &Execution,
        cancel: watch::Receiver<bool>,
    ) -> Result<TaskReport, VaultError> {
        let task = self
            .registry
            .read()
            .expect("lock poisoned")
            .get(&task_type)
            .cloned();
        let Some(task) = task else {
            return Err(VaultError::not_found(format!(
                "no task registered for {task_type}"
            )));
        };
        task.run(TaskContext {
            execution_id: execution.id.clone(),
            task: task_type,
            options: execution.options.clone(),
            cancel,
        })
        .await
    }

    /// The ordered full-maintenance sequence; individual steps that are
    /// gated, unregistered, or failing become warnings rather than aborting
    /// the run.
    async fn run_full_maintenance(
        &self,
        execution: &Execution,
        cancel: watch::Receiver<bool>,
    ) -> Result<TaskReport, VaultError> {
        let mut combined = TaskReport::default();
        for step in TaskType::FULL_MAINTENANCE_STEPS {
            if *cancel.borrow() {
                return Err(VaultError::Cancelled);
            }
            if step.requires_market_closed() && self.market_open_now() {
                combined.warnings.push(format!("{step} skipped: market open"));
                continue;
            }
            let registered = self
                .registry
                .read()
                .expect("lock poisoned")
                .contains_key(&step);
            if !registered {
                combined.warnings.push(format!("{step} skipped: no task registered"));
                continue;
            }
            match self.dispatch(step, execution, cancel.clone()).await {
                Ok(report) => combined.absorb(report),
                Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
                Err(err) => combined
                    .warnings
                    .push(format!("{step} failed: {err}")),
            }
        }
        Ok(combined)
    }

    fn schedule_retry(self: &Arc<Self>, id: &str, err: &VaultError) {
        let (priority, attempt) = {
            let mut log = self.execs.lock().expect("mutex poisoned");
            let Some(execution) = log.map.get_mut(id) else {
                return;
            };
            execution.status = ExecutionStatus::Pending;
            execution.attempt += 1;
            execution.error = Some(err.to_string());
            let out = (execution.priority, execution.attempt);
            let event = Self::event_of(execution);
            self.persist_locked(&log);
            drop(log);
            let _ = self.events.send(event);
            out
        };
        let delay = self.backoff_delay(attempt);
        info!(execution = %id, attempt, ?delay, "transient failure; retrying after backoff");
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.push_queue(priority, id);
        });
    }

    fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        report: TaskReport,
        error: Option<String>,
    ) {
        let event = {
            let mut log = self.execs.lock().expect("mutex poisoned");
            let Some(execution) = log.map.get_mut(id) else {
                return;
            };
            if execution.status.is_terminal() {
                error!(execution = %id, ?status, "attempted transition out of terminal status");
                if let Some(counters) = &self.counters {
                    counters.incr_unaccounted();
                }
                return;
            }
            execution.status = status;
            execution.completed_at = Some(Utc::now());
            execution.error = error.clone();
            execution.report.absorb(report);
            let event = Self::event_of(execution);
            self.persist_locked(&log);
            event
        };
        let _ = self.events.send(event.clone());

        if matches!(
            status,
            ExecutionStatus::Failed | ExecutionStatus::TimedOut
        ) && let Some(alerts) = &self.alerts
        {
            alerts.submit(AlertItem {
                category: AlertCategory::Scheduler,
                severity: AlertSeverity::Error,
                title: format!("execution {status:?}"),
                message: format!(
                    "{} ({}): {}",
                    event.id,
                    event.task_type,
                    error.unwrap_or_default()
                ),
                source: "job-engine".to_string(),
                fingerprint: Some(format!("execution-{}-{:?}", event.task_type, status)),
                timestamp: Utc::now(),
            });
        }
    }

    /// Send the cancel signal to every running execution.
    pub fn cancel_all_running(&self) {
        for tx in self.cancels.lock().expect("mutex poisoned").values() {
            let _ = tx.send(true);
        }
    }

    /// Spawn `n` workers draining the priority queue.
    pub fn spawn_workers(self: &Arc<Self>, n: usize) -> Vec<TaskHandle> {
        (0..n.max(1))
            .map(|_| {
                let this = Arc::clone(self);
                TaskHandle::spawn(move |mut stop| async move {
                    loop {
                        // A stop raised while an execution ran is observed
                        // here, before the next pop.
                        if *stop.borrow() {
                            break;
                        }
                        if let Some(id) = this.pop_next() {
                            this.run_execution(&id).await;
                            continue;
                        }
                        tokio::select! {
                            _ = stop.changed() => break,
                            () = this.wake.notified() => {}
                        }
                    }
                })
            })
            .collect()
    }

    /// Default worker-pool size: `min(cores, 8)` unless configured.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.cfg.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
                .min(8)
        })
    }
}

/// Weekdays inside the configured open/close window count as open.
fn market_open_at(cfg: &SchedulerConfig, local: chrono::DateTime<Tz>) -> bool {
    if local.weekday().number_from_monday() > 5 {
        return false;
    }
    let time = local.time();
    time >= cfg.market_open && time < cfg.market_close
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_gate_tracks_hours_and_weekends() {
        let cfg = SchedulerConfig::default();
        let tz: Tz = "America/New_York".parse().unwrap();
        let at = |y, mo, d, h, mi| {
            use chrono::TimeZone;
            tz.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
        };
        // Wednesday midday: open.
        assert!(market_open_at(&cfg, at(2026, 7, 1, 12, 0)));
        // Wednesday pre-open and post-close: closed.
        assert!(!market_open_at(&cfg, at(2026, 7, 1, 9, 0)));
        assert!(!market_open_at(&cfg, at(2026, 7, 1, 16, 0)));
        // Saturday midday: closed.
        assert!(!market_open_at(&cfg, at(2026, 7, 4, 12, 0)));
    }

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedExec {
            priority: Priority::Normal,
            seq: 0,
            id: "n0".into(),
        });
        heap.push(QueuedExec {
            priority: Priority::Critical,
            seq: 1,
            id: "c1".into(),
        });
        heap.push(QueuedExec {
            priority: Priority::Normal,
            seq: 2,
            id: "n2".into(),
        });
        heap.push(QueuedExec {
            priority: Priority::Background,
            seq: 3,
            id: "b3".into(),
        });
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|q| q.id)).collect();
        assert_eq!(order, vec!["c1", "n0", "n2", "b3"]);
    }

    #[test]
    fn backoff_is_capped() {
        let engine = JobEngine::new(SchedulerConfig::default(), None, None, None).unwrap();
        for attempt in 1..12 {
            let d = engine.backoff_delay(attempt);
            assert!(d <= SchedulerConfig::default().retry_cap);
        }
    }
}
