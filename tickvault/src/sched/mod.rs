//! Cron scheduling: a min-heap of next-fire times drained by a single timer
//! task that enqueues executions into the job engine.

pub(crate) mod cron;
mod store;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use tickvault_core::TaskHandle;
use tickvault_types::{CronSchedule, Execution, VaultError};

use crate::jobs::{ExecutionEvent, JobEngine};
use cron::{CronExpression, resolve_tz};
use store::ScheduleStore;

struct SchedInner {
    schedules: HashMap<String, CronSchedule>,
    // Reverse for a min-heap; entries are (fire time, schedule id) and may go
    // stale after an upsert, so the timer re-checks against the schedule.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

/// The scheduler: owns durable schedules, computes next fires in each
/// schedule's zone, and feeds due executions to the job engine.
pub struct Scheduler {
    inner: Mutex<SchedInner>,
    rearm: Notify,
    store: ScheduleStore,
    engine: Arc<JobEngine>,
}

impl Scheduler {
    /// Build a scheduler, loading any persisted schedules.
    ///
    /// Stale or missing `next_execution_at` values are recomputed so the
    /// invariant `next_execution_at > now` holds for every enabled schedule.
    pub fn new(engine: Arc<JobEngine>, path: Option<PathBuf>) -> Result<Self, VaultError> {
        let store = ScheduleStore::new(path);
        let mut schedules = HashMap::new();
        let mut heap = BinaryHeap::new();
        let now = Utc::now();

        for mut schedule in store.load()? {
            let expr = CronExpression::parse(&schedule.cron_expression)?;
            let tz = resolve_tz(&schedule.time_zone)?;
            if schedule.enabled {
                let stale = schedule
                    .next_execution_at
                    .is_none_or(|next| next <= now);
                if stale {
                    schedule.next_execution_at = expr.next_after(now, tz);
                }
                if let Some(next) = schedule.next_execution_at {
                    heap.push(Reverse((next, schedule.id.clone())));
                }
            }
            schedules.insert(schedule.id.clone(), schedule);
        }

        Ok(Self {
            inner: Mutex::new(SchedInner { schedules, heap }),
            rearm: Notify::new(),
            store,
            engine,
        })
    }

    /// Create or replace a schedule.
    ///
    /// The cron expression and time zone are validated here, so a malformed
    /// write never reaches the heap. Returns the stored schedule with its
    /// computed `next_execution_at`.
    pub fn upsert(&self, mut schedule: CronSchedule) -> Result<CronSchedule, VaultError> {
        let expr = CronExpression::parse(&schedule.cron_expression)?;
        let tz = resolve_tz(&schedule.time_zone)?;
        schedule.next_execution_at = if schedule.enabled {
            expr.next_after(Utc::now(), tz)
        } else {
            None
        };

        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(next) = schedule.next_execution_at {
            inner.heap.push(Reverse((next, schedule.id.clone())));
        }
        inner
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        self.persist_locked(&inner);
        drop(inner);

        self.rearm.notify_one();
        info!(id = %schedule.id, cron = %schedule.cron_expression, zone = %schedule.time_zone, "schedule upserted");
        Ok(schedule)
    }

    /// Remove a schedule. Heap entries for it become stale and are skipped.
    pub fn remove(&self, id: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.schedules.remove(id).is_none() {
            return Err(VaultError::not_found(format!("schedule {id}")));
        }
        self.persist_locked(&inner);
        drop(inner);
        self.rearm.notify_one();
        Ok(())
    }

    /// All schedules, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<CronSchedule> {
        let inner = self.inner.lock().expect("mutex poisoned");
        let mut out: Vec<CronSchedule> = inner.schedules.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// One schedule by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<CronSchedule> {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .schedules
            .get(id)
            .cloned()
    }

    fn persist_locked(&self, inner: &SchedInner) {
        let mut list: Vec<CronSchedule> = inner.schedules.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(err) = self.store.save(&list) {
            warn!(error = %err, "failed to persist schedules");
        }
    }

    /// Fire everything due at `now`; returns the delay to the next wake-up.
    ///
    /// Factored out of the timer task so tests can drive it directly.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let mut due: Vec<CronSchedule> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            while let Some(Reverse((fire_at, id))) = inner.heap.peek().cloned() {
                if fire_at > now {
                    break;
                }
                inner.heap.pop();
                let Some(schedule) = inner.schedules.get(&id) else {
                    continue; // removed; stale heap entry
                };
                // Stale entry after an upsert re-pushed a fresher time.
                if !schedule.enabled || schedule.next_execution_at != Some(fire_at) {
                    continue;
                }
                due.push(schedule.clone());
            }

            for schedule in &due {
                let entry = inner
                    .schedules
                    .get_mut(&schedule.id)
                    .expect("due schedule present");
                entry.last_executed_at = Some(now);
                entry.execution_count += 1;
                // Parse errors cannot happen here; upsert validated both.
                let next = CronExpression::parse(&entry.cron_expression)
                    .ok()
                    .zip(resolve_tz(&entry.time_zone).ok())
                    .and_then(|(expr, tz)| expr.next_after(now, tz));
                entry.next_execution_at = next;
                let entry_id = entry.id.clone();
                if let Some(next) = next {
                    inner.heap.push(Reverse((next, entry_id)));
                }
            }
            if !due.is_empty() {
                self.persist_locked(&inner);
            }
        }

        for schedule in due {
            let execution = Execution::new(
                format!("{}-{}", schedule.id, now.timestamp()),
                Some(schedule.id.clone()),
                schedule.task_type,
                schedule.priority,
                schedule.options.clone(),
                schedule.max_duration,
                schedule.max_retries,
                now,
            );
            debug!(schedule = %schedule.id, execution = %execution.id, "schedule fired");
            self.engine.enqueue(execution);
        }

        let inner = self.inner.lock().expect("mutex poisoned");
        inner.heap.peek().map(|Reverse((fire_at, _))| {
            (*fire_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        })
    }

    /// Spawn the single timer task waking at the heap head.
    pub fn spawn_timer(self: &Arc<Self>) -> TaskHandle {
        let this = Arc::clone(self);
        TaskHandle::spawn(move |mut stop| async move {
            // An idle scheduler parks until a schedule write re-arms it.
            const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(3600);
            loop {
                let wait = this.fire_due(Utc::now()).unwrap_or(IDLE_WAIT);
                tokio::select! {
                    _ = stop.changed() => break,
                    () = this.rearm.notified() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
        })
    }

    /// Spawn the listener that folds terminal execution statuses back into
    /// the parent schedule's `last_status`.
    pub fn spawn_status_listener(self: &Arc<Self>) -> TaskHandle {
        let this = Arc::clone(self);
        let mut rx = self.engine.subscribe_events();
        TaskHandle::spawn(move |mut stop| async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = rx.recv() => match event {
                        Ok(ExecutionEvent { schedule_id: Some(schedule_id), status, .. })
                            if status.is_terminal() =>
                        {
                            let mut inner = this.inner.lock().expect("mutex poisoned");
                            if let Some(schedule) = inner.schedules.get_mut(&schedule_id) {
                                schedule.last_status = Some(status);
                                this.persist_locked(&inner);
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
