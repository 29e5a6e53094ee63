//! The collector: wiring, lifecycle, and the builder.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tickvault_core::{
    ArchiveWriter, InstanceCoordinator, MaintenanceTask, MarketDataProvider, TaskHandle,
};
use tickvault_types::{
    AlertCategory, AlertItem, AlertSeverity, CollectorConfig, StatusReport, SymbolSpec, TaskType,
    VaultError,
};

use crate::alerts::AlertAggregator;
use crate::coordinator::SoloCoordinator;
use crate::health::HealthMonitor;
use crate::health::degradation::{DegradationEvent, DegradationScorer};
use crate::health::skew::SkewEstimator;
use crate::jobs::JobEngine;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{ConsumerParts, EventPipeline, PipelineStats};
use crate::recon::Counters;
use crate::sched::Scheduler;
use crate::status;
use crate::validate::ValidatorChain;

/// Builder for a [`Collector`].
pub struct CollectorBuilder {
    cfg: CollectorConfig,
    providers: Vec<Arc<dyn MarketDataProvider>>,
    archive: Option<Arc<dyn ArchiveWriter>>,
    coordinator: Option<Arc<dyn InstanceCoordinator>>,
    tasks: Vec<(TaskType, Arc<dyn MaintenanceTask>)>,
    state_dir: Option<PathBuf>,
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: CollectorConfig::default(),
            providers: Vec::new(),
            archive: None,
            coordinator: None,
            tasks: Vec::new(),
            state_dir: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, cfg: CollectorConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Register a market-data provider.
    ///
    /// Registration order is the initial subscription order; failover may
    /// move the active provider to any other registered one. Disabled
    /// providers are skipped at build time.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Set the archive sink. Required.
    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveWriter>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Override the instance coordinator (defaults to single-instance).
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<dyn InstanceCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Register a maintenance task implementation.
    #[must_use]
    pub fn with_task(mut self, task_type: TaskType, task: Arc<dyn MaintenanceTask>) -> Self {
        self.tasks.push((task_type, task));
        self
    }

    /// Directory for durable engine state (schedules, execution history,
    /// last-known subscriptions). `None` keeps state in memory only.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Wire everything. Validation errors (config, weights, zones) surface
    /// here; nothing is spawned until [`Collector::start`].
    pub fn build(self) -> Result<Collector, VaultError> {
        self.cfg.validate()?;
        let archive = self
            .archive
            .ok_or_else(|| VaultError::invalid_arg("an archive sink is required"))?;

        let counters = Arc::new(Counters::new());
        let alerts = Arc::new(AlertAggregator::new(self.cfg.alerts.clone()));
        let health = Arc::new(HealthMonitor::new(self.cfg.health.clone()));
        let scorer = Arc::new(DegradationScorer::new(self.cfg.degradation.clone())?);
        let skew = Arc::new(SkewEstimator::default());
        let coordinator = self
            .coordinator
            .unwrap_or_else(|| Arc::new(SoloCoordinator::default()));

        let providers: Vec<Arc<dyn MarketDataProvider>> = self
            .providers
            .into_iter()
            .filter(|p| {
                let enabled = p.is_enabled();
                if !enabled {
                    info!(provider = %p.key(), "provider disabled; skipping");
                }
                enabled
            })
            .collect();

        let (pipeline, rx) = EventPipeline::new(
            &self.cfg.pipeline,
            Arc::clone(&counters),
            Some(Arc::clone(&alerts)),
            Some(Arc::clone(&health)),
        );

        for provider in &providers {
            provider.attach(pipeline.clone());
            health.register(provider.key(), None);
        }

        let state = |file: &str| self.state_dir.as_ref().map(|d| d.join(file));
        let orchestrator = Arc::new(Orchestrator::new(
            providers.clone(),
            self.cfg.provider_call_timeout,
            Arc::clone(&coordinator),
            Some(Arc::clone(&scorer)),
            state("subscriptions.json"),
        ));

        let jobs = Arc::new(JobEngine::new(
            self.cfg.scheduler.clone(),
            state("executions.json"),
            Some(Arc::clone(&alerts)),
            Some(Arc::clone(&counters)),
        )?);
        for (task_type, task) in self.tasks {
            jobs.register_task(task_type, task);
        }

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&jobs),
            state("schedules.json"),
        )?);

        Ok(Collector {
            cfg: self.cfg,
            counters,
            alerts,
            health,
            scorer,
            skew,
            coordinator,
            pipeline,
            consumer_rx: Mutex::new(Some(rx)),
            archive,
            orchestrator,
            jobs,
            scheduler,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// The assembled engine. Build with [`CollectorBuilder`], then [`start`],
/// then [`shutdown`] for a graceful drain.
///
/// [`start`]: Collector::start
/// [`shutdown`]: Collector::shutdown
pub struct Collector {
    cfg: CollectorConfig,
    counters: Arc<Counters>,
    alerts: Arc<AlertAggregator>,
    health: Arc<HealthMonitor>,
    scorer: Arc<DegradationScorer>,
    skew: Arc<SkewEstimator>,
    coordinator: Arc<dyn InstanceCoordinator>,
    pipeline: Arc<EventPipeline>,
    consumer_rx: Mutex<Option<tokio::sync::mpsc::Receiver<tickvault_types::MarketEvent>>>,
    archive: Arc<dyn ArchiveWriter>,
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<JobEngine>,
    scheduler: Arc<Scheduler>,
    handles: Mutex<Vec<TaskHandle>>,
    started: AtomicBool,
}

impl Collector {
    /// Spawn the consumer, monitors, scheduler timer, and worker pool, then
    /// apply the configured symbol set.
    pub async fn start(&self) -> Result<(), VaultError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VaultError::invalid_arg("collector already started"));
        }

        let rx = self
            .consumer_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VaultError::invalid_arg("consumer already taken"))?;

        let chain = ValidatorChain::new(&self.cfg.validators, Some(Arc::clone(&self.alerts)));
        let mut handles = self.handles.lock().await;
        handles.push(self.pipeline.spawn_consumer(ConsumerParts {
            rx,
            archive: Arc::clone(&self.archive),
            chain,
            skew: Arc::clone(&self.skew),
        }));
        handles.push(self.health.spawn_heartbeat(Some(Arc::clone(&self.scorer))));
        handles.push(self.scorer.spawn_evaluator(Arc::clone(&self.health)));
        handles.push(self.alerts.spawn_flusher());
        handles.push(self.scheduler.spawn_timer());
        handles.push(self.scheduler.spawn_status_listener());
        handles.extend(self.jobs.spawn_workers(self.jobs.worker_count()));
        handles.push(self.spawn_failover_watch());
        handles.push(self.spawn_claim_heartbeat());
        drop(handles);

        // Configured symbols win; otherwise fall back to the persisted
        // last-known set so a restart resumes collection before any reload.
        let desired = if self.cfg.symbols.is_empty() {
            self.orchestrator.recovered_desired().unwrap_or_default()
        } else {
            self.cfg.symbols.clone()
        };
        if self.orchestrator.provider_keys().is_empty() {
            if !desired.is_empty() {
                warn!(
                    symbols = desired.len(),
                    "symbols configured but no providers registered; nothing to subscribe"
                );
            }
        } else {
            let outcome = self.orchestrator.apply(desired).await?;
            info!(
                subscribed = outcome.subscribed,
                failed = outcome.failed,
                "initial subscription pass complete"
            );
        }
        Ok(())
    }

    /// Re-apply a new desired symbol set (config reload path).
    pub async fn apply_symbols(&self, desired: Vec<SymbolSpec>) -> Result<(), VaultError> {
        let outcome = self.orchestrator.apply(desired).await?;
        info!(
            subscribed = outcome.subscribed,
            unsubscribed = outcome.unsubscribed,
            failed = outcome.failed,
            "symbol set applied"
        );
        Ok(())
    }

    /// Watches degradation transitions and moves subscriptions off a
    /// degraded active provider when a better candidate exists.
    fn spawn_failover_watch(&self) -> TaskHandle {
        let orchestrator = Arc::clone(&self.orchestrator);
        let scorer = Arc::clone(&self.scorer);
        let mut events = self.scorer.subscribe();
        TaskHandle::spawn(move |mut stop| async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = events.recv() => match event {
                        Ok(DegradationEvent::Degraded { provider, .. }) => {
                            if orchestrator.active_provider().await != Some(provider.clone()) {
                                continue;
                            }
                            let candidates = orchestrator.provider_keys();
                            match scorer.select_best(&candidates, Some(&provider)) {
                                Some(target) => {
                                    warn!(from = %provider, to = %target, "active provider degraded; failing over");
                                    if let Err(err) = orchestrator.failover_to(&target).await {
                                        warn!(error = %err, "failover failed");
                                    }
                                }
                                None => {
                                    warn!(provider = %provider, "active provider degraded; no failover candidate qualifies");
                                }
                            }
                        }
                        Ok(DegradationEvent::Recovered { .. }) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Keeps this instance's symbol claims fresh and sweeps stale ones.
    fn spawn_claim_heartbeat(&self) -> TaskHandle {
        let coordinator = Arc::clone(&self.coordinator);
        let interval = self.cfg.coordinator.heartbeat_interval;
        TaskHandle::spawn(move |mut stop| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        coordinator.refresh_heartbeat();
                        let reclaimed = coordinator.reclaim_stale();
                        if reclaimed > 0 {
                            info!(reclaimed, "reclaimed stale symbol claims");
                        }
                    }
                }
            }
        })
    }

    /// Graceful shutdown: stop accepting publishes, drain the pipeline up to
    /// the drain timeout, stop every task, flush alerts, close the archive,
    /// and release symbol claims.
    pub async fn shutdown(&self) {
        info!("collector shutting down");
        self.pipeline.close();
        self.jobs.cancel_all_running();
        self.orchestrator.teardown().await;

        let handles: Vec<TaskHandle> = self.handles.lock().await.drain(..).collect();
        // Signal everything first so the wind-downs overlap, then await.
        for handle in &handles {
            handle.request_stop();
        }
        futures::future::join_all(handles.into_iter().map(TaskHandle::stop)).await;

        if let Err(err) = self.archive.close().await {
            warn!(error = %err, "archive close failed");
        }

        // Anything still unaccounted at quiescence is a finding, not noise.
        let snapshot = self.counters.snapshot();
        if snapshot.residual() != 0 || snapshot.unaccounted != 0 {
            warn!(
                residual = snapshot.residual(),
                unaccounted = snapshot.unaccounted,
                "reconciliation mismatch at shutdown"
            );
            self.alerts.submit(AlertItem {
                category: AlertCategory::System,
                severity: AlertSeverity::Warning,
                title: "reconciliation mismatch".to_string(),
                message: format!(
                    "residual {} unaccounted {} at shutdown",
                    snapshot.residual(),
                    snapshot.unaccounted
                ),
                source: "collector".to_string(),
                fingerprint: Some("reconciliation-mismatch".to_string()),
                timestamp: Utc::now(),
            });
            self.alerts.flush_all();
        }
    }

    /// Assemble the read-only status view.
    pub async fn status(&self) -> StatusReport {
        status::build_report(
            &self.counters,
            &self.pipeline.stats(),
            &self.health,
            &self.scorer,
            &self.skew,
            self.orchestrator.counts().await,
        )
    }

    /// Raise a fatal alert and begin shutdown. Used by the binary when a
    /// non-recoverable condition (unwritable storage root) is detected.
    pub async fn fail_fatal(&self, reason: &str) {
        self.alerts.submit(AlertItem {
            category: AlertCategory::System,
            severity: AlertSeverity::Critical,
            title: "fatal condition".to_string(),
            message: reason.to_string(),
            source: "collector".to_string(),
            fingerprint: Some("fatal".to_string()),
            timestamp: Utc::now(),
        });
        self.alerts.flush_all();
        self.shutdown().await;
    }

    /// The reconciliation counters.
    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// The pipeline stats handle.
    #[must_use]
    pub fn pipeline_stats(&self) -> Arc<PipelineStats> {
        self.pipeline.stats()
    }

    /// The pipeline publish surface (also handed to providers at build).
    #[must_use]
    pub fn pipeline(&self) -> Arc<EventPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// The alert aggregator.
    #[must_use]
    pub fn alerts(&self) -> Arc<AlertAggregator> {
        Arc::clone(&self.alerts)
    }

    /// The health monitor.
    #[must_use]
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// The degradation scorer.
    #[must_use]
    pub fn scorer(&self) -> Arc<DegradationScorer> {
        Arc::clone(&self.scorer)
    }

    /// The subscription orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// The cron scheduler.
    #[must_use]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// The job engine.
    #[must_use]
    pub fn jobs(&self) -> Arc<JobEngine> {
        Arc::clone(&self.jobs)
    }

    /// The instance coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<dyn InstanceCoordinator> {
        Arc::clone(&self.coordinator)
    }
}
