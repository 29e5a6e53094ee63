//! Configuration types shared across the engine and its collaborators.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::VaultError;
use crate::symbol::SymbolSpec;

/// Bounded event-queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Queue capacity; publishes beyond it are dropped, never blocked on.
    pub capacity: usize,
    /// How long shutdown waits for the consumer to drain before abandoning.
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Heartbeat and latency-tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Cadence of the heartbeat check timer.
    pub heartbeat_interval: Duration,
    /// Silence longer than this counts as a missed heartbeat.
    pub heartbeat_timeout: Duration,
    /// Missed heartbeats before the channel is marked disconnected.
    pub max_missed_heartbeats: u32,
    /// Smoothing factor for the recent-latency EWMA.
    pub latency_ewma_alpha: f64,
    /// Bounded sample window used for the p95 digest.
    pub latency_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            latency_ewma_alpha: 0.2,
            latency_window: 256,
        }
    }
}

/// Component weights for the composite degradation score.
///
/// Weights must sum to 1.0; [`DegradationWeights::validate`] is checked at
/// scorer construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegradationWeights {
    /// Weight of the connection component.
    pub connection: f64,
    /// Weight of the latency component.
    pub latency: f64,
    /// Weight of the error-rate component.
    pub error_rate: f64,
    /// Weight of the reconnect component.
    pub reconnect: f64,
}

impl Default for DegradationWeights {
    fn default() -> Self {
        Self {
            connection: 0.35,
            latency: 0.25,
            error_rate: 0.25,
            reconnect: 0.15,
        }
    }
}

impl DegradationWeights {
    /// Reject weight sets that do not sum to 1.0 (within f64 tolerance).
    pub fn validate(&self) -> Result<(), VaultError> {
        let sum = self.connection + self.latency + self.error_rate + self.reconnect;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(VaultError::invalid_arg(format!(
                "degradation weights must sum to 1.0, got {sum}"
            )));
        }
        if [self.connection, self.latency, self.error_rate, self.reconnect]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(VaultError::invalid_arg(
                "degradation weights must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Degradation scoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Cadence of score evaluation.
    pub evaluation_interval: Duration,
    /// Component weights; must sum to 1.0.
    pub weights: DegradationWeights,
    /// Latency below this scores 0.
    pub latency_threshold_ms: f64,
    /// Latency at or above this scores 1.
    pub latency_max_ms: f64,
    /// Failure rate below this scores 0.
    pub error_rate_threshold: f64,
    /// Sliding window for success/failure accounting.
    pub error_window: Duration,
    /// Reconnects per hour at or above this score 1.
    pub max_reconnects_per_hour: f64,
    /// Missed heartbeats at which the connection component saturates.
    pub missed_heartbeat_ceiling: u32,
    /// Composite at or above this marks the provider degraded.
    pub degradation_threshold: f64,
    /// Minimum normalized (0-100) score a failover candidate must have.
    pub failover_threshold: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            weights: DegradationWeights::default(),
            latency_threshold_ms: 200.0,
            latency_max_ms: 2000.0,
            error_rate_threshold: 0.05,
            error_window: Duration::from_secs(300),
            max_reconnects_per_hour: 10.0,
            missed_heartbeat_ceiling: 5,
            degradation_threshold: 0.6,
            failover_threshold: 40.0,
        }
    }
}

/// Alert batching and dedup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Flush cadence for pending groups.
    pub window: Duration,
    /// Fingerprints seen within this window are suppressed.
    pub dedup_cooldown: Duration,
    /// A group at this size flushes immediately.
    pub max_batch_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            dedup_cooldown: Duration::from_secs(300),
            max_batch_size: 50,
        }
    }
}

/// Per-event validator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Fractional tolerance on the tick remainder (0.001 = 0.1%).
    pub tick_tolerance: f64,
    /// Per-symbol tick-size overrides (canonical symbol key).
    #[serde(default)]
    pub tick_overrides: BTreeMap<String, Decimal>,
    /// Cooldown per (symbol, check) between alerts.
    pub alert_cooldown: Duration,
    /// Cross-provider mid divergence threshold, basis points.
    pub divergence_threshold_bps: f64,
    /// Rolling window for per-provider mids.
    pub divergence_window: Duration,
    /// Reorderings within this window are tolerated without an integrity event.
    pub reorder_tolerance: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tick_tolerance: 0.001,
            tick_overrides: BTreeMap::new(),
            alert_cooldown: Duration::from_secs(10),
            divergence_threshold_bps: 10.0,
            divergence_window: Duration::from_secs(5),
            reorder_tolerance: Duration::from_secs(1),
        }
    }
}

/// Scheduler and job-engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone used by market-closed precondition gates.
    pub market_tz: String,
    /// Local market open, in `market_tz`.
    pub market_open: NaiveTime,
    /// Local market close, in `market_tz`.
    pub market_close: NaiveTime,
    /// Worker-pool size; `None` means `min(cores, 8)`.
    #[serde(default)]
    pub worker_count: Option<usize>,
    /// Rolling execution-history bound.
    pub execution_history_limit: usize,
    /// Retry backoff base.
    pub retry_base: Duration,
    /// Retry backoff cap.
    pub retry_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            market_tz: "America/New_York".to_string(),
            market_open: NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"),
            market_close: NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
            worker_count: None,
            execution_history_limit: 500,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(600),
        }
    }
}

/// Which instance-coordination strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum CoordinatorMode {
    /// Single instance; every claim succeeds.
    #[default]
    Solo,
    /// Claim files under `claims_dir`, atomic-rename discipline.
    FileLock,
}

/// Instance-coordination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordination strategy.
    pub mode: CoordinatorMode,
    /// Claim heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Staleness multiplier: claims older than `multiplier * heartbeat_interval`
    /// are reclaimable.
    pub ttl_multiplier: u32,
    /// Directory holding claim files (file-lock mode).
    #[serde(default)]
    pub claims_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: CoordinatorMode::Solo,
            heartbeat_interval: Duration::from_secs(60),
            ttl_multiplier: 3,
            claims_dir: None,
        }
    }
}

/// Top-level engine configuration, loaded from JSON at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Archive root directory.
    pub data_root: PathBuf,
    /// Desired symbol set.
    pub symbols: Vec<SymbolSpec>,
    /// Bound on each provider call made under the orchestrator lock.
    pub provider_call_timeout: Duration,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Heartbeat/latency settings.
    pub health: HealthConfig,
    /// Degradation scoring settings.
    pub degradation: DegradationConfig,
    /// Alert batching settings.
    pub alerts: AlertConfig,
    /// Validator settings.
    pub validators: ValidatorConfig,
    /// Scheduler/job settings.
    pub scheduler: SchedulerConfig,
    /// Instance-coordination settings.
    pub coordinator: CoordinatorConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::new(),
            symbols: Vec::new(),
            provider_call_timeout: Duration::from_secs(10),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
            degradation: DegradationConfig::default(),
            alerts: AlertConfig::default(),
            validators: ValidatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Validate cross-field invariants and every symbol spec.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.pipeline.capacity == 0 {
            return Err(VaultError::invalid_arg("pipeline capacity must be nonzero"));
        }
        self.degradation.weights.validate()?;
        chrono_tz::Tz::from_str(&self.scheduler.market_tz)
            .map_err(|_| VaultError::invalid_arg(format!(
                "unknown market time zone: {}",
                self.scheduler.market_tz
            )))?;
        for spec in &self.symbols {
            spec.validate()?;
        }
        Ok(())
    }

    /// Apply `TICKVAULT_*` environment overrides from the given variable set.
    ///
    /// Returns the list of keys that were applied. Unknown `TICKVAULT_` keys
    /// handled elsewhere (CLI-level keys) are ignored; malformed values are a
    /// validation error.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<Vec<String>, VaultError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        fn parse<T: FromStr>(key: &str, val: &str) -> Result<T, VaultError> {
            val.parse().map_err(|_| {
                VaultError::invalid_arg(format!("bad value for {key}: {val:?}"))
            })
        }

        let mut applied = Vec::new();
        for (key, val) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DATA_ROOT" => self.data_root = PathBuf::from(&val),
                "PROVIDER_CALL_TIMEOUT_SECS" => {
                    self.provider_call_timeout = Duration::from_secs(parse(&key, &val)?);
                }
                "PIPELINE_CAPACITY" => self.pipeline.capacity = parse(&key, &val)?,
                "DRAIN_TIMEOUT_SECS" => {
                    self.pipeline.drain_timeout = Duration::from_secs(parse(&key, &val)?);
                }
                "HEARTBEAT_INTERVAL_SECS" => {
                    self.health.heartbeat_interval = Duration::from_secs(parse(&key, &val)?);
                }
                "HEARTBEAT_TIMEOUT_SECS" => {
                    self.health.heartbeat_timeout = Duration::from_secs(parse(&key, &val)?);
                }
                "MAX_MISSED_HEARTBEATS" => {
                    self.health.max_missed_heartbeats = parse(&key, &val)?;
                }
                "EVALUATION_INTERVAL_SECS" => {
                    self.degradation.evaluation_interval =
                        Duration::from_secs(parse(&key, &val)?);
                }
                "LATENCY_THRESHOLD_MS" => {
                    self.degradation.latency_threshold_ms = parse(&key, &val)?;
                }
                "LATENCY_MAX_MS" => self.degradation.latency_max_ms = parse(&key, &val)?,
                "ERROR_RATE_THRESHOLD" => {
                    self.degradation.error_rate_threshold = parse(&key, &val)?;
                }
                "MAX_RECONNECTS_PER_HOUR" => {
                    self.degradation.max_reconnects_per_hour = parse(&key, &val)?;
                }
                "DEGRADATION_THRESHOLD" => {
                    self.degradation.degradation_threshold = parse(&key, &val)?;
                }
                "FAILOVER_THRESHOLD" => {
                    self.degradation.failover_threshold = parse(&key, &val)?;
                }
                "ALERT_WINDOW_SECS" => {
                    self.alerts.window = Duration::from_secs(parse(&key, &val)?);
                }
                "ALERT_DEDUP_COOLDOWN_SECS" => {
                    self.alerts.dedup_cooldown = Duration::from_secs(parse(&key, &val)?);
                }
                "ALERT_MAX_BATCH_SIZE" => self.alerts.max_batch_size = parse(&key, &val)?,
                "TICK_TOLERANCE" => self.validators.tick_tolerance = parse(&key, &val)?,
                "DIVERGENCE_THRESHOLD_BPS" => {
                    self.validators.divergence_threshold_bps = parse(&key, &val)?;
                }
                "VALIDATOR_ALERT_COOLDOWN_SECS" => {
                    self.validators.alert_cooldown = Duration::from_secs(parse(&key, &val)?);
                }
                "MARKET_TZ" => self.scheduler.market_tz = val.clone(),
                "MARKET_OPEN" => {
                    self.scheduler.market_open = parse(&key, &val)?;
                }
                "MARKET_CLOSE" => {
                    self.scheduler.market_close = parse(&key, &val)?;
                }
                "WORKER_COUNT" => self.scheduler.worker_count = Some(parse(&key, &val)?),
                "EXECUTION_HISTORY_LIMIT" => {
                    self.scheduler.execution_history_limit = parse(&key, &val)?;
                }
                "RETRY_BASE_SECS" => {
                    self.scheduler.retry_base = Duration::from_secs(parse(&key, &val)?);
                }
                "RETRY_CAP_SECS" => {
                    self.scheduler.retry_cap = Duration::from_secs(parse(&key, &val)?);
                }
                "COORDINATOR_MODE" => {
                    self.coordinator.mode = match val.as_str() {
                        "solo" => CoordinatorMode::Solo,
                        "file-lock" => CoordinatorMode::FileLock,
                        other => {
                            return Err(VaultError::invalid_arg(format!(
                                "bad value for {key}: {other:?}"
                            )));
                        }
                    };
                }
                _ => continue,
            }
            applied.push(key);
        }
        Ok(applied)
    }
}

const ENV_PREFIX: &str = "TICKVAULT_";

/// Documentation string enumerating every recognized environment override.
#[must_use]
pub fn env_overrides_help() -> String {
    let rows: &[(&str, &str)] = &[
        ("TICKVAULT_DATA_ROOT", "archive root directory (path)"),
        ("TICKVAULT_PROVIDER_CALL_TIMEOUT_SECS", "per-provider-call bound (u64 secs)"),
        ("TICKVAULT_PIPELINE_CAPACITY", "pipeline queue capacity (usize)"),
        ("TICKVAULT_DRAIN_TIMEOUT_SECS", "shutdown drain bound (u64 secs)"),
        ("TICKVAULT_HEARTBEAT_INTERVAL_SECS", "heartbeat check cadence (u64 secs)"),
        ("TICKVAULT_HEARTBEAT_TIMEOUT_SECS", "silence counted as a miss (u64 secs)"),
        ("TICKVAULT_MAX_MISSED_HEARTBEATS", "misses before disconnect (u32)"),
        ("TICKVAULT_EVALUATION_INTERVAL_SECS", "degradation evaluation cadence (u64 secs)"),
        ("TICKVAULT_LATENCY_THRESHOLD_MS", "latency scoring floor (f64 ms)"),
        ("TICKVAULT_LATENCY_MAX_MS", "latency scoring ceiling (f64 ms)"),
        ("TICKVAULT_ERROR_RATE_THRESHOLD", "error-rate scoring floor (f64)"),
        ("TICKVAULT_MAX_RECONNECTS_PER_HOUR", "reconnect scoring ceiling (f64)"),
        ("TICKVAULT_DEGRADATION_THRESHOLD", "composite degraded threshold (f64)"),
        ("TICKVAULT_FAILOVER_THRESHOLD", "minimum failover candidate score (f64)"),
        ("TICKVAULT_ALERT_WINDOW_SECS", "alert flush cadence (u64 secs)"),
        ("TICKVAULT_ALERT_DEDUP_COOLDOWN_SECS", "fingerprint suppression window (u64 secs)"),
        ("TICKVAULT_ALERT_MAX_BATCH_SIZE", "immediate-flush group size (usize)"),
        ("TICKVAULT_TICK_TOLERANCE", "tick remainder tolerance (f64 fraction)"),
        ("TICKVAULT_DIVERGENCE_THRESHOLD_BPS", "mid divergence threshold (f64 bps)"),
        ("TICKVAULT_VALIDATOR_ALERT_COOLDOWN_SECS", "per-(symbol,check) cooldown (u64 secs)"),
        ("TICKVAULT_MARKET_TZ", "market gate zone (IANA id)"),
        ("TICKVAULT_MARKET_OPEN", "market open, HH:MM:SS local"),
        ("TICKVAULT_MARKET_CLOSE", "market close, HH:MM:SS local"),
        ("TICKVAULT_WORKER_COUNT", "job worker pool size (usize)"),
        ("TICKVAULT_EXECUTION_HISTORY_LIMIT", "rolling execution history bound (usize)"),
        ("TICKVAULT_RETRY_BASE_SECS", "retry backoff base (u64 secs)"),
        ("TICKVAULT_RETRY_CAP_SECS", "retry backoff cap (u64 secs)"),
        ("TICKVAULT_COORDINATOR_MODE", "solo | file-lock"),
        ("TICKVAULT_CONFIG", "config file path (CLI)"),
    ];
    let mut out = String::from("Recognized environment overrides:\n");
    for (key, desc) in rows {
        out.push_str(&format!("  {key:<44} {desc}\n"));
    }
    out
}
