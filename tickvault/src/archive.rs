//! Line-delimited JSON archive: the default sink for the daemon.
//!
//! Partitions are `<root>/<SYMBOL>/<YYYY-MM-DD>/<kind>.jsonl`, one writer per
//! partition (the pipeline consumer serializes writes). A columnar writer can
//! replace this by implementing [`ArchiveWriter`]; the engine does not care.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use tickvault_core::{ArchiveWriter, MaintenanceTask, TaskContext};
use tickvault_types::{MarketEvent, TaskReport, TaskType, VaultError};

/// Append-only JSONL archive rooted at a data directory.
pub struct JsonlArchive {
    root: PathBuf,
}

impl JsonlArchive {
    /// Build an archive over `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn partition(&self, event: &MarketEvent) -> PathBuf {
        self.root
            .join(event.symbol.as_str())
            .join(event.exchange_ts.date_naive().to_string())
            .join(format!("{}.jsonl", event.kind()))
    }

    /// Register the archive-backed maintenance tasks on a registry hook.
    ///
    /// Covers the filesystem-level tasks this writer can honor; tier
    /// migration, compression, repair, archival, and gap-fill belong to a
    /// real columnar backend and stay unregistered here.
    pub fn maintenance_tasks(self: &Arc<Self>) -> Vec<(TaskType, Arc<dyn MaintenanceTask>)> {
        vec![
            (
                TaskType::HealthCheck,
                Arc::new(HealthCheckTask {
                    root: self.root.clone(),
                }) as Arc<dyn MaintenanceTask>,
            ),
            (
                TaskType::Cleanup,
                Arc::new(CleanupTask {
                    root: self.root.clone(),
                }),
            ),
            (
                TaskType::IntegrityCheck,
                Arc::new(IntegrityCheckTask {
                    root: self.root.clone(),
                }),
            ),
            (
                TaskType::RetentionEnforcement,
                Arc::new(RetentionTask {
                    root: self.root.clone(),
                }),
            ),
        ]
    }
}

#[async_trait]
impl ArchiveWriter for JsonlArchive {
    async fn write(&self, event: &MarketEvent) -> Result<(), VaultError> {
        let path = self.partition(event);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), VaultError> {
        // Writes are append+close per event; nothing buffered here.
        Ok(())
    }

    async fn close(&self) -> Result<(), VaultError> {
        Ok(())
    }
}

fn walk_partitions(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(symbols) = std::fs::read_dir(root) else {
        return files;
    };
    for symbol in symbols.filter_map(Result::ok) {
        let Ok(dates) = std::fs::read_dir(symbol.path()) else {
            continue;
        };
        for date in dates.filter_map(Result::ok) {
            let Ok(parts) = std::fs::read_dir(date.path()) else {
                continue;
            };
            for part in parts.filter_map(Result::ok) {
                if part.path().extension().is_some_and(|e| e == "jsonl") {
                    files.push(part.path());
                }
            }
        }
    }
    files
}

struct HealthCheckTask {
    root: PathBuf,
}

#[async_trait]
impl MaintenanceTask for HealthCheckTask {
    async fn run(&self, _ctx: TaskContext) -> Result<TaskReport, VaultError> {
        // Probe that the root is present and writable.
        let probe = self.root.join(".health-probe");
        tokio::fs::write(&probe, Utc::now().to_rfc3339())
            .await
            .map_err(|err| VaultError::storage(format!("archive root not writable: {err}")))?;
        let _ = tokio::fs::remove_file(&probe).await;
        let mut report = TaskReport::default();
        report.files_processed = walk_partitions(&self.root).len() as u64;
        Ok(report)
    }
}

struct CleanupTask {
    root: PathBuf,
}

#[async_trait]
impl MaintenanceTask for CleanupTask {
    async fn run(&self, ctx: TaskContext) -> Result<TaskReport, VaultError> {
        let mut report = TaskReport::default();
        for path in walk_partitions(&self.root) {
            if ctx.cancelled() {
                return Err(VaultError::Cancelled);
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            report.files_processed += 1;
            if meta.len() == 0 {
                debug!(path = %path.display(), "removing empty partition");
                if std::fs::remove_file(&path).is_ok() {
                    report.issues_found += 1;
                    report.issues_resolved += 1;
                }
            }
        }
        Ok(report)
    }
}

struct IntegrityCheckTask {
    root: PathBuf,
}

#[async_trait]
impl MaintenanceTask for IntegrityCheckTask {
    async fn run(&self, ctx: TaskContext) -> Result<TaskReport, VaultError> {
        let mut report = TaskReport::default();
        for path in walk_partitions(&self.root) {
            if ctx.cancelled() {
                return Err(VaultError::Cancelled);
            }
            let data = tokio::fs::read(&path).await?;
            report.files_processed += 1;
            report.bytes_processed += data.len() as u64;
            let broken = data
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .filter(|line| serde_json::from_slice::<MarketEvent>(line).is_err())
                .count() as u64;
            if broken > 0 {
                report.issues_found += broken;
                report
                    .log
                    .push(format!("{}: {broken} unparsable lines", path.display()));
            }
        }
        Ok(report)
    }
}

struct RetentionTask {
    root: PathBuf,
}

#[async_trait]
impl MaintenanceTask for RetentionTask {
    async fn run(&self, ctx: TaskContext) -> Result<TaskReport, VaultError> {
        let retention_days = ctx
            .options
            .get("retention_days")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(3650);
        let cutoff = Utc::now().date_naive() - chrono::Days::new(retention_days);

        let mut report = TaskReport::default();
        let Ok(symbols) = std::fs::read_dir(&self.root) else {
            return Ok(report);
        };
        for symbol in symbols.filter_map(Result::ok) {
            let Ok(dates) = std::fs::read_dir(symbol.path()) else {
                continue;
            };
            for date in dates.filter_map(Result::ok) {
                if ctx.cancelled() {
                    return Err(VaultError::Cancelled);
                }
                let name = date.file_name();
                let Some(day) = name
                    .to_str()
                    .and_then(|s| s.parse::<chrono::NaiveDate>().ok())
                else {
                    continue;
                };
                if day < cutoff {
                    let bytes: u64 = std::fs::read_dir(date.path())
                        .map(|entries| {
                            entries
                                .filter_map(Result::ok)
                                .filter_map(|e| e.metadata().ok())
                                .map(|m| m.len())
                                .sum()
                        })
                        .unwrap_or(0);
                    if std::fs::remove_dir_all(date.path()).is_ok() {
                        report.files_processed += 1;
                        report.bytes_saved += bytes;
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use tickvault_types::{EventPayload, ProviderKey, Symbol, Trade};

    fn event(symbol: &str, day: (i32, u32, u32)) -> MarketEvent {
        let ts = Utc
            .with_ymd_and_hms(day.0, day.1, day.2, 14, 30, 0)
            .unwrap();
        MarketEvent {
            event_id: 1,
            symbol: Symbol::new(symbol),
            exchange_ts: ts,
            received_at: ts,
            provider: ProviderKey::new("mock"),
            sequence: 1,
            payload: EventPayload::Trade(Trade {
                price: Decimal::new(18525, 2),
                size: 100,
            }),
        }
    }

    #[tokio::test]
    async fn writes_partition_per_symbol_date_kind() {
        let dir = tempfile::tempdir().unwrap();
        let archive = JsonlArchive::new(dir.path()).unwrap();
        archive.write(&event("AAPL", (2026, 7, 1))).await.unwrap();
        archive.write(&event("AAPL", (2026, 7, 1))).await.unwrap();
        archive.write(&event("MSFT", (2026, 7, 2))).await.unwrap();

        let aapl = dir.path().join("AAPL").join("2026-07-01").join("trade.jsonl");
        let msft = dir.path().join("MSFT").join("2026-07-02").join("trade.jsonl");
        assert_eq!(std::fs::read_to_string(&aapl).unwrap().lines().count(), 2);
        assert_eq!(std::fs::read_to_string(&msft).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn retention_removes_old_dates_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(JsonlArchive::new(dir.path()).unwrap());
        archive.write(&event("AAPL", (2020, 1, 2))).await.unwrap();
        archive.write(&event("AAPL", (2026, 7, 1))).await.unwrap();

        let tasks = archive.maintenance_tasks();
        let retention = tasks
            .iter()
            .find(|(t, _)| *t == TaskType::RetentionEnforcement)
            .map(|(_, task)| Arc::clone(task))
            .unwrap();
        let (_tx, cancel) = tokio::sync::watch::channel(false);
        let report = retention
            .run(TaskContext {
                execution_id: "exec-1".into(),
                task: TaskType::RetentionEnforcement,
                options: serde_json::json!({ "retention_days": 365 }),
                cancel,
            })
            .await
            .unwrap();
        assert_eq!(report.files_processed, 1);
        assert!(dir.path().join("AAPL").join("2026-07-01").exists());
        assert!(!dir.path().join("AAPL").join("2020-01-02").exists());
    }
}
