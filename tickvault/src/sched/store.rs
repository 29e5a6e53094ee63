//! JSON persistence for schedules.

use std::path::PathBuf;

use tickvault_types::{CronSchedule, VaultError};

use crate::persist;

/// Durable schedule list: read at startup, written on every change.
pub(crate) struct ScheduleStore {
    path: Option<PathBuf>,
}

impl ScheduleStore {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub(crate) fn load(&self) -> Result<Vec<CronSchedule>, VaultError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        Ok(persist::read_json(path)?.unwrap_or_default())
    }

    pub(crate) fn save(&self, schedules: &[CronSchedule]) -> Result<(), VaultError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        persist::write_json_atomic(path, &schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickvault_types::TaskType;

    #[test]
    fn load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(Some(dir.path().join("schedules.json")));
        assert!(store.load().unwrap().is_empty());

        let schedules = vec![CronSchedule::new(
            "nightly",
            "Nightly",
            "0 3 * * *",
            "UTC",
            TaskType::Cleanup,
        )];
        store.save(&schedules).unwrap();
        let back = store.load().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, "nightly");
    }

    #[test]
    fn pathless_store_is_inert() {
        let store = ScheduleStore::new(None);
        assert!(store.load().unwrap().is_empty());
        store.save(&[]).unwrap();
    }
}
