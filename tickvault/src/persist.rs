//! Atomic-rename JSON persistence for engine state files.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use tickvault_types::VaultError;

/// Write `value` as pretty JSON via a temp file + rename, creating parent
/// directories as needed.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON state file; `Ok(None)` when it does not exist yet.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, VaultError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("subs.json");
        assert!(read_json::<Vec<String>>(&path).unwrap().is_none());
        write_json_atomic(&path, &vec!["a".to_string()]).unwrap();
        assert_eq!(
            read_json::<Vec<String>>(&path).unwrap(),
            Some(vec!["a".to_string()])
        );
    }
}
