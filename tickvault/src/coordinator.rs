//! Instance-coordination strategies: single-instance no-op and file locks.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use tickvault_core::coordinator::{Claim, InstanceCoordinator};
use tickvault_types::Symbol;

/// Single-instance coordinator: every claim succeeds.
pub struct SoloCoordinator {
    instance_id: String,
    owned: Mutex<HashSet<Symbol>>,
}

impl SoloCoordinator {
    /// Build with an instance id (used only in claim listings).
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            owned: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for SoloCoordinator {
    fn default() -> Self {
        Self::new(format!("solo-{}", std::process::id()))
    }
}

impl InstanceCoordinator for SoloCoordinator {
    fn try_claim(&self, symbol: &Symbol) -> bool {
        self.owned
            .lock()
            .expect("mutex poisoned")
            .insert(symbol.clone());
        true
    }

    fn release(&self, symbol: &Symbol) {
        self.owned.lock().expect("mutex poisoned").remove(symbol);
    }

    fn refresh_heartbeat(&self) {}

    fn owned(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self
            .owned
            .lock()
            .expect("mutex poisoned")
            .iter()
            .cloned()
            .collect();
        out.sort();
        out
    }

    fn all_claims(&self) -> Vec<Claim> {
        let now = Utc::now();
        self.owned()
            .into_iter()
            .map(|symbol| Claim {
                instance_id: self.instance_id.clone(),
                symbol,
                heartbeat_at: now,
            })
            .collect()
    }

    fn reclaim_stale(&self) -> usize {
        0
    }
}

/// File-lock coordinator: one JSON claim file per symbol under a shared
/// directory, written with the temp-file + atomic-rename pattern.
///
/// A claim held by another instance blocks ours unless its heartbeat is
/// older than the TTL, in which case it is reclaimable.
pub struct FileLockCoordinator {
    instance_id: String,
    dir: PathBuf,
    ttl: Duration,
    owned: Mutex<HashSet<Symbol>>,
}

impl FileLockCoordinator {
    /// Build a coordinator rooted at `dir` with the given staleness TTL.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, dir: PathBuf, ttl: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            dir,
            ttl,
            owned: Mutex::new(HashSet::new()),
        }
    }

    fn claim_path(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }

    fn read_claim(&self, symbol: &Symbol) -> Option<Claim> {
        let data = std::fs::read(self.claim_path(symbol)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn write_claim(&self, symbol: &Symbol) -> bool {
        let claim = Claim {
            instance_id: self.instance_id.clone(),
            symbol: symbol.clone(),
            heartbeat_at: Utc::now(),
        };
        let path = self.claim_path(symbol);
        let tmp = path.with_extension(format!("tmp-{}", self.instance_id));
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(&tmp, serde_json::to_vec(&claim)?)?;
            std::fs::rename(&tmp, &path)
        };
        match write() {
            Ok(()) => true,
            Err(err) => {
                warn!(%symbol, error = %err, "failed to write claim file");
                false
            }
        }
    }

    fn is_stale(&self, claim: &Claim) -> bool {
        let age = Utc::now() - claim.heartbeat_at;
        age.to_std().map(|a| a > self.ttl).unwrap_or(false)
    }
}

impl InstanceCoordinator for FileLockCoordinator {
    fn try_claim(&self, symbol: &Symbol) -> bool {
        if self.owned.lock().expect("mutex poisoned").contains(symbol) {
            return true;
        }
        if let Some(existing) = self.read_claim(symbol) {
            if existing.instance_id != self.instance_id && !self.is_stale(&existing) {
                debug!(%symbol, holder = %existing.instance_id, "symbol claimed elsewhere");
                return false;
            }
        }
        if self.write_claim(symbol) {
            self.owned
                .lock()
                .expect("mutex poisoned")
                .insert(symbol.clone());
            true
        } else {
            false
        }
    }

    fn release(&self, symbol: &Symbol) {
        let was_ours = self.owned.lock().expect("mutex poisoned").remove(symbol);
        if was_ours
            && let Err(err) = std::fs::remove_file(self.claim_path(symbol))
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(%symbol, error = %err, "failed to remove claim file");
        }
    }

    fn refresh_heartbeat(&self) {
        let owned: Vec<Symbol> = self
            .owned
            .lock()
            .expect("mutex poisoned")
            .iter()
            .cloned()
            .collect();
        for symbol in owned {
            self.write_claim(&symbol);
        }
    }

    fn owned(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self
            .owned
            .lock()
            .expect("mutex poisoned")
            .iter()
            .cloned()
            .collect();
        out.sort();
        out
    }

    fn all_claims(&self) -> Vec<Claim> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut claims: Vec<Claim> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| std::fs::read(e.path()).ok())
            .filter_map(|data| serde_json::from_slice(&data).ok())
            .collect();
        claims.sort_by(|a: &Claim, b: &Claim| a.symbol.cmp(&b.symbol));
        claims
    }

    fn reclaim_stale(&self) -> usize {
        let mut reclaimed = 0;
        for claim in self.all_claims() {
            if self.is_stale(&claim) && std::fs::remove_file(self.claim_path(&claim.symbol)).is_ok()
            {
                debug!(symbol = %claim.symbol, holder = %claim.instance_id, "reclaimed stale claim");
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_claims_everything() {
        let c = SoloCoordinator::new("one");
        let sym = Symbol::new("AAPL");
        assert!(c.try_claim(&sym));
        assert!(c.try_claim(&sym));
        assert_eq!(c.owned(), vec![sym.clone()]);
        c.release(&sym);
        assert!(c.owned().is_empty());
    }

    #[test]
    fn file_lock_blocks_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let ttl = Duration::from_secs(180);
        let a = FileLockCoordinator::new("a", dir.path().to_path_buf(), ttl);
        let b = FileLockCoordinator::new("b", dir.path().to_path_buf(), ttl);
        let sym = Symbol::new("AAPL");

        assert!(a.try_claim(&sym));
        assert!(!b.try_claim(&sym));
        assert_eq!(a.all_claims().len(), 1);

        a.release(&sym);
        assert!(b.try_claim(&sym));
    }

    #[test]
    fn stale_claims_are_reclaimable() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLockCoordinator::new("a", dir.path().to_path_buf(), Duration::ZERO);
        let b = FileLockCoordinator::new("b", dir.path().to_path_buf(), Duration::ZERO);
        let sym = Symbol::new("AAPL");

        assert!(a.try_claim(&sym));
        // TTL of zero: any existing heartbeat is already stale.
        assert!(b.try_claim(&sym));
        assert_eq!(b.reclaim_stale(), 1);
    }
}
