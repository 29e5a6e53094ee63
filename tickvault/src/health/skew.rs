//! Per-provider clock-skew estimation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tickvault_types::ProviderKey;

/// EWMA of `received_at - exchange_ts` per provider, in milliseconds.
///
/// Fed by the pipeline consumer on every stored event; a persistently large
/// skew means either provider clock drift or a backed-up delivery path.
pub struct SkewEstimator {
    alpha: f64,
    skews: Mutex<HashMap<ProviderKey, f64>>,
}

impl SkewEstimator {
    /// Build an estimator with the given smoothing factor.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            skews: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one observation into the provider's EWMA.
    pub fn observe(&self, provider: &ProviderKey, skew_ms: f64) {
        let mut guard = self.skews.lock().expect("mutex poisoned");
        guard
            .entry(provider.clone())
            .and_modify(|e| *e = self.alpha * skew_ms + (1.0 - self.alpha) * *e)
            .or_insert(skew_ms);
    }

    /// Current EWMA per provider, keyed by provider name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.skews
            .lock()
            .expect("mutex poisoned")
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect()
    }
}

impl Default for SkewEstimator {
    fn default() -> Self {
        Self::new(0.1)
    }
}
