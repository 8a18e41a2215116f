//! Controllers for the fly-tunnel-operator
//!
//! The Service controller watches LoadBalancer Services of the configured
//! class and keeps a Fly.io tunnel in step with each of them.

pub mod admission;
mod service;

pub use admission::{is_managed, should_reconcile, AdmissionFilter, DEFAULT_LOAD_BALANCER_CLASS};
pub use service::{KubeServiceClient, ServiceClient, ServiceController, ServiceReconciler};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::OperatorError;

/// Per-key exponential requeue delay for failed reconciles.
///
/// Each consecutive failure of a key doubles its delay, starting at `base`
/// and capped at `max`. A successful reconcile resets the key.
pub struct RequeueBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RequeueBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return the delay before its retry.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .checked_mul(1u32 << (*count).min(16))
            .map_or(self.max, |d| d.min(self.max));
        *count = count.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}

/// Error policy shared by controllers: requeue the key with backoff.
pub fn error_policy_backoff(backoff: &RequeueBackoff, key: &str, error: &OperatorError) -> Action {
    let delay = backoff.next_delay(key);
    tracing::warn!(key = %key, error = %error, retry_in = ?delay, "Reconciliation failed");
    Action::requeue(delay)
}
