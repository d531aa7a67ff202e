//! Vigil controllers: per-kind informer + queue + workers, and the manager running them.

#![forbid(unsafe_code)]

use std::time::Duration;

use vigil_queue::{controller_rate_limiter, rate_limit, MaxOf, QueueKey};
use vigil_store::InformerOptions;

mod controller;
pub mod kinds;
mod manager;
mod reconciler;

pub use controller::{ControllerError, ResourceController, Worker};
pub use kinds::{DeploymentReconciler, NodeReconciler, PodReconciler};
pub use manager::{ControllerManager, ManagedController, ManagerError};
pub use reconciler::Reconciler;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("queue qps must be a positive number, got {0}")]
    QueueQps(f64),
    #[error("queue burst must be at least 1")]
    QueueBurst,
}

/// Tunables shared by every controller the manager runs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Limit namespaced kinds to one namespace; `None` watches all of them.
    pub namespace: Option<String>,
    /// How long `run` waits for the first full list before giving up.
    pub sync_timeout: Duration,
    pub resync_period: Option<Duration>,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub queue_qps: f64,
    pub queue_burst: u32,
    /// Pause before a stopped or crashed worker is launched again.
    pub worker_restart: Duration,
    /// Log every cached object once each controller has synced.
    pub list_on_start: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            sync_timeout: Duration::from_secs(120),
            resync_period: None,
            queue_base_delay: rate_limit::DEFAULT_BASE_DELAY,
            queue_max_delay: rate_limit::DEFAULT_MAX_DELAY,
            queue_qps: rate_limit::DEFAULT_QPS,
            queue_burst: rate_limit::DEFAULT_BURST,
            worker_restart: Duration::from_secs(1),
            list_on_start: false,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.queue_qps.is_finite() && self.queue_qps > 0.0) {
            return Err(ConfigError::QueueQps(self.queue_qps));
        }
        if self.queue_burst == 0 {
            return Err(ConfigError::QueueBurst);
        }
        Ok(())
    }

    pub fn informer_options(&self) -> InformerOptions {
        InformerOptions { resync_period: self.resync_period.filter(|p| !p.is_zero()), ..InformerOptions::default() }
    }

    pub fn rate_limiter<K: QueueKey>(&self) -> MaxOf<K> {
        controller_rate_limiter(self.queue_base_delay, self.queue_max_delay, self.queue_qps, self.queue_burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ManagerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn non_positive_rates_are_rejected() {
        for qps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let cfg = ManagerConfig { queue_qps: qps, ..ManagerConfig::default() };
            assert!(matches!(cfg.validate(), Err(ConfigError::QueueQps(_))), "qps {qps} accepted");
        }
        let cfg = ManagerConfig { queue_burst: 0, ..ManagerConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::QueueBurst));
    }
}
