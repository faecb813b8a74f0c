//! Node configuration, loadable from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::{FaultInjector, FaultKind, NoFaults, RateFaults};
use crate::types::{validate_params, Error, QuorumParams};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Threads in the shared BLS worker pool.
    pub worker_count: usize,
    pub thread_name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            thread_name_prefix: "bls-work".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Half of the available hardware threads, at least one.
    pub fn half_of_hardware() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers((threads / 2).max(1))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub parallel_verification: bool,
    /// Pending contributions that trigger an eager batch verification.
    pub pending_verify_flush: usize,
    /// Mark members that the connectivity collaborator reports as unreachable.
    pub check_connections: bool,
    /// Per-peer cap of queued messages of one kind in the session handler.
    pub max_messages_per_node: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parallel_verification: true,
            pending_verify_flush: 32,
            check_connections: false,
            max_messages_per_node: 8,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Probability in [0, 1] per fault kind. Missing kinds never fire.
    pub rates: BTreeMap<FaultKind, f64>,
    pub seed: u64,
}

impl FaultConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (kind, rate) in &self.rates {
            if !(0.0..=1.0).contains(rate) {
                return Err(Error::Config(format!("rate {rate} for {kind:?} out of range")));
            }
        }
        Ok(())
    }

    /// Injector for these rates; no rates means production behaviour.
    pub fn injector(&self) -> Arc<dyn FaultInjector> {
        if self.rates.values().all(|rate| *rate <= 0.0) {
            return Arc::new(NoFaults);
        }
        Arc::new(RateFaults::new(self.rates.clone(), self.seed))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub quorum: QuorumParams,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub faults: FaultConfig,
}

impl NodeConfig {
    pub fn new(quorum: QuorumParams) -> Self {
        Self {
            quorum,
            worker: WorkerConfig::default(),
            session: SessionConfig::default(),
            faults: FaultConfig::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let cfg: NodeConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_params(&self.quorum)?;
        self.worker.validate()?;
        self.faults.validate()?;
        if self.session.pending_verify_flush == 0 {
            return Err(Error::Config("pending_verify_flush must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_json_with_defaults() {
        let json = r#"{
            "quorum": {
                "llmq_type": 100, "name": "llmq_test", "size": 3,
                "min_size": 2, "threshold": 2, "bad_votes_threshold": 2
            },
            "worker": { "worker_count": 2 },
            "faults": { "rates": { "ContributionOmit": 0.5 }, "seed": 3 }
        }"#;
        let cfg = NodeConfig::from_json_str(json).expect("config");
        assert_eq!(cfg.quorum, QuorumParams::llmq_test());
        assert_eq!(cfg.worker.worker_count, 2);
        assert_eq!(cfg.worker.thread_name_prefix, "bls-work");
        assert_eq!(cfg.session, SessionConfig::default());
        assert_eq!(cfg.faults.rates.get(&FaultKind::ContributionOmit), Some(&0.5));
    }

    #[test]
    fn empty_rates_build_a_silent_injector() {
        let injector = FaultConfig::default().injector();
        assert!(!injector.should_inject(FaultKind::CommitOmit));

        let mut faults = FaultConfig::default();
        faults.rates.insert(FaultKind::CommitOmit, 1.0);
        assert!(faults.injector().should_inject(FaultKind::CommitOmit));
    }

    #[test]
    fn rejects_zero_workers_and_bad_rates() {
        let mut cfg = NodeConfig::new(QuorumParams::llmq_test());
        cfg.worker.worker_count = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = NodeConfig::new(QuorumParams::llmq_test());
        cfg.faults.rates.insert(FaultKind::CommitLie, 1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_worker_count_is_fixed() {
        assert_eq!(WorkerConfig::default().worker_count, 4);
        assert!(WorkerConfig::half_of_hardware().worker_count >= 1);
    }
}
