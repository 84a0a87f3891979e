//! Shared test utilities for fleetsync integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetsync::memory::MemoryControlPlane;
use fleetsync::{Candidate, Engine, EngineConfig, GranteeSet};

/// Engine over a fresh in-memory control plane.
pub struct TestFleet {
    pub api: Arc<MemoryControlPlane>,
    pub engine: Engine<MemoryControlPlane>,
}

impl TestFleet {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Short timings so paused-clock tests advance quickly through polls.
    pub fn fast() -> Self {
        let mut config = EngineConfig::default();
        config.wait.poll_interval_ms = 1_000;
        config.wait.timeout_secs = 30;
        config.retry.timeout_secs = 10;
        config.retry.min_backoff_ms = 1_000;
        config.retry.max_backoff_ms = 4_000;
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_api(MemoryControlPlane::new(), config)
    }

    pub fn with_api(api: MemoryControlPlane, config: EngineConfig) -> Self {
        let api = Arc::new(api);
        let engine = Engine::new(Arc::clone(&api), config).expect("valid test config");
        Self { api, engine }
    }
}

/// Grantee set from literal IDs.
pub fn grantees(ids: &[&str]) -> GranteeSet {
    ids.iter().copied().collect()
}

/// `count` twelve-digit account IDs starting at `first`.
pub fn accounts(first: u32, count: u32) -> GranteeSet {
    (first..first + count).map(|n| format!("{:012}", n)).collect()
}

/// Platform-owned default baseline candidate.
pub fn platform_baseline(id: &str, name: &str, category: &str) -> Candidate {
    Candidate::new(id, name, "AWS", category)
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
