//! Campaign runner: many seeds, one report.
//!
//! Executes every seed in a range with the same parameters, collecting
//! pass/fail results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::{FaultConfig, SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    pub rounds: u32,
    pub initial_tasks: u32,
    pub optimistic: bool,
    pub settle_ms: u64,
    pub fault_disconnect_percent: u8,
    pub fault_query_failure_percent: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..20,
            rounds: sim.rounds,
            initial_tasks: sim.initial_tasks,
            optimistic: sim.optimistic,
            settle_ms: sim.settle_ms,
            fault_disconnect_percent: sim.fault.disconnect_percent,
            fault_query_failure_percent: sim.fault.query_failure_percent,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            rounds: self.rounds,
            initial_tasks: self.initial_tasks,
            optimistic: self.optimistic,
            settle_ms: self.settle_ms,
            fault: FaultConfig {
                disconnect_percent: self.fault_disconnect_percent,
                query_failure_percent: self.fault_query_failure_percent,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub divergences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that ran fault-free and were also checked before re-fetching.
    pub realtime_checked: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

pub async fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        realtime_checked: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let result = replay_seed(seed, config).await?;
        if result.realtime_checked {
            report.realtime_checked += 1;
        }

        if result.converged() {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, divergences = result.divergences.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                divergences: result.divergences.iter().map(ToString::to_string).collect(),
            });
        }
    }

    Ok(report)
}

/// Run one seed of `config` and return its full trace.
pub async fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    simulator.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_config_default_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn campaign_config_empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn campaign_config_bad_percent_rejected() {
        let config = CampaignConfig {
            fault_disconnect_percent: 101,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_for_seed_uses_correct_seed() {
        let sim = CampaignConfig::default().sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.fault.disconnect_percent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn small_campaign_passes() {
        let config = CampaignConfig {
            seed_range: 0..3,
            rounds: 12,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).await.expect("campaign");
        assert_eq!(report.seeds_run, 3);
        assert!(report.all_passed(), "{:?}", report.failures);
        assert_eq!(report.first_failure, None);
    }
}
