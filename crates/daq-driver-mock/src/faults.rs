//! Failure injection for the simulated digitizer.
//!
//! Every driver hook asks the [`FaultInjector`] whether it should fail before
//! doing any work. Failures come from deterministic scenarios or from a
//! seeded random rate, and are reported as ordinary [`DriverError`]s so the
//! controller's recovery path is exercised exactly as with real hardware.

use std::collections::HashMap;

use daq_core::error::{DriverError, DriverErrorKind, DriverResult};
use daq_digitizer::HookStage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rng::SimRng;

/// A deterministic failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultScenario {
    /// `stage` succeeds `count` times, then fails on every call
    FailAfterN { stage: HookStage, count: u32 },
    /// Every call of `stage` times out
    Timeout { stage: HookStage },
    /// The first checked call loses communication; every later call fails
    /// until reset
    CommunicationLoss,
    /// The first checked call reports hardware fault `code`; latched until
    /// reset
    HardwareFault { code: u32 },
}

/// Serializable failure-injection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Probability (0.0 to 1.0) that any hook call fails
    #[serde(default)]
    pub failure_rate: f64,
    /// Per-stage probabilities overriding `failure_rate`
    #[serde(default)]
    pub stage_rates: HashMap<HookStage, f64>,
    /// RNG seed for the random failures
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub scenarios: Vec<FaultScenario>,
}

impl FaultConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn scenario(scenario: FaultScenario) -> Self {
        Self {
            scenarios: vec![scenario],
            ..Self::default()
        }
    }

    pub fn random_failures_seeded(rate: f64, seed: u64) -> Self {
        Self {
            failure_rate: rate,
            seed: Some(seed),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stage_rate(mut self, stage: HookStage, rate: f64) -> Self {
        self.stage_rates.insert(stage, rate);
        self
    }

    fn rate_for(&self, stage: HookStage) -> f64 {
        self.stage_rates
            .get(&stage)
            .copied()
            .unwrap_or(self.failure_rate)
    }
}

#[derive(Debug, Default)]
struct FaultState {
    calls: HashMap<HookStage, u32>,
    communication_lost: bool,
    hardware_fault_code: Option<u32>,
    injected: u64,
}

/// Decides, per hook call, whether the simulated hardware fails.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: SimRng,
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let rng = SimRng::new(config.seed);
        Self {
            config,
            rng,
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn none() -> Self {
        Self::new(FaultConfig::none())
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    /// Fail `stage` if a scenario or the random rate says so.
    pub fn check(&self, driver_type: &str, stage: HookStage) -> DriverResult<()> {
        let result = self.evaluate(driver_type, stage);
        if let Err(err) = &result {
            self.state.lock().injected += 1;
            debug!(driver = driver_type, %stage, error = %err, "Injected fault");
        }
        result
    }

    fn evaluate(&self, driver_type: &str, stage: HookStage) -> DriverResult<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(communication_lost(driver_type));
        }
        if let Some(code) = state.hardware_fault_code {
            return Err(hardware_fault(driver_type, code));
        }

        for scenario in &self.config.scenarios {
            match scenario {
                FaultScenario::FailAfterN { stage: s, count } if *s == stage => {
                    let calls = state.calls.entry(stage).or_insert(0);
                    *calls = calls.saturating_add(1);
                    if *calls > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("{} failed after {} calls", stage, count),
                        ));
                    }
                }
                FaultScenario::Timeout { stage: s } if *s == stage => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("{} timed out", stage),
                    ));
                }
                FaultScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(communication_lost(driver_type));
                }
                FaultScenario::HardwareFault { code } => {
                    state.hardware_fault_code = Some(*code);
                    return Err(hardware_fault(driver_type, *code));
                }
                _ => {}
            }
        }
        drop(state);

        if self.rng.should_fail(self.config.rate_for(stage)) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("random failure in {}", stage),
            ));
        }
        Ok(())
    }

    /// Clear call counters and latched faults.
    ///
    /// Latching scenarios trigger again on the next check.
    pub fn reset(&self) {
        *self.state.lock() = FaultState::default();
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.state.lock().injected
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::none()
    }
}

fn communication_lost(driver_type: &str) -> DriverError {
    DriverError::new(driver_type, DriverErrorKind::Communication, "communication lost")
}

fn hardware_fault(driver_type: &str, code: u32) -> DriverError {
    DriverError::new(
        driver_type,
        DriverErrorKind::Hardware,
        format!("hardware fault {:#06x}", code),
    )
}
