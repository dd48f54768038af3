//! Failure of one arm cycle.

use daq_core::error::DriverError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Driver hook that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    WaitForPreconditions,
    CheckSettings,
    StartAcquisition,
    ReadBurst,
    CheckOverflow,
    ProcessBurstData,
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HookStage::WaitForPreconditions => "wait_for_preconditions",
            HookStage::CheckSettings => "check_settings",
            HookStage::StartAcquisition => "start_acquisition",
            HookStage::ReadBurst => "read_burst",
            HookStage::CheckOverflow => "check_overflow",
            HookStage::ProcessBurstData => "process_burst_data",
        };
        write!(f, "{}", label)
    }
}

/// Why an arm cycle ended in the `Error` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// A driver hook returned an error.
    #[error("{stage} failed: {source}")]
    Hook {
        stage: HookStage,
        #[source]
        source: DriverError,
    },

    /// The snapshotted base settings are inconsistent.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The settings check succeeded without providing a usable display rate.
    #[error("Driver did not provide a valid display sample rate")]
    MissingDisplayRate,
}

impl AcquisitionError {
    pub(crate) fn hook(stage: HookStage) -> impl FnOnce(DriverError) -> Self {
        move |source| AcquisitionError::Hook { stage, source }
    }

    /// The hook that failed, if the failure came from a driver hook.
    pub fn stage(&self) -> Option<HookStage> {
        match self {
            AcquisitionError::Hook { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
