//! Arm states, arm requests and per-arm/per-burst records.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Externally visible arm state of a digitizer.
///
/// The numeric values are the ones published in the `ARM_STATE` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ArmState {
    Disarmed = 0,
    PostTrigger = 1,
    PrePostTrigger = 2,
    /// Transient: arming, disarming or recovering from an overflow.
    Busy = 3,
    /// An unexpected failure occurred; held until disarm is requested.
    Error = 4,
}

impl ArmState {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ArmState::Disarmed),
            1 => Some(ArmState::PostTrigger),
            2 => Some(ArmState::PrePostTrigger),
            3 => Some(ArmState::Busy),
            4 => Some(ArmState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ArmState::Disarmed => "disarmed",
            ArmState::PostTrigger => "post_trigger",
            ArmState::PrePostTrigger => "pre_post_trigger",
            ArmState::Busy => "busy",
            ArmState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// Capture mode requested when arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmMode {
    /// Post-trigger samples only.
    PostTrigger,
    /// Pre-trigger and post-trigger samples.
    PrePostTrigger,
}

impl From<ArmMode> for ArmState {
    fn from(mode: ArmMode) -> Self {
        match mode {
            ArmMode::PostTrigger => ArmState::PostTrigger,
            ArmMode::PrePostTrigger => ArmState::PrePostTrigger,
        }
    }
}

/// A decoded write to the `ARM_REQUEST` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRequest {
    Disarm,
    Arm(ArmMode),
}

impl ArmRequest {
    /// Decode 0 (disarm), 1 (post-trigger) or 2 (pre+post-trigger).
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ArmRequest::Disarm),
            1 => Some(ArmRequest::Arm(ArmMode::PostTrigger)),
            2 => Some(ArmRequest::Arm(ArmMode::PrePostTrigger)),
            _ => None,
        }
    }
}

/// Sample counts overriding the configured ones for the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CustomTimeAxis {
    pub num_pre_samples: u32,
    pub num_post_samples: u32,
}

/// Information a driver's settings check hands back to the framework.
///
/// The driver must set `rate_for_display`; arming fails otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArmInfo {
    /// Sample rate (Hz) used for display and for the time axis.
    pub rate_for_display: Option<f64>,
    /// Use these counts for the time axis instead of the snapshotted settings.
    pub custom_time_axis: Option<CustomTimeAxis>,
}

impl ArmInfo {
    /// The display rate, if it was set to a finite positive value.
    pub fn valid_display_rate(&self) -> Option<f64> {
        self.rate_for_display
            .filter(|rate| rate.is_finite() && *rate > 0.0)
    }
}

/// Timing information about one processed burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstMetaInfo {
    /// Increments with every burst and wraps to zero before `i32::MAX`.
    pub burst_id: i32,
    /// Duration of the burst itself.
    pub time_burst: Option<Duration>,
    /// Time spent reading the burst from hardware.
    pub time_read: Option<Duration>,
    /// Time spent processing the burst after it was read.
    pub time_process: Option<Duration>,
}

impl BurstMetaInfo {
    pub fn new(burst_id: i32) -> Self {
        Self {
            burst_id,
            ..Self::default()
        }
    }

    /// Convert an optional duration to microseconds, NaN if absent.
    pub fn micros(duration: Option<Duration>) -> f64 {
        duration.map_or(f64::NAN, |d| d.as_secs_f64() * 1e6)
    }
}

/// The burst id following `id`, wrapping to zero before `i32::MAX`.
pub fn next_burst_id(id: i32) -> i32 {
    if id >= i32::MAX - 1 || id < 0 {
        0
    } else {
        id + 1
    }
}
