//! Simulated digitizer hardware for rust-daq burst acquisition.
//!
//! This crate provides a software burst digitizer for exercising the
//! acquisition controller without physical hardware.
//!
//! # Available Components
//!
//! - [`SimulatedDigitizer`] - Driver implementing every acquisition hook
//! - [`FaultInjector`] - Per-hook failure scenarios and random failures
//! - [`Waveform`] - Synthetic per-channel burst data
//! - [`SimRng`] - Seeded RNG for reproducible runs
//!
//! # Timing Characteristics
//!
//! - `SimMode::Instant`: reads never wait, overflows only when forced
//! - `SimMode::Realistic`: one trigger per `SIM_TRIGGER_PERIOD`, ring overflow
//!   when the reader falls `ring_capacity` bursts behind
//! - Read aborts complete after `abort_latency` on a worker thread
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_digitizer::{Digitizer, DigitizerConfig};
//! use daq_driver_mock::{SimulatedConfig, SimulatedDigitizer};
//!
//! let config = SimulatedConfig::default().realistic(1e-3);
//! let digitizer = Digitizer::spawn(DigitizerConfig::new("sim", 4), |setup| {
//!     SimulatedDigitizer::create(setup, config)
//! })?;
//! ```

pub mod faults;
pub mod rng;
pub mod simulated;
pub mod waveform;

pub use faults::{FaultConfig, FaultInjector, FaultScenario};
pub use rng::SimRng;
pub use simulated::{
    ForcedOverflow, SimMode, SimParams, SimStatsSnapshot, SimulatedConfig, SimulatedDigitizer,
    DRIVER_TYPE,
};
pub use waveform::Waveform;
