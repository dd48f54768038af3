//! `daq-digitizer`
//!
//! Acquisition controller for burst digitizers.
//!
//! A [`Digitizer`] drives a hardware-specific [`DigitizerDriver`] through
//! arm cycles on a dedicated read thread: configuration snapshot, settings
//! check, acquisition start, the burst read loop with buffer overflow
//! recovery, and acquisition stop. Drivers push burst data to consumers with
//! [`DataSubmission`], which only lets data through while the controller
//! allows it.
//!
//! ## Example
//!
//! ```no_run
//! use daq_core::{ArmInfo, ArmMode, DriverResult};
//! use daq_digitizer::{AcquisitionContext, Digitizer, DigitizerConfig, DigitizerDriver, PortData};
//!
//! struct Idle;
//!
//! impl DigitizerDriver for Idle {
//!     fn driver_type(&self) -> &str {
//!         "idle"
//!     }
//!
//!     fn check_settings(&self, _port: &mut PortData, arm_info: &mut ArmInfo) -> DriverResult<()> {
//!         arm_info.rate_for_display = Some(1e6);
//!         Ok(())
//!     }
//!
//!     fn start_acquisition(&self, _ctx: &AcquisitionContext, _overflow: bool) -> DriverResult<()> {
//!         Ok(())
//!     }
//!
//!     fn stop_acquisition(&self, _ctx: &AcquisitionContext) {}
//! }
//!
//! # fn main() -> daq_core::AppResult<()> {
//! let digitizer = Digitizer::spawn(DigitizerConfig::new("idle", 1), |_| Ok(Idle))?;
//! digitizer.write_int("DESIRED_NUM_POST_SAMPLES", 100)?;
//! digitizer.request_arm(ArmMode::PostTrigger);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod port;
pub mod submit;

pub use config::DigitizerConfig;
pub use controller::{Digitizer, DriverSetup};
pub use driver::{AcquisitionContext, AcquisitionSettings, DigitizerDriver, OverflowStatus};
pub use error::{AcquisitionError, HookStage};
pub use port::{BaseParams, PortData, PortGuard, PortHandle};
pub use submit::{DataSubmission, SubmitStatus};
