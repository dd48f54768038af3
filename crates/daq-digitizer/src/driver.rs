//! The hardware driver interface.
//!
//! A driver plugs into the acquisition controller by implementing
//! [`DigitizerDriver`]. The controller calls its hooks from the read thread
//! in a fixed order for every arm cycle:
//!
//! ```text
//! wait_for_preconditions ─▶ check_settings ─▶ start_acquisition(false)
//!        ┌──────────────────────────────────────────────┘
//!        ▼
//!   read_burst ─▶ check_overflow ─▶ process_burst_data ─▶ (repeat)
//!        │
//!        └─ after an overflow: start_acquisition(true) and repeat
//!
//! stop_acquisition ─▶ on_disarmed
//! ```
//!
//! Hooks taking `&mut PortData` run with the port lock held and must not
//! block. Hooks taking an [`AcquisitionContext`] run unlocked and may lock
//! the port through [`AcquisitionContext::port`].

use std::num::NonZeroU32;

use daq_core::arm::{ArmInfo, ArmMode};
use daq_core::error::{DriverError, DriverErrorKind, DriverResult};

use crate::port::{PortData, PortGuard, PortHandle};

/// Result of [`DigitizerDriver::check_overflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStatus {
    Clear,
    /// The hardware buffer overflowed. `buffer_bursts` is the number of
    /// bursts that can still be read before restarting, including the one
    /// just read.
    Overflowed { buffer_bursts: NonZeroU32 },
}

impl OverflowStatus {
    /// # Panics
    ///
    /// Panics if `buffer_bursts` is zero; the burst just read always counts.
    pub fn overflowed(buffer_bursts: u32) -> Self {
        assert!(
            buffer_bursts > 0,
            "overflow must report at least the burst just read"
        );
        NonZeroU32::new(buffer_bursts)
            .map_or(Self::Clear, |buffer_bursts| Self::Overflowed { buffer_bursts })
    }
}

/// Settings accepted for the current arm cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub mode: ArmMode,
    /// Bursts to acquire before disarming automatically, 0 for unlimited
    pub num_bursts: u32,
    pub num_post_samples: u32,
    /// Total samples per burst; equals `num_post_samples` in post-trigger mode
    pub num_pre_post_samples: u32,
    pub requested_sample_rate: f64,
    pub achievable_sample_rate: f64,
    pub rate_for_display: f64,
}

impl AcquisitionSettings {
    /// Samples before the trigger, 0 in post-trigger mode.
    pub fn num_pre_samples(&self) -> u32 {
        self.num_pre_post_samples.saturating_sub(self.num_post_samples)
    }

    /// Samples per channel in each burst.
    pub fn samples_per_burst(&self) -> u32 {
        self.num_pre_post_samples
    }
}

/// What the unlocked acquisition hooks get to work with.
#[derive(Debug, Clone)]
pub struct AcquisitionContext {
    port: PortHandle,
    settings: AcquisitionSettings,
}

impl AcquisitionContext {
    pub(crate) fn new(port: PortHandle, settings: AcquisitionSettings) -> Self {
        Self { port, settings }
    }

    pub fn port(&self) -> &PortHandle {
        &self.port
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }
}

/// Hardware-specific behavior of a burst digitizer.
///
/// Only [`check_settings`](Self::check_settings),
/// [`start_acquisition`](Self::start_acquisition) and
/// [`stop_acquisition`](Self::stop_acquisition) are required. Drivers that
/// submit data from their own threads keep the default `read_burst`, which
/// simply waits until disarming.
pub trait DigitizerDriver: Send + Sync + 'static {
    /// Short identifier used in logs and errors (e.g. "simulated").
    fn driver_type(&self) -> &str;

    /// The desired requested sample rate changed. Called with the port
    /// locked; must update the achievable sample rate.
    fn requested_sample_rate_changed(&self, port: &mut PortData) {
        let rate = port.requested_sample_rate();
        port.set_achievable_sample_rate(rate);
    }

    /// Wait until the hardware is ready to be armed.
    ///
    /// Called with the port locked. May release the lock temporarily but
    /// must hold it again when returning.
    fn wait_for_preconditions(&self, _port: &mut PortGuard<'_>) -> DriverResult<()> {
        Ok(())
    }

    /// Validate the snapshotted settings and fill in `arm_info`.
    ///
    /// Called with the port locked, inside the snapshot window: snapshots
    /// may be read and adjusted, and parameters may be marked irrelevant.
    /// `arm_info.rate_for_display` must be set.
    fn check_settings(&self, port: &mut PortData, arm_info: &mut ArmInfo) -> DriverResult<()>;

    /// Configure the hardware and start acquiring. `overflow` is true when
    /// restarting after a buffer overflow.
    fn start_acquisition(&self, ctx: &AcquisitionContext, overflow: bool) -> DriverResult<()>;

    /// Wait for and read one burst.
    ///
    /// Must return promptly, without error, once
    /// [`interrupt_reading`](Self::interrupt_reading) has been called.
    fn read_burst(&self, ctx: &AcquisitionContext) -> DriverResult<()> {
        ctx.port().wait_until_disarming();
        Ok(())
    }

    /// Called after every burst while no overflow is being handled.
    fn check_overflow(&self, _ctx: &AcquisitionContext) -> DriverResult<OverflowStatus> {
        Ok(OverflowStatus::Clear)
    }

    /// Process and submit the burst that was just read.
    fn process_burst_data(&self, _ctx: &AcquisitionContext) -> DriverResult<()> {
        Err(DriverError::new(
            self.driver_type(),
            DriverErrorKind::Unsupported,
            "driver does not use the burst read loop",
        ))
    }

    /// Make any ongoing or future `read_burst` return as soon as possible.
    ///
    /// Called with the port locked, at most once per arm cycle, and only
    /// while the read loop is running. Must not block.
    fn interrupt_reading(&self, _port: &mut PortData) {}

    /// Undo [`start_acquisition`](Self::start_acquisition). Called after the
    /// last `read_burst`, `check_overflow` or `process_burst_data` returned.
    fn stop_acquisition(&self, ctx: &AcquisitionContext);

    /// [`PortData::is_armed`] changed from true to false. Called with the
    /// port locked.
    fn on_disarmed(&self, _port: &mut PortData) {}
}
