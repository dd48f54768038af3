//! Port state: the parameter table plus the controller state it protects.
//!
//! Everything in [`PortData`] is guarded by one coarse-grained mutex, the
//! *port lock*. Hooks that run with the lock held receive `&mut PortData`
//! (must not release it) or `&mut PortGuard` (may release and reacquire it,
//! e.g. with [`MutexGuard::unlocked`](parking_lot::MutexGuard::unlocked) or a
//! condition variable wait).

use std::sync::Arc;
use std::time::Duration;

use daq_core::arm::{ArmMode, ArmRequest, ArmState, BurstMetaInfo};
use daq_core::config_param::ConfigParam;
use daq_core::error::ParamError;
use daq_core::parameter::{ParamId, ParamKind, ParamTable};
use daq_core::time_axis::TimeAxis;
use daq_pool::ChannelPool;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::DigitizerConfig;
use crate::driver::DigitizerDriver;
use crate::error::AcquisitionError;

/// Port lock guard.
pub type PortGuard<'a> = MutexGuard<'a, PortData>;

/// Condition variables paired with the port lock.
#[derive(Debug, Default)]
pub(crate) struct PortSignals {
    /// Signalled when an arm cycle should start (or on shutdown).
    pub start_arming: Condvar,
    /// Signalled on the first disarm request of a cycle.
    pub disarm_requested: Condvar,
    /// Signalled on every arm state change.
    pub state_changed: Condvar,
}

/// Framework-owned parameters.
#[derive(Debug, Clone, Copy)]
pub struct BaseParams {
    /// Client arm request: 0 disarm, 1 post-trigger, 2 pre+post-trigger
    pub arm_request: ParamId,
    /// Current [`ArmState`] as an integer
    pub arm_state: ParamId,
    /// Display rate of the current arm cycle, NaN when disarmed
    pub effective_sample_rate: ParamId,
    /// Id of the last processed burst
    pub burst_id: ParamId,
    /// Duration of the last burst from its [`BurstMetaInfo`], in seconds
    pub burst_time_burst: ParamId,
    /// Read time of the last burst, in seconds
    pub burst_time_read: ParamId,
    /// Processing time of the last burst, in seconds
    pub burst_time_process: ParamId,
    /// Seconds the read thread sleeps after each burst
    pub sleep_after_burst: ParamId,
    /// Device name reported by the driver
    pub digitizer_name: ParamId,
    /// Inverse time unit of the time axis
    pub time_array_unit_inv: ParamId,
    /// Number of bursts to acquire, 0 for unlimited
    pub num_bursts: ConfigParam<i32, f64>,
    /// Samples after the trigger
    pub num_post_samples: ConfigParam<i32, f64>,
    /// Total samples (pre + post) in pre+post-trigger mode
    pub num_pre_post_samples: ConfigParam<i32, f64>,
    /// Sample rate asked for by the client
    pub requested_sample_rate: ConfigParam<f64>,
    /// Set by the driver from the requested rate
    pub achievable_sample_rate: ConfigParam<f64>,
}

impl BaseParams {
    pub(crate) fn create(params: &mut ParamTable, name: &str) -> Result<Self, ParamError> {
        let base = Self {
            arm_request: params.create("ARM_REQUEST", ParamKind::Int)?,
            arm_state: params.create_protected("ARM_STATE", ParamKind::Int)?,
            effective_sample_rate: params.create_protected("EFFECTIVE_SAMPLE_RATE", ParamKind::Float)?,
            burst_id: params.create_protected("BURST_ID", ParamKind::Int)?,
            burst_time_burst: params.create_protected("BURST_TIME_BURST", ParamKind::Float)?,
            burst_time_read: params.create_protected("BURST_TIME_READ", ParamKind::Float)?,
            burst_time_process: params.create_protected("BURST_TIME_PROCESS", ParamKind::Float)?,
            sleep_after_burst: params.create("SLEEP_AFTER_BURST", ParamKind::Float)?,
            digitizer_name: params.create_protected("DIGITIZER_NAME", ParamKind::Text)?,
            time_array_unit_inv: params.create("TIME_ARRAY_UNIT_INV", ParamKind::Float)?,
            num_bursts: params.create_config_param("NUM_BURSTS", f64::NAN, false)?,
            num_post_samples: params.create_config_param("NUM_POST_SAMPLES", f64::NAN, false)?,
            num_pre_post_samples: params.create_config_param("NUM_PRE_POST_SAMPLES", f64::NAN, false)?,
            requested_sample_rate: params.create_config_param("REQUESTED_SAMPLE_RATE", f64::NAN, false)?,
            achievable_sample_rate: params.create_config_param("ACHIEVABLE_SAMPLE_RATE", f64::NAN, true)?,
        };

        params.set_int(base.arm_request, ArmState::Disarmed.as_raw());
        params.set_int(base.arm_state, ArmState::Disarmed.as_raw());
        params.set_float(base.effective_sample_rate, f64::NAN);
        params.set_float(base.sleep_after_burst, 0.0);
        params.set_text(base.digitizer_name, name);
        params.set_float(base.time_array_unit_inv, 1.0);
        Ok(base)
    }
}

/// Controller state, only touched with the port lock held.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub arm_state: ArmState,
    /// Mode of the current (or starting) arm cycle
    pub requested_mode: ArmMode,
    /// Mode to rearm with once disarming completes, `None` to stay disarmed
    pub requested_rearm: Option<ArmMode>,
    /// Armed from the precondition wait until acquisition is stopped
    pub armed: bool,
    /// Whether submitted data may reach consumers
    pub allowing_data: bool,
    pub disarm_requested: bool,
    pub in_read_loop: bool,
    pub rate_for_display: f64,
    pub time_axis: Option<TimeAxis>,
    /// Why the most recent arm cycle failed
    pub last_error: Option<AcquisitionError>,
    pub start_signaled: bool,
    pub disarm_signaled: bool,
    pub shutdown: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            arm_state: ArmState::Disarmed,
            requested_mode: ArmMode::PostTrigger,
            requested_rearm: None,
            armed: false,
            allowing_data: false,
            disarm_requested: false,
            in_read_loop: false,
            rate_for_display: f64::NAN,
            time_axis: None,
            last_error: None,
            start_signaled: false,
            disarm_signaled: false,
            shutdown: false,
        }
    }
}

/// Everything protected by the port lock.
pub struct PortData {
    /// Framework, configuration and driver parameters
    pub params: ParamTable,
    base: BaseParams,
    pub(crate) state: ControllerState,
    signals: Arc<PortSignals>,
    driver: Option<Arc<dyn DigitizerDriver>>,
    supports_pre_samples: bool,
}

impl PortData {
    pub(crate) fn new(
        params: ParamTable,
        base: BaseParams,
        signals: Arc<PortSignals>,
        supports_pre_samples: bool,
    ) -> Self {
        Self {
            params,
            base,
            state: ControllerState::default(),
            signals,
            driver: None,
            supports_pre_samples,
        }
    }

    /// Framework parameter ids.
    pub fn base(&self) -> &BaseParams {
        &self.base
    }

    /// Externally visible arm state.
    pub fn arm_state(&self) -> ArmState {
        self.state.arm_state
    }

    /// True from the start of the precondition wait until the acquisition
    /// is stopped, or until an early failure.
    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    /// Capture mode of the current arm cycle.
    pub fn requested_mode(&self) -> ArmMode {
        self.state.requested_mode
    }

    /// Whether the hardware profile allows pre+post-trigger mode.
    pub fn supports_pre_samples(&self) -> bool {
        self.supports_pre_samples
    }

    /// The desired (not snapshotted) requested sample rate.
    pub fn requested_sample_rate(&self) -> f64 {
        self.base.requested_sample_rate.desired(&self.params)
    }

    /// Set the rate the hardware can actually achieve for the requested one.
    pub fn set_achievable_sample_rate(&mut self, rate: f64) {
        self.base
            .achievable_sample_rate
            .set_desired(&mut self.params, rate);
        self.params.publish();
    }

    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn num_bursts_snapshot(&self) -> i32 {
        self.base.num_bursts.snapshot(&self.params)
    }

    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn num_post_samples_snapshot(&self) -> i32 {
        self.base.num_post_samples.snapshot(&self.params)
    }

    /// Total samples per burst. Equals the post-sample count unless armed
    /// in pre+post-trigger mode.
    ///
    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn num_pre_post_samples_snapshot(&self) -> i32 {
        self.base.num_pre_post_samples.snapshot(&self.params)
    }

    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn requested_sample_rate_snapshot(&self) -> f64 {
        self.base.requested_sample_rate.snapshot(&self.params)
    }

    /// # Panics
    ///
    /// Panics outside the snapshot window.
    pub fn achievable_sample_rate_snapshot(&self) -> f64 {
        self.base.achievable_sample_rate.snapshot(&self.params)
    }

    pub fn digitizer_name(&self) -> &str {
        self.params.get_text(self.base.digitizer_name).unwrap_or_default()
    }

    pub fn set_digitizer_name(&mut self, name: &str) {
        self.params.set_text(self.base.digitizer_name, name);
        self.params.publish();
    }

    /// Time axis of the most recently accepted settings.
    pub fn time_axis(&self) -> Option<TimeAxis> {
        self.state.time_axis
    }

    /// Disarm on behalf of the driver (e.g. after detecting a fatal hardware
    /// condition). No-op when already disarmed; never rearms.
    pub fn request_disarm_from_driver(&mut self) {
        if self.state.arm_state != ArmState::Disarmed {
            debug!("Disarm requested by driver");
            self.request_disarming(None);
        }
    }

    /// Publish pending parameter changes.
    pub fn publish(&mut self) -> usize {
        self.params.publish()
    }

    pub(crate) fn driver(&self) -> Option<Arc<dyn DigitizerDriver>> {
        self.driver.clone()
    }

    pub(crate) fn set_driver(&mut self, driver: Option<Arc<dyn DigitizerDriver>>) {
        self.driver = driver;
    }

    /// Run `f` with the driver, if one is installed.
    pub(crate) fn with_driver(&mut self, f: impl FnOnce(&dyn DigitizerDriver, &mut PortData)) {
        if let Some(driver) = self.driver.clone() {
            f(driver.as_ref(), self);
        }
    }

    pub(crate) fn set_arm_state(&mut self, arm_state: ArmState) {
        if self.state.arm_state != arm_state {
            info!(from = %self.state.arm_state, to = %arm_state, "Arm state changed");
        }
        self.state.arm_state = arm_state;
        self.params.set_int(self.base.arm_state, arm_state.as_raw());
        self.params.publish();
        self.signals.state_changed.notify_all();
    }

    pub(crate) fn handle_arm_request(&mut self, request: ArmRequest) {
        let mode = match request {
            ArmRequest::Disarm => None,
            ArmRequest::Arm(mode) => Some(mode),
        };
        if self.state.shutdown && mode.is_some() {
            debug!("Ignoring arm request during shutdown");
            return;
        }
        match (self.state.arm_state, mode) {
            (ArmState::Disarmed, Some(mode)) => self.start_arming(mode),
            (ArmState::Disarmed, None) => {}
            (_, rearm) => self.request_disarming(rearm),
        }
    }

    pub(crate) fn start_arming(&mut self, mode: ArmMode) {
        debug_assert_eq!(self.state.arm_state, ArmState::Disarmed);
        self.set_arm_state(ArmState::Busy);

        self.state.requested_mode = mode;
        self.state.disarm_requested = false;
        self.state.requested_rearm = None;
        self.state.in_read_loop = false;
        self.state.last_error = None;

        self.state.start_signaled = true;
        self.signals.start_arming.notify_one();
    }

    /// Only the first request of a cycle has side effects; later ones just
    /// update the rearm mode.
    pub(crate) fn request_disarming(&mut self, rearm: Option<ArmMode>) {
        debug_assert_ne!(self.state.arm_state, ArmState::Disarmed);

        if !self.state.disarm_requested {
            self.state.disarm_requested = true;
            self.state.allowing_data = false;
            self.set_arm_state(ArmState::Busy);

            self.state.disarm_signaled = true;
            self.signals.disarm_requested.notify_all();

            if self.state.in_read_loop {
                debug!("Interrupting burst read");
                self.with_driver(|driver, port| driver.interrupt_reading(port));
            }
        }

        self.state.requested_rearm = rearm;
    }

    /// Clear the armed flag, notifying the driver if it was set.
    pub(crate) fn mark_disarmed(&mut self) {
        if self.state.armed {
            self.state.armed = false;
            self.with_driver(|driver, port| driver.on_disarmed(port));
        }
    }

    pub(crate) fn set_effective_params(&mut self) {
        let rate = self.state.rate_for_display;
        self.params.set_float(self.base.effective_sample_rate, rate);
        self.params.publish_effective_values();
        self.params.publish();
    }

    pub(crate) fn clear_effective_params(&mut self) {
        self.params.set_float(self.base.effective_sample_rate, f64::NAN);
        self.params.invalidate_effective_values();
        self.params.publish();
    }
}

impl std::fmt::Debug for PortData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortData")
            .field("params", &self.params.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// State shared between the controller, its read thread and data producers.
pub(crate) struct PortShared {
    pub port: Mutex<PortData>,
    pub signals: Arc<PortSignals>,
    pub channels: ChannelPool,
    pub config: DigitizerConfig,
}

/// Cloneable handle to a digitizer port.
///
/// Drivers keep one to lock the port from their own threads, to allocate
/// and submit channel data, and to publish burst information.
#[derive(Clone)]
pub struct PortHandle {
    shared: Arc<PortShared>,
}

impl PortHandle {
    pub(crate) fn new(shared: Arc<PortShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &PortShared {
        &self.shared
    }

    /// Acquire the port lock.
    pub fn lock(&self) -> PortGuard<'_> {
        self.shared.port.lock()
    }

    pub fn channels(&self) -> &ChannelPool {
        &self.shared.channels
    }

    pub fn num_channels(&self) -> usize {
        self.shared.channels.num_channels()
    }

    pub fn config(&self) -> &DigitizerConfig {
        &self.shared.config
    }

    /// Publish timing information about the burst that was just processed.
    ///
    /// Must be called with the port unlocked.
    pub fn publish_burst_meta_info(&self, info: &BurstMetaInfo) {
        let mut port = self.lock();
        let base = *port.base();
        port.params.set_int(base.burst_id, info.burst_id);
        port.params
            .set_float(base.burst_time_burst, BurstMetaInfo::micros(info.time_burst));
        port.params
            .set_float(base.burst_time_read, BurstMetaInfo::micros(info.time_read));
        port.params
            .set_float(base.burst_time_process, BurstMetaInfo::micros(info.time_process));
        port.params.publish();
    }

    /// Sleep for `SLEEP_AFTER_BURST` seconds if positive.
    ///
    /// Used to provoke buffer overflows in tests. Must be called with the
    /// port unlocked.
    pub fn maybe_sleep_for_testing(&self) {
        let seconds = {
            let port = self.lock();
            port.params
                .get_float(port.base().sleep_after_burst)
                .unwrap_or(0.0)
        };
        if seconds.is_finite() && seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }

    /// Whether disarming was requested in the current arm cycle.
    pub fn is_disarm_requested(&self) -> bool {
        self.lock().state.disarm_requested
    }

    /// Block until disarming is requested. Must be called with the port
    /// unlocked.
    pub fn wait_until_disarming(&self) {
        let mut port = self.lock();
        self.wait_until_disarming_locked(&mut port);
    }

    /// Like [`wait_until_disarming`](Self::wait_until_disarming), but gives
    /// up after `timeout`. Returns whether disarming was requested.
    pub fn wait_until_disarming_for(&self, timeout: Duration) -> bool {
        let mut port = self.lock();
        if !port.state.disarm_signaled {
            let _ = self
                .shared
                .signals
                .disarm_requested
                .wait_for(&mut port, timeout);
        }
        port.state.disarm_signaled
    }

    pub(crate) fn wait_until_disarming_locked(&self, port: &mut PortGuard<'_>) {
        while !port.state.disarm_signaled {
            self.shared.signals.disarm_requested.wait(port);
        }
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("name", &self.shared.config.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_data() -> PortData {
        let mut params = ParamTable::new();
        let base = BaseParams::create(&mut params, "unit").unwrap();
        PortData::new(params, base, Arc::new(PortSignals::default()), false)
    }

    #[test]
    fn test_base_params_registered() {
        let port = port_data();
        let names: Vec<_> = port.params.config_param_names().collect();
        assert_eq!(
            names,
            vec![
                "NUM_BURSTS",
                "NUM_POST_SAMPLES",
                "NUM_PRE_POST_SAMPLES",
                "REQUESTED_SAMPLE_RATE",
                "ACHIEVABLE_SAMPLE_RATE"
            ]
        );

        let achievable = port.params.find("DESIRED_ACHIEVABLE_SAMPLE_RATE").unwrap();
        assert!(port.params.is_protected(achievable));
        let requested = port.params.find("DESIRED_REQUESTED_SAMPLE_RATE").unwrap();
        assert!(!port.params.is_protected(requested));
        assert_eq!(port.digitizer_name(), "unit");
    }

    #[test]
    fn test_arm_request_from_disarmed_starts_arming() {
        let mut port = port_data();
        port.handle_arm_request(ArmRequest::Arm(ArmMode::PrePostTrigger));

        assert_eq!(port.arm_state(), ArmState::Busy);
        assert_eq!(port.requested_mode(), ArmMode::PrePostTrigger);
        assert!(port.state.start_signaled);
        assert_eq!(
            port.params.get_int(port.base().arm_state),
            Some(ArmState::Busy.as_raw())
        );
    }

    #[test]
    fn test_disarm_requests_coalesce() {
        let mut port = port_data();
        port.handle_arm_request(ArmRequest::Arm(ArmMode::PostTrigger));
        port.state.allowing_data = true;

        port.handle_arm_request(ArmRequest::Disarm);
        assert!(port.state.disarm_requested);
        assert!(port.state.disarm_signaled);
        assert!(!port.state.allowing_data);
        assert_eq!(port.state.requested_rearm, None);

        port.handle_arm_request(ArmRequest::Arm(ArmMode::PrePostTrigger));
        assert_eq!(port.state.requested_rearm, Some(ArmMode::PrePostTrigger));

        // Later requests only change the rearm mode.
        port.state.allowing_data = true;
        port.handle_arm_request(ArmRequest::Disarm);
        assert_eq!(port.state.requested_rearm, None);
        assert!(port.state.allowing_data);
    }

    #[test]
    fn test_disarm_when_disarmed_is_noop() {
        let mut port = port_data();
        port.handle_arm_request(ArmRequest::Disarm);
        port.request_disarm_from_driver();
        assert_eq!(port.arm_state(), ArmState::Disarmed);
        assert!(!port.state.disarm_requested);
    }

    #[test]
    fn test_arm_ignored_after_shutdown() {
        let mut port = port_data();
        port.state.shutdown = true;
        port.handle_arm_request(ArmRequest::Arm(ArmMode::PostTrigger));
        assert_eq!(port.arm_state(), ArmState::Disarmed);
        assert!(!port.state.start_signaled);
    }

    #[test]
    fn test_achievable_rate_is_internal() {
        let mut port = port_data();
        port.set_achievable_sample_rate(125e6);
        let id = port.base().achievable_sample_rate.desired_id();
        assert_eq!(port.params.get_float(id), Some(125e6));
    }
}
