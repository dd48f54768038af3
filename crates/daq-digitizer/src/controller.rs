//! The acquisition controller: arm/disarm state machine and burst read loop.
//!
//! A [`Digitizer`] owns one read thread. Each arm request wakes the thread,
//! which runs one arm cycle:
//!
//! 1. Wait for preconditions, snapshot the configuration parameters and
//!    check the settings (framework checks first, then the driver's).
//! 2. Publish the effective values and the display time axis.
//! 3. Start acquisition and read bursts until the burst count is reached or
//!    disarming is requested. A buffer overflow caps the bursts read before
//!    acquisition is restarted, without disarming.
//! 4. Stop acquisition, invalidate the effective values, then settle in
//!    `Disarmed` or start the next cycle if a rearm was requested.
//!
//! A failing driver hook puts the controller in the `Error` state, where it
//! stays until disarming is requested.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use daq_core::arm::{ArmInfo, ArmMode, ArmRequest, ArmState};
use daq_core::error::{AppResult, DaqError, DriverResult};
use daq_core::parameter::{ParamKind, ParamTable, ParamUpdate, ParamValue};
use daq_core::time_axis::TimeAxis;
use daq_pool::{BufferPool, ChannelPool};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::config::DigitizerConfig;
use crate::driver::{AcquisitionContext, AcquisitionSettings, DigitizerDriver, OverflowStatus};
use crate::error::{AcquisitionError, HookStage};
use crate::port::{BaseParams, PortData, PortHandle, PortShared, PortSignals};

/// What a driver constructor gets to work with.
///
/// The port is locked while the constructor runs; use [`params`](Self::params)
/// to register driver parameters and do not lock the port through the handle.
pub struct DriverSetup<'a> {
    params: &'a mut ParamTable,
    base: BaseParams,
    port: &'a PortHandle,
}

impl<'a> DriverSetup<'a> {
    /// Parameter table, for creating the driver's own parameters.
    pub fn params(&mut self) -> &mut ParamTable {
        self.params
    }

    /// Framework parameter ids.
    pub fn base(&self) -> &BaseParams {
        &self.base
    }

    /// Static configuration of the digitizer being built.
    pub fn config(&self) -> &DigitizerConfig {
        self.port.config()
    }

    /// Handle for the driver to keep, e.g. for its own worker threads.
    pub fn port(&self) -> &PortHandle {
        self.port
    }
}

/// A burst digitizer: parameters, channel outputs and the read thread
/// driving `D`.
pub struct Digitizer<D: DigitizerDriver> {
    port: PortHandle,
    driver: Arc<D>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<D: DigitizerDriver> Digitizer<D> {
    /// Create the port, construct the driver with `build` and start the read
    /// thread.
    pub fn spawn<F>(config: DigitizerConfig, build: F) -> AppResult<Self>
    where
        F: FnOnce(&mut DriverSetup<'_>) -> DriverResult<D>,
    {
        config.validate()?;

        let mut params = ParamTable::new();
        let base = BaseParams::create(&mut params, &config.name)?;
        let signals = Arc::new(PortSignals::default());
        let channels = ChannelPool::new(
            config.num_channels,
            BufferPool::new(config.max_buffers, config.max_memory),
            config.update_arrays,
        );
        let port_data = PortData::new(params, base, signals.clone(), config.supports_pre_samples);
        let port = PortHandle::new(Arc::new(PortShared {
            port: Mutex::new(port_data),
            signals,
            channels,
            config,
        }));

        let driver = {
            let mut guard = port.lock();
            let mut setup = DriverSetup {
                params: &mut guard.params,
                base,
                port: &port,
            };
            let driver = Arc::new(build(&mut setup)?);
            let dyn_driver: Arc<dyn DigitizerDriver> = driver.clone();
            guard.set_driver(Some(dyn_driver));
            driver.requested_sample_rate_changed(&mut guard);
            guard.publish();
            driver
        };

        let thread = std::thread::Builder::new()
            .name(port.config().thread_name())
            .spawn({
                let port = port.clone();
                let parent = Span::current();
                move || read_thread(port, &parent)
            })?;

        info!(
            digitizer = %port.config().name,
            driver = driver.driver_type(),
            channels = port.num_channels(),
            "Digitizer started"
        );

        Ok(Self {
            port,
            driver,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Port name from the configuration.
    pub fn name(&self) -> &str {
        &self.port.config().name
    }

    /// The hardware driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Shared port handle, for locking the parameter table directly.
    pub fn port(&self) -> &PortHandle {
        &self.port
    }

    /// Channel outputs: buffer pool, last arrays, observers and sinks.
    pub fn channels(&self) -> &ChannelPool {
        self.port.channels()
    }

    /// Arm in `mode`. When not disarmed, this disarms first and rearms in
    /// `mode` once disarming completes; the last request wins.
    pub fn request_arm(&self, mode: ArmMode) {
        self.port.lock().handle_arm_request(ArmRequest::Arm(mode));
    }

    /// Disarm. No-op when already disarmed.
    pub fn request_disarm(&self) {
        self.port.lock().handle_arm_request(ArmRequest::Disarm);
    }

    /// Externally visible arm state.
    pub fn arm_state(&self) -> ArmState {
        self.port.lock().arm_state()
    }

    /// See [`PortData::is_armed`].
    pub fn is_armed(&self) -> bool {
        self.port.lock().is_armed()
    }

    /// Why the last arm cycle failed, until the next cycle starts.
    pub fn last_error(&self) -> Option<AcquisitionError> {
        self.port.lock().state.last_error.clone()
    }

    /// Display time axis of the current or most recent arm cycle.
    pub fn time_axis(&self) -> Option<TimeAxis> {
        self.port.lock().time_axis()
    }

    pub fn set_digitizer_name(&self, name: &str) {
        self.port.lock().set_digitizer_name(name);
    }

    /// Write a parameter as an external client would.
    ///
    /// Writes to `ARM_REQUEST` are validated (0 disarms, 1 and 2 arm) and
    /// forwarded to the state machine. Write-protected parameters are
    /// rejected.
    pub fn write(&self, name: &str, value: ParamValue) -> AppResult<()> {
        let mut port = self.port.lock();
        let id = port.params.find(name)?;
        let base = *port.base();

        let arm_request = match (&value, id == base.arm_request) {
            (ParamValue::Int(raw), true) => {
                Some(ArmRequest::from_raw(*raw).ok_or(DaqError::InvalidArmRequest(*raw))?)
            }
            _ => None,
        };

        port.params.write(id, value)?;
        debug!(param = name, "Parameter written");

        if let Some(request) = arm_request {
            port.handle_arm_request(request);
        }
        if id == base.requested_sample_rate.desired_id() {
            port.with_driver(|driver, port| driver.requested_sample_rate_changed(port));
        }
        port.publish();
        Ok(())
    }

    /// Shorthand for [`write`](Self::write) with an integer value.
    pub fn write_int(&self, name: &str, value: i32) -> AppResult<()> {
        self.write(name, ParamValue::Int(value))
    }

    /// Shorthand for [`write`](Self::write) with a float value.
    pub fn write_float(&self, name: &str, value: f64) -> AppResult<()> {
        self.write(name, ParamValue::Float(value))
    }

    /// Shorthand for [`write`](Self::write) with a text value.
    pub fn write_text(&self, name: &str, value: &str) -> AppResult<()> {
        self.write(name, ParamValue::Text(value.to_string()))
    }

    /// Current value of a parameter, `None` if it was never set.
    pub fn param(&self, name: &str) -> AppResult<Option<ParamValue>> {
        let port = self.port.lock();
        let id = port.params.find(name)?;
        Ok(port.params.value(id).cloned())
    }

    /// Integer parameter by name; fails on unknown names and non-integer parameters.
    pub fn read_int(&self, name: &str) -> AppResult<Option<i32>> {
        let port = self.port.lock();
        let id = port.params.find(name)?;
        port.params.check_kind(id, ParamKind::Int)?;
        Ok(port.params.get_int(id))
    }

    /// Float parameter by name; fails on unknown names and non-float parameters.
    pub fn read_float(&self, name: &str) -> AppResult<Option<f64>> {
        let port = self.port.lock();
        let id = port.params.find(name)?;
        port.params.check_kind(id, ParamKind::Float)?;
        Ok(port.params.get_float(id))
    }

    /// Text parameter by name; fails on unknown names and non-text parameters.
    pub fn read_text(&self, name: &str) -> AppResult<Option<String>> {
        let port = self.port.lock();
        let id = port.params.find(name)?;
        port.params.check_kind(id, ParamKind::Text)?;
        Ok(port.params.get_text(id).map(str::to_string))
    }

    /// Receive published parameter changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ParamUpdate> {
        self.port.lock().params.subscribe()
    }

    /// Block until `predicate` holds for the arm state or `timeout` elapses.
    /// Returns whether the predicate held.
    pub fn wait_until(&self, timeout: Duration, predicate: impl Fn(ArmState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let signals = &self.port.shared().signals;
        let mut port = self.port.lock();
        while !predicate(port.arm_state()) {
            if signals
                .state_changed
                .wait_until(&mut port, deadline)
                .timed_out()
            {
                return predicate(port.arm_state());
            }
        }
        true
    }

    /// Block until the arm state is `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: ArmState, timeout: Duration) -> bool {
        self.wait_until(timeout, |current| current == state)
    }

    /// Disarm, stop the read thread and release the driver.
    ///
    /// Arm requests are ignored afterwards. Called on drop.
    pub fn shutdown(&self) {
        {
            let mut port = self.port.lock();
            if !port.state.shutdown {
                info!(digitizer = %self.name(), "Shutting down digitizer");
                port.state.shutdown = true;
                if port.arm_state() != ArmState::Disarmed {
                    port.request_disarming(None);
                }
            }
            self.port.shared().signals.start_arming.notify_all();
        }

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(digitizer = %self.name(), "Read thread panicked");
            }
        }

        // The driver may hold a port handle.
        self.port.lock().set_driver(None);
    }
}

impl<D: DigitizerDriver> Drop for Digitizer<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: DigitizerDriver> std::fmt::Debug for Digitizer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digitizer")
            .field("name", &self.name())
            .field("driver", &self.driver.driver_type())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Read thread
// =============================================================================

fn read_thread(port: PortHandle, parent: &Span) {
    let _span = info_span!(parent: parent, "read_thread", digitizer = %port.config().name).entered();
    debug!("Read thread started");

    loop {
        let driver = {
            let mut guard = port.lock();
            while !guard.state.start_signaled && !guard.state.shutdown {
                port.shared().signals.start_arming.wait(&mut guard);
            }
            if !guard.state.start_signaled {
                break;
            }
            guard.state.start_signaled = false;
            debug_assert_eq!(guard.arm_state(), ArmState::Busy);

            match guard.driver() {
                Some(driver) => driver,
                None => break,
            }
        };

        ArmCycle::new(&port, driver.as_ref()).run();
    }

    debug!("Read thread exiting");
}

enum LoopExit {
    Stopped,
    OverflowRestart,
}

/// One arm to disarm cycle on the read thread.
struct ArmCycle<'a> {
    port: &'a PortHandle,
    driver: &'a dyn DigitizerDriver,
    /// Set once `start_acquisition` was called, successfully or not
    need_stop: bool,
    ctx: Option<AcquisitionContext>,
}

impl<'a> ArmCycle<'a> {
    fn new(port: &'a PortHandle, driver: &'a dyn DigitizerDriver) -> Self {
        Self {
            port,
            driver,
            need_stop: false,
            ctx: None,
        }
    }

    fn run(mut self) {
        let result = self.acquire();
        self.finish(result);
    }

    /// Returns `Ok` when acquisition stopped normally.
    fn acquire(&mut self) -> Result<(), AcquisitionError> {
        let handle = self.port;
        let driver = self.driver;
        let mut port = handle.lock();

        port.state.armed = true;

        driver
            .wait_for_preconditions(&mut port)
            .map_err(AcquisitionError::hook(HookStage::WaitForPreconditions))?;

        port.params.begin_settings_check();
        check_basic_settings(&mut port)?;

        let mut arm_info = ArmInfo::default();
        driver
            .check_settings(&mut port, &mut arm_info)
            .map_err(AcquisitionError::hook(HookStage::CheckSettings))?;
        check_adjusted_settings(&mut port)?;
        let rate = arm_info
            .valid_display_rate()
            .ok_or(AcquisitionError::MissingDisplayRate)?;
        port.params.freeze_snapshots();

        port.state.rate_for_display = rate;
        port.set_effective_params();

        let settings = accepted_settings(&port, rate);
        port.state.time_axis = Some(time_axis(&port, &arm_info, &settings));
        debug!(?settings, "Settings accepted");

        MutexGuard::unlocked(&mut port, || handle.channels().reset_arrays());

        let ctx = AcquisitionContext::new(handle.clone(), settings);
        self.ctx = Some(ctx.clone());

        let mut remaining = (settings.num_bursts > 0).then_some(u64::from(settings.num_bursts));
        let mut overflow = false;

        loop {
            if port.state.disarm_requested {
                return Ok(());
            }

            // Data submitted while start_acquisition runs is not lost.
            port.state.allowing_data = true;
            self.need_stop = true;

            MutexGuard::unlocked(&mut port, || driver.start_acquisition(&ctx, overflow))
                .map_err(AcquisitionError::hook(HookStage::StartAcquisition))?;

            if port.state.disarm_requested {
                return Ok(());
            }
            if !overflow {
                let mode = port.requested_mode();
                port.set_arm_state(mode.into());
            }
            port.state.in_read_loop = true;

            let exit = MutexGuard::unlocked(&mut port, || read_loop(driver, &ctx, &mut remaining))?;
            match exit {
                LoopExit::Stopped => return Ok(()),
                LoopExit::OverflowRestart => {
                    warn!("Restarting acquisition after buffer overflow");
                    port.state.in_read_loop = false;
                    overflow = true;
                }
            }
        }
    }

    fn finish(self, result: Result<(), AcquisitionError>) {
        let handle = self.port;
        let driver = self.driver;
        let mut port = handle.lock();

        port.state.in_read_loop = false;

        if let Err(err) = result {
            if port.state.disarm_requested {
                warn!(
                    driver = driver.driver_type(),
                    stage = ?err.stage(),
                    error = %err,
                    "Arm cycle failed while disarming"
                );
            } else {
                error!(
                    driver = driver.driver_type(),
                    stage = ?err.stage(),
                    error = %err,
                    "Arm cycle failed, waiting for disarm"
                );
                port.set_arm_state(ArmState::Error);
                if !self.need_stop {
                    port.mark_disarmed();
                }
                port.state.last_error = Some(err);
                handle.wait_until_disarming_locked(&mut port);
            }
        }

        port.state.allowing_data = false;

        if self.need_stop {
            if let Some(ctx) = &self.ctx {
                MutexGuard::unlocked(&mut port, || driver.stop_acquisition(ctx));
            }
        }

        port.mark_disarmed();
        port.params.close_snapshot_window();
        port.clear_effective_params();
        port.state.disarm_signaled = false;

        let rearm = port.state.requested_rearm.filter(|_| !port.state.shutdown);
        match rearm {
            Some(mode) => {
                debug!(?mode, "Rearming");
                // Not published; start_arming moves straight on to Busy.
                port.state.arm_state = ArmState::Disarmed;
                port.start_arming(mode);
            }
            None => port.set_arm_state(ArmState::Disarmed),
        }
    }
}

/// Read bursts until the per-restart budget is used up or disarming is
/// requested. `remaining` is the total budget, `None` for unlimited.
fn read_loop(
    driver: &dyn DigitizerDriver,
    ctx: &AcquisitionContext,
    remaining: &mut Option<u64>,
) -> Result<LoopExit, AcquisitionError> {
    let mut current = *remaining;
    let mut overflow = false;

    while current != Some(0) {
        driver
            .read_burst(ctx)
            .map_err(AcquisitionError::hook(HookStage::ReadBurst))?;

        // The burst just read is dropped unprocessed.
        if ctx.port().is_disarm_requested() {
            return Ok(LoopExit::Stopped);
        }

        if !overflow {
            let status = driver
                .check_overflow(ctx)
                .map_err(AcquisitionError::hook(HookStage::CheckOverflow))?;
            if let OverflowStatus::Overflowed { buffer_bursts } = status {
                overflow = true;
                let buffer_bursts = u64::from(buffer_bursts.get());
                warn!(
                    remaining_bursts = buffer_bursts - 1,
                    "Buffer overflow, reading remaining bursts before restart"
                );
                current = Some(current.map_or(buffer_bursts, |c| c.min(buffer_bursts)));
            }
        }

        driver
            .process_burst_data(ctx)
            .map_err(AcquisitionError::hook(HookStage::ProcessBurstData))?;

        if let Some(c) = current.as_mut() {
            *c -= 1;
        }
        if let Some(r) = remaining.as_mut() {
            *r = r.saturating_sub(1);
        }

        ctx.port().maybe_sleep_for_testing();
    }

    if *remaining == Some(0) {
        Ok(LoopExit::Stopped)
    } else {
        debug_assert!(overflow);
        Ok(LoopExit::OverflowRestart)
    }
}

/// Framework checks on the snapshotted burst and sample counts.
fn check_basic_settings(port: &mut PortData) -> Result<(), AcquisitionError> {
    let base = *port.base();

    let num_bursts = base.num_bursts.snapshot(&port.params);
    if num_bursts < 0 {
        return Err(AcquisitionError::InvalidSettings(format!(
            "NUM_BURSTS is negative ({})",
            num_bursts
        )));
    }

    let num_post = base.num_post_samples.snapshot(&port.params);
    if num_post < 0 {
        return Err(AcquisitionError::InvalidSettings(format!(
            "NUM_POST_SAMPLES is negative ({})",
            num_post
        )));
    }

    match port.requested_mode() {
        ArmMode::PrePostTrigger => {
            if !port.supports_pre_samples() {
                return Err(AcquisitionError::InvalidSettings(
                    "pre+post-trigger mode requested but pre-samples are not supported".into(),
                ));
            }
            let num_pre_post = base.num_pre_post_samples.snapshot(&port.params);
            if num_pre_post <= num_post {
                return Err(AcquisitionError::InvalidSettings(format!(
                    "NUM_PRE_POST_SAMPLES ({}) is not greater than NUM_POST_SAMPLES ({})",
                    num_pre_post, num_post
                )));
            }
        }
        ArmMode::PostTrigger => {
            if num_post == 0 {
                return Err(AcquisitionError::InvalidSettings(
                    "NUM_POST_SAMPLES is zero".into(),
                ));
            }
            base.num_pre_post_samples.set_irrelevant(&mut port.params);
            base.num_pre_post_samples.set_snapshot(&mut port.params, num_post);
        }
    }

    Ok(())
}

/// Re-check the sample counts after the driver had a chance to adjust their
/// snapshots, and keep the post-trigger pre+post count equal to the post
/// count.
fn check_adjusted_settings(port: &mut PortData) -> Result<(), AcquisitionError> {
    let base = *port.base();

    let num_bursts = base.num_bursts.snapshot(&port.params);
    let num_post = base.num_post_samples.snapshot(&port.params);
    if num_bursts < 0 || num_post < 0 {
        return Err(AcquisitionError::InvalidSettings(format!(
            "driver adjusted NUM_BURSTS ({}) or NUM_POST_SAMPLES ({}) below zero",
            num_bursts, num_post
        )));
    }

    match port.requested_mode() {
        ArmMode::PostTrigger => {
            if num_post == 0 {
                return Err(AcquisitionError::InvalidSettings(
                    "driver adjusted NUM_POST_SAMPLES to zero".into(),
                ));
            }
            base.num_pre_post_samples.set_snapshot(&mut port.params, num_post);
        }
        ArmMode::PrePostTrigger => {
            let num_pre_post = base.num_pre_post_samples.snapshot(&port.params);
            if num_pre_post < num_post {
                return Err(AcquisitionError::InvalidSettings(format!(
                    "NUM_PRE_POST_SAMPLES ({}) is less than NUM_POST_SAMPLES ({}) after the driver check",
                    num_pre_post, num_post
                )));
            }
        }
    }

    Ok(())
}

fn accepted_settings(port: &PortData, rate_for_display: f64) -> AcquisitionSettings {
    AcquisitionSettings {
        mode: port.requested_mode(),
        num_bursts: port.num_bursts_snapshot().unsigned_abs(),
        num_post_samples: port.num_post_samples_snapshot().unsigned_abs(),
        num_pre_post_samples: port.num_pre_post_samples_snapshot().unsigned_abs(),
        requested_sample_rate: port.requested_sample_rate_snapshot(),
        achievable_sample_rate: port.achievable_sample_rate_snapshot(),
        rate_for_display,
    }
}

fn time_axis(port: &PortData, arm_info: &ArmInfo, settings: &AcquisitionSettings) -> TimeAxis {
    let unit_inv = port
        .params
        .get_float(port.base().time_array_unit_inv)
        .unwrap_or(1.0);
    let (num_pre, num_post) = match arm_info.custom_time_axis {
        Some(custom) => (custom.num_pre_samples, custom.num_post_samples),
        None => (settings.num_pre_samples(), settings.num_post_samples),
    };
    TimeAxis::new(unit_inv, settings.rate_for_display, num_pre, num_post)
}
