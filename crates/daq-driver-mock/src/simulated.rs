//! Simulated burst digitizer.
//!
//! Implements every [`DigitizerDriver`] hook against a software model of a
//! triggered digitizer:
//!
//! - sample rates are quantized to integer divisors of a base clock
//! - in [`SimMode::Realistic`] a trigger arrives every `SIM_TRIGGER_PERIOD`
//!   seconds and `read_burst` waits for it; bursts that are not read in time
//!   pile up in a finite hardware ring and eventually overflow it
//! - overflows can also be forced at a given burst of each arm cycle
//! - aborting a read is "slow" and runs on a [`WorkerQueue`], so
//!   `interrupt_reading` never blocks
//! - every hook consults a [`FaultInjector`]
//!
//! # Example
//!
//! ```rust,ignore
//! let digitizer = Digitizer::spawn(DigitizerConfig::new("sim", 2), |setup| {
//!     SimulatedDigitizer::create(setup, SimulatedConfig::default())
//! })?;
//! digitizer.write_int("DESIRED_NUM_BURSTS", 10)?;
//! digitizer.write_int("DESIRED_NUM_POST_SAMPLES", 256)?;
//! digitizer.write_float("DESIRED_REQUESTED_SAMPLE_RATE", 1e6)?;
//! digitizer.request_arm(ArmMode::PostTrigger);
//! ```

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use daq_core::{
    next_burst_id, ArmInfo, BurstMetaInfo, ConfigParam, DriverError, DriverErrorKind, DriverResult,
    ParamError, ParamId, ParamKind, WorkerQueue, WorkerTask,
};
use daq_digitizer::{
    AcquisitionContext, DataSubmission, DigitizerDriver, DriverSetup, HookStage, OverflowStatus,
    PortData, PortGuard,
};
use daq_pool::SampleFormat;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::faults::{FaultConfig, FaultInjector};
use crate::rng::SimRng;
use crate::waveform::Waveform;

/// Driver type reported in errors and logs.
pub const DRIVER_TYPE: &str = "simulated";

/// How long `wait_for_preconditions` waits for a pending abort.
const ABORT_WAIT: Duration = Duration::from_secs(2);

/// Timing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimMode {
    /// A trigger is always pending; reads never wait
    #[default]
    Instant,
    /// Triggers arrive every trigger period and reads wait for them
    Realistic,
}

/// Forced overflow at a fixed burst of every arm cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedOverflow {
    /// Overflow is reported by the overflow check following this burst
    pub after_bursts: u64,
    /// Bursts still readable, including the one just read
    pub buffer_bursts: u32,
}

/// Configuration of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub mode: SimMode,
    /// Sample clock (Hz) that sample rates are divided down from
    pub base_clock_hz: f64,
    /// Initial `DESIRED_SIM_TRIGGER_PERIOD` (seconds)
    pub trigger_period_s: f64,
    /// Capacity of the hardware burst ring in realistic mode
    pub ring_capacity: u32,
    pub forced_overflow: Option<ForcedOverflow>,
    /// The hardware stops itself after this many bursts per cycle
    pub disarm_after_bursts: Option<u64>,
    /// Largest burst the hardware can capture
    pub max_samples_per_burst: u32,
    pub waveform: Waveform,
    /// Uniform noise amplitude in counts
    pub noise: f64,
    pub seed: Option<u64>,
    /// Time the hardware needs to abort a read
    #[serde(with = "humantime_serde")]
    pub abort_latency: Duration,
    pub faults: FaultConfig,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            mode: SimMode::Instant,
            base_clock_hz: 100e6,
            trigger_period_s: 1e-3,
            ring_capacity: 8,
            forced_overflow: None,
            disarm_after_bursts: None,
            max_samples_per_burst: 1 << 20,
            waveform: Waveform::default(),
            noise: 0.0,
            seed: None,
            abort_latency: Duration::from_millis(5),
            faults: FaultConfig::none(),
        }
    }
}

impl SimulatedConfig {
    #[must_use]
    pub fn realistic(mut self, trigger_period_s: f64) -> Self {
        self.mode = SimMode::Realistic;
        self.trigger_period_s = trigger_period_s;
        self
    }

    #[must_use]
    pub fn with_forced_overflow(mut self, after_bursts: u64, buffer_bursts: u32) -> Self {
        self.forced_overflow = Some(ForcedOverflow {
            after_bursts,
            buffer_bursts,
        });
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    #[must_use]
    pub fn with_waveform(mut self, waveform: Waveform, noise: f64) -> Self {
        self.waveform = waveform;
        self.noise = noise;
        self
    }

    pub fn validate(&self) -> DriverResult<()> {
        if !self.base_clock_hz.is_finite() || self.base_clock_hz <= 0.0 {
            return Err(DriverError::configuration(
                DRIVER_TYPE,
                format!("base clock must be positive, got {}", self.base_clock_hz),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(DriverError::configuration(
                DRIVER_TYPE,
                "ring capacity must be at least one burst",
            ));
        }
        if let Some(forced) = self.forced_overflow {
            if forced.after_bursts == 0 || forced.buffer_bursts == 0 {
                return Err(DriverError::configuration(
                    DRIVER_TYPE,
                    "forced overflow needs after_bursts and buffer_bursts of at least 1",
                ));
            }
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(DriverError::configuration(
                DRIVER_TYPE,
                format!("noise must be a non-negative number, got {}", self.noise),
            ));
        }
        Ok(())
    }

    /// The rate the base clock can produce closest to `requested`, NaN if
    /// `requested` is not a positive number.
    pub fn quantize_rate(&self, requested: f64) -> f64 {
        if !requested.is_finite() || requested <= 0.0 {
            return f64::NAN;
        }
        let divisor = (self.base_clock_hz / requested).round().max(1.0);
        self.base_clock_hz / divisor
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Default)]
struct SimStats {
    starts: AtomicU64,
    overflow_restarts: AtomicU64,
    bursts_read: AtomicU64,
    bursts_processed: AtomicU64,
    arrays_submitted: AtomicU64,
    allocation_failures: AtomicU64,
    interrupts: AtomicU64,
    aborts_completed: AtomicU64,
    stops: AtomicU64,
    disarms: AtomicU64,
}

/// Point-in-time copy of the simulator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SimStatsSnapshot {
    pub starts: u64,
    pub overflow_restarts: u64,
    pub bursts_read: u64,
    pub bursts_processed: u64,
    pub arrays_submitted: u64,
    pub allocation_failures: u64,
    pub interrupts: u64,
    pub aborts_completed: u64,
    pub stops: u64,
    pub disarms: u64,
    pub faults_injected: u64,
}

/// State of the simulated acquisition hardware.
#[derive(Debug)]
struct Hardware {
    running: bool,
    interrupted: bool,
    abort_pending: bool,
    /// Start of the current acquisition (reset by an overflow restart)
    started_at: Instant,
    trigger_period: Duration,
    /// Bursts read since `started_at`
    read_since_start: u64,
    /// Bursts read in this arm cycle
    read_in_cycle: u64,
    forced_overflow_done: bool,
}

impl Hardware {
    fn idle() -> Self {
        Self {
            running: false,
            interrupted: false,
            abort_pending: false,
            started_at: Instant::now(),
            trigger_period: Duration::ZERO,
            read_since_start: 0,
            read_in_cycle: 0,
            forced_overflow_done: false,
        }
    }

    /// Triggers that have occurred since the acquisition (re)started.
    fn triggers_elapsed(&self, now: Instant) -> u64 {
        let nanos = self.trigger_period.as_nanos();
        if nanos == 0 {
            return u64::MAX;
        }
        let elapsed = now.saturating_duration_since(self.started_at).as_nanos();
        u64::try_from(elapsed / nanos).unwrap_or(u64::MAX)
    }

    fn trigger_time(&self, burst: u64) -> Instant {
        let offset = self
            .trigger_period
            .checked_mul(u32::try_from(burst).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        self.started_at.checked_add(offset).unwrap_or(self.started_at)
    }
}

#[derive(Debug)]
struct HardwareShared {
    state: Mutex<Hardware>,
    signal: Condvar,
}

impl HardwareShared {
    fn lock(&self) -> MutexGuard<'_, Hardware> {
        self.state.lock()
    }
}

/// Parameters the simulator adds to the port.
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    /// Seconds between simulated triggers
    pub trigger_period: ConfigParam<f64>,
    /// Overflow restarts since the port was created
    pub overflows: ParamId,
}

impl SimParams {
    fn create(setup: &mut DriverSetup<'_>, config: &SimulatedConfig) -> Result<Self, ParamError> {
        let params = setup.params();
        let trigger_period = params.create_config_param("SIM_TRIGGER_PERIOD", f64::NAN, false)?;
        trigger_period.set_desired(params, config.trigger_period_s);
        let overflows = params.create_protected("SIM_OVERFLOWS", ParamKind::Int)?;
        params.set_int(overflows, 0);
        Ok(Self {
            trigger_period,
            overflows,
        })
    }
}

/// Software digitizer driven by the acquisition controller.
pub struct SimulatedDigitizer {
    config: SimulatedConfig,
    params: SimParams,
    hardware: Arc<HardwareShared>,
    stats: Arc<SimStats>,
    faults: FaultInjector,
    rng: SimRng,
    burst_id: AtomicI32,
    abort_task: WorkerTask,
    worker: WorkerQueue,
}

impl SimulatedDigitizer {
    /// Register the simulator's parameters and start its abort worker.
    pub fn create(setup: &mut DriverSetup<'_>, config: SimulatedConfig) -> DriverResult<Self> {
        config.validate()?;

        let params = SimParams::create(setup, &config).map_err(|e| {
            DriverError::new(DRIVER_TYPE, DriverErrorKind::Configuration, e.to_string())
        })?;
        let worker = WorkerQueue::spawn(format!("abort:{}", setup.config().name)).map_err(|e| {
            DriverError::new(DRIVER_TYPE, DriverErrorKind::Resource, e.to_string())
        })?;

        let hardware = Arc::new(HardwareShared {
            state: Mutex::new(Hardware::idle()),
            signal: Condvar::new(),
        });
        let stats = Arc::new(SimStats::default());
        let abort_task = {
            let hardware = hardware.clone();
            let stats = stats.clone();
            let latency = config.abort_latency;
            WorkerTask::new("abort-read", move || {
                std::thread::sleep(latency);
                let mut hw = hardware.lock();
                hw.abort_pending = false;
                stats.aborts_completed.fetch_add(1, Ordering::Relaxed);
                hardware.signal.notify_all();
                trace!("Simulated abort completed");
            })
        };

        info!(
            digitizer = %setup.config().name,
            mode = ?config.mode,
            base_clock_hz = config.base_clock_hz,
            ring_capacity = config.ring_capacity,
            "Simulated digitizer created"
        );

        Ok(Self {
            faults: FaultInjector::new(config.faults.clone()),
            rng: SimRng::new(config.seed),
            config,
            params,
            hardware,
            stats,
            burst_id: AtomicI32::new(0),
            abort_task,
            worker,
        })
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn stats(&self) -> SimStatsSnapshot {
        let s = &self.stats;
        SimStatsSnapshot {
            starts: s.starts.load(Ordering::Relaxed),
            overflow_restarts: s.overflow_restarts.load(Ordering::Relaxed),
            bursts_read: s.bursts_read.load(Ordering::Relaxed),
            bursts_processed: s.bursts_processed.load(Ordering::Relaxed),
            arrays_submitted: s.arrays_submitted.load(Ordering::Relaxed),
            allocation_failures: s.allocation_failures.load(Ordering::Relaxed),
            interrupts: s.interrupts.load(Ordering::Relaxed),
            aborts_completed: s.aborts_completed.load(Ordering::Relaxed),
            stops: s.stops.load(Ordering::Relaxed),
            disarms: s.disarms.load(Ordering::Relaxed),
            faults_injected: self.faults.injected(),
        }
    }

    /// Whether the simulated hardware is acquiring.
    pub fn is_running(&self) -> bool {
        self.hardware.lock().running
    }

    fn check(&self, stage: HookStage) -> DriverResult<()> {
        self.faults.check(DRIVER_TYPE, stage)
    }

    fn ring_overflow(&self, hw: &Hardware) -> Option<u32> {
        if self.config.mode != SimMode::Realistic {
            return None;
        }
        let backlog = hw
            .triggers_elapsed(Instant::now())
            .saturating_sub(hw.read_since_start);
        (backlog >= u64::from(self.config.ring_capacity)).then_some(self.config.ring_capacity)
    }
}

impl DigitizerDriver for SimulatedDigitizer {
    fn driver_type(&self) -> &str {
        DRIVER_TYPE
    }

    fn requested_sample_rate_changed(&self, port: &mut PortData) {
        let requested = port.requested_sample_rate();
        let achievable = self.config.quantize_rate(requested);
        debug!(requested, achievable, "Sample rate quantized");
        port.set_achievable_sample_rate(achievable);
    }

    fn wait_for_preconditions(&self, port: &mut PortGuard<'_>) -> DriverResult<()> {
        self.check(HookStage::WaitForPreconditions)?;

        // The previous cycle's abort may still be running.
        let ready = MutexGuard::unlocked(port, || {
            let deadline = Instant::now() + ABORT_WAIT;
            let mut hw = self.hardware.lock();
            while hw.abort_pending {
                if self.hardware.signal.wait_until(&mut hw, deadline).timed_out() {
                    return !hw.abort_pending;
                }
            }
            true
        });
        if !ready {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Timeout,
                "previous read abort did not complete",
            ));
        }
        Ok(())
    }

    fn check_settings(&self, port: &mut PortData, arm_info: &mut ArmInfo) -> DriverResult<()> {
        self.check(HookStage::CheckSettings)?;

        let samples = port.num_pre_post_samples_snapshot();
        if u32::try_from(samples).map_or(true, |n| n > self.config.max_samples_per_burst) {
            return Err(DriverError::configuration(
                DRIVER_TYPE,
                format!(
                    "{} samples per burst exceeds the maximum of {}",
                    samples, self.config.max_samples_per_burst
                ),
            ));
        }

        let rate = port.achievable_sample_rate_snapshot();
        if !rate.is_finite() || rate <= 0.0 {
            return Err(DriverError::configuration(
                DRIVER_TYPE,
                format!(
                    "requested sample rate {} is not achievable",
                    port.requested_sample_rate_snapshot()
                ),
            ));
        }

        let period = self.params.trigger_period.snapshot(&port.params);
        if self.config.mode == SimMode::Realistic {
            let burst_duration = f64::from(samples) / rate;
            if !period.is_finite() || period < burst_duration {
                return Err(DriverError::configuration(
                    DRIVER_TYPE,
                    format!(
                        "trigger period {} s is shorter than a burst ({} s)",
                        period, burst_duration
                    ),
                ));
            }
        } else {
            self.params.trigger_period.set_irrelevant(&mut port.params);
        }

        arm_info.rate_for_display = Some(rate);
        Ok(())
    }

    fn start_acquisition(&self, ctx: &AcquisitionContext, overflow: bool) -> DriverResult<()> {
        self.check(HookStage::StartAcquisition)?;

        let period = {
            let port = ctx.port().lock();
            if self.config.mode == SimMode::Realistic {
                self.params.trigger_period.snapshot(&port.params)
            } else {
                0.0
            }
        };

        {
            let mut hw = self.hardware.lock();
            hw.running = true;
            hw.started_at = Instant::now();
            hw.trigger_period = Duration::try_from_secs_f64(period).unwrap_or(Duration::ZERO);
            hw.read_since_start = 0;
            if !overflow {
                hw.interrupted = false;
                hw.read_in_cycle = 0;
                hw.forced_overflow_done = false;
            }
        }

        if overflow {
            self.stats.overflow_restarts.fetch_add(1, Ordering::Relaxed);
            let mut port = ctx.port().lock();
            let count = port.params.get_int(self.params.overflows).unwrap_or(0);
            port.params
                .set_int(self.params.overflows, count.saturating_add(1));
            port.publish();
        } else {
            self.stats.starts.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            overflow,
            samples = ctx.settings().samples_per_burst(),
            rate = ctx.settings().rate_for_display,
            "Simulated acquisition started"
        );
        Ok(())
    }

    fn read_burst(&self, _ctx: &AcquisitionContext) -> DriverResult<()> {
        self.check(HookStage::ReadBurst)?;

        let mut hw = self.hardware.lock();
        loop {
            if hw.interrupted {
                trace!("Read interrupted");
                return Ok(());
            }
            if self.config.mode == SimMode::Instant {
                break;
            }
            let due = hw.trigger_time(hw.read_since_start + 1);
            if Instant::now() >= due {
                break;
            }
            self.hardware.signal.wait_until(&mut hw, due);
        }

        hw.read_since_start += 1;
        hw.read_in_cycle += 1;
        self.stats.bursts_read.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_overflow(&self, _ctx: &AcquisitionContext) -> DriverResult<OverflowStatus> {
        self.check(HookStage::CheckOverflow)?;

        let mut hw = self.hardware.lock();
        if let Some(forced) = self.config.forced_overflow {
            if !hw.forced_overflow_done && hw.read_in_cycle == forced.after_bursts {
                hw.forced_overflow_done = true;
                return Ok(OverflowStatus::overflowed(forced.buffer_bursts));
            }
        }
        if let Some(capacity) = self.ring_overflow(&hw) {
            warn!(capacity, "Simulated burst ring full");
            return Ok(OverflowStatus::overflowed(capacity));
        }
        Ok(OverflowStatus::Clear)
    }

    fn process_burst_data(&self, ctx: &AcquisitionContext) -> DriverResult<()> {
        self.check(HookStage::ProcessBurstData)?;

        let processing_started = Instant::now();
        let settings = *ctx.settings();
        let num_pre = settings.num_pre_samples();
        let num_post = settings.num_post_samples;
        let burst_id = next_burst_id(self.burst_id.load(Ordering::Relaxed));
        self.burst_id.store(burst_id, Ordering::Relaxed);

        let (timestamp, read_in_cycle) = {
            let hw = self.hardware.lock();
            (hw.started_at.elapsed().as_secs_f64(), hw.read_in_cycle)
        };
        let wall_time = Utc::now();

        for channel in 0..ctx.port().num_channels() {
            let mut submission = DataSubmission::new(ctx.port());
            let total = (num_pre + num_post) as usize;
            if !submission.allocate(channel, SampleFormat::I16, total) {
                self.stats
                    .allocation_failures
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let samples = self
                .config
                .waveform
                .burst(channel, num_pre, num_post, self.config.noise, &self.rng);
            if let Some(buffer) = submission.buffer_mut() {
                buffer.write_samples(&samples);
            }
            submission.submit(channel, burst_id, timestamp, wall_time, None);
            self.stats.arrays_submitted.fetch_add(1, Ordering::Relaxed);
        }

        let time_burst = Duration::try_from_secs_f64(
            f64::from(settings.samples_per_burst()) / settings.rate_for_display,
        )
        .ok();
        ctx.port().publish_burst_meta_info(&BurstMetaInfo {
            burst_id,
            time_burst,
            time_read: None,
            time_process: Some(processing_started.elapsed()),
        });
        self.stats.bursts_processed.fetch_add(1, Ordering::Relaxed);
        trace!(burst_id, "Burst processed");

        if self
            .config
            .disarm_after_bursts
            .is_some_and(|limit| read_in_cycle >= limit)
        {
            debug!(bursts = read_in_cycle, "Hardware burst limit reached, disarming");
            ctx.port().lock().request_disarm_from_driver();
        }
        Ok(())
    }

    fn interrupt_reading(&self, _port: &mut PortData) {
        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
        let mut hw = self.hardware.lock();
        hw.interrupted = true;
        // Held across submit so the abort cannot finish before it is marked
        // pending.
        if self.worker.submit(&self.abort_task) {
            hw.abort_pending = true;
        }
        self.hardware.signal.notify_all();
    }

    fn stop_acquisition(&self, _ctx: &AcquisitionContext) {
        self.stats.stops.fetch_add(1, Ordering::Relaxed);
        let mut hw = self.hardware.lock();
        hw.running = false;
        debug!(bursts = hw.read_in_cycle, "Simulated acquisition stopped");
    }

    fn on_disarmed(&self, _port: &mut PortData) {
        self.stats.disarms.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SimulatedDigitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDigitizer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
