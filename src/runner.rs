//! One acquisition run against the simulated digitizer.
//!
//! Wires an [`AppConfig`] into a [`Digitizer`] driving a
//! [`SimulatedDigitizer`], arms it, waits for the run to end and reports what
//! the consumers received.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use daq_core::{ArmMode, ArmState};
use daq_digitizer::Digitizer;
use daq_driver_mock::{SimStatsSnapshot, SimulatedDigitizer};
use daq_pool::{ArrayObserver, ChannelArray, ChannelPoolStats};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;

/// How long to wait for the device to disarm after requesting it.
const DISARM_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts delivered arrays per channel.
struct ArrayCounter {
    per_channel: Mutex<Vec<u64>>,
    last_sequence_id: Mutex<Option<i32>>,
}

impl ArrayCounter {
    fn new(num_channels: usize) -> Self {
        Self {
            per_channel: Mutex::new(vec![0; num_channels]),
            last_sequence_id: Mutex::new(None),
        }
    }
}

impl ArrayObserver for ArrayCounter {
    fn on_array(&self, array: &ChannelArray) {
        if let Some(count) = self.per_channel.lock().get_mut(array.channel) {
            *count += 1;
        }
        *self.last_sequence_id.lock() = Some(array.sequence_id);
    }

    fn name(&self) -> &str {
        "array_counter"
    }
}

/// Outcome of a run, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub digitizer: String,
    pub mode: ArmMode,
    /// Arm state the run ended in before the final disarm
    pub end_state: ArmState,
    /// Whether the run was cut short by the timeout
    pub timed_out: bool,
    pub last_error: Option<String>,
    pub arrays_per_channel: Vec<u64>,
    pub last_burst_id: Option<i32>,
    pub effective_sample_rate: Option<f64>,
    pub time_axis_len: usize,
    pub elapsed_ms: u128,
    pub simulator: SimStatsSnapshot,
    pub pool: PoolReport,
}

/// Buffer-pool counters at the end of the run.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub arrays_accepted: u64,
    pub outstanding_buffers: usize,
    pub refused_allocations: u64,
}

impl PoolReport {
    fn new(stats: &ChannelPoolStats, outstanding_buffers: usize, refused: u64) -> Self {
        Self {
            arrays_accepted: stats.arrays_accepted,
            outstanding_buffers,
            refused_allocations: refused,
        }
    }
}

/// Arm the simulated device with `config` and run until it disarms, fails
/// or `config.acquisition.timeout` elapses.
///
/// Unlimited runs (`num_bursts = 0`) always end at the timeout; that is not
/// reported as `timed_out`.
pub fn run(config: &AppConfig) -> Result<RunReport> {
    config.validate().context("invalid configuration")?;

    let sim = config.simulator.clone();
    let digitizer = Digitizer::spawn(config.digitizer.clone(), move |setup| {
        SimulatedDigitizer::create(setup, sim)
    })
    .context("failed to start digitizer")?;

    let counter = Arc::new(ArrayCounter::new(digitizer.channels().num_channels()));
    digitizer.channels().register_observer(counter.clone());

    apply_settings(&digitizer, config)?;

    let acq = &config.acquisition;
    info!(
        digitizer = %digitizer.name(),
        mode = ?acq.mode,
        num_bursts = acq.num_bursts,
        "Starting run"
    );
    let started = Instant::now();
    digitizer.request_arm(acq.mode);

    let mut effective_sample_rate = None;
    if digitizer.wait_until(acq.timeout, |s| s != ArmState::Busy) {
        effective_sample_rate = digitizer
            .read_float("EFFECTIVE_SAMPLE_RATE")?
            .filter(|rate| rate.is_finite());
    }

    let remaining = acq.timeout.saturating_sub(started.elapsed());
    let finished = digitizer.wait_until(remaining, |s| {
        matches!(s, ArmState::Disarmed | ArmState::Error)
    });
    let end_state = digitizer.arm_state();
    let timed_out = !finished && acq.num_bursts > 0;
    if timed_out {
        warn!(state = %end_state, "Run timed out, disarming");
    }

    digitizer.request_disarm();
    if !digitizer.wait_for_state(ArmState::Disarmed, DISARM_TIMEOUT) {
        bail!("digitizer did not disarm within {:?}", DISARM_TIMEOUT);
    }

    let buffers = digitizer.channels().buffers();
    let report = RunReport {
        digitizer: digitizer.name().to_string(),
        mode: acq.mode,
        end_state,
        timed_out,
        last_error: digitizer.last_error().map(|e| e.to_string()),
        arrays_per_channel: counter.per_channel.lock().clone(),
        last_burst_id: *counter.last_sequence_id.lock(),
        effective_sample_rate,
        time_axis_len: digitizer.time_axis().map_or(0, |axis| axis.len()),
        elapsed_ms: started.elapsed().as_millis(),
        simulator: digitizer.driver().stats(),
        pool: PoolReport::new(
            &digitizer.channels().stats(),
            buffers.outstanding(),
            buffers.total_refused(),
        ),
    };

    info!(
        end_state = %report.end_state,
        bursts = report.simulator.bursts_processed,
        overflows = report.simulator.overflow_restarts,
        elapsed_ms = report.elapsed_ms as u64,
        "Run finished"
    );
    Ok(report)
}

fn apply_settings(digitizer: &Digitizer<SimulatedDigitizer>, config: &AppConfig) -> Result<()> {
    let acq = &config.acquisition;
    digitizer.write_int("DESIRED_NUM_BURSTS", acq.num_bursts)?;
    digitizer.write_int("DESIRED_NUM_POST_SAMPLES", acq.num_post_samples)?;
    if acq.mode == ArmMode::PrePostTrigger {
        digitizer.write_int("DESIRED_NUM_PRE_POST_SAMPLES", acq.num_pre_post_samples)?;
    }
    digitizer.write_float("DESIRED_REQUESTED_SAMPLE_RATE", acq.sample_rate)?;
    digitizer.write_float("TIME_ARRAY_UNIT_INV", acq.time_unit_inv)?;
    Ok(())
}
