//! Shared test utilities for acquisition controller tests.
//!
//! - `ScriptedDriver`: driver whose hook behavior is set per test and which
//!   records every hook call
//! - `spawn_digitizer` / `configure`: setup helpers
//! - `wait_for`: polling helper for conditions without a signal

#![allow(dead_code)] // Utilities may not all be used in every test file

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use daq_core::{next_burst_id, ArmInfo, BurstMetaInfo, CustomTimeAxis, DriverError, DriverResult};
use daq_digitizer::{
    AcquisitionContext, DataSubmission, Digitizer, DigitizerConfig, DigitizerDriver, HookStage,
    OverflowStatus, PortData, PortGuard,
};
use daq_pool::SampleFormat;
use parking_lot::{Condvar, Mutex};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Hook calls, in order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Preconditions,
    CheckSettings,
    Start { overflow: bool },
    Read,
    CheckOverflow,
    Process { burst_id: i32 },
    Interrupt,
    Stop,
    Disarmed,
}

/// Per-test behavior of the scripted driver.
#[derive(Debug, Clone)]
pub struct Script {
    pub display_rate: Option<f64>,
    pub custom_time_axis: Option<CustomTimeAxis>,
    pub fail_at: Option<HookStage>,
    /// `(n, capacity)`: the n-th overflow check of a cycle reports an overflow
    pub overflow_at: Option<(u64, u32)>,
    /// Reads past this many bursts block until interrupted
    pub burst_limit: Option<u64>,
    pub samples_per_channel: usize,
    /// Time stop_acquisition takes
    pub stop_delay: Option<Duration>,
    /// Snapshot values check_settings rounds the sample counts to
    pub adjusted_post_samples: Option<i32>,
    pub adjusted_pre_post_samples: Option<i32>,
    /// check_settings marks NUM_BURSTS irrelevant
    pub bursts_irrelevant: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            display_rate: Some(1e6),
            custom_time_axis: None,
            fail_at: None,
            overflow_at: None,
            burst_limit: None,
            samples_per_channel: 16,
            stop_delay: None,
            adjusted_post_samples: None,
            adjusted_pre_post_samples: None,
            bursts_irrelevant: false,
        }
    }
}

#[derive(Debug, Default)]
struct ReadGate {
    bursts_read: u64,
    interrupted: bool,
}

pub struct ScriptedDriver {
    pub script: Mutex<Script>,
    events: Mutex<Vec<Event>>,
    gate: Mutex<ReadGate>,
    gate_signal: Condvar,
    overflow_checks: AtomicU64,
    burst_id: AtomicI32,
    /// `NUM_POST_SAMPLES` snapshot seen by check_settings and stop_acquisition
    pub snapshots_seen: Mutex<Vec<i32>>,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            events: Mutex::new(Vec::new()),
            gate: Mutex::new(ReadGate::default()),
            gate_signal: Condvar::new(),
            overflow_checks: AtomicU64::new(0),
            burst_id: AtomicI32::new(0),
            snapshots_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn processed(&self) -> usize {
        self.count(|e| matches!(e, Event::Process { .. }))
    }

    pub fn starts(&self) -> Vec<bool> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Start { overflow } => Some(*overflow),
                _ => None,
            })
            .collect()
    }

    /// Let `n` more bursts through a blocked read.
    pub fn release_bursts(&self, n: u64) {
        let mut script = self.script.lock();
        script.burst_limit = script.burst_limit.map(|limit| limit + n);
        drop(script);
        let _gate = self.gate.lock();
        self.gate_signal.notify_all();
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn fail_if(&self, stage: HookStage) -> DriverResult<()> {
        if self.script.lock().fail_at == Some(stage) {
            return Err(DriverError::hardware("scripted", format!("injected {} failure", stage)));
        }
        Ok(())
    }
}

impl DigitizerDriver for ScriptedDriver {
    fn driver_type(&self) -> &str {
        "scripted"
    }

    fn wait_for_preconditions(&self, _port: &mut PortGuard<'_>) -> DriverResult<()> {
        self.record(Event::Preconditions);
        self.fail_if(HookStage::WaitForPreconditions)
    }

    fn check_settings(&self, port: &mut PortData, arm_info: &mut ArmInfo) -> DriverResult<()> {
        self.record(Event::CheckSettings);
        self.fail_if(HookStage::CheckSettings)?;
        self.snapshots_seen
            .lock()
            .push(port.num_post_samples_snapshot());
        let script = self.script.lock();
        arm_info.rate_for_display = script.display_rate;
        arm_info.custom_time_axis = script.custom_time_axis;

        let base = *port.base();
        if let Some(num_post) = script.adjusted_post_samples {
            base.num_post_samples.set_snapshot(&mut port.params, num_post);
        }
        if let Some(num_pre_post) = script.adjusted_pre_post_samples {
            base.num_pre_post_samples
                .set_snapshot(&mut port.params, num_pre_post);
        }
        if script.bursts_irrelevant {
            base.num_bursts.set_irrelevant(&mut port.params);
        }
        Ok(())
    }

    fn start_acquisition(&self, _ctx: &AcquisitionContext, overflow: bool) -> DriverResult<()> {
        self.record(Event::Start { overflow });
        if !overflow {
            *self.gate.lock() = ReadGate::default();
            self.overflow_checks.store(0, Ordering::SeqCst);
        }
        self.fail_if(HookStage::StartAcquisition)
    }

    fn read_burst(&self, _ctx: &AcquisitionContext) -> DriverResult<()> {
        self.record(Event::Read);
        self.fail_if(HookStage::ReadBurst)?;
        let mut gate = self.gate.lock();
        loop {
            let limit = self.script.lock().burst_limit;
            if gate.interrupted {
                return Ok(());
            }
            if limit.map_or(true, |limit| gate.bursts_read < limit) {
                gate.bursts_read += 1;
                return Ok(());
            }
            self.gate_signal.wait(&mut gate);
        }
    }

    fn check_overflow(&self, _ctx: &AcquisitionContext) -> DriverResult<OverflowStatus> {
        self.record(Event::CheckOverflow);
        self.fail_if(HookStage::CheckOverflow)?;
        let n = self.overflow_checks.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().overflow_at {
            Some((at, capacity)) if at == n => Ok(OverflowStatus::overflowed(capacity)),
            _ => Ok(OverflowStatus::Clear),
        }
    }

    fn process_burst_data(&self, ctx: &AcquisitionContext) -> DriverResult<()> {
        let burst_id = next_burst_id(self.burst_id.load(Ordering::SeqCst));
        self.burst_id.store(burst_id, Ordering::SeqCst);
        self.record(Event::Process { burst_id });
        self.fail_if(HookStage::ProcessBurstData)?;

        let samples = self.script.lock().samples_per_channel;
        for channel in 0..ctx.port().num_channels() {
            let mut submission = DataSubmission::new(ctx.port());
            if !submission.allocate(channel, SampleFormat::I16, samples) {
                return Err(DriverError::new(
                    "scripted",
                    daq_core::DriverErrorKind::Resource,
                    "buffer pool exhausted",
                ));
            }
            if let Some(buffer) = submission.buffer_mut() {
                buffer.fill_with(|i| (i as i16).wrapping_add(burst_id as i16));
            }
            submission.submit(channel, burst_id, f64::from(burst_id), Utc::now(), None);
        }

        ctx.port().publish_burst_meta_info(&BurstMetaInfo {
            burst_id,
            time_burst: Some(Duration::from_micros(10)),
            time_read: Some(Duration::from_micros(5)),
            time_process: None,
        });
        Ok(())
    }

    fn interrupt_reading(&self, _port: &mut PortData) {
        self.record(Event::Interrupt);
        let mut gate = self.gate.lock();
        gate.interrupted = true;
        self.gate_signal.notify_all();
    }

    fn stop_acquisition(&self, ctx: &AcquisitionContext) {
        self.record(Event::Stop);
        let delay = self.script.lock().stop_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let port = ctx.port().lock();
        self.snapshots_seen
            .lock()
            .push(port.num_post_samples_snapshot());
    }

    fn on_disarmed(&self, _port: &mut PortData) {
        self.record(Event::Disarmed);
    }
}

pub fn spawn_digitizer(config: DigitizerConfig, script: Script) -> Digitizer<ScriptedDriver> {
    Digitizer::spawn(config, |_| Ok(ScriptedDriver::new(script))).unwrap()
}

/// Set the burst and sample counts.
pub fn configure(digitizer: &Digitizer<ScriptedDriver>, num_bursts: i32, num_post: i32) {
    digitizer.write_int("DESIRED_NUM_BURSTS", num_bursts).unwrap();
    digitizer
        .write_int("DESIRED_NUM_POST_SAMPLES", num_post)
        .unwrap();
    digitizer
        .write_float("DESIRED_REQUESTED_SAMPLE_RATE", 1e6)
        .unwrap();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
