//! Arm cycle tests
//!
//! Drives the acquisition controller with a scripted driver through complete
//! arm/disarm cycles: bounded and unbounded burst counts, settings
//! rejection, hook failures, rearming and shutdown.

mod common;

use std::time::Duration;

use common::{configure, spawn_digitizer, wait_for, Event, Script, TIMEOUT};
use daq_core::{ArmMode, ArmState, CustomTimeAxis, DaqError, ParamError};
use daq_digitizer::{AcquisitionError, DigitizerConfig, HookStage};

fn config() -> DigitizerConfig {
    DigitizerConfig::new("test", 2).with_pre_samples(true)
}

// =============================================================================
// Burst counts
// =============================================================================

#[test]
fn test_three_bursts_then_disarmed() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, 3, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(wait_for(TIMEOUT, || digitizer.driver().count(|e| *e == Event::Disarmed) == 1));
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));

    let driver = digitizer.driver();
    assert_eq!(driver.processed(), 3);
    assert_eq!(driver.starts(), vec![false]);
    assert_eq!(driver.count(|e| *e == Event::Stop), 1);
    assert_eq!(driver.count(|e| *e == Event::Interrupt), 0);

    let events = driver.events();
    assert_eq!(
        &events[..3],
        &[
            Event::Preconditions,
            Event::CheckSettings,
            Event::Start { overflow: false }
        ]
    );
    assert_eq!(&events[events.len() - 2..], &[Event::Stop, Event::Disarmed]);
    assert!(!digitizer.is_armed());
}

#[test]
fn test_unbounded_run_stops_after_disarm() {
    let script = Script {
        burst_limit: Some(5),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));
    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 5));
    assert!(digitizer.is_armed());

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert!(wait_for(TIMEOUT, || digitizer.driver().count(|e| *e == Event::Disarmed) == 1));

    let driver = digitizer.driver();
    assert_eq!(driver.processed(), 5);
    assert_eq!(driver.count(|e| *e == Event::Interrupt), 1);
    assert_eq!(driver.count(|e| *e == Event::Stop), 1);
}

#[test]
fn test_repeated_disarm_interrupts_once() {
    let script = Script {
        burst_limit: Some(1),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    digitizer.request_disarm();
    digitizer.request_disarm();
    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));

    assert_eq!(digitizer.driver().count(|e| *e == Event::Interrupt), 1);
}

#[test]
fn test_disarm_when_disarmed_is_noop() {
    let digitizer = spawn_digitizer(config(), Script::default());
    digitizer.request_disarm();
    assert_eq!(digitizer.arm_state(), ArmState::Disarmed);
    assert!(digitizer.driver().events().is_empty());
}

#[test]
fn test_burst_meta_info_published() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, 2, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(wait_for(TIMEOUT, || digitizer.driver().count(|e| *e == Event::Disarmed) == 1));

    assert_eq!(digitizer.read_int("BURST_ID").unwrap(), Some(2));
    let time_burst = digitizer.read_float("BURST_TIME_BURST").unwrap().unwrap();
    assert!((time_burst - 10.0).abs() < 1e-9);
    assert!(digitizer
        .read_float("BURST_TIME_PROCESS")
        .unwrap()
        .unwrap()
        .is_nan());
}

// =============================================================================
// Settings checks
// =============================================================================

#[test]
fn test_missing_display_rate_enters_error() {
    let script = Script {
        display_rate: None,
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 1, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
    assert_eq!(digitizer.last_error(), Some(AcquisitionError::MissingDisplayRate));
    assert!(!digitizer.is_armed());
    assert_eq!(digitizer.driver().count(|e| matches!(e, Event::Start { .. })), 0);

    // Held in Error until disarm is requested.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(digitizer.arm_state(), ArmState::Error);

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert_eq!(digitizer.driver().count(|e| *e == Event::Disarmed), 1);
    assert_eq!(digitizer.driver().count(|e| *e == Event::Stop), 0);
}

#[test]
fn test_pre_post_not_greater_than_post_rejected() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, 1, 100);
    digitizer
        .write_int("DESIRED_NUM_PRE_POST_SAMPLES", 100)
        .unwrap();

    digitizer.request_arm(ArmMode::PrePostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
    assert!(matches!(
        digitizer.last_error(),
        Some(AcquisitionError::InvalidSettings(_))
    ));
    // Rejected before the driver was consulted.
    assert_eq!(digitizer.driver().count(|e| *e == Event::CheckSettings), 0);
}

#[test]
fn test_pre_post_requires_pre_sample_support() {
    let digitizer = spawn_digitizer(DigitizerConfig::new("test", 1), Script::default());
    configure(&digitizer, 1, 100);
    digitizer
        .write_int("DESIRED_NUM_PRE_POST_SAMPLES", 150)
        .unwrap();

    digitizer.request_arm(ArmMode::PrePostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
}

#[test]
fn test_zero_post_samples_rejected() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, 1, 0);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
}

#[test]
fn test_negative_burst_count_rejected() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, -1, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
}

#[test]
fn test_driver_rounded_post_samples_in_post_trigger() {
    let script = Script {
        burst_limit: Some(0),
        adjusted_post_samples: Some(104),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));
    assert_eq!(digitizer.last_error(), None);

    assert_eq!(
        digitizer.read_float("EFFECTIVE_NUM_POST_SAMPLES").unwrap(),
        Some(104.0)
    );
    assert!(digitizer
        .read_float("EFFECTIVE_NUM_PRE_POST_SAMPLES")
        .unwrap()
        .unwrap()
        .is_nan());
    assert_eq!(digitizer.time_axis().unwrap().len(), 104);

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert_eq!(digitizer.driver().count(|e| *e == Event::Stop), 1);
}

#[test]
fn test_driver_adjusted_snapshots_are_published() {
    let script = Script {
        burst_limit: Some(0),
        adjusted_post_samples: Some(104),
        adjusted_pre_post_samples: Some(160),
        bursts_irrelevant: true,
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);
    digitizer
        .write_int("DESIRED_NUM_PRE_POST_SAMPLES", 150)
        .unwrap();
    digitizer.write_float("TIME_ARRAY_UNIT_INV", 1e6).unwrap();

    digitizer.request_arm(ArmMode::PrePostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PrePostTrigger, TIMEOUT));

    assert_eq!(
        digitizer.read_float("EFFECTIVE_NUM_POST_SAMPLES").unwrap(),
        Some(104.0)
    );
    assert_eq!(
        digitizer.read_float("EFFECTIVE_NUM_PRE_POST_SAMPLES").unwrap(),
        Some(160.0)
    );
    assert!(digitizer
        .read_float("EFFECTIVE_NUM_BURSTS")
        .unwrap()
        .unwrap()
        .is_nan());
    // Desired values are untouched by the driver's rounding.
    assert_eq!(
        digitizer.read_int("DESIRED_NUM_POST_SAMPLES").unwrap(),
        Some(100)
    );

    let axis = digitizer.time_axis().unwrap();
    assert_eq!(axis.len(), 160);
    assert_eq!(axis.values()[0], -56.0);

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
}

#[test]
fn test_driver_post_samples_above_pre_post_rejected() {
    let script = Script {
        adjusted_post_samples: Some(200),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 1, 100);
    digitizer
        .write_int("DESIRED_NUM_PRE_POST_SAMPLES", 150)
        .unwrap();

    digitizer.request_arm(ArmMode::PrePostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
    assert!(matches!(
        digitizer.last_error(),
        Some(AcquisitionError::InvalidSettings(_))
    ));
    assert_eq!(digitizer.driver().count(|e| *e == Event::CheckSettings), 1);
    assert_eq!(digitizer.driver().count(|e| matches!(e, Event::Start { .. })), 0);

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
}

// =============================================================================
// Hook failures
// =============================================================================

#[test]
fn test_process_failure_waits_for_disarm_before_stop() {
    let script = Script {
        fail_at: Some(HookStage::ProcessBurstData),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));
    assert_eq!(
        digitizer.last_error().and_then(|e| e.stage()),
        Some(HookStage::ProcessBurstData)
    );

    // Acquisition was started, so the device counts as armed until stopped.
    assert!(digitizer.is_armed());
    assert_eq!(digitizer.driver().count(|e| *e == Event::Stop), 0);

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert!(wait_for(TIMEOUT, || digitizer.driver().count(|e| *e == Event::Stop) == 1));
    assert!(!digitizer.is_armed());
}

#[test]
fn test_start_failure_still_stops_acquisition() {
    let script = Script {
        fail_at: Some(HookStage::StartAcquisition),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 1, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert_eq!(digitizer.driver().count(|e| *e == Event::Stop), 1);
}

#[test]
fn test_arm_request_in_error_rearms() {
    let script = Script {
        fail_at: Some(HookStage::CheckSettings),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 1, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::Error, TIMEOUT));

    digitizer.driver().script.lock().fail_at = None;
    digitizer.request_arm(ArmMode::PostTrigger);

    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 1));
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    assert_eq!(digitizer.last_error(), None);
}

// =============================================================================
// Rearm and shutdown
// =============================================================================

#[test]
fn test_arm_while_armed_rearms_in_new_mode() {
    let script = Script {
        burst_limit: Some(1),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);
    digitizer
        .write_int("DESIRED_NUM_PRE_POST_SAMPLES", 150)
        .unwrap();

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    digitizer.request_arm(ArmMode::PrePostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PrePostTrigger, TIMEOUT));
    assert_eq!(digitizer.driver().starts(), vec![false, false]);
    assert_eq!(digitizer.driver().count(|e| *e == Event::Interrupt), 1);

    let axis = digitizer.time_axis().unwrap();
    assert_eq!((axis.num_pre, axis.num_post), (50, 100));

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
}

#[test]
fn test_last_rearm_request_wins() {
    let script = Script {
        burst_limit: Some(0),
        stop_delay: Some(Duration::from_millis(200)),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    // All three land while stop_acquisition is still running.
    digitizer.request_disarm();
    digitizer.request_arm(ArmMode::PostTrigger);
    digitizer.request_disarm();
    assert_eq!(digitizer.arm_state(), ArmState::Busy);

    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(digitizer.arm_state(), ArmState::Disarmed);
    assert_eq!(digitizer.driver().starts(), vec![false]);
}

#[test]
fn test_rearm_request_during_disarm() {
    let script = Script {
        burst_limit: Some(0),
        stop_delay: Some(Duration::from_millis(100)),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    {
        let mut port = digitizer.port().lock();
        port.request_disarm_from_driver();
    }
    digitizer.request_arm(ArmMode::PostTrigger);

    assert!(wait_for(TIMEOUT, || digitizer.driver().starts().len() == 2));
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));
}

#[test]
fn test_shutdown_while_armed() {
    let script = Script {
        burst_limit: Some(0),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    digitizer.shutdown();
    assert_eq!(digitizer.arm_state(), ArmState::Disarmed);
    assert_eq!(digitizer.driver().count(|e| *e == Event::Stop), 1);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert_eq!(digitizer.arm_state(), ArmState::Disarmed);
}

// =============================================================================
// Parameters
// =============================================================================

#[test]
fn test_arm_request_parameter() {
    let digitizer = spawn_digitizer(config(), Script::default());
    configure(&digitizer, 1, 100);

    let err = digitizer.write_int("ARM_REQUEST", 7).unwrap_err();
    assert!(matches!(err, DaqError::InvalidArmRequest(7)));

    digitizer.write_int("ARM_REQUEST", 1).unwrap();
    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 1));
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
}

#[test]
fn test_protected_parameters_rejected() {
    let digitizer = spawn_digitizer(config(), Script::default());

    for name in [
        "ARM_STATE",
        "EFFECTIVE_NUM_BURSTS",
        "DESIRED_ACHIEVABLE_SAMPLE_RATE",
        "DIGITIZER_NAME",
    ] {
        let err = digitizer.write_float(name, 1.0).unwrap_err();
        assert!(
            matches!(err, DaqError::Parameter(ParamError::WriteProtected(_))),
            "{} should be write-protected, got {:?}",
            name,
            err
        );
    }
}

#[test]
fn test_reads_with_wrong_kind_rejected() {
    let digitizer = spawn_digitizer(config(), Script::default());

    let err = digitizer.read_int("EFFECTIVE_SAMPLE_RATE").unwrap_err();
    assert!(matches!(
        err,
        DaqError::Parameter(ParamError::TypeMismatch { .. })
    ));
    assert!(matches!(
        digitizer.read_float("ARM_STATE").unwrap_err(),
        DaqError::Parameter(ParamError::TypeMismatch { .. })
    ));
    assert!(matches!(
        digitizer.read_text("BURST_ID").unwrap_err(),
        DaqError::Parameter(ParamError::TypeMismatch { .. })
    ));

    // The digitizer keeps working afterwards.
    configure(&digitizer, 1, 100);
    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 1));
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
}

#[test]
fn test_requested_rate_updates_achievable_rate() {
    let digitizer = spawn_digitizer(config(), Script::default());
    digitizer
        .write_float("DESIRED_REQUESTED_SAMPLE_RATE", 2.5e6)
        .unwrap();
    assert_eq!(
        digitizer
            .read_float("DESIRED_ACHIEVABLE_SAMPLE_RATE")
            .unwrap(),
        Some(2.5e6)
    );
}

#[test]
fn test_initial_parameter_values() {
    let digitizer = spawn_digitizer(config(), Script::default());
    assert_eq!(digitizer.read_int("ARM_REQUEST").unwrap(), Some(0));
    assert_eq!(digitizer.read_int("ARM_STATE").unwrap(), Some(0));
    assert!(digitizer
        .read_float("EFFECTIVE_SAMPLE_RATE")
        .unwrap()
        .unwrap()
        .is_nan());
    assert_eq!(
        digitizer.read_text("DIGITIZER_NAME").unwrap().as_deref(),
        Some("test")
    );

    digitizer.set_digitizer_name("scope-1");
    assert_eq!(
        digitizer.read_text("DIGITIZER_NAME").unwrap().as_deref(),
        Some("scope-1")
    );
}

#[test]
fn test_effective_values_while_armed() {
    let script = Script {
        burst_limit: Some(0),
        display_rate: Some(2e6),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(digitizer.wait_for_state(ArmState::PostTrigger, TIMEOUT));

    assert_eq!(digitizer.read_float("EFFECTIVE_SAMPLE_RATE").unwrap(), Some(2e6));
    assert_eq!(
        digitizer.read_float("EFFECTIVE_NUM_POST_SAMPLES").unwrap(),
        Some(100.0)
    );
    assert_eq!(digitizer.read_float("EFFECTIVE_NUM_BURSTS").unwrap(), Some(0.0));
    // Irrelevant in post-trigger mode.
    assert!(digitizer
        .read_float("EFFECTIVE_NUM_PRE_POST_SAMPLES")
        .unwrap()
        .unwrap()
        .is_nan());

    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));
    for name in ["EFFECTIVE_SAMPLE_RATE", "EFFECTIVE_NUM_POST_SAMPLES"] {
        assert!(digitizer.read_float(name).unwrap().unwrap().is_nan());
    }
}

#[test]
fn test_snapshot_frozen_while_armed() {
    let script = Script {
        burst_limit: Some(1),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 0, 100);

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 1));

    digitizer
        .write_int("DESIRED_NUM_POST_SAMPLES", 500)
        .unwrap();
    digitizer.request_disarm();
    assert!(digitizer.wait_for_state(ArmState::Disarmed, TIMEOUT));

    assert_eq!(*digitizer.driver().snapshots_seen.lock(), vec![100, 100]);
    assert_eq!(
        digitizer.read_int("DESIRED_NUM_POST_SAMPLES").unwrap(),
        Some(500)
    );
}

#[test]
fn test_custom_time_axis() {
    let script = Script {
        custom_time_axis: Some(CustomTimeAxis {
            num_pre_samples: 10,
            num_post_samples: 20,
        }),
        ..Script::default()
    };
    let digitizer = spawn_digitizer(config(), script);
    configure(&digitizer, 1, 100);
    digitizer.write_float("TIME_ARRAY_UNIT_INV", 1e6).unwrap();

    digitizer.request_arm(ArmMode::PostTrigger);
    assert!(wait_for(TIMEOUT, || digitizer.driver().processed() == 1));

    let axis = digitizer.time_axis().unwrap();
    assert_eq!(axis.len(), 30);
    assert_eq!(axis.step, 1.0);
    assert_eq!(axis.values()[0], -10.0);
}
