//! The per-block callback driven by hand, without the block clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use behavior_daq::acquisition::{AcquisitionLoop, BlockOutcome};
use behavior_daq::behavior::{BehaviorPhase, BehaviorStateMachine};
use behavior_daq::camera::CameraSync;
use behavior_daq::hardware::MockDaq;
use behavior_daq::sync::SessionSync;
use tokio_util::sync::CancellationToken;

use common::{fast_rig, minimal_rig};

#[test]
fn test_hundred_blocks_with_three_failed_reads() {
    let config = fast_rig();
    let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1)));
    let daq = MockDaq::from_config(&config.hardware).with_failing_reads([7, 42, 99]);
    let mut acquisition = AcquisitionLoop::new(
        daq,
        &config,
        sync,
        CameraSync::disabled(),
        CancellationToken::new(),
        100,
    )
    .unwrap();
    acquisition.arm().unwrap();

    for _ in 0..100 {
        assert_eq!(acquisition.on_block_ready().unwrap(), BlockOutcome::Continue);
    }

    let buffers = acquisition.buffers();
    assert_eq!(acquisition.sequence(), 100);
    assert_eq!(buffers.blocks_stored(), 97);
    assert_eq!(buffers.skipped(), &[7, 42, 99]);
    assert_eq!(buffers.samples_per_channel(), 97 * 10);
    assert!(buffers.phase_labels().iter().all(|p| *p == BehaviorPhase::Setup));
    assert_eq!(buffers.catch_times_ms().len(), 100);
}

#[test]
fn test_gate_crossing_drives_trial_flag_on_change_only() {
    let config = fast_rig();
    let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1)));
    let daq = MockDaq::from_config(&config.hardware).with_gate_open_on([3, 4, 5, 9]);
    let handle = daq.handle();
    let mut acquisition = AcquisitionLoop::new(
        daq,
        &config,
        sync,
        CameraSync::disabled(),
        CancellationToken::new(),
        16,
    )
    .unwrap();
    acquisition.arm().unwrap();

    for _ in 0..12 {
        acquisition.on_block_ready().unwrap();
    }

    let flag_line = config.hardware.trial_flag_line.unwrap();
    let flag_writes: Vec<bool> = handle
        .digital_writes()
        .into_iter()
        .filter(|(line, _)| *line == flag_line)
        .map(|(_, value)| value)
        .collect();
    // arm, crossing at 3, cleared at 6, crossing at 9, cleared at 10
    assert_eq!(flag_writes, vec![false, true, false, true, false]);
}

#[test]
fn test_labels_follow_machine_through_saving() {
    let config = minimal_rig(40, 40);
    let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(50)));
    let cancel = CancellationToken::new();
    let machine =
        BehaviorStateMachine::new(&config.protocol, Arc::clone(&sync), cancel.clone()).unwrap();
    let mut acquisition = AcquisitionLoop::new(
        MockDaq::new(4, 5),
        &config,
        Arc::clone(&sync),
        CameraSync::disabled(),
        cancel.clone(),
        64,
    )
    .unwrap();
    acquisition.arm().unwrap();
    let handle = machine.spawn().unwrap();
    sync.request_run();

    let mut outcome = BlockOutcome::Continue;
    for _ in 0..500 {
        outcome = acquisition.on_block_ready().unwrap();
        if outcome != BlockOutcome::Continue {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(outcome, BlockOutcome::SavingReached);

    let labels = acquisition.buffers().phase_labels();
    assert_eq!(labels.last(), Some(&BehaviorPhase::Saving));
    // labels only ever move forward through the protocol
    let mut ordered = labels.to_vec();
    ordered.sort();
    assert_eq!(ordered, labels);

    sync.mark_saving_complete();
    assert!(handle.join().unwrap().is_completed());
}

#[test]
fn test_cancelled_loop_reads_nothing() {
    let config = fast_rig();
    let sync = Arc::new(SessionSync::new(BehaviorPhase::Setup, Duration::from_millis(1)));
    let cancel = CancellationToken::new();
    let daq = MockDaq::from_config(&config.hardware);
    let handle = daq.handle();
    let mut acquisition =
        AcquisitionLoop::new(daq, &config, sync, CameraSync::disabled(), cancel.clone(), 4)
            .unwrap();

    cancel.cancel();
    assert_eq!(acquisition.on_block_ready().unwrap(), BlockOutcome::Cancelled);
    assert_eq!(acquisition.sequence(), 0);
    assert_eq!(handle.analog_reads(), 0);
}
