//! End-to-end acquisitions against the mock microscope.

use spim_daq::acquisition::status::StatusRecorder;
use spim_daq::acquisition::{
    AcquisitionContext, AcquisitionStatus, ChannelMode, ChannelSpec, RunOutcome, RunRequest,
    Sequencer, SequencerState, Side, UserIntent,
};
use spim_daq::config::SpimConfig;
use spim_daq::hardware::capabilities::LiveMode;
use spim_daq::hardware::mock::{BOTTOM_CAMERA, CAMERA_A, CAMERA_B};
use spim_daq::hardware::MockMicroscope;
use spim_daq::{SpimError, ValidationError};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

fn sequencer(mock: &Arc<MockMicroscope>) -> Arc<Sequencer> {
    Arc::new(Sequencer::new(mock.microscope(), SpimConfig::default()))
}

fn two_channels() -> Vec<ChannelSpec> {
    vec![
        ChannelSpec::new("488nm").with_output(5),
        ChannelSpec::new("561nm").with_output(6),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_single_volume_run_stores_every_frame() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);

    let report = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.timepoints_done, 1);
    assert_eq!(report.frames_received, 40);
    assert!(!report.missed_images);
    assert_eq!(mock.trigger_count(), 1);
    assert_eq!(mock.datasets(), vec!["acq"]);

    let images = mock.images();
    assert_eq!(images.len(), 40);
    assert_eq!(images.iter().filter(|i| i.camera == CAMERA_A).count(), 20);
    // Two-sided runs interleave sides into channels 0 and 1
    assert!(images
        .iter()
        .all(|i| i.coords.channel == usize::from(i.camera == CAMERA_B)));

    // Devices are back to where they were
    assert!(mock.is_live());
    assert_eq!(mock.selected_camera().await, BOTTOM_CAMERA);
    assert_eq!(mock.trigger_mode(CAMERA_A).await, None);
    assert!(!mock.polling_paused());
    assert!(!seq.context().hardware_in_use());
    assert!(!seq.context().is_requested());
    assert_eq!(seq.context().state(), SequencerState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_arming_order_and_cleanup() {
    let mock = Arc::new(MockMicroscope::new());
    sequencer(&mock)
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap();

    let calls = mock.calls();
    let pos = |name: &str| {
        calls
            .iter()
            .position(|c| c == name)
            .unwrap_or_else(|| panic!("{name} not called: {calls:?}"))
    };
    assert!(pos("set_live:false") < pos("pause_updates:true"));
    assert!(pos("set_current_camera:HamCam1") < pos("program"));
    assert!(pos("program") < pos("start_sequence:HamCam1"));
    assert!(pos("start_sequence:HamCam2") < pos("trigger:scanner_A"));
    assert!(pos("trigger:scanner_A") < pos("clean_up:AB"));
    assert_eq!(calls.last().map(String::as_str), Some("set_live:true"));
}

#[tokio::test(start_paused = true)]
async fn test_failure_while_arming_restores_devices() {
    let mock = Arc::new(MockMicroscope::new());
    mock.fail_on("program");
    let seq = sequencer(&mock);

    let err = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, SpimError::Hardware(_)), "got {err:?}");
    assert!(mock.is_live());
    assert_eq!(mock.selected_camera().await, BOTTOM_CAMERA);
    assert!(!mock.polling_paused());
    assert!(!seq.context().hardware_in_use());
    assert_eq!(seq.context().state(), SequencerState::Done);
    assert!(mock.datasets().is_empty());
    assert_eq!(mock.trigger_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequencer_usable_after_failure() {
    let mock = Arc::new(MockMicroscope::new());
    mock.fail_on("trigger");
    let seq = sequencer(&mock);
    assert!(seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .is_err());

    let healthy = Arc::new(MockMicroscope::new());
    let seq = Arc::new(
        Sequencer::new(healthy.microscope(), SpimConfig::default())
            .with_context(Arc::clone(seq.context())),
    );
    let report = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_wait_stops_within_one_increment() {
    let mock = Arc::new(MockMicroscope::new());
    let recorder = Arc::new(StatusRecorder::new());
    let seq = Arc::new(
        Sequencer::new(mock.microscope(), SpimConfig::default())
            .with_status_sink(recorder.clone()),
    );
    let intent = UserIntent {
        use_timepoints: true,
        num_timepoints: 3,
        timepoint_interval_s: 10.0,
        ..UserIntent::default()
    };

    let handle = seq.spawn(RunRequest::acquisition(intent));
    sleep(Duration::from_millis(2500)).await;
    seq.cancel();
    let cancelled_at = Instant::now();

    let report = handle.await.unwrap().unwrap();
    assert!(cancelled_at.elapsed() <= Duration::from_secs(1));
    assert!(report.was_cancelled());
    assert_eq!(report.timepoints_done, 1);
    assert_eq!(report.timepoints_total, 3);
    assert_eq!(mock.trigger_count(), 1);

    let history = recorder.history();
    assert_eq!(
        history.first(),
        Some(&AcquisitionStatus::Acquiring {
            timepoint: 1,
            total: 3
        })
    );
    assert!(history
        .iter()
        .any(|s| matches!(s, AcquisitionStatus::Waiting { next: 2, total: 3, .. })));
    assert_eq!(
        recorder.last(),
        Some(AcquisitionStatus::Done { timepoints: 1 })
    );
    assert!(mock.is_live());
    assert!(!seq.context().hardware_in_use());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_worker_starts_is_honoured() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);
    let intent = UserIntent {
        use_timepoints: true,
        num_timepoints: 5,
        timepoint_interval_s: 10.0,
        ..UserIntent::default()
    };

    let handle = seq.spawn(RunRequest::acquisition(intent));
    seq.cancel();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.timepoints_done, 0);
    assert_eq!(mock.trigger_count(), 0);
    assert!(mock.is_live());
    assert!(!seq.context().hardware_in_use());

    // The stop belonged to that run; the next one runs to completion
    assert!(!seq.context().is_cancel_requested());
    let report = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_idle_does_not_stop_next_spawn() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);
    seq.cancel();

    let report = seq
        .spawn(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(mock.trigger_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_software_timepoints_keep_schedule() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);
    let intent = UserIntent {
        use_timepoints: true,
        num_timepoints: 3,
        timepoint_interval_s: 5.0,
        separate_timepoints: true,
        name: "lapse".to_string(),
        ..UserIntent::default()
    };

    let started = Instant::now();
    let report = seq.run(RunRequest::acquisition(intent)).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.timepoints_done, 3);
    assert_eq!(mock.trigger_count(), 3);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(
        mock.datasets(),
        vec!["lapse_t0000", "lapse_t0001", "lapse_t0002"]
    );
    let last = mock.images().last().cloned().unwrap();
    assert_eq!(last.dataset, "lapse_t0002");
    assert_eq!(last.coords.timepoint, 2);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_timepoints_trigger_once() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);
    // 1.5 s is shorter than one volume plus the software setup margin
    let intent = UserIntent {
        use_timepoints: true,
        num_timepoints: 3,
        timepoint_interval_s: 1.5,
        ..UserIntent::default()
    };

    let report = seq.run(RunRequest::acquisition(intent)).await.unwrap();

    assert_eq!(mock.trigger_count(), 1);
    assert_eq!(report.frames_received, 120);
    assert_eq!(report.timepoints_done, 3);
    let program = mock.last_program().await.unwrap();
    assert!(program.sides.iter().all(|s| s.num_repeats == 3));

    let images = mock.images();
    let last_tp = images.iter().map(|i| i.coords.timepoint).max();
    assert_eq!(last_tp, Some(2));
    assert_eq!(images.iter().filter(|i| i.coords.timepoint == 1).count(), 40);
}

#[tokio::test(start_paused = true)]
async fn test_multi_position_visits_positions_then_channels() {
    let mock = Arc::new(MockMicroscope::new().with_positions(vec![(0.0, 0.0), (250.0, 0.0)]));
    let seq = sequencer(&mock);
    let intent = UserIntent {
        num_sides: 1,
        use_multi_positions: true,
        use_channels: true,
        channel_mode: ChannelMode::Volume,
        channels: two_channels(),
        ..UserIntent::default()
    };

    let report = seq.run(RunRequest::acquisition(intent)).await.unwrap();
    assert_eq!(report.frames_received, 80);

    let order: Vec<String> = mock
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("go_to") || c.starts_with("set_config") || c.starts_with("trigger"))
        .collect();
    assert_eq!(
        order,
        vec![
            "go_to:0",
            "set_config:488nm",
            "trigger:scanner_A",
            "set_config:561nm",
            "trigger:scanner_A",
            "go_to:1",
            "set_config:488nm",
            "trigger:scanner_A",
            "set_config:561nm",
            "trigger:scanner_A",
            // channel preset restored
            "set_config:488nm",
        ]
    );

    let images = mock.images();
    assert_eq!(images.iter().filter(|i| i.coords.position == 1).count(), 40);
    assert_eq!(images.iter().filter(|i| i.coords.channel == 1).count(), 40);
}

#[tokio::test(start_paused = true)]
async fn test_test_run_writes_nothing() {
    let mock = Arc::new(MockMicroscope::new());
    let seq = sequencer(&mock);
    let intent = UserIntent {
        use_timepoints: true,
        num_timepoints: 5,
        timepoint_interval_s: 30.0,
        ..UserIntent::default()
    };

    let report = seq
        .run(RunRequest::test(intent, Some(Side::B)))
        .await
        .unwrap();

    assert_eq!(report.timepoints_total, 1);
    assert_eq!(report.frames_received, 20);
    assert!(mock.datasets().is_empty());
    assert!(mock.images().is_empty());
    assert!(mock.calls().iter().any(|c| c == "trigger:scanner_B"));
    assert!(!mock.calls().iter().any(|c| c.starts_with("start_sequence:HamCam1")));
}

#[tokio::test(start_paused = true)]
async fn test_missed_images_are_reported() {
    let mock = Arc::new(MockMicroscope::new());
    mock.limit_frames(30);
    let seq = sequencer(&mock);

    let report = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.missed_images);
    assert_eq!(report.frames_received, 30);
}

#[tokio::test(start_paused = true)]
async fn test_no_first_frame_is_a_hardware_error() {
    let mock = Arc::new(MockMicroscope::new());
    mock.limit_frames(0);
    let seq = sequencer(&mock);

    let err = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, SpimError::Hardware(_)));
    assert!(mock.calls().iter().any(|c| c == "stop_sequence:HamCam1"));
    assert!(mock.is_live());
}

#[tokio::test]
async fn test_second_request_is_refused() {
    let mock = Arc::new(MockMicroscope::new());
    let context = Arc::new(AcquisitionContext::new());
    let seq = Sequencer::new(mock.microscope(), SpimConfig::default())
        .with_context(Arc::clone(&context));

    let _slot = context.request().unwrap();
    let err = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, SpimError::AlreadyRequested));
    assert_eq!(mock.mutation_count(), 0);
    assert_eq!(mock.read_count(), 0);
}

#[tokio::test]
async fn test_hardware_in_use_is_refused() {
    let mock = Arc::new(MockMicroscope::new());
    let context = Arc::new(AcquisitionContext::new());
    let seq = Sequencer::new(mock.microscope(), SpimConfig::default())
        .with_context(Arc::clone(&context));

    // e.g. autofocus holds the hardware
    let lock = context.lock_hardware().unwrap();
    let err = seq
        .run(RunRequest::acquisition(UserIntent::default()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SpimError::Validation(ValidationError::HardwareInUse)
    ));
    assert_eq!(mock.mutation_count(), 0);
    assert_eq!(context.state(), SequencerState::Idle);

    lock.release();
    assert!(!context.hardware_in_use());
}
