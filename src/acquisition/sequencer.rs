//! Acquisition sequencer.
//!
//! The [`Sequencer`] turns a [`UserIntent`] into a finished run. It reads
//! the hardware, synthesizes the slice timing, validates, arms the microscope
//! and then iterates timepoints, positions and software channels, draining
//! frames from the cameras into the image sink.
//!
//! # Architecture
//!
//! ```text
//! UserIntent ─> read_hardware ─> plan_timing ─> assemble ─> validate
//!                                                              │
//!        Done <── restore (CleanupRegistry) <── timepoint loop <── arm
//! ```
//!
//! Every device mutation made while arming registers its undo with a
//! [`CleanupRegistry`]; the registry runs on every exit path, after which the
//! hardware lock is released.
//!
//! # Repeat strategies
//!
//! - **Hardware timepoints**: the controller repeats the volume on its own.
//!   The sequencer triggers once and only drains frames.
//! - **Software timepoints**: timepoint `n` starts at `start + n × interval`.
//!   Waiting happens in sleeps no longer than the configured wait increment,
//!   publishing [`AcquisitionStatus::Waiting`] and checking the cancel flag
//!   between sleeps.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = Arc::new(MockMicroscope::new());
//! let sequencer = Arc::new(Sequencer::new(mock.microscope(), SpimConfig::default()));
//!
//! let handle = sequencer.spawn(RunRequest::acquisition(intent));
//! // ... later, from any task
//! sequencer.cancel();
//! let report = handle.await??;
//! ```

use super::cleanup::CleanupRegistry;
use super::context::AcquisitionContext;
use super::modes::{ChannelMode, Side};
use super::program::build_controller_program;
use super::settings::{
    assemble, plan_timing, AcquisitionSettings, CameraOverhead, ChannelSpec, HardwareSnapshot,
    SideCamera, UserIntent,
};
use super::state::SequencerEvent;
use super::status::{AcquisitionStatus, LogStatusSink, RunOutcome, RunReport, StatusSink};
use super::validator::{
    cameras_in_order, validate, ValidatedSettings, ValidationContext, ValidationWarning,
};
use crate::config::SpimConfig;
use crate::error::{AppResult, SpimError};
use crate::hardware::capabilities::{props, FrameCoords, Microscope};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Operator choices
    pub intent: UserIntent,
    /// Set for a quick test run
    pub test: Option<TestRun>,
}

/// Quick single-timepoint run that never writes to the image sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestRun {
    /// Restrict the run to one side
    pub side: Option<Side>,
}

impl RunRequest {
    /// A full acquisition.
    pub fn acquisition(intent: UserIntent) -> Self {
        Self { intent, test: None }
    }

    /// A test run, optionally restricted to one side.
    pub fn test(intent: UserIntent, side: Option<Side>) -> Self {
        Self {
            intent,
            test: Some(TestRun { side }),
        }
    }

    /// This is a test run.
    pub fn is_test(&self) -> bool {
        self.test.is_some()
    }
}

/// Device state read before anything is changed.
#[derive(Debug, Clone)]
struct Readings {
    hw: HardwareSnapshot,
    stage_xy_um: (f64, f64),
    camera: String,
    channel: Option<String>,
    stage_speed: Option<f64>,
}

#[derive(Debug)]
struct Progress {
    started: Instant,
    frames_received: u64,
    missed_images: bool,
    /// Last timepoint announced while draining hardware timepoints
    announced_timepoint: u32,
}

/// Start time of each software-timed repeat.
#[derive(Debug, Clone, Copy)]
struct RepeatClock {
    start: Instant,
    interval: Duration,
}

impl RepeatClock {
    fn start_of(&self, repeat: u32) -> Instant {
        self.start + self.interval * repeat
    }
}

/// Runs acquisitions on one microscope, one at a time.
pub struct Sequencer {
    scope: Microscope,
    config: SpimConfig,
    context: Arc<AcquisitionContext>,
    status: Arc<dyn StatusSink>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("state", &self.context.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Sequencer with a fresh context that logs its status.
    pub fn new(scope: Microscope, config: SpimConfig) -> Self {
        Self {
            scope,
            config,
            context: Arc::new(AcquisitionContext::new()),
            status: Arc::new(LogStatusSink),
        }
    }

    /// Share a context, e.g. one whose hardware flag autofocus also honours.
    pub fn with_context(mut self, context: Arc<AcquisitionContext>) -> Self {
        self.context = context;
        self
    }

    /// Send status updates to `status` instead of the log.
    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Flags and progress shared with the rest of the process.
    pub fn context(&self) -> &Arc<AcquisitionContext> {
        &self.context
    }

    /// Configuration the sequencer was built with.
    pub fn config(&self) -> &SpimConfig {
        &self.config
    }

    /// Ask the running acquisition to stop after its current volume.
    pub fn cancel(&self) {
        self.context.request_cancel();
    }

    /// Run on a background task.
    ///
    /// A [`cancel`](Self::cancel) issued after this returns applies to the
    /// spawned run, even if the task has not started yet.
    pub fn spawn(self: &Arc<Self>, request: RunRequest) -> JoinHandle<AppResult<RunReport>> {
        self.context.clear_idle_cancel();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request).await })
    }

    /// Run one acquisition to completion.
    ///
    /// # Errors
    ///
    /// - [`SpimError::AlreadyRequested`] if another run holds the sequencer
    /// - [`SpimError::Validation`] if a feasibility check failed; no device
    ///   state was changed
    /// - [`SpimError::Hardware`] if a device call failed; device state has
    ///   been restored and the hardware lock released
    ///
    /// Cancellation is not an error: the report's outcome is
    /// [`RunOutcome::Cancelled`].
    pub async fn run(&self, request: RunRequest) -> AppResult<RunReport> {
        let _slot = self.context.request()?;
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("acquisition", %run_id, test = request.is_test());
        self.run_claimed(request, run_id).instrument(span).await
    }

    async fn run_claimed(&self, request: RunRequest, run_id: Uuid) -> AppResult<RunReport> {
        let started = Instant::now();
        let started_at = Utc::now();
        self.context.apply(SequencerEvent::Arm)?;
        self.context.set_timepoints_done(0);

        let is_test = request.is_test();
        let intent = match request.test {
            Some(test) => request.intent.for_test_run(test.side),
            None => request.intent,
        };

        let readings = match self.read_hardware(&intent).await {
            Ok(readings) => readings,
            Err(err) => {
                error!(error = %err, "Could not read hardware state");
                self.context.apply(SequencerEvent::Fail)?;
                self.status.publish(AcquisitionStatus::None);
                return Err(err);
            }
        };

        let synthesis = plan_timing(&intent, &readings.hw, &self.config.controller);
        let mut warnings = Vec::new();
        if let Some(by_ms) = synthesis.period_extended_by_ms {
            if !intent.minimize_slice_period {
                let warning = ValidationWarning::PeriodExtended { by_ms };
                warn!("{warning}");
                warnings.push(warning);
            }
        }

        let settings = assemble(&intent, &readings.hw, synthesis.timing, is_test);
        let checks = ValidationContext {
            hardware_in_use: self.context.hardware_in_use(),
            hw: &readings.hw,
            config: &self.config,
            stage_xy_um: readings.stage_xy_um,
        };
        let armed = validate(settings, &checks)
            .and_then(|validated| self.context.lock_hardware().map(|lock| (validated, lock)));
        let (validated, hardware_lock) = match armed {
            Ok(armed) => armed,
            Err(err) => {
                warn!(error = %err, "Acquisition refused");
                self.context.apply(SequencerEvent::ValidationFailed)?;
                self.status.publish(AcquisitionStatus::None);
                return Err(err.into());
            }
        };
        for warning in validated.warnings() {
            warn!("{warning}");
        }
        warnings.extend(validated.warnings().iter().cloned());

        let settings = validated.settings();
        info!(
            sides = settings.num_sides,
            slices = settings.num_slices,
            channels = settings.num_channels,
            timepoints = settings.num_timepoints,
            hardware_timepoints = settings.hardware_timepoints,
            slice_ms = settings.slice_timing.slice_duration_ms(),
            volume_ms = validated.volume_duration_ms(),
            "Starting acquisition"
        );

        let mut cleanup = CleanupRegistry::new();
        let mut progress = Progress {
            started,
            frames_received: 0,
            missed_images: false,
            announced_timepoint: 0,
        };
        let result = self
            .execute(&validated, &readings, &mut cleanup, &mut progress)
            .await;

        debug!(restores = ?cleanup.names(), "Restoring device state");
        let failed_restores = cleanup.run_all().await;
        if failed_restores > 0 {
            warn!(failed_restores, "Some device settings could not be restored");
        }
        hardware_lock.release();

        let timepoints_done = self.context.timepoints_done();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, timepoints_done, "Acquisition failed");
                self.context.apply(SequencerEvent::Fail)?;
                self.status.publish(AcquisitionStatus::Done {
                    timepoints: timepoints_done,
                });
                return Err(err);
            }
        };
        self.context.apply(SequencerEvent::Finish)?;
        self.status.publish(AcquisitionStatus::Done {
            timepoints: timepoints_done,
        });

        match outcome {
            RunOutcome::Completed => info!(timepoints_done, "Acquisition finished"),
            RunOutcome::Cancelled => info!(timepoints_done, "Acquisition cancelled"),
        }
        if progress.missed_images {
            warn!("Acquisition finished with missed images");
        }

        Ok(RunReport {
            run_id,
            started_at,
            outcome,
            timepoints_done,
            timepoints_total: validated.settings().num_timepoints,
            frames_received: progress.frames_received,
            missed_images: progress.missed_images,
            warnings,
            elapsed: started.elapsed(),
        })
    }

    // =========================================================================
    // Hardware snapshot
    // =========================================================================

    async fn read_hardware(&self, intent: &UserIntent) -> AppResult<Readings> {
        let scope = &self.scope;
        let overlap = intent.camera_mode.reads_out_during_exposure();

        let mut cameras = [None, None];
        for (slot, side) in cameras.iter_mut().zip([Side::A, Side::B]) {
            let Some(camera) = scope.cameras.camera_for(side) else {
                continue;
            };
            let roi = scope.cameras.roi(&camera).await?;
            let reset_ms = scope
                .cameras
                .reset_time_ms(&camera, intent.camera_mode)
                .await?;
            let readout_ms = scope.cameras.readout_time_ms(&camera, overlap).await?;
            *slot = Some(SideCamera {
                camera,
                roi,
                overhead: CameraOverhead {
                    reset_ms,
                    readout_ms,
                },
            });
        }
        let [side_a, side_b] = cameras;

        let mut scan_filter_freq_khz: f64 = 0.0;
        for scanner in [props::SCANNER_A, props::SCANNER_B] {
            if scope.props.has_property(scanner, props::FILTER_FREQ_X) {
                let freq = scope.props.get_float(scanner, props::FILTER_FREQ_X).await?;
                scan_filter_freq_khz = scan_filter_freq_khz.max(freq);
            }
        }

        let stage_scan_capable = scope
            .props
            .has_property(props::XY_STAGE, props::STAGESCAN_NUM_LINES);
        let stage_accel_ms = if scope
            .props
            .has_property(props::XY_STAGE, props::ACCELERATION_X)
        {
            scope
                .props
                .get_float(props::XY_STAGE, props::ACCELERATION_X)
                .await?
        } else {
            0.0
        };
        let stage_speed = if intent.spim_mode.is_stage_scan()
            && scope
                .props
                .has_property(props::XY_STAGE, props::STAGESCAN_MOTOR_SPEED)
        {
            Some(
                scope
                    .props
                    .get_float(props::XY_STAGE, props::STAGESCAN_MOTOR_SPEED)
                    .await?,
            )
        } else {
            None
        };

        let num_positions = if intent.use_multi_positions {
            scope.positions.position_count().await?
        } else {
            0
        };

        let (available_channel_configs, channel) = if intent.use_channels {
            (
                scope.channels.available_configs(&intent.channel_group).await?,
                Some(scope.channels.current_config(&intent.channel_group).await?),
            )
        } else {
            (Vec::new(), None)
        };

        let camera = scope.cameras.current_camera().await?;
        let stage_xy_um = scope.positions.xy().await?;

        Ok(Readings {
            hw: HardwareSnapshot {
                side_a,
                side_b,
                scan_filter_freq_khz,
                stage_scan_capable,
                stage_accel_ms,
                num_positions,
                available_channel_configs,
            },
            stage_xy_um,
            camera,
            channel,
            stage_speed,
        })
    }

    // =========================================================================
    // Arming
    // =========================================================================

    async fn execute(
        &self,
        v: &ValidatedSettings,
        readings: &Readings,
        cleanup: &mut CleanupRegistry,
        progress: &mut Progress,
    ) -> AppResult<RunOutcome> {
        let scope = &self.scope;
        let settings = v.settings();
        let cameras: Vec<String> = cameras_in_order(settings, &readings.hw)
            .into_iter()
            .map(|(_, camera)| camera)
            .collect();

        if scope.live.is_live() {
            let live = Arc::clone(&scope.live);
            cleanup.register("live_mode", move || async move { live.set_live(true).await });
            scope.live.set_live(false).await?;
        }

        let positions = Arc::clone(&scope.positions);
        cleanup.register("position_polling", move || async move {
            positions.pause_updates(false);
            Ok(())
        });
        scope.positions.pause_updates(true);

        let camera_bank = Arc::clone(&scope.cameras);
        let original_camera = readings.camera.clone();
        cleanup.register("camera_selection", move || async move {
            camera_bank.set_current_camera(&original_camera).await
        });
        if let Some(first) = cameras.first() {
            scope.cameras.set_current_camera(first).await?;
        }

        let camera_bank = Arc::clone(&scope.cameras);
        let armed_cameras = cameras.clone();
        cleanup.register("camera_trigger_mode", move || async move {
            camera_bank.set_trigger_mode(&armed_cameras, None).await
        });
        scope
            .cameras
            .set_trigger_mode(&cameras, Some(settings.camera_mode))
            .await?;
        for camera in &cameras {
            scope
                .cameras
                .set_exposure(camera, settings.slice_timing.camera_exposure_ms())
                .await?;
        }
        scope.cameras.clear_buffer().await?;

        if let Some(original) = readings.channel.clone() {
            let channels = Arc::clone(&scope.channels);
            let group = settings.channel_group.clone();
            cleanup.register("channel", move || async move {
                channels.set_config(&group, &original).await
            });
            // A single channel in a hardware mode is selected once up front.
            if settings.channel_mode.is_hardware() && !settings.uses_hardware_switching() {
                if let Some(channel) = settings.channels.first() {
                    scope
                        .channels
                        .set_config(&settings.channel_group, &channel.config)
                        .await?;
                }
            }
        }

        if settings.is_stage_scanning {
            let store = Arc::clone(&scope.props);
            let stage = Arc::clone(&scope.positions);
            let speed = readings.stage_speed;
            let (x_um, y_um) = readings.stage_xy_um;
            cleanup.register("stage", move || async move {
                if let Some(speed) = speed {
                    store
                        .set_float(props::XY_STAGE, props::STAGESCAN_MOTOR_SPEED, speed)
                        .await?;
                }
                stage.set_xy(x_um, y_um).await
            });
        }

        let controller = Arc::clone(&scope.controller);
        let sides = settings.active_sides();
        cleanup.register("controller", move || async move {
            controller.clean_up(&sides).await
        });
        scope.controller.program(v.program()).await?;
        debug!(cameras = ?cameras, "Hardware armed");

        if self.context.is_cancel_requested() {
            return self.mark_cancelled();
        }
        self.context.apply(SequencerEvent::Start)?;
        self.context.set_running(true);
        self.context.set_timepoints_total(settings.num_timepoints);

        let single_dataset = !settings.is_test && !settings.separate_timepoints;
        if single_dataset {
            scope.sink.begin(&settings.name).await?;
        }
        let result = self.timepoint_loop(v, readings, &cameras, progress).await;
        let finished = if single_dataset {
            scope.sink.finish().await.map_err(SpimError::from)
        } else {
            Ok(())
        };
        let outcome = result?;
        finished?;
        Ok(outcome)
    }

    fn mark_cancelled(&self) -> AppResult<RunOutcome> {
        self.context.apply(SequencerEvent::Cancel)?;
        info!("Stopping acquisition at cancel request");
        Ok(RunOutcome::Cancelled)
    }

    // =========================================================================
    // Repeat loop
    // =========================================================================

    async fn timepoint_loop(
        &self,
        v: &ValidatedSettings,
        readings: &Readings,
        cameras: &[String],
        progress: &mut Progress,
    ) -> AppResult<RunOutcome> {
        let settings = v.settings();
        let total = settings.num_timepoints;
        let repeats = if settings.hardware_timepoints { 1 } else { total };
        let clock = RepeatClock {
            start: Instant::now(),
            interval: Duration::from_secs_f64(settings.timepoint_interval_ms().max(0.0) / 1000.0),
        };

        for tp in 0..repeats {
            if tp > 0 && self.wait_until(clock.start_of(tp), tp + 1, total).await {
                return self.mark_cancelled();
            }
            if self.context.is_cancel_requested() {
                return self.mark_cancelled();
            }

            self.status.publish(AcquisitionStatus::Acquiring {
                timepoint: tp + 1,
                total,
            });
            info!(timepoint = tp + 1, total, "Acquiring time point");

            let mut reprogram = tp > 0;
            if autofocus_due(settings, tp) {
                self.run_autofocus(settings).await?;
                reprogram = true;
            }
            if reprogram {
                self.scope.controller.program(v.program()).await?;
            }

            let own_dataset = settings.separate_timepoints && !settings.is_test;
            if own_dataset {
                self.scope
                    .sink
                    .begin(&format!("{}_t{:04}", settings.name, tp))
                    .await?;
            }
            let result = self
                .acquire_timepoint(v, readings, cameras, tp, progress)
                .await;
            if own_dataset {
                self.scope.sink.finish().await?;
            }
            let outcome = result?;

            if !settings.hardware_timepoints {
                self.context.set_timepoints_done(tp + 1);
            }
            if outcome == RunOutcome::Cancelled {
                return self.mark_cancelled();
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Sleep until `target` in bounded steps. Returns `true` if cancelled.
    async fn wait_until(&self, target: Instant, next: u32, total: u32) -> bool {
        let increment = self.config.sequencer.wait_increment();
        loop {
            if self.context.is_cancel_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= target {
                return false;
            }
            let remaining = target - now;
            self.status.publish(AcquisitionStatus::Waiting {
                next,
                total,
                seconds_remaining: remaining.as_secs_f64().ceil() as u64,
            });
            sleep(remaining.min(increment)).await;
        }
    }

    async fn run_autofocus(&self, settings: &AcquisitionSettings) -> AppResult<()> {
        if settings.use_channels {
            self.scope
                .channels
                .set_config(&settings.channel_group, &settings.autofocus_channel)
                .await?;
        }
        for side in settings.active_sides() {
            let score = self.scope.autofocus.run_focus(side).await?;
            info!(side = %side, score, "Autofocus complete");
        }
        self.scope.cameras.clear_buffer().await?;
        Ok(())
    }

    async fn acquire_timepoint(
        &self,
        v: &ValidatedSettings,
        readings: &Readings,
        cameras: &[String],
        tp: u32,
        progress: &mut Progress,
    ) -> AppResult<RunOutcome> {
        let settings = v.settings();
        let num_positions = if settings.use_multi_positions {
            settings.num_positions
        } else {
            1
        };
        let channels = software_channels(settings);

        for position in 0..num_positions {
            if position > 0 && self.context.is_cancel_requested() {
                return Ok(RunOutcome::Cancelled);
            }
            if settings.use_multi_positions {
                self.move_to_position(v, readings, position).await?;
            }

            for (i, channel) in channels.iter().enumerate() {
                if i > 0 && self.context.is_cancel_requested() {
                    return Ok(RunOutcome::Cancelled);
                }
                let index = match channel {
                    Some((index, spec)) => {
                        debug!(channel = %spec.config, "Selecting channel");
                        self.scope
                            .channels
                            .set_config(&settings.channel_group, &spec.config)
                            .await?;
                        *index
                    }
                    None => 0,
                };
                let outcome = self
                    .acquire_volume(v, cameras, tp, position, index, progress)
                    .await?;
                if outcome == RunOutcome::Cancelled {
                    return Ok(outcome);
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    async fn move_to_position(
        &self,
        v: &ValidatedSettings,
        readings: &Readings,
        position: usize,
    ) -> AppResult<()> {
        let settings = v.settings();
        let scope = &self.scope;

        // Moves run at normal speed, not at the scan speed.
        if settings.is_stage_scanning {
            if let Some(speed) = readings.stage_speed {
                scope
                    .props
                    .set_float(props::XY_STAGE, props::STAGESCAN_MOTOR_SPEED, speed)
                    .await?;
            }
        }
        debug!(position, "Moving to position");
        scope.positions.go_to(position).await?;
        if settings.position_delay_ms > 0.0 {
            sleep(Duration::from_secs_f64(settings.position_delay_ms / 1000.0)).await;
        }

        if settings.is_stage_scanning {
            let xy = scope.positions.xy().await?;
            let program = build_controller_program(
                settings,
                &self.config.setup,
                xy,
                v.volume_duration_ms(),
                self.config.controller.max_hardware_channels,
            )?;
            scope.controller.program(&program).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Frame draining
    // =========================================================================

    async fn acquire_volume(
        &self,
        v: &ValidatedSettings,
        cameras: &[String],
        tp: u32,
        position: usize,
        software_channel: usize,
        progress: &mut Progress,
    ) -> AppResult<RunOutcome> {
        let settings = v.settings();
        let scope = &self.scope;
        let per_camera = frames_per_camera(settings);
        let total = per_camera * cameras.len() as u64;
        let per_timepoint = (total / u64::from(settings.num_timepoints.max(1))).max(1);
        let (first_timeout, between_timeout) = frame_timeouts(v, &self.config);

        for camera in cameras {
            scope.cameras.start_sequence(camera, per_camera).await?;
        }
        if let Err(err) = scope
            .controller
            .trigger(settings.spim_mode, settings.first_side)
            .await
        {
            self.stop_sequences(cameras).await;
            return Err(err.into());
        }

        let mut counts = vec![0u64; cameras.len()];
        let mut received = 0u64;
        let mut outcome = RunOutcome::Completed;
        while received < total {
            let timeout = if received == 0 {
                first_timeout
            } else {
                between_timeout
            };
            let frame = match scope.cameras.next_frame(timeout).await {
                Ok(frame) => frame,
                Err(err) => {
                    self.stop_sequences(cameras).await;
                    return Err(err.into());
                }
            };
            let Some(frame) = frame else {
                if received == 0 {
                    self.stop_sequences(cameras).await;
                    return Err(SpimError::Hardware(format!(
                        "Camera did not send first image within {} ms",
                        first_timeout.as_millis()
                    )));
                }
                warn!(received, expected = total, "Missed images");
                progress.missed_images = true;
                break;
            };
            let Some(camera_index) = cameras.iter().position(|c| *c == frame.camera) else {
                warn!(camera = %frame.camera, "Ignoring frame from camera not in acquisition");
                continue;
            };

            let n = counts[camera_index];
            counts[camera_index] += 1;
            received += 1;
            progress.frames_received += 1;

            let mut coords =
                route_frame(settings, camera_index, n, software_channel, tp, position);
            coords.elapsed_ms =
                u64::try_from(progress.started.elapsed().as_millis()).unwrap_or(u64::MAX);

            if settings.hardware_timepoints {
                let done = u32::try_from(received / per_timepoint).unwrap_or(u32::MAX);
                if done > self.context.timepoints_done() {
                    self.context.set_timepoints_done(done);
                }
                if camera_index == 0
                    && coords.slice == 0
                    && coords.channel == 0
                    && coords.timepoint > progress.announced_timepoint
                {
                    progress.announced_timepoint = coords.timepoint;
                    self.status.publish(AcquisitionStatus::Acquiring {
                        timepoint: coords.timepoint + 1,
                        total: settings.num_timepoints,
                    });
                }
            }

            if !settings.is_test {
                if let Err(err) = scope.sink.put(frame, coords).await {
                    self.stop_sequences(cameras).await;
                    return Err(err.into());
                }
            }

            if settings.hardware_timepoints
                && received % per_timepoint == 0
                && received < total
                && self.context.is_cancel_requested()
            {
                outcome = RunOutcome::Cancelled;
                break;
            }
        }

        for camera in cameras {
            scope.cameras.stop_sequence(camera).await?;
        }
        Ok(outcome)
    }

    async fn stop_sequences(&self, cameras: &[String]) {
        for camera in cameras {
            if let Err(err) = self.scope.cameras.stop_sequence(camera).await {
                warn!(camera = %camera, error = %format!("{err:#}"), "Could not stop camera sequence");
            }
        }
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

fn autofocus_due(settings: &AcquisitionSettings, tp: u32) -> bool {
    if !settings.use_autofocus {
        return false;
    }
    (settings.autofocus_before_start && tp == 0)
        || (tp > 0 && settings.autofocus_every_n > 0 && tp % settings.autofocus_every_n == 0)
}

/// Channels the sequencer selects itself, one volume each.
///
/// `None` means the volume is taken without touching the channel preset.
fn software_channels(settings: &AcquisitionSettings) -> Vec<Option<(usize, ChannelSpec)>> {
    match settings.effective_channel_mode() {
        Some(ChannelMode::Volume) => settings
            .channels
            .iter()
            .cloned()
            .enumerate()
            .map(Some)
            .collect(),
        Some(ChannelMode::VolumeHw | ChannelMode::SliceHw) | None => vec![None],
    }
}

/// Frames each camera delivers for one trigger.
pub fn frames_per_camera(settings: &AcquisitionSettings) -> u64 {
    let mut frames = u64::from(settings.num_slices);
    if settings.uses_hardware_switching() {
        frames *= u64::from(settings.num_channels);
    }
    if settings.hardware_timepoints {
        frames *= u64::from(settings.num_timepoints);
    }
    frames
}

/// Timeouts for the first frame of a volume and for every later one.
pub fn frame_timeouts(v: &ValidatedSettings, config: &SpimConfig) -> (Duration, Duration) {
    let settings = v.settings();
    let seq = &config.sequencer;
    let first_ms = (seq.first_frame_timeout_ms as f64).max(1.2 * v.volume_duration_ms());
    let mut between_ms =
        (seq.inter_frame_timeout_ms as f64).max(5.0 * settings.slice_timing.slice_duration_ms());
    if settings.hardware_timepoints {
        // The controller waits out the interval between volumes.
        between_ms = between_ms.max(settings.timepoint_interval_ms());
    }
    (
        Duration::from_secs_f64(first_ms / 1000.0),
        Duration::from_secs_f64(between_ms / 1000.0),
    )
}

/// Where the `n`-th frame of one camera's sequence belongs.
///
/// `camera_index` is 0 for the first side's camera and 1 for the second.
/// `elapsed_ms` is left at 0 for the caller to fill in.
pub fn route_frame(
    settings: &AcquisitionSettings,
    camera_index: usize,
    n: u64,
    software_channel: usize,
    timepoint: u32,
    position: usize,
) -> FrameCoords {
    let slices = u64::from(settings.num_slices.max(1));
    let channels = u64::from(settings.num_channels.max(1));

    let (channel, slice, volume) = if settings.uses_hardware_switching() {
        match settings.channel_mode {
            ChannelMode::SliceHw => (n % channels, (n / channels) % slices, n / (slices * channels)),
            ChannelMode::VolumeHw | ChannelMode::Volume => {
                ((n / slices) % channels, n % slices, n / (slices * channels))
            }
        }
    } else {
        (software_channel as u64, n % slices, n / slices)
    };

    let timepoint = if settings.hardware_timepoints {
        u32::try_from(volume).unwrap_or(u32::MAX)
    } else {
        timepoint
    };
    let channel = channel as usize;
    let channel = if settings.two_sided() {
        channel * 2 + camera_index
    } else {
        channel
    };

    FrameCoords {
        timepoint,
        channel,
        slice: u32::try_from(slice).unwrap_or(u32::MAX),
        position,
        elapsed_ms: 0,
    }
}
