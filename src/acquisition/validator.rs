//! Feasibility checks.
//!
//! [`validate`] runs every precondition for an acquisition in a fixed order and
//! stops at the first failure. It only reads the settings snapshot and the
//! hardware readings taken with it, so a refused run has not touched any
//! device.
//!
//! Whether the controller repeats timepoints on its own is decided here too.
//! Conditions that rule out hardware timepoints downgrade the run to software
//! timing and record a warning; they never refuse the run.

use super::modes::{CameraMode, ChannelMode, Side, SpimMode};
use super::program::{build_controller_program, ControllerProgram};
use super::settings::{AcquisitionSettings, HardwareSnapshot};
use crate::config::SpimConfig;
use crate::error::ValidationError;
use serde::Serialize;
use std::fmt;

/// With multiple positions, intervals shorter than this multiple of the
/// timepoint duration may not leave enough time to move between positions.
const POSITION_INTERVAL_SAFETY_FACTOR: f64 = 1.2;

/// Why hardware timepoints could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HardwareTimepointBlocker {
    /// Per-volume hardware switching uses the same repeat counter
    VolumeChannelSwitching,
    /// Stage scans repeat through the stage, not the controller
    StageScanning,
    /// Each timepoint needs its own dataset
    SeparateTimepoints,
    /// Focusing needs software between timepoints
    Autofocus,
    /// Channel changes need software between volumes
    SoftwareChannelSwitching,
    /// Nothing is scanned
    NoScan,
}

impl fmt::Display for HardwareTimepointBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::VolumeChannelSwitching => "hardware channel switching volume-by-volume",
            Self::StageScanning => "stage scanning",
            Self::SeparateTimepoints => "a separate dataset for each time point",
            Self::Autofocus => "autofocus during acquisition",
            Self::SoftwareChannelSwitching => "software channel switching",
            Self::NoScan => "no-scan mode",
        };
        f.write_str(text)
    }
}

/// Non-fatal findings surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ValidationWarning {
    /// The requested slice period was too short and was lengthened.
    PeriodExtended {
        /// Added to the requested period
        by_ms: f64,
    },
    /// A short interval asked for hardware timepoints but something ruled them out.
    HardwareTimepointsDisabled(HardwareTimepointBlocker),
    /// Multi-position interval may be too short to visit every position.
    PositionIntervalAtRisk {
        /// Requested interval
        interval_ms: f64,
        /// Time one timepoint takes
        timepoint_ms: f64,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeriodExtended { by_ms } => write!(
                f,
                "Increasing slice period by {by_ms} ms to meet laser exposure constraint \
                 (time required for camera readout; readout time depends on ROI)"
            ),
            Self::HardwareTimepointsDisabled(blocker) => write!(
                f,
                "Cannot use hardware time points (small time point interval) with {blocker}; \
                 using software timing"
            ),
            Self::PositionIntervalAtRisk { .. } => f.write_str(
                "Timepoint interval may not be sufficient depending on actual time required \
                 to change positions. Proceed at your own risk.",
            ),
        }
    }
}

/// Outcome of the hardware-timepoint decision.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareTimepointDecision {
    /// Controller repeats the timepoints
    pub enabled: bool,
    /// Why they were ruled out, if they were
    pub warnings: Vec<ValidationWarning>,
}

/// Decide whether the controller should repeat timepoints itself.
///
/// Short intervals are handed to the controller because the software loop
/// needs setup time between timepoints. Multi-position runs always use
/// software timing.
pub fn decide_hardware_timepoints(
    settings: &AcquisitionSettings,
    timepoint_duration_ms: f64,
    margin_ms: f64,
) -> HardwareTimepointDecision {
    let interval_ms = settings.timepoint_interval_ms();
    let multiple = settings.num_timepoints > 1;
    let wanted = multiple
        && interval_ms < timepoint_duration_ms + margin_ms
        && !settings.is_stage_scanning;

    let mut warnings = Vec::new();

    if settings.use_multi_positions {
        if wanted
            || (multiple && interval_ms < timepoint_duration_ms * POSITION_INTERVAL_SAFETY_FACTOR)
        {
            warnings.push(ValidationWarning::PositionIntervalAtRisk {
                interval_ms,
                timepoint_ms: timepoint_duration_ms,
            });
        }
        return HardwareTimepointDecision {
            enabled: false,
            warnings,
        };
    }

    if !wanted {
        return HardwareTimepointDecision {
            enabled: false,
            warnings,
        };
    }

    let blockers = hardware_timepoint_blockers(settings);
    warnings.extend(
        blockers
            .iter()
            .map(|b| ValidationWarning::HardwareTimepointsDisabled(*b)),
    );
    HardwareTimepointDecision {
        enabled: blockers.is_empty(),
        warnings,
    }
}

/// Every condition present in `settings` that rules out hardware timepoints.
pub fn hardware_timepoint_blockers(settings: &AcquisitionSettings) -> Vec<HardwareTimepointBlocker> {
    let mut blockers = Vec::new();
    match settings.effective_channel_mode() {
        Some(ChannelMode::VolumeHw) => {
            blockers.push(HardwareTimepointBlocker::VolumeChannelSwitching)
        }
        Some(ChannelMode::Volume) => {
            blockers.push(HardwareTimepointBlocker::SoftwareChannelSwitching)
        }
        Some(ChannelMode::SliceHw) | None => {}
    }
    if settings.is_stage_scanning {
        blockers.push(HardwareTimepointBlocker::StageScanning);
    }
    if settings.separate_timepoints {
        blockers.push(HardwareTimepointBlocker::SeparateTimepoints);
    }
    if settings.use_autofocus {
        blockers.push(HardwareTimepointBlocker::Autofocus);
    }
    if settings.spim_mode == SpimMode::NoScan {
        blockers.push(HardwareTimepointBlocker::NoScan);
    }
    blockers
}

/// Settings that passed every check, with the program to run them.
///
/// Only [`validate`] can build one, so holding a `ValidatedSettings` proves the
/// checks ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSettings {
    settings: AcquisitionSettings,
    program: ControllerProgram,
    warnings: Vec<ValidationWarning>,
    volume_duration_ms: f64,
    timepoint_duration_ms: f64,
}

impl ValidatedSettings {
    /// The checked settings.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Controller program built from the settings.
    pub fn program(&self) -> &ControllerProgram {
        &self.program
    }

    /// Non-fatal findings.
    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    /// Time to acquire one volume in ms.
    pub fn volume_duration_ms(&self) -> f64 {
        self.volume_duration_ms
    }

    /// Time to acquire one timepoint in ms.
    pub fn timepoint_duration_ms(&self) -> f64 {
        self.timepoint_duration_ms
    }
}

/// Inputs the checks need besides the settings themselves.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Another acquisition or autofocus holds the hardware
    pub hardware_in_use: bool,
    /// Device readings
    pub hw: &'a HardwareSnapshot,
    /// Engine configuration
    pub config: &'a SpimConfig,
    /// Current stage XY in um, used to centre stage scans
    pub stage_xy_um: (f64, f64),
}

/// Run all feasibility checks in order.
pub fn validate(
    mut settings: AcquisitionSettings,
    ctx: &ValidationContext<'_>,
) -> Result<ValidatedSettings, ValidationError> {
    let cfg = ctx.config;

    // 1. hardware lock
    if ctx.hardware_in_use {
        return Err(ValidationError::HardwareInUse);
    }

    // 2. cameras for every active side
    let sides = settings.active_sides();
    for (i, side) in sides.iter().enumerate() {
        if ctx.hw.camera(*side).is_none() {
            return Err(ValidationError::CameraNotAssigned {
                position: if i == 0 { "first" } else { "second" },
                side: side.letter(),
            });
        }
    }

    // 3. shared frame buffer needs matching geometry
    if let [first, second] = sides.as_slice() {
        if let (Some(a), Some(b)) = (ctx.hw.camera(*first), ctx.hw.camera(*second)) {
            if a.roi.width != b.roi.width || a.roi.height != b.roi.height {
                return Err(ValidationError::RoiMismatch {
                    first_w: a.roi.width,
                    first_h: a.roi.height,
                    second_w: b.roi.width,
                    second_h: b.roi.height,
                });
            }
        }
    }

    // 4. exposure plus readout must fit in the slice
    let exposure = settings.slice_timing.camera_exposure_ms();
    let readout = settings.camera_overhead.readout_ms;
    let slice = settings.slice_timing.slice_duration_ms();
    if exposure + readout > slice {
        return Err(ValidationError::ExposureExceedsSlice {
            exposure_ms: exposure,
            readout_ms: readout,
            slice_ms: slice,
        });
    }

    // 5. stage scanning
    if settings.is_stage_scanning && !ctx.hw.stage_scan_capable {
        return Err(ValidationError::StageScanUnsupported);
    }
    if settings.spim_mode == SpimMode::StageScanInterleaved {
        if settings.num_sides != 2 {
            return Err(ValidationError::InterleavedNeedsTwoSides);
        }
        if settings.camera_mode == CameraMode::Overlap {
            return Err(ValidationError::InterleavedWithOverlap);
        }
    }

    // 6. hardware timepoints
    let timepoint_duration_ms = settings.timepoint_duration_ms(&cfg.sequencer);
    let decision = decide_hardware_timepoints(
        &settings,
        timepoint_duration_ms,
        cfg.sequencer.hardware_timepoint_margin_ms,
    );
    settings.hardware_timepoints = decision.enabled;
    let mut warnings = decision.warnings;

    // 7. channels
    if settings.use_channels {
        if settings.channels.is_empty() {
            return Err(ValidationError::NoChannelsSelected);
        }
        if settings.channel_mode == ChannelMode::VolumeHw && settings.num_sides < 2 {
            return Err(ValidationError::VolumeSwitchingNeedsTwoSides);
        }
        if settings.channel_mode.is_hardware() {
            if settings.channels.len() > cfg.controller.max_hardware_channels {
                return Err(ValidationError::TooManyHardwareChannels {
                    requested: settings.channels.len(),
                    max: cfg.controller.max_hardware_channels,
                });
            }
            if settings.uses_hardware_switching() && !cfg.controller.has_plogic {
                return Err(ValidationError::PlogicRequired);
            }
        }
    }

    if settings.use_multi_positions && settings.num_positions == 0 {
        return Err(ValidationError::NoPositions);
    }

    // 8. timepoints faster than volumes
    let volume_duration_ms = settings.volume_duration_ms(&cfg.sequencer);
    if !settings.use_multi_positions
        && settings.num_timepoints > 1
        && settings.timepoint_interval_ms() < volume_duration_ms
    {
        return Err(ValidationError::IntervalShorterThanVolume {
            interval_ms: settings.timepoint_interval_ms(),
            volume_ms: volume_duration_ms,
        });
    }

    // 9. autofocus channel
    if settings.use_autofocus
        && settings.use_channels
        && !ctx
            .hw
            .available_channel_configs
            .iter()
            .any(|c| c == &settings.autofocus_channel)
    {
        return Err(ValidationError::InvalidAutofocusChannel(
            settings.autofocus_channel.clone(),
        ));
    }

    let program = build_controller_program(
        &settings,
        &cfg.setup,
        ctx.stage_xy_um,
        volume_duration_ms,
        cfg.controller.max_hardware_channels,
    )?;

    Ok(ValidatedSettings {
        settings,
        program,
        warnings,
        volume_duration_ms,
        timepoint_duration_ms,
    })
}

/// The cameras to arm, in first/second order.
pub fn cameras_in_order(settings: &AcquisitionSettings, hw: &HardwareSnapshot) -> Vec<(Side, String)> {
    settings
        .active_sides()
        .into_iter()
        .filter_map(|side| hw.camera(side).map(|c| (side, c.camera.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::settings::{
        assemble, CameraOverhead, ChannelSpec, SideCamera, UserIntent,
    };
    use crate::hardware::Roi;
    use crate::timing::{SliceTiming, TimingFields};

    fn side_camera(name: &str, width: u32) -> SideCamera {
        SideCamera {
            camera: name.to_string(),
            roi: Roi {
                x: 0,
                y: 0,
                width,
                height: 512,
            },
            overhead: CameraOverhead {
                reset_ms: 10.1,
                readout_ms: 10.0,
            },
        }
    }

    fn snapshot() -> HardwareSnapshot {
        HardwareSnapshot {
            side_a: Some(side_camera("HamCam1", 2048)),
            side_b: Some(side_camera("HamCam2", 2048)),
            scan_filter_freq_khz: 1.6,
            stage_scan_capable: true,
            stage_accel_ms: 50.0,
            num_positions: 3,
            available_channel_configs: vec!["488".to_string(), "561".to_string()],
        }
    }

    fn timing(exposure_ms: f64) -> SliceTiming {
        SliceTiming::new(TimingFields {
            scan_delay_ms: 0.0,
            scan_num: 1,
            scan_period_ms: 30,
            laser_delay_ms: 0.0,
            laser_duration_ms: 29.0,
            camera_delay_ms: 0.0,
            camera_duration_ms: 30.0,
            camera_exposure_ms: exposure_ms,
        })
    }

    fn check(intent: UserIntent) -> Result<ValidatedSettings, ValidationError> {
        check_with(intent, snapshot(), false)
    }

    fn check_with(
        intent: UserIntent,
        hw: HardwareSnapshot,
        in_use: bool,
    ) -> Result<ValidatedSettings, ValidationError> {
        let config = SpimConfig::default();
        let settings = assemble(&intent, &hw, timing(19.0), false);
        validate(
            settings,
            &ValidationContext {
                hardware_in_use: in_use,
                hw: &hw,
                config: &config,
                stage_xy_um: (0.0, 0.0),
            },
        )
    }

    /// Two-sided, 20 slices of 30 ms: 1200 ms volumes.
    fn fast_timelapse() -> UserIntent {
        UserIntent {
            use_timepoints: true,
            num_timepoints: 10,
            timepoint_interval_s: 1.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_run_passes() {
        let validated = check(UserIntent::default()).unwrap();
        assert_eq!(validated.volume_duration_ms(), 1200.0);
        assert!(validated.warnings().is_empty());
        assert_eq!(validated.program().sides.len(), 2);
    }

    #[test]
    fn test_lock_checked_first() {
        let hw = HardwareSnapshot {
            side_b: None,
            ..snapshot()
        };
        assert_eq!(
            check_with(UserIntent::default(), hw, true).unwrap_err(),
            ValidationError::HardwareInUse
        );
    }

    #[test]
    fn test_missing_camera() {
        let hw = HardwareSnapshot {
            side_b: None,
            ..snapshot()
        };
        let err = check_with(UserIntent::default(), hw.clone(), false).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CameraNotAssigned {
                position: "second",
                side: 'B'
            }
        );

        let single_a = UserIntent {
            num_sides: 1,
            ..Default::default()
        };
        assert!(check_with(single_a, hw, false).is_ok());
    }

    #[test]
    fn test_roi_mismatch() {
        let hw = HardwareSnapshot {
            side_b: Some(side_camera("HamCam2", 1024)),
            ..snapshot()
        };
        assert!(matches!(
            check_with(UserIntent::default(), hw, false).unwrap_err(),
            ValidationError::RoiMismatch { second_w: 1024, .. }
        ));
    }

    #[test]
    fn test_exposure_must_fit_slice() {
        let config = SpimConfig::default();
        let hw = snapshot();
        let settings = assemble(&UserIntent::default(), &hw, timing(20.5), false);
        let err = validate(
            settings,
            &ValidationContext {
                hardware_in_use: false,
                hw: &hw,
                config: &config,
                stage_xy_um: (0.0, 0.0),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ExposureExceedsSlice { .. }));
    }

    #[test]
    fn test_stage_scan_preconditions() {
        let hw = HardwareSnapshot {
            stage_scan_capable: false,
            ..snapshot()
        };
        let stage = UserIntent {
            spim_mode: SpimMode::StageScan,
            ..Default::default()
        };
        assert_eq!(
            check_with(stage, hw, false).unwrap_err(),
            ValidationError::StageScanUnsupported
        );

        let interleaved_single = UserIntent {
            spim_mode: SpimMode::StageScanInterleaved,
            num_sides: 1,
            ..Default::default()
        };
        assert_eq!(
            check(interleaved_single).unwrap_err(),
            ValidationError::InterleavedNeedsTwoSides
        );

        let interleaved_overlap = UserIntent {
            spim_mode: SpimMode::StageScanInterleaved,
            camera_mode: CameraMode::Overlap,
            ..Default::default()
        };
        assert_eq!(
            check(interleaved_overlap).unwrap_err(),
            ValidationError::InterleavedWithOverlap
        );
    }

    #[test]
    fn test_short_interval_uses_hardware_timepoints() {
        let validated = check(fast_timelapse()).unwrap();
        assert!(validated.settings().hardware_timepoints);
        assert_eq!(validated.program().sides[0].num_repeats, 10);
        assert_eq!(validated.program().sides[0].repeat_delay_ms, 300.0);
    }

    #[test]
    fn test_long_interval_uses_software_timepoints() {
        let validated = check(UserIntent {
            timepoint_interval_s: 10.0,
            ..fast_timelapse()
        })
        .unwrap();
        assert!(!validated.settings().hardware_timepoints);
        assert!(validated.warnings().is_empty());
    }

    #[test]
    fn test_interval_shorter_than_volume() {
        let err = check(UserIntent {
            timepoint_interval_s: 1.0,
            ..fast_timelapse()
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::IntervalShorterThanVolume { .. }));
    }

    #[test]
    fn test_multi_position_never_hardware_timed() {
        let validated = check(UserIntent {
            use_multi_positions: true,
            timepoint_interval_s: 5.0,
            ..fast_timelapse()
        })
        .unwrap();
        assert!(!validated.settings().hardware_timepoints);
        assert!(matches!(
            validated.warnings()[0],
            ValidationWarning::PositionIntervalAtRisk { .. }
        ));
    }

    #[test]
    fn test_channel_preconditions() {
        let empty = UserIntent {
            use_channels: true,
            ..Default::default()
        };
        assert_eq!(check(empty).unwrap_err(), ValidationError::NoChannelsSelected);

        let volume_hw_single = UserIntent {
            use_channels: true,
            num_sides: 1,
            channel_mode: ChannelMode::VolumeHw,
            channels: vec![ChannelSpec::new("488").with_output(5)],
            ..Default::default()
        };
        assert_eq!(
            check(volume_hw_single).unwrap_err(),
            ValidationError::VolumeSwitchingNeedsTwoSides
        );

        let too_many = UserIntent {
            use_channels: true,
            channel_mode: ChannelMode::SliceHw,
            channels: (5..=9)
                .map(|o| ChannelSpec::new(format!("ch{o}")).with_output(o))
                .collect(),
            ..Default::default()
        };
        assert!(matches!(
            check(too_many).unwrap_err(),
            ValidationError::TooManyHardwareChannels { requested: 5, max: 4 }
        ));
    }

    #[test]
    fn test_plogic_required_for_hardware_switching() {
        let mut config = SpimConfig::default();
        config.controller.has_plogic = false;
        let hw = snapshot();
        let intent = UserIntent {
            use_channels: true,
            channel_mode: ChannelMode::SliceHw,
            channels: vec![
                ChannelSpec::new("488").with_output(5),
                ChannelSpec::new("561").with_output(6),
            ],
            ..Default::default()
        };
        let settings = assemble(&intent, &hw, timing(19.0), false);
        let err = validate(
            settings,
            &ValidationContext {
                hardware_in_use: false,
                hw: &hw,
                config: &config,
                stage_xy_um: (0.0, 0.0),
            },
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::PlogicRequired);
    }

    #[test]
    fn test_empty_position_list() {
        let hw = HardwareSnapshot {
            num_positions: 0,
            ..snapshot()
        };
        let intent = UserIntent {
            use_multi_positions: true,
            ..Default::default()
        };
        assert_eq!(
            check_with(intent, hw, false).unwrap_err(),
            ValidationError::NoPositions
        );
    }

    #[test]
    fn test_autofocus_channel_must_exist() {
        let intent = UserIntent {
            use_autofocus: true,
            use_channels: true,
            channels: vec![ChannelSpec::new("488")],
            autofocus_channel: "405".to_string(),
            ..Default::default()
        };
        assert_eq!(
            check(intent.clone()).unwrap_err(),
            ValidationError::InvalidAutofocusChannel("405".to_string())
        );

        let valid = UserIntent {
            autofocus_channel: "488".to_string(),
            ..intent
        };
        assert!(check(valid).is_ok());
    }
}
