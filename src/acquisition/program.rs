//! Controller programs.
//!
//! Pure translation of validated settings into what the trigger controller
//! has to be told: per-side sweep parameters, the stage-scan move, and the
//! PLogic channel switching table. Nothing here touches hardware.

use super::modes::{CameraMode, ChannelMode, Side, SpimMode};
use super::settings::AcquisitionSettings;
use crate::config::{SetupConfig, SideCalibration};
use crate::error::ValidationError;
use crate::timing::SliceTiming;
use serde::Serialize;
use std::f64::consts::SQRT_2;

/// Lowest PLogic BNC output usable for lasers.
pub const PLOGIC_FIRST_LASER_OUTPUT: u8 = 5;
/// Highest PLogic BNC output usable for lasers.
pub const PLOGIC_LAST_LASER_OUTPUT: u8 = 8;

/// PLogic input addresses used to build the channel-select AND cells.
pub mod plogic {
    /// Counter low bit
    pub const COUNTER_LSB: u8 = 3;
    /// Counter high bit
    pub const COUNTER_MSB: u8 = 4;
    /// TTL laser trigger from the scanner card
    pub const LASER_TRIGGER: u8 = 10;
    /// Added to an address to invert it; alone it is a constant high input
    pub const INVERT: u8 = 64;
    /// Output cells are numbered 8 above their BNC
    pub const CELL_OFFSET: u8 = 8;
}

/// Everything pushed to the controller before a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerProgram {
    /// Slice timing shared by both sides
    pub timing: SliceTiming,
    /// One entry per active side
    pub sides: Vec<SideProgram>,
    /// Set when stage scanning
    pub stage_scan: Option<StageScanProgram>,
    /// Set for PLogic channel switching
    pub channel_switching: Option<ChannelSwitchProgram>,
}

/// Sweep parameters for one imaging path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideProgram {
    /// Imaging path
    pub side: Side,
    /// Camera triggers per stack, including the extra overlap-mode trigger
    pub num_slices: u32,
    /// Slices taken at each piezo position
    pub slices_per_piezo: u32,
    /// Volumes run per trigger
    pub num_repeats: u32,
    /// Idle time between repeated volumes
    pub repeat_delay_ms: f64,
    /// Length of the sheet sweep
    pub scan_duration_ms: u32,
    /// Sheet sweep amplitude
    pub sheet_amplitude_deg: f64,
    /// Sheet sweep centre
    pub sheet_center_deg: f64,
    /// Piezo travel over the stack
    pub piezo_amplitude_um: f64,
    /// Piezo centre position
    pub piezo_center_um: f64,
    /// Sides in the acquisition
    pub num_sides: u8,
    /// Side triggered first
    pub first_side: Side,
    /// Alternate sides every slice
    pub interleave_sides: bool,
    /// Keep the piezo where the stack ends
    pub piezo_home_disable: bool,
}

/// Raster or serpentine stage scan pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPattern {
    /// Every line in the same direction.
    Raster,
    /// Alternating direction line to line.
    Serpentine,
}

/// Stage-scan move, positions in mm as the stage expects them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageScanProgram {
    /// um/ms, numerically equal to mm/s
    pub motor_speed: f64,
    /// Fast axis start
    pub fast_start_mm: f64,
    /// Fast axis end
    pub fast_stop_mm: f64,
    /// Slow axis start
    pub slow_start_mm: f64,
    /// Slow axis end
    pub slow_stop_mm: f64,
    /// Lines in the scan
    pub num_lines: u8,
    /// Raster or serpentine
    pub pattern: ScanPattern,
    /// Wait before each line
    pub settling_time_ms: f64,
}

/// What advances the PLogic channel counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CounterClock {
    /// Every laser pulse, i.e. every slice
    LaserTrigger,
    /// Every side change, counting from side A
    SideAFirst,
    /// Every side change, counting from side B
    SideBFirst,
}

/// One laser output cell in the PLogic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelOutput {
    /// Index into the settings' channel list
    pub channel: usize,
    /// BNC output 5-8
    pub output: u8,
    /// Logic cell driving the output
    pub cell: u8,
    /// Counter value that selects this channel
    pub counter_match: usize,
    /// Counter bit 0 address, possibly inverted
    pub input_lsb: u8,
    /// Counter bit 1 address, possibly inverted
    pub input_msb: u8,
}

/// PLogic counter and output table for hardware channel switching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSwitchProgram {
    /// What advances the counter
    pub clock: CounterClock,
    /// Counter wraps after this many channels
    pub modulus: usize,
    /// One cell per channel
    pub outputs: Vec<ChannelOutput>,
}

/// Build the complete controller program for a run.
///
/// `stage_xy_um` is the current stage position; stage scans are centred on it.
pub fn build_controller_program(
    settings: &AcquisitionSettings,
    setup: &SetupConfig,
    stage_xy_um: (f64, f64),
    volume_duration_ms: f64,
    max_hardware_channels: usize,
) -> Result<ControllerProgram, ValidationError> {
    let sides = settings
        .active_sides()
        .into_iter()
        .map(|side| build_side_program(settings, side, setup.side(side), volume_duration_ms))
        .collect::<Result<Vec<_>, _>>()?;

    let stage_scan = settings
        .is_stage_scanning
        .then(|| build_stage_scan(settings, stage_xy_um));

    let channel_switching = if settings.uses_hardware_switching() {
        Some(build_channel_switching(settings, max_hardware_channels)?)
    } else {
        None
    };

    Ok(ControllerProgram {
        timing: settings.slice_timing,
        sides,
        stage_scan,
        channel_switching,
    })
}

fn build_side_program(
    settings: &AcquisitionSettings,
    side: Side,
    cal: &SideCalibration,
    volume_duration_ms: f64,
) -> Result<SideProgram, ValidationError> {
    let slices_per_piezo = match settings.effective_channel_mode() {
        Some(ChannelMode::SliceHw) => settings.num_channels,
        Some(ChannelMode::Volume | ChannelMode::VolumeHw) | None => 1,
    };

    let mut num_repeats = match settings.effective_channel_mode() {
        Some(ChannelMode::VolumeHw) => settings.num_channels,
        Some(ChannelMode::Volume | ChannelMode::SliceHw) | None => 1,
    };
    let mut repeat_delay_ms = 0.0;
    if settings.hardware_timepoints && settings.use_timepoints {
        repeat_delay_ms = settings.timepoint_interval_ms() - volume_duration_ms;
        num_repeats = settings.num_timepoints;
    }

    let mut piezo_center = cal.piezo_center_um;
    let mut piezo_amplitude = if settings.spim_mode.sweeps_piezo() {
        f64::from(settings.num_slices - 1) * settings.step_size_um
    } else {
        0.0
    };

    // Overlap mode takes one extra trigger. Stretch the sweep so the first N
    // positions are unchanged and the last trigger lands one step beyond.
    let mut num_slices = settings.num_slices;
    let overlap_shift = match settings.camera_mode {
        CameraMode::Overlap if num_slices > 1 => {
            let n = f64::from(num_slices);
            piezo_amplitude *= n / (n - 1.0);
            let shift = piezo_amplitude / (2.0 * n);
            piezo_center += shift;
            num_slices += 1;
            shift
        }
        CameraMode::Overlap => {
            num_slices += 1;
            0.0
        }
        CameraMode::Edge | CameraMode::PseudoOverlap | CameraMode::Level => 0.0,
    };

    if cal.sheet_rate == 0.0 {
        return Err(ValidationError::ZeroSheetRate(side.letter()));
    }
    let mut sheet_amplitude = piezo_amplitude / cal.sheet_rate;
    let mut sheet_center = (piezo_center - cal.sheet_offset_um) / cal.sheet_rate;

    match settings.spim_mode {
        SpimMode::PiezoScanOnly => {
            sheet_center = (piezo_center - overlap_shift - cal.sheet_offset_um) / cal.sheet_rate;
            sheet_amplitude = 0.0;
        }
        SpimMode::SliceScanOnly => {
            piezo_center -= overlap_shift;
            piezo_amplitude = 0.0;
        }
        SpimMode::PiezoSliceScan
        | SpimMode::StageScan
        | SpimMode::StageScanInterleaved
        | SpimMode::NoScan => {}
    }

    let low = piezo_center - piezo_amplitude / 2.0;
    let high = piezo_center + piezo_amplitude / 2.0;
    let in_range = |v: f64| v >= cal.piezo_min_um && v <= cal.piezo_max_um;
    if !in_range(low) || !in_range(high) {
        return Err(ValidationError::PiezoOutOfRange {
            side: side.letter(),
            low_um: low,
            high_um: high,
        });
    }

    let interleaved = settings.spim_mode == SpimMode::StageScanInterleaved;
    Ok(SideProgram {
        side,
        num_slices,
        slices_per_piezo,
        num_repeats,
        repeat_delay_ms,
        scan_duration_ms: settings.slice_timing.scan_period_ms(),
        // DAC resolution is about 1e-4 deg and 1e-3 um
        sheet_amplitude_deg: round_to_places(sheet_amplitude, 4),
        sheet_center_deg: round_to_places(sheet_center, 4),
        piezo_amplitude_um: round_to_places(piezo_amplitude, 3),
        piezo_center_um: round_to_places(piezo_center, 3),
        num_sides: settings.num_sides,
        first_side: settings.first_side,
        interleave_sides: interleaved,
        piezo_home_disable: interleaved,
    })
}

fn build_stage_scan(settings: &AcquisitionSettings, (x_um, y_um): (f64, f64)) -> StageScanProgram {
    let interleaved = settings.spim_mode == SpimMode::StageScanInterleaved;
    let mut slice_duration = settings.slice_timing.slice_duration_ms();
    if interleaved {
        // Both sides share each step, so the stage moves at half speed.
        slice_duration *= 2.0;
    }
    let channels = f64::from(settings.num_channels.max(1));
    let motor_speed = settings.step_size_um * SQRT_2 / slice_duration / channels;
    let distance = f64::from(settings.num_slices) * settings.step_size_um * SQRT_2;

    StageScanProgram {
        motor_speed,
        fast_start_mm: (x_um - distance / 2.0) / 1000.0,
        fast_stop_mm: (x_um + distance / 2.0) / 1000.0,
        slow_start_mm: y_um / 1000.0,
        slow_stop_mm: y_um / 1000.0,
        num_lines: if interleaved { 1 } else { settings.num_sides },
        pattern: if !interleaved && settings.num_sides == 2 {
            ScanPattern::Serpentine
        } else {
            ScanPattern::Raster
        },
        settling_time_ms: settings.delay_before_side_ms,
    }
}

/// Build the PLogic table for hardware channel switching.
pub fn build_channel_switching(
    settings: &AcquisitionSettings,
    max_channels: usize,
) -> Result<ChannelSwitchProgram, ValidationError> {
    let count = settings.channels.len();
    if count == 0 || count > max_channels {
        return Err(ValidationError::TooManyHardwareChannels {
            requested: count,
            max: max_channels,
        });
    }

    let clock = match (settings.channel_mode, settings.first_side) {
        (ChannelMode::SliceHw, _) => CounterClock::LaserTrigger,
        (ChannelMode::VolumeHw, Side::A) => CounterClock::SideAFirst,
        (ChannelMode::VolumeHw, Side::B) => CounterClock::SideBFirst,
        (ChannelMode::Volume, _) => CounterClock::LaserTrigger,
    };

    let mut used = [false; 4];
    let mut outputs = Vec::with_capacity(count);
    for (index, channel) in settings.channels.iter().enumerate() {
        let output = channel
            .plogic_output
            .filter(|o| (PLOGIC_FIRST_LASER_OUTPUT..=PLOGIC_LAST_LASER_OUTPUT).contains(o))
            .ok_or_else(|| ValidationError::MissingPlogicOutput(channel.config.clone()))?;
        let slot = usize::from(output - PLOGIC_FIRST_LASER_OUTPUT);
        if used[slot] {
            return Err(ValidationError::DuplicatePlogicOutput(output));
        }
        used[slot] = true;

        // Counting from side B starts the counter one step ahead.
        let counter_match = match clock {
            CounterClock::SideBFirst => (index + 1) % count,
            CounterClock::LaserTrigger | CounterClock::SideAFirst => index,
        };
        outputs.push(ChannelOutput {
            channel: index,
            output,
            cell: output + plogic::CELL_OFFSET,
            counter_match,
            input_lsb: if counter_match & 0x01 != 0 {
                plogic::COUNTER_LSB
            } else {
                plogic::COUNTER_LSB + plogic::INVERT
            },
            input_msb: if counter_match & 0x02 != 0 {
                plogic::COUNTER_MSB
            } else {
                plogic::COUNTER_MSB + plogic::INVERT
            },
        });
    }

    Ok(ChannelSwitchProgram {
        clock,
        modulus: count,
        outputs,
    })
}

fn round_to_places(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::settings::{assemble, ChannelSpec, HardwareSnapshot, UserIntent};
    use crate::timing::{SliceTiming, TimingFields};

    fn settings(intent: UserIntent) -> AcquisitionSettings {
        let timing = SliceTiming::new(TimingFields {
            scan_delay_ms: 0.0,
            scan_num: 1,
            scan_period_ms: 10,
            laser_delay_ms: 0.0,
            laser_duration_ms: 10.0,
            camera_delay_ms: 0.0,
            camera_duration_ms: 10.0,
            camera_exposure_ms: 9.0,
        });
        let hw = HardwareSnapshot {
            num_positions: 1,
            ..Default::default()
        };
        assemble(&intent, &hw, timing, false)
    }

    #[test]
    fn test_piezo_sweep_centered_on_calibration() {
        let s = settings(UserIntent {
            num_slices: 11,
            step_size_um: 2.0,
            ..Default::default()
        });
        let program = build_controller_program(&s, &SetupConfig::default(), (0.0, 0.0), 0.0, 4)
            .unwrap();
        assert_eq!(program.sides.len(), 2);
        let a = &program.sides[0];
        assert_eq!(a.piezo_amplitude_um, 20.0);
        assert_eq!(a.piezo_center_um, 0.0);
        assert_eq!(a.sheet_amplitude_deg, 0.2);
        assert_eq!(a.num_slices, 11);
        assert_eq!(a.num_repeats, 1);
    }

    #[test]
    fn test_overlap_adds_trigger_and_shifts_center() {
        let s = settings(UserIntent {
            num_slices: 10,
            step_size_um: 1.0,
            camera_mode: CameraMode::Overlap,
            ..Default::default()
        });
        let program = build_controller_program(&s, &SetupConfig::default(), (0.0, 0.0), 0.0, 4)
            .unwrap();
        let a = &program.sides[0];
        assert_eq!(a.num_slices, 11);
        assert_eq!(a.piezo_amplitude_um, 10.0);
        assert_eq!(a.piezo_center_um, 0.5);
    }

    #[test]
    fn test_piezo_limits_enforced() {
        let s = settings(UserIntent {
            num_slices: 401,
            step_size_um: 1.0,
            ..Default::default()
        });
        let err = build_controller_program(&s, &SetupConfig::default(), (0.0, 0.0), 0.0, 4)
            .unwrap_err();
        assert!(matches!(err, ValidationError::PiezoOutOfRange { side: 'A', .. }));
    }

    #[test]
    fn test_stage_scan_parameters() {
        let s = settings(UserIntent {
            spim_mode: SpimMode::StageScan,
            num_slices: 100,
            step_size_um: 1.0,
            ..Default::default()
        });
        let program =
            build_controller_program(&s, &SetupConfig::default(), (1000.0, 2000.0), 0.0, 4)
                .unwrap();
        let scan = program.stage_scan.unwrap();
        assert!((scan.motor_speed - SQRT_2 / 10.0).abs() < 1e-12);
        let distance = 100.0 * SQRT_2;
        assert!((scan.fast_start_mm - (1000.0 - distance / 2.0) / 1000.0).abs() < 1e-12);
        assert_eq!(scan.slow_start_mm, 2.0);
        assert_eq!(scan.num_lines, 2);
        assert_eq!(scan.pattern, ScanPattern::Serpentine);
        assert_eq!(program.sides[0].piezo_amplitude_um, 0.0);
    }

    #[test]
    fn test_channel_switching_side_b_first_shifts_counter() {
        let s = settings(UserIntent {
            first_side: Side::B,
            use_channels: true,
            channel_mode: ChannelMode::VolumeHw,
            channels: vec![
                ChannelSpec::new("488").with_output(5),
                ChannelSpec::new("561").with_output(6),
                ChannelSpec::new("640").with_output(8),
            ],
            ..Default::default()
        });
        let program = build_channel_switching(&s, 4).unwrap();
        assert_eq!(program.clock, CounterClock::SideBFirst);
        assert_eq!(program.modulus, 3);
        let matches: Vec<usize> = program.outputs.iter().map(|o| o.counter_match).collect();
        assert_eq!(matches, vec![1, 2, 0]);
        assert_eq!(program.outputs[2].cell, 16);
        // match 0: both inputs inverted
        assert_eq!(program.outputs[2].input_lsb, 67);
        assert_eq!(program.outputs[2].input_msb, 68);
    }

    #[test]
    fn test_channel_switching_rejects_bad_outputs() {
        let s = settings(UserIntent {
            use_channels: true,
            channel_mode: ChannelMode::SliceHw,
            channels: vec![
                ChannelSpec::new("488").with_output(5),
                ChannelSpec::new("561").with_output(5),
            ],
            ..Default::default()
        });
        assert_eq!(
            build_channel_switching(&s, 4).unwrap_err(),
            ValidationError::DuplicatePlogicOutput(5)
        );

        let missing = settings(UserIntent {
            use_channels: true,
            channel_mode: ChannelMode::SliceHw,
            channels: vec![ChannelSpec::new("488").with_output(5), ChannelSpec::new("561")],
            ..Default::default()
        });
        assert!(matches!(
            build_channel_switching(&missing, 4).unwrap_err(),
            ValidationError::MissingPlogicOutput(ref c) if c == "561"
        ));
    }
}
