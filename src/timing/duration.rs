//! Volume, timepoint and time-lapse durations.
//!
//! Everything here is a pure function of a [`DurationModel`]. Nothing is
//! cached; callers rebuild the model whenever an input changes.

use crate::acquisition::modes::{CameraMode, ChannelMode, SpimMode};
use serde::Serialize;

/// Topology and timing inputs needed to estimate acquisition durations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationModel {
    /// 1 or 2
    pub num_sides: u8,
    /// Slices per volume
    pub num_slices: u32,
    /// Effective channel count (1 when channels are not used)
    pub num_channels: u32,
    /// When channels change
    pub channel_mode: ChannelMode,
    /// Camera trigger mode
    pub camera_mode: CameraMode,
    /// How the volume is scanned
    pub spim_mode: SpimMode,
    /// Derived slice duration
    pub slice_duration_ms: f64,
    /// Wait before each side's stack
    pub delay_before_side_ms: f64,
    /// Stage acceleration time, only used when stage scanning
    pub stage_accel_ms: f64,
    /// Number of positions, `None` when multi-position is off
    pub num_positions: Option<usize>,
    /// Wait after each move
    pub position_delay_ms: f64,
    /// Timepoints to acquire
    pub num_timepoints: u32,
    /// Start-to-start interval
    pub timepoint_interval_s: f64,
    /// Estimated cost of a software channel change
    pub channel_switch_overhead_ms: f64,
    /// Estimated cost of a stage move between positions
    pub position_move_overhead_ms: f64,
}

impl DurationModel {
    /// Duration of one volume in ms, including all sides and channels but not
    /// positions.
    pub fn volume_duration_ms(&self) -> f64 {
        let sides = f64::from(self.num_sides);
        let channels = f64::from(self.num_channels.max(1));
        let mut triggers = self.num_slices;
        if self.camera_mode.extra_trigger_per_stack() {
            triggers += 1;
        }
        let stack = f64::from(triggers) * self.slice_duration_ms;
        let per_slice_channels = matches!(self.channel_mode, ChannelMode::SliceHw);

        match self.spim_mode {
            SpimMode::StageScan => {
                let ramp = self.delay_before_side_ms + self.stage_accel_ms;
                if per_slice_channels {
                    sides * (ramp * 2.0 + stack * channels)
                } else {
                    sides * (ramp * 2.0 + stack) * channels
                }
            }
            SpimMode::StageScanInterleaved => {
                let ramp = self.delay_before_side_ms + self.stage_accel_ms;
                if per_slice_channels {
                    ramp * 2.0 + stack * sides * channels
                } else {
                    (ramp * 2.0 + stack * sides) * channels
                }
            }
            SpimMode::PiezoSliceScan
            | SpimMode::SliceScanOnly
            | SpimMode::PiezoScanOnly
            | SpimMode::NoScan => match self.channel_mode {
                ChannelMode::SliceHw => sides * (self.delay_before_side_ms + stack * channels),
                ChannelMode::VolumeHw => sides * channels * (self.delay_before_side_ms + stack),
                ChannelMode::Volume => {
                    sides * channels * (self.delay_before_side_ms + stack)
                        + (channels - 1.0) * self.channel_switch_overhead_ms
                }
            },
        }
    }

    /// Duration of one timepoint in ms: one volume, or one volume per position
    /// plus move and settle overhead.
    pub fn timepoint_duration_ms(&self) -> f64 {
        let volume = self.volume_duration_ms();
        match self.num_positions {
            Some(n) => {
                n as f64 * (volume + self.position_move_overhead_ms + self.position_delay_ms)
            }
            None => volume,
        }
    }

    /// Total time-lapse duration in seconds.
    pub fn time_lapse_duration_s(&self) -> f64 {
        f64::from(self.num_timepoints.max(1) - 1) * self.timepoint_interval_s
            + self.timepoint_duration_ms() / 1000.0
    }
}

/// Human-readable time-lapse duration: `"N s"`, `"M min S s"` or `"H hr M min"`.
pub fn format_time_lapse(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{} s", trim_number(seconds))
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let rest = (seconds % 60.0).round();
        format!("{minutes:.0} min {rest:.0} s")
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).round();
        format!("{hours:.0} hr {minutes:.0} min")
    }
}

fn trim_number(value: f64) -> String {
    let text = format!("{value:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
