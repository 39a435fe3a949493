//! Acquisition settings snapshot.
//!
//! [`UserIntent`] is what the operator asked for. [`HardwareSnapshot`] is what
//! the devices reported at the moment the run was requested. [`assemble`]
//! combines the two with a freshly computed [`SliceTiming`] into an
//! [`AcquisitionSettings`] value that the rest of the pipeline only reads.

use super::modes::{CameraMode, ChannelMode, Side, SpimMode};
use crate::config::{ControllerConfig, SequencerConfig};
use crate::hardware::Roi;
use crate::timing::synthesizer::{from_advanced, synthesize, Synthesis, SynthesisRequest};
use crate::timing::{DurationModel, SliceTiming, TimingFields};
use serde::{Deserialize, Serialize};

/// One channel preset in the channel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Preset name within the channel group
    pub config: String,
    /// PLogic BNC output (5-8) the preset drives, needed for hardware switching
    #[serde(default)]
    pub plogic_output: Option<u8>,
    /// Disabled presets are kept but skipped
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelSpec {
    /// Enabled preset without a PLogic output.
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            plogic_output: None,
            enabled: true,
        }
    }

    /// Drive PLogic output `output` for this preset.
    pub fn with_output(mut self, output: u8) -> Self {
        self.plogic_output = Some(output);
        self
    }
}

fn default_true() -> bool {
    true
}

/// Everything the operator chose for the next acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIntent {
    /// 1 or 2
    pub num_sides: u8,
    /// Side imaged first
    pub first_side: Side,
    /// Slices per volume
    pub num_slices: u32,
    /// Distance between slices
    pub step_size_um: f64,
    /// Wait before each side's stack
    pub delay_before_side_ms: f64,
    /// How the volume is scanned
    pub spim_mode: SpimMode,
    /// Camera trigger mode
    pub camera_mode: CameraMode,

    /// Acquire more than one channel
    pub use_channels: bool,
    /// When channels change
    pub channel_mode: ChannelMode,
    /// Preset group holding the channels
    pub channel_group: String,
    /// Channel presets, in acquisition order
    pub channels: Vec<ChannelSpec>,

    /// Acquire more than one timepoint
    pub use_timepoints: bool,
    /// Timepoints to acquire
    pub num_timepoints: u32,
    /// Start-to-start interval
    pub timepoint_interval_s: f64,
    /// Store each timepoint as its own dataset
    pub separate_timepoints: bool,

    /// Visit every entry in the position list
    pub use_multi_positions: bool,
    /// Wait after each move
    pub position_delay_ms: f64,

    /// When set, `desired_slice_period_ms` is ignored
    pub minimize_slice_period: bool,
    /// Requested slice period
    pub desired_slice_period_ms: f64,
    /// Requested sample light exposure
    pub desired_light_exposure_ms: f64,
    /// Manual timing; bypasses synthesis entirely
    pub advanced_timing: Option<TimingFields>,

    /// Run autofocus during the acquisition
    pub use_autofocus: bool,
    /// Focus before the first timepoint
    pub autofocus_before_start: bool,
    /// Focus every N timepoints (0 disables periodic focus)
    pub autofocus_every_n: u32,
    /// Preset selected while focusing
    pub autofocus_channel: String,

    /// Name handed to the image sink
    pub name: String,
}

impl Default for UserIntent {
    fn default() -> Self {
        Self {
            num_sides: 2,
            first_side: Side::A,
            num_slices: 20,
            step_size_um: 1.0,
            delay_before_side_ms: 0.0,
            spim_mode: SpimMode::PiezoSliceScan,
            camera_mode: CameraMode::Edge,
            use_channels: false,
            channel_mode: ChannelMode::Volume,
            channel_group: "Channel".to_string(),
            channels: Vec::new(),
            use_timepoints: false,
            num_timepoints: 1,
            timepoint_interval_s: 1.0,
            separate_timepoints: false,
            use_multi_positions: false,
            position_delay_ms: 0.0,
            minimize_slice_period: true,
            desired_slice_period_ms: 30.0,
            desired_light_exposure_ms: 8.0,
            advanced_timing: None,
            use_autofocus: false,
            autofocus_before_start: false,
            autofocus_every_n: 10,
            autofocus_channel: String::new(),
            name: "acq".to_string(),
        }
    }
}

impl UserIntent {
    /// Parse an intent from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Adjust the intent for a quick test acquisition.
    ///
    /// One timepoint, no autofocus, optionally a single side. Per-volume
    /// hardware switching needs both sides, so a single-sided test run falls
    /// back to software switching.
    pub fn for_test_run(&self, side: Option<Side>) -> UserIntent {
        let mut intent = self.clone();
        intent.use_timepoints = false;
        intent.num_timepoints = 1;
        intent.use_autofocus = false;
        if let Some(side) = side {
            intent.num_sides = 1;
            intent.first_side = side;
        }
        if intent.use_channels
            && intent.channel_mode == ChannelMode::VolumeHw
            && intent.num_sides < 2
        {
            intent.channel_mode = ChannelMode::Volume;
        }
        intent
    }

    /// Sides in acquisition order.
    pub fn active_sides(&self) -> Vec<Side> {
        Side::active_sides(self.num_sides, self.first_side)
    }

    /// Channels that will be acquired.
    pub fn enabled_channels(&self) -> Vec<ChannelSpec> {
        self.channels.iter().filter(|c| c.enabled).cloned().collect()
    }
}

/// Reset and readout overhead of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CameraOverhead {
    /// Trigger to global exposure
    pub reset_ms: f64,
    /// Readout for the current ROI
    pub readout_ms: f64,
}

/// Camera state for one imaging path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideCamera {
    /// Camera identifier
    pub camera: String,
    /// Current region of interest
    pub roi: Roi,
    /// Timing overhead
    pub overhead: CameraOverhead,
}

/// Device readings taken when the run was requested.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HardwareSnapshot {
    /// Camera on path A
    pub side_a: Option<SideCamera>,
    /// Camera on path B
    pub side_b: Option<SideCamera>,
    /// Max of the two scanner filter cutoffs
    pub scan_filter_freq_khz: f64,
    /// Stage reports scan-enabled firmware
    pub stage_scan_capable: bool,
    /// Stage X acceleration time
    pub stage_accel_ms: f64,
    /// Entries in the position list
    pub num_positions: usize,
    /// Presets present in the channel group
    pub available_channel_configs: Vec<String>,
}

impl HardwareSnapshot {
    /// Camera on one imaging path.
    pub fn camera(&self, side: Side) -> Option<&SideCamera> {
        match side {
            Side::A => self.side_a.as_ref(),
            Side::B => self.side_b.as_ref(),
        }
    }

    /// Worst-case overhead over the cameras that will be used.
    pub fn overhead_for(&self, sides: &[Side]) -> CameraOverhead {
        sides
            .iter()
            .filter_map(|s| self.camera(*s))
            .fold(CameraOverhead::default(), |acc, cam| CameraOverhead {
                reset_ms: acc.reset_ms.max(cam.overhead.reset_ms),
                readout_ms: acc.readout_ms.max(cam.overhead.readout_ms),
            })
    }
}

/// Compute the slice timing for an intent.
///
/// Advanced timing is taken verbatim; otherwise the timing is synthesized from
/// the requested period and exposure.
pub fn plan_timing(
    intent: &UserIntent,
    hw: &HardwareSnapshot,
    controller: &ControllerConfig,
) -> Synthesis {
    if let Some(fields) = intent.advanced_timing {
        return Synthesis {
            timing: from_advanced(fields),
            period_extended_by_ms: None,
        };
    }
    let overhead = hw.overhead_for(&intent.active_sides());
    synthesize(&SynthesisRequest {
        desired_period_ms: if intent.minimize_slice_period {
            0.0
        } else {
            intent.desired_slice_period_ms
        },
        desired_exposure_ms: intent.desired_light_exposure_ms,
        camera_reset_ms: overhead.reset_ms,
        camera_readout_ms: overhead.readout_ms,
        camera_mode: intent.camera_mode,
        scan_filter_freq_khz: hw.scan_filter_freq_khz,
        controller_has_extra_latency: controller.has_plogic,
    })
}

/// Immutable per-run settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionSettings {
    /// Dataset name
    pub name: String,
    /// Quick test run; nothing is stored
    pub is_test: bool,

    /// 1 or 2
    pub num_sides: u8,
    /// Side imaged first
    pub first_side: Side,
    /// Slices per volume
    pub num_slices: u32,
    /// Distance between slices
    pub step_size_um: f64,
    /// Wait before each side's stack
    pub delay_before_side_ms: f64,

    /// Acquire more than one channel
    pub use_channels: bool,
    /// When channels change
    pub channel_mode: ChannelMode,
    /// Number of enabled channels, 1 when channels are off
    pub num_channels: u32,
    /// Enabled channel presets
    pub channels: Vec<ChannelSpec>,
    /// Preset group holding the channels
    pub channel_group: String,

    /// Acquire more than one timepoint
    pub use_timepoints: bool,
    /// Timepoints to acquire
    pub num_timepoints: u32,
    /// Start-to-start interval
    pub timepoint_interval_s: f64,
    /// Decided by the validator, never by the operator
    pub hardware_timepoints: bool,
    /// Store each timepoint as its own dataset
    pub separate_timepoints: bool,

    /// Visit every entry in the position list
    pub use_multi_positions: bool,
    /// Entries in the position list
    pub num_positions: usize,
    /// Wait after each move
    pub position_delay_ms: f64,

    /// How the volume is scanned
    pub spim_mode: SpimMode,
    /// Stage moves during the volume
    pub is_stage_scanning: bool,
    /// Camera trigger mode
    pub camera_mode: CameraMode,

    /// Timing sent to the controller
    pub slice_timing: SliceTiming,
    /// Worst-case camera overhead
    pub camera_overhead: CameraOverhead,
    /// Stage X acceleration time
    pub stage_accel_ms: f64,

    /// Shortest period was asked for
    pub minimize_slice_period: bool,
    /// Requested slice period
    pub desired_slice_period_ms: f64,
    /// Requested sample light exposure
    pub desired_light_exposure_ms: f64,

    /// Run autofocus during the acquisition
    pub use_autofocus: bool,
    /// Focus before the first timepoint
    pub autofocus_before_start: bool,
    /// Focus every N timepoints
    pub autofocus_every_n: u32,
    /// Preset selected while focusing
    pub autofocus_channel: String,
}

/// Combine intent, device readings and timing into a settings snapshot.
pub fn assemble(
    intent: &UserIntent,
    hw: &HardwareSnapshot,
    timing: SliceTiming,
    is_test: bool,
) -> AcquisitionSettings {
    let channels = if intent.use_channels {
        intent.enabled_channels()
    } else {
        Vec::new()
    };
    let num_channels = if intent.use_channels {
        channels.len() as u32
    } else {
        1
    };
    let num_timepoints = if intent.use_timepoints {
        intent.num_timepoints.max(1)
    } else {
        1
    };

    AcquisitionSettings {
        name: intent.name.clone(),
        is_test,
        num_sides: intent.num_sides.clamp(1, 2),
        first_side: intent.first_side,
        num_slices: intent.num_slices.max(1),
        step_size_um: intent.step_size_um,
        delay_before_side_ms: intent.delay_before_side_ms,
        use_channels: intent.use_channels,
        channel_mode: intent.channel_mode,
        num_channels,
        channels,
        channel_group: intent.channel_group.clone(),
        use_timepoints: intent.use_timepoints,
        num_timepoints,
        timepoint_interval_s: intent.timepoint_interval_s,
        hardware_timepoints: false,
        separate_timepoints: intent.separate_timepoints,
        use_multi_positions: intent.use_multi_positions,
        num_positions: if intent.use_multi_positions {
            hw.num_positions
        } else {
            1
        },
        position_delay_ms: intent.position_delay_ms,
        spim_mode: intent.spim_mode,
        is_stage_scanning: intent.spim_mode.is_stage_scan(),
        camera_mode: intent.camera_mode,
        slice_timing: timing,
        camera_overhead: hw.overhead_for(&intent.active_sides()),
        stage_accel_ms: hw.stage_accel_ms,
        minimize_slice_period: intent.minimize_slice_period,
        desired_slice_period_ms: intent.desired_slice_period_ms,
        desired_light_exposure_ms: intent.desired_light_exposure_ms,
        use_autofocus: intent.use_autofocus,
        autofocus_before_start: intent.autofocus_before_start,
        autofocus_every_n: intent.autofocus_every_n,
        autofocus_channel: intent.autofocus_channel.clone(),
    }
}

impl AcquisitionSettings {
    /// Sides in acquisition order.
    pub fn active_sides(&self) -> Vec<Side> {
        Side::active_sides(self.num_sides, self.first_side)
    }

    /// Both sides are imaged.
    pub fn two_sided(&self) -> bool {
        self.num_sides > 1
    }

    /// Interval between timepoint starts in ms.
    pub fn timepoint_interval_ms(&self) -> f64 {
        (self.timepoint_interval_s * 1000.0).round()
    }

    /// Channel mode actually in effect, `None` when channels are off.
    pub fn effective_channel_mode(&self) -> Option<ChannelMode> {
        self.use_channels.then_some(self.channel_mode)
    }

    /// Hardware switching is only programmed for two or more channels.
    pub fn uses_hardware_switching(&self) -> bool {
        self.use_channels && self.channel_mode.is_hardware() && self.num_channels > 1
    }

    /// Duration model for these settings.
    pub fn duration_model(&self, cfg: &SequencerConfig) -> DurationModel {
        DurationModel {
            num_sides: self.num_sides,
            num_slices: self.num_slices,
            num_channels: self.num_channels,
            channel_mode: self.channel_mode,
            camera_mode: self.camera_mode,
            spim_mode: self.spim_mode,
            slice_duration_ms: self.slice_timing.slice_duration_ms(),
            delay_before_side_ms: self.delay_before_side_ms,
            stage_accel_ms: self.stage_accel_ms,
            num_positions: self.use_multi_positions.then_some(self.num_positions),
            position_delay_ms: self.position_delay_ms,
            num_timepoints: self.num_timepoints,
            timepoint_interval_s: self.timepoint_interval_s,
            channel_switch_overhead_ms: cfg.channel_switch_overhead_ms,
            position_move_overhead_ms: cfg.position_move_overhead_ms,
        }
    }

    /// Time to acquire one volume in ms.
    pub fn volume_duration_ms(&self, cfg: &SequencerConfig) -> f64 {
        self.duration_model(cfg).volume_duration_ms()
    }

    /// Time to acquire one timepoint in ms.
    pub fn timepoint_duration_ms(&self, cfg: &SequencerConfig) -> f64 {
        self.duration_model(cfg).timepoint_duration_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(name: &str, reset: f64, readout: f64) -> SideCamera {
        SideCamera {
            camera: name.to_string(),
            roi: Roi {
                x: 0,
                y: 0,
                width: 2048,
                height: 256,
            },
            overhead: CameraOverhead {
                reset_ms: reset,
                readout_ms: readout,
            },
        }
    }

    #[test]
    fn test_overhead_is_max_over_active_cameras() {
        let hw = HardwareSnapshot {
            side_a: Some(camera("A", 0.5, 9.0)),
            side_b: Some(camera("B", 0.75, 8.0)),
            ..Default::default()
        };
        let both = hw.overhead_for(&[Side::A, Side::B]);
        assert_eq!(both.reset_ms, 0.75);
        assert_eq!(both.readout_ms, 9.0);

        let only_b = hw.overhead_for(&[Side::B]);
        assert_eq!(only_b.readout_ms, 8.0);
    }

    #[test]
    fn test_test_run_overrides() {
        let intent = UserIntent {
            use_timepoints: true,
            num_timepoints: 50,
            use_autofocus: true,
            use_channels: true,
            channel_mode: ChannelMode::VolumeHw,
            ..Default::default()
        };

        let test = intent.for_test_run(Some(Side::B));
        assert_eq!(test.num_timepoints, 1);
        assert!(!test.use_autofocus);
        assert_eq!(test.num_sides, 1);
        assert_eq!(test.first_side, Side::B);
        assert_eq!(test.channel_mode, ChannelMode::Volume);

        let both_sides = intent.for_test_run(None);
        assert_eq!(both_sides.channel_mode, ChannelMode::VolumeHw);
    }

    #[test]
    fn test_assemble_counts_enabled_channels() {
        let mut disabled = ChannelSpec::new("561");
        disabled.enabled = false;
        let intent = UserIntent {
            use_channels: true,
            channels: vec![ChannelSpec::new("488"), disabled, ChannelSpec::new("640")],
            ..Default::default()
        };
        let settings = assemble(&intent, &HardwareSnapshot::default(), SliceTiming::default(), false);
        assert_eq!(settings.num_channels, 2);
        assert_eq!(settings.channels[1].config, "640");
        assert!(!settings.hardware_timepoints);

        let no_channels = assemble(
            &UserIntent::default(),
            &HardwareSnapshot::default(),
            SliceTiming::default(),
            false,
        );
        assert_eq!(no_channels.num_channels, 1);
        assert_eq!(no_channels.effective_channel_mode(), None);
    }

    #[test]
    fn test_plan_timing_respects_minimize_flag() {
        let hw = HardwareSnapshot {
            side_a: Some(camera("A", 0.5, 10.0)),
            side_b: Some(camera("B", 0.5, 10.0)),
            ..Default::default()
        };
        let controller = ControllerConfig {
            has_plogic: false,
            ..Default::default()
        };
        let minimized = plan_timing(&UserIntent::default(), &hw, &controller);
        let explicit = plan_timing(
            &UserIntent {
                minimize_slice_period: false,
                desired_slice_period_ms: 40.0,
                ..Default::default()
            },
            &hw,
            &controller,
        );
        assert!(minimized.period_was_extended());
        assert!(!explicit.period_was_extended());
        assert_eq!(explicit.timing.slice_duration_ms(), 40.0);
    }

    #[test]
    fn test_intent_from_toml() {
        let intent = UserIntent::from_toml(
            r#"
            num_slices = 50
            camera_mode = "overlap"
            use_channels = true
            channel_mode = "slice_hw"

            [[channels]]
            config = "488"
            plogic_output = 5
            "#,
        )
        .unwrap();
        assert_eq!(intent.num_slices, 50);
        assert_eq!(intent.camera_mode, CameraMode::Overlap);
        assert_eq!(intent.channels[0].plogic_output, Some(5));
        assert!(intent.channels[0].enabled);
        assert_eq!(intent.num_sides, 2);
    }
}
