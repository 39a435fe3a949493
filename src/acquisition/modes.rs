//! Operating modes.
//!
//! Every decision that depends on how the microscope scans, how the camera is
//! triggered, or how channels are switched matches exhaustively on one of these
//! enums, so adding a variant is caught by the compiler at each decision point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the light sheet and imaging plane are swept through the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpimMode {
    /// Piezo moves the objective while the scanner moves the sheet.
    #[default]
    PiezoSliceScan,
    /// Only the sheet moves; the piezo holds still.
    SliceScanOnly,
    /// Only the piezo moves; the sheet holds still.
    PiezoScanOnly,
    /// The XY stage sweeps the sample through a fixed sheet, one side at a time.
    StageScan,
    /// Stage scan alternating sides slice by slice.
    StageScanInterleaved,
    /// Nothing moves; repeated images of one plane.
    NoScan,
}

impl SpimMode {
    /// Stage moves during the volume.
    pub fn is_stage_scan(self) -> bool {
        match self {
            SpimMode::StageScan | SpimMode::StageScanInterleaved => true,
            SpimMode::PiezoSliceScan
            | SpimMode::SliceScanOnly
            | SpimMode::PiezoScanOnly
            | SpimMode::NoScan => false,
        }
    }

    /// Whether the controller sweeps a piezo range for this mode.
    pub fn sweeps_piezo(self) -> bool {
        match self {
            SpimMode::PiezoSliceScan | SpimMode::SliceScanOnly | SpimMode::PiezoScanOnly => true,
            SpimMode::StageScan | SpimMode::StageScanInterleaved | SpimMode::NoScan => false,
        }
    }
}

impl fmt::Display for SpimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpimMode::PiezoSliceScan => "Synchronous piezo/slice scan",
            SpimMode::SliceScanOnly => "Slice scan only",
            SpimMode::PiezoScanOnly => "Piezo scan only",
            SpimMode::StageScan => "Stage scan",
            SpimMode::StageScanInterleaved => "Stage scan interleaved",
            SpimMode::NoScan => "No scan (fixed sheet)",
        };
        f.write_str(name)
    }
}

/// Camera trigger scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    /// Exposure starts on the trigger edge and is programmed in the camera.
    #[default]
    Edge,
    /// Synchronous readout; exposure is the spacing between trigger pulses.
    Overlap,
    /// Overlap-like mode with a short fixed readout gap.
    PseudoOverlap,
    /// Exposure lasts as long as the trigger is held high.
    Level,
}

impl CameraMode {
    /// Whether readout overlaps the next exposure, which changes the readout
    /// time the camera reports.
    pub fn reads_out_during_exposure(self) -> bool {
        match self {
            CameraMode::Overlap | CameraMode::PseudoOverlap => true,
            CameraMode::Edge | CameraMode::Level => false,
        }
    }

    /// Overlap mode takes one extra trigger per stack; the last frame is discarded
    /// by the camera.
    pub fn extra_trigger_per_stack(self) -> bool {
        matches!(self, CameraMode::Overlap)
    }
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraMode::Edge => "Edge trigger",
            CameraMode::Overlap => "Overlap/synchronous",
            CameraMode::PseudoOverlap => "Pseudo overlap",
            CameraMode::Level => "Level trigger",
        };
        f.write_str(name)
    }
}

/// How the sequencer changes channels between acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Software selects each channel before a volume.
    #[default]
    Volume,
    /// The controller switches channel between volumes.
    VolumeHw,
    /// The controller switches channel every slice.
    SliceHw,
}

impl ChannelMode {
    /// The controller switches channels through PLogic.
    pub fn is_hardware(self) -> bool {
        match self {
            ChannelMode::VolumeHw | ChannelMode::SliceHw => true,
            ChannelMode::Volume => false,
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelMode::Volume => "Every volume (software)",
            ChannelMode::VolumeHw => "Every volume (PLogic)",
            ChannelMode::SliceHw => "Every slice (PLogic)",
        };
        f.write_str(name)
    }
}

/// One of the two imaging paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Side {
    /// First imaging path.
    #[default]
    A,
    /// Second imaging path.
    B,
}

impl Side {
    /// The opposite path.
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Path letter as shown to the operator.
    pub fn letter(self) -> char {
        match self {
            Side::A => 'A',
            Side::B => 'B',
        }
    }

    /// The sides that will be imaged, in acquisition order.
    pub fn active_sides(num_sides: u8, first: Side) -> Vec<Side> {
        if num_sides > 1 {
            vec![first, first.other()]
        } else {
            vec![first]
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}
