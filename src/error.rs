//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `SpimError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur between the moment a user asks for
//! an acquisition and the moment the hardware is released again.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically related to file parsing
//!   or type mismatches in the configuration files.
//! - **`Configuration`**: Semantic errors in a configuration that parsed correctly
//!   (e.g. a zero sheet calibration slope).
//! - **`Validation`**: A feasibility check refused the acquisition before any device
//!   state was touched. See [`ValidationError`] for the individual reasons.
//! - **`Hardware`**: A collaborator (controller, camera, stage, ...) returned an error.
//!   Fatal to the current run; device state is restored before this is returned.
//! - **`AlreadyRequested`** / **`InvalidTransition`**: Sequencer lifecycle misuse.
//!
//! Cancellation is deliberately not an error; it is reported through
//! [`crate::acquisition::status::RunOutcome::Cancelled`].

use crate::acquisition::state::{SequencerEvent, SequencerState};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SpimError>;

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum SpimError {
    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but holds values that cannot be used.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The acquisition was refused by a feasibility check.
    #[error("Acquisition refused: {0}")]
    Validation(#[from] ValidationError),

    /// A hardware collaborator call failed.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A run was requested while another one is still requested or running.
    #[error("Another acquisition has already been requested")]
    AlreadyRequested,

    /// The sequencer state machine rejected an event.
    #[error("Invalid sequencer transition: {event:?} while {state}")]
    InvalidTransition {
        /// State the sequencer was in
        state: SequencerState,
        /// Event that was rejected
        event: SequencerEvent,
    },

    /// Reading an acquisition intent file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An acquisition intent file could not be parsed.
    #[error("Failed to parse acquisition intent: {0}")]
    IntentParse(#[from] toml::de::Error),
}

impl From<anyhow::Error> for SpimError {
    fn from(err: anyhow::Error) -> Self {
        SpimError::Hardware(format!("{err:#}"))
    }
}

impl SpimError {
    /// True if the error was raised before any device state was changed.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            SpimError::Validation(_)
                | SpimError::AlreadyRequested
                | SpimError::Config(_)
                | SpimError::Configuration(_)
                | SpimError::IntentParse(_)
        )
    }
}

/// User-facing reasons for refusing an acquisition.
///
/// Each variant corresponds to exactly one feasibility check, so callers can
/// match on the reason rather than on message text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Another acquisition or autofocus holds the hardware.
    #[error("Hardware is being used by something else (maybe autofocus?)")]
    HardwareInUse,

    /// A side in use has no camera.
    #[error("Please select a valid camera for the {position} side (imaging path {side})")]
    CameraNotAssigned {
        /// "first" or "second"
        position: &'static str,
        /// Imaging path letter
        side: char,
    },

    /// The two cameras disagree on ROI size.
    #[error("Camera ROI height and width must be equal on both cameras ({first_w}x{first_h} vs {second_w}x{second_h})")]
    RoiMismatch {
        /// First camera width
        first_w: u32,
        /// First camera height
        first_h: u32,
        /// Second camera width
        second_w: u32,
        /// Second camera height
        second_h: u32,
    },

    /// The camera cannot finish a frame within one slice.
    #[error("Exposure time of {exposure_ms} ms plus readout time of {readout_ms} ms exceeds the slice duration of {slice_ms} ms; frames would be dropped")]
    ExposureExceedsSlice {
        /// Camera exposure
        exposure_ms: f64,
        /// Camera readout
        readout_ms: f64,
        /// Slice duration
        slice_ms: f64,
    },

    /// Stage scanning without scan firmware.
    #[error("Must have stage with scan-enabled firmware for stage scanning")]
    StageScanUnsupported,

    /// Interleaved stage scan with one side.
    #[error("Interleaved stage scan is only possible for two-sided acquisition")]
    InterleavedNeedsTwoSides,

    /// Interleaved stage scan in overlap mode.
    #[error("Interleaved stage scan is not compatible with overlap camera mode")]
    InterleavedWithOverlap,

    /// Channels enabled but none selected.
    #[error("\"Channels\" is checked, but no channels are selected")]
    NoChannelsSelected,

    /// Per-volume hardware switching with one side.
    #[error("Cannot do hardware channel switching per volume when only one side is selected")]
    VolumeSwitchingNeedsTwoSides,

    /// Hardware switching without PLogic.
    #[error("Hardware channel switching requires a PLogic card")]
    PlogicRequired,

    /// More channels than PLogic outputs.
    #[error("Hardware channel switching supports 1 to {max} channels, got {requested}")]
    TooManyHardwareChannels {
        /// Channels selected
        requested: usize,
        /// PLogic outputs available
        max: usize,
    },

    /// A channel has no PLogic output.
    #[error("Channel \"{0}\" must map to a PLogic output between 5 and 8 for hardware switching")]
    MissingPlogicOutput(String),

    /// Two channels share a PLogic output.
    #[error("Multiple channels cannot use the same laser output {0} for PLogic triggering")]
    DuplicatePlogicOutput(u8),

    /// Positions enabled with an empty list.
    #[error("\"Positions\" is checked, but no positions are in the position list")]
    NoPositions,

    /// Timepoint interval shorter than one volume.
    #[error("Time point interval of {interval_ms} ms is shorter than the {volume_ms} ms needed to collect a single volume")]
    IntervalShorterThanVolume {
        /// Requested interval
        interval_ms: f64,
        /// Time one volume takes
        volume_ms: f64,
    },

    /// Autofocus preset not in the channel group.
    #[error("Invalid autofocus channel \"{0}\" selected")]
    InvalidAutofocusChannel(String),

    /// Sheet calibration slope is zero.
    #[error("Calibration slope for side {0} cannot be zero; redo the sheet calibration")]
    ZeroSheetRate(char),

    /// Piezo travel beyond its limits.
    #[error("Imaging piezo for side {side} would travel outside its limits ({low_um:.1}..{high_um:.1} um)")]
    PiezoOutOfRange {
        /// Imaging path letter
        side: char,
        /// Lower travel limit
        low_um: f64,
        /// Upper travel limit
        high_um: f64,
    },
}
