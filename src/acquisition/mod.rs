//! Acquisition Planning and Sequencing
//!
//! Settings flow one way through this module:
//!
//! ```text
//! UserIntent ─> settings::plan_timing ─> settings::assemble ─> validator::validate
//!                                                                     │
//!                                     sequencer::Sequencer <─ ValidatedSettings
//! ```
//!
//! - [`modes`]: closed enums for scan, camera and channel modes
//! - [`settings`]: operator intent and the immutable per-run snapshot
//! - [`validator`]: ordered feasibility checks
//! - [`program`]: what is pushed to the trigger controller
//! - [`sequencer`]: the run loop, with [`context`], [`state`], [`status`] and
//!   [`cleanup`] supporting it

pub mod cleanup;
pub mod context;
pub mod modes;
pub mod program;
pub mod sequencer;
pub mod settings;
pub mod state;
pub mod status;
pub mod validator;

pub use context::{AcquisitionContext, HardwareLock};
pub use modes::{CameraMode, ChannelMode, Side, SpimMode};
pub use program::ControllerProgram;
pub use sequencer::{RunRequest, Sequencer, TestRun};
pub use settings::{AcquisitionSettings, ChannelSpec, HardwareSnapshot, UserIntent};
pub use state::{SequencerEvent, SequencerState};
pub use status::{AcquisitionStatus, RunOutcome, RunReport, StatusSink};
pub use validator::{validate, ValidatedSettings, ValidationWarning};
