//! # spim_daq
//!
//! Acquisition timing and sequencing engine for dual-view light-sheet (diSPIM)
//! microscopes. Turns an operator's intent (exposure, slice period, slices,
//! channels, positions, timepoints) into a validated trigger plan and runs it
//! repeatedly against the microscope hardware.
//!
//! ## Crate Structure
//!
//! - **`timing`**: the per-slice trigger waveform (`SliceTiming`), its
//!   synthesis from desired period and exposure, and volume/time-lapse
//!   durations.
//! - **`acquisition`**: settings snapshot, feasibility checks, controller
//!   programme and the `Sequencer` that runs acquisitions.
//! - **`hardware`**: async capability traits for every collaborator the
//!   engine drives, plus a mock microscope.
//! - **`config`**: figment-backed configuration (`config/spim.toml` plus
//!   `SPIM_DAQ_` environment overrides).
//! - **`error`**: `SpimError` and `ValidationError`.
//! - **`tracing_setup`**: subscriber initialisation.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod timing;
pub mod tracing_setup;

pub use error::{AppResult, SpimError, ValidationError};
