//! Collaborator Capabilities
//!
//! The acquisition engine never talks to a device directly. Everything it needs
//! from the microscope is expressed as a small capability trait, and the
//! sequencer receives a [`Microscope`] bundle of trait objects:
//!
//! - The trigger controller implements [`SpimController`]
//! - The two SPIM cameras are reached through [`CameraBank`]
//! - Raw device properties (filter cutoff, stage acceleration, ...) come from [`PropertyStore`]
//! - Stage positions and the position list come from [`PositionStore`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE collaborator
//!
//! Any error returned from these traits is treated as fatal to the current
//! run. The sequencer restores device state and releases the hardware lock
//! before reporting it.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn camera_overhead(cameras: &dyn CameraBank, side: Side) -> Result<f64> {
//!     let camera = cameras
//!         .camera_for(side)
//!         .ok_or_else(|| anyhow::anyhow!("no camera on side {side}"))?;
//!     let reset = cameras.reset_time_ms(&camera, CameraMode::Edge).await?;
//!     let readout = cameras.readout_time_ms(&camera, false).await?;
//!     Ok(reset + readout)
//! }
//! ```

use crate::acquisition::modes::{CameraMode, Side, SpimMode};
use crate::acquisition::program::ControllerProgram;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Well-known device and property names read through [`PropertyStore`].
pub mod props {
    /// Scanner (micro-mirror) for imaging path A
    pub const SCANNER_A: &str = "ScannerA";
    /// Scanner (micro-mirror) for imaging path B
    pub const SCANNER_B: &str = "ScannerB";
    /// XY stage
    pub const XY_STAGE: &str = "XYStage";

    /// Scanner analog filter cutoff, kHz
    pub const FILTER_FREQ_X: &str = "FilterFreqX(kHz)";
    /// Stage X acceleration time, ms
    pub const ACCELERATION_X: &str = "AccelerationX-AC(ms)";
    /// Stage-scan motor speed, mm/s
    pub const STAGESCAN_MOTOR_SPEED: &str = "MotorSpeedX-S(mm/s)";
    /// Present only on scan-enabled stage firmware
    pub const STAGESCAN_NUM_LINES: &str = "ScanNumLines";
}

/// Camera region of interest in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Roi {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

/// A single image as delivered by a camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identifier of the camera that produced the frame
    pub camera: String,
    /// Sequence number within the camera's current sequence
    pub sequence: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major 16-bit pixels
    pub pixels: Vec<u16>,
}

/// Where a frame belongs in the acquisition's hyperstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameCoords {
    /// 0-based timepoint
    pub timepoint: u32,
    /// Combined channel/side index (second camera on odd indices when two-sided)
    pub channel: usize,
    /// 0-based slice within the stack
    pub slice: u32,
    /// Position list index
    pub position: usize,
    /// Milliseconds since the acquisition started
    pub elapsed_ms: u64,
}

/// Capability: SPIM Trigger Controller
///
/// The controller runs the per-slice trigger program and sequences slices,
/// sides and (optionally) repeats on its own once triggered.
///
/// # Contract
/// - `program` may be called more than once per run (after autofocus, or at
///   every software-timed repeat); each call fully replaces the previous program
/// - `trigger` starts one programmed sequence and returns without waiting for it
/// - `clean_up` returns the controller to its idle state and must be safe to
///   call even if `program` never succeeded
#[async_trait]
pub trait SpimController: Send + Sync {
    /// Push a complete program to the controller.
    async fn program(&self, program: &ControllerProgram) -> Result<()>;

    /// Start the programmed sequence.
    ///
    /// Stage-scan modes are started through the stage; other modes through the
    /// scanner of `first_side`.
    async fn trigger(&self, mode: SpimMode, first_side: Side) -> Result<()>;

    /// Return the controller to its idle state.
    async fn clean_up(&self, sides: &[Side]) -> Result<()>;
}

/// Capability: SPIM Camera Pair
///
/// # Contract
/// - Camera identifiers are opaque strings
/// - `next_frame` returns `Ok(None)` on timeout, never an error
/// - Frames from both cameras arrive through a single shared buffer
#[async_trait]
pub trait CameraBank: Send + Sync {
    /// Camera assigned to an imaging path, if any.
    fn camera_for(&self, side: Side) -> Option<String>;

    /// Camera currently selected for live view and snaps.
    async fn current_camera(&self) -> Result<String>;

    /// Select the camera for live view and snaps.
    async fn set_current_camera(&self, camera: &str) -> Result<()>;

    /// Current region of interest.
    async fn roi(&self, camera: &str) -> Result<Roi>;

    /// Time from trigger to start of global exposure.
    async fn reset_time_ms(&self, camera: &str, mode: CameraMode) -> Result<f64>;

    /// Readout time for the current ROI. `overlap` selects the readout the
    /// camera needs when it reads out during the next exposure.
    async fn readout_time_ms(&self, camera: &str, overlap: bool) -> Result<f64>;

    /// Put cameras in external-trigger mode for acquisition (`Some`), or back to
    /// internal triggering (`None`).
    async fn set_trigger_mode(&self, cameras: &[String], mode: Option<CameraMode>) -> Result<()>;

    /// Set the exposure used in level-trigger and internal modes.
    async fn set_exposure(&self, camera: &str, exposure_ms: f64) -> Result<()>;

    /// Drop any frames left in the shared buffer.
    async fn clear_buffer(&self) -> Result<()>;

    /// Arm a camera to deliver `num_frames` triggered frames.
    async fn start_sequence(&self, camera: &str, num_frames: u64) -> Result<()>;

    /// Stop a running sequence.
    async fn stop_sequence(&self, camera: &str) -> Result<()>;

    /// Wait up to `timeout` for the next frame from any armed camera.
    async fn next_frame(&self, timeout: Duration) -> Result<Option<Frame>>;
}

/// Capability: Named Device Properties
///
/// Properties are only read as numeric inputs to the timing and duration
/// calculations, and written to restore stage speed after stage scanning.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Read a numeric property.
    async fn get_float(&self, device: &str, property: &str) -> Result<f64>;

    /// Write a numeric property.
    async fn set_float(&self, device: &str, property: &str, value: f64) -> Result<()>;

    /// The device exposes `property`.
    fn has_property(&self, device: &str, property: &str) -> bool;
}

/// Capability: Stage Positions
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Number of entries in the user's position list.
    async fn position_count(&self) -> Result<usize>;

    /// Move to a position list entry; returns once the stage has arrived.
    async fn go_to(&self, index: usize) -> Result<()>;

    /// Current XY stage position in um.
    async fn xy(&self) -> Result<(f64, f64)>;

    /// Move the XY stage; returns once it has arrived.
    async fn set_xy(&self, x_um: f64, y_um: f64) -> Result<()>;

    /// Pause or resume background position polling. Polling shares the
    /// serial link with triggering and must not run during acquisition.
    fn pause_updates(&self, paused: bool);
}

/// Capability: Live View
#[async_trait]
pub trait LiveMode: Send + Sync {
    /// Live view is running.
    fn is_live(&self) -> bool;

    /// Start or stop live view.
    async fn set_live(&self, on: bool) -> Result<()>;
}

/// Capability: Channel Presets
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Preset currently applied in `group`.
    async fn current_config(&self, group: &str) -> Result<String>;

    /// Apply a preset.
    async fn set_config(&self, group: &str, config: &str) -> Result<()>;

    /// Presets defined in `group`.
    async fn available_configs(&self, group: &str) -> Result<Vec<String>>;
}

/// Capability: Image Destination
///
/// # Contract
/// - `begin` opens a new dataset; with separate timepoints it is called once
///   per timepoint
/// - `finish` closes the dataset opened by the last `begin`
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Open a dataset.
    async fn begin(&self, name: &str) -> Result<()>;

    /// Store one frame.
    async fn put(&self, frame: Frame, coords: FrameCoords) -> Result<()>;

    /// Close the dataset.
    async fn finish(&self) -> Result<()>;
}

/// Capability: Autofocus
#[async_trait]
pub trait Autofocus: Send + Sync {
    /// Run a focus sweep on one side and apply the result to that side's
    /// calibration. Returns the focus score.
    async fn run_focus(&self, side: Side) -> Result<f64>;
}

/// Every collaborator the sequencer needs.
#[derive(Clone)]
pub struct Microscope {
    /// Trigger controller
    pub controller: Arc<dyn SpimController>,
    /// Cameras and the frame buffer
    pub cameras: Arc<dyn CameraBank>,
    /// Device properties
    pub props: Arc<dyn PropertyStore>,
    /// Position list and XY stage
    pub positions: Arc<dyn PositionStore>,
    /// Live view
    pub live: Arc<dyn LiveMode>,
    /// Channel presets
    pub channels: Arc<dyn ChannelControl>,
    /// Image destination
    pub sink: Arc<dyn ImageSink>,
    /// Autofocus routine
    pub autofocus: Arc<dyn Autofocus>,
}

impl std::fmt::Debug for Microscope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microscope").finish_non_exhaustive()
    }
}
