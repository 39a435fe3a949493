//! Slice timing model.
//!
//! A [`SliceTiming`] holds the trigger program for a single slice: when the
//! scan mirror starts and how long it sweeps, when the laser fires and for how
//! long, and when the camera is triggered. The controller executes this program
//! once per slice, so every quantity here is in milliseconds relative to the
//! start of the slice.
//!
//! The slice duration is never stored independently of its inputs. It is
//! recomputed whenever a field changes, so a `SliceTiming` can never hold a
//! stale duration.
//!
//! # Calibration constants
//!
//! The constants in this module were tuned empirically against a specific
//! camera/controller combination. They are not derived from first principles.
//! Replacing the camera model or the controller firmware requires re-measuring
//! them.

pub mod duration;
pub mod synthesizer;

use serde::{Deserialize, Serialize};

pub use duration::{format_time_lapse, DurationModel};
pub use synthesizer::{synthesize, Synthesis, SynthesisRequest};

/// Controller clock resolution. All delays are multiples of this.
pub const CONTROLLER_TICK_MS: f64 = 0.25;

/// The scan starts this long before the laser and ends this long after it.
pub const SCAN_LASER_BUFFER_MS: f64 = 0.25;

/// Exposure headroom reserved because cameras round the requested exposure up.
pub const CAMERA_EXPOSURE_MARGIN_MS: f64 = 0.10;

/// Fixed latency the PLogic card adds to the camera and laser triggers.
pub const PLOGIC_LATENCY_MS: f64 = 0.25;

/// Camera trigger pulse width in overlap (synchronous) mode, where exposure is
/// set by the spacing between pulses rather than by pulse width.
pub const OVERLAP_TRIGGER_MS: f64 = 1.0;

/// Empirical group delay of the scanner's Bessel filter, in ms·kHz.
pub const FILTER_GROUP_DELAY_COEFF: f64 = 0.4;

/// Round to the nearest controller tick (0.25 ms).
pub fn round_to_quarter_ms(ms: f64) -> f64 {
    (ms * 4.0).round() / 4.0
}

/// Round up to the next controller tick (0.25 ms).
pub fn ceil_to_quarter_ms(ms: f64) -> f64 {
    (ms * 4.0).ceil() / 4.0
}

/// Round a requested light exposure to the nearest `x.5` ms.
///
/// The scan period is an integer number of milliseconds and the laser is on for
/// the scan period minus two buffers, so the only exposures the controller can
/// realize end in `.5`.
pub fn round_to_half_ms_exposure(ms: f64) -> f64 {
    (ms + 0.5).round() - 0.5
}

/// The raw, user-editable fields of a slice timing program.
///
/// Used for advanced (manual) timing and for deserializing stored timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingFields {
    /// Delay from slice start to scan start
    pub scan_delay_ms: f64,
    /// Number of scan sweeps per slice
    pub scan_num: u32,
    /// Duration of one scan sweep (integer ms)
    pub scan_period_ms: u32,
    /// Delay from slice start to laser on
    pub laser_delay_ms: f64,
    /// Laser on time
    pub laser_duration_ms: f64,
    /// Delay from slice start to camera trigger
    pub camera_delay_ms: f64,
    /// Camera trigger pulse width
    pub camera_duration_ms: f64,
    /// Exposure programmed into the camera
    pub camera_exposure_ms: f64,
}

impl Default for TimingFields {
    fn default() -> Self {
        Self {
            scan_delay_ms: 0.0,
            scan_num: 1,
            scan_period_ms: 10,
            laser_delay_ms: 0.0,
            laser_duration_ms: 1.0,
            camera_delay_ms: 0.0,
            camera_duration_ms: 1.0,
            camera_exposure_ms: 1.0,
        }
    }
}

/// One slice's trigger program together with its derived duration.
///
/// `SliceTiming` is a plain value: cloning it into a settings snapshot
/// detaches it from whatever produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SliceTiming {
    fields: TimingFields,
    slice_duration_ms: f64,
}

impl SliceTiming {
    /// Build a timing from raw fields, deriving the slice duration.
    pub fn new(fields: TimingFields) -> Self {
        Self {
            slice_duration_ms: slice_duration_of(&fields),
            fields,
        }
    }

    /// Apply an edit to the raw fields and recompute the slice duration.
    pub fn update<F: FnOnce(&mut TimingFields)>(&mut self, edit: F) {
        edit(&mut self.fields);
        self.slice_duration_ms = slice_duration_of(&self.fields);
    }

    /// Copy of the raw fields.
    pub fn fields(&self) -> TimingFields {
        self.fields
    }

    /// Delay before the scanner starts.
    pub fn scan_delay_ms(&self) -> f64 {
        self.fields.scan_delay_ms
    }

    /// Number of sheet sweeps per slice.
    pub fn scan_num(&self) -> u32 {
        self.fields.scan_num
    }

    /// Length of one sheet sweep.
    pub fn scan_period_ms(&self) -> u32 {
        self.fields.scan_period_ms
    }

    /// Delay before the laser fires.
    pub fn laser_delay_ms(&self) -> f64 {
        self.fields.laser_delay_ms
    }

    /// Laser on-time.
    pub fn laser_duration_ms(&self) -> f64 {
        self.fields.laser_duration_ms
    }

    /// Delay before the camera trigger.
    pub fn camera_delay_ms(&self) -> f64 {
        self.fields.camera_delay_ms
    }

    /// Camera trigger length.
    pub fn camera_duration_ms(&self) -> f64 {
        self.fields.camera_duration_ms
    }

    /// Exposure set on the camera.
    pub fn camera_exposure_ms(&self) -> f64 {
        self.fields.camera_exposure_ms
    }

    /// Time from slice start until the last of the three signals ends.
    pub fn slice_duration_ms(&self) -> f64 {
        self.slice_duration_ms
    }
}

impl Default for SliceTiming {
    fn default() -> Self {
        Self::new(TimingFields::default())
    }
}

impl From<TimingFields> for SliceTiming {
    fn from(fields: TimingFields) -> Self {
        Self::new(fields)
    }
}

fn slice_duration_of(f: &TimingFields) -> f64 {
    let scan_end = f.scan_delay_ms + f64::from(f.scan_period_ms) * f64::from(f.scan_num);
    let laser_end = f.laser_delay_ms + f.laser_duration_ms;
    let camera_end = f.camera_delay_ms + f.camera_duration_ms;
    scan_end.max(laser_end).max(camera_end)
}
