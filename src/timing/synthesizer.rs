//! Timing synthesis.
//!
//! Each slice period is laid out as:
//!
//! 1. camera readout (absent in overlap mode)
//! 2. any slack the requested period leaves over
//! 3. camera reset
//! 4. scan start, one buffer before global exposure and pulled earlier by the
//!    scanner filter's group delay
//! 5. laser on for the requested light exposure
//! 6. camera exposure ends in the final buffer, together with the scan
//!
//! [`synthesize`] solves this layout for a requested period and exposure. It
//! never fails: an infeasible period is lengthened and the extension is
//! reported in [`Synthesis::period_extended_by_ms`].

use super::{
    ceil_to_quarter_ms, round_to_half_ms_exposure, round_to_quarter_ms, SliceTiming, TimingFields,
    CAMERA_EXPOSURE_MARGIN_MS, CONTROLLER_TICK_MS, FILTER_GROUP_DELAY_COEFF, OVERLAP_TRIGGER_MS,
    PLOGIC_LATENCY_MS, SCAN_LASER_BUFFER_MS,
};
use crate::acquisition::modes::CameraMode;
use serde::Serialize;

/// Inputs to easy-mode synthesis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisRequest {
    /// Requested slice period; 0 asks for the shortest possible period
    pub desired_period_ms: f64,
    /// Requested sample light exposure
    pub desired_exposure_ms: f64,
    /// Camera reset overhead (max over active cameras)
    pub camera_reset_ms: f64,
    /// Camera readout overhead (max over active cameras)
    pub camera_readout_ms: f64,
    /// Camera trigger mode
    pub camera_mode: CameraMode,
    /// Scanner analog filter cutoff; 0 disables the group delay correction
    pub scan_filter_freq_khz: f64,
    /// Controller routes triggers through a PLogic card
    pub controller_has_extra_latency: bool,
}

/// Result of synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Synthesis {
    /// Synthesized timing
    pub timing: SliceTiming,
    /// Set when the requested period was too short and had to be lengthened.
    pub period_extended_by_ms: Option<f64>,
}

impl Synthesis {
    /// The requested period was lengthened.
    pub fn period_was_extended(&self) -> bool {
        self.period_extended_by_ms.is_some()
    }
}

/// Solve slice timing from a desired period and light exposure.
pub fn synthesize(req: &SynthesisRequest) -> Synthesis {
    let buffer = SCAN_LASER_BUFFER_MS;

    // Edge-mode cameras start exposing slightly after the trigger.
    let exposure_delay = match req.camera_mode {
        CameraMode::Edge => req.camera_reset_ms - req.camera_readout_ms,
        CameraMode::Overlap | CameraMode::PseudoOverlap | CameraMode::Level => 0.0,
    };

    let slice_period = round_to_quarter_ms(req.desired_period_ms.max(0.0));
    let exposure = round_to_half_ms_exposure(req.desired_exposure_ms);
    let scan_period = (exposure + 2.0 * buffer).round().max(1.0);
    let laser_duration = scan_period - 2.0 * buffer;

    let readout_ceil = match req.camera_mode {
        CameraMode::Overlap => 0.0,
        CameraMode::Edge | CameraMode::PseudoOverlap | CameraMode::Level => {
            ceil_to_quarter_ms(req.camera_readout_ms)
        }
    };
    let reset_ceil = ceil_to_quarter_ms(req.camera_reset_ms);

    let mut global_delay = slice_period - readout_ceil - reset_ceil - scan_period + buffer;
    let mut period_extended_by_ms = None;
    if global_delay < 0.0 {
        let deficit = ceil_to_quarter_ms(-global_delay);
        global_delay += deficit;
        period_extended_by_ms = Some(deficit);
    }

    let mut scan_delay_filter = if req.scan_filter_freq_khz > 0.0 {
        round_to_quarter_ms(FILTER_GROUP_DELAY_COEFF / req.scan_filter_freq_khz)
    } else {
        0.0
    };

    // The scan was pulled earlier, so its final tick no longer bounds the
    // period in overlap mode; give that tick back at the start.
    if readout_ceil == 0.0 && scan_delay_filter > 0.01 {
        global_delay += CONTROLLER_TICK_MS;
    }

    if req.controller_has_extra_latency {
        scan_delay_filter -= PLOGIC_LATENCY_MS;
    }

    let camera_duration_bulb = reset_ceil + scan_period - buffer;
    let camera_exposure = camera_duration_bulb - CAMERA_EXPOSURE_MARGIN_MS - exposure_delay;
    let camera_duration = match req.camera_mode {
        CameraMode::Overlap => OVERLAP_TRIGGER_MS,
        CameraMode::Edge | CameraMode::PseudoOverlap | CameraMode::Level => camera_duration_bulb,
    };

    let fields = TimingFields {
        scan_delay_ms: readout_ceil + global_delay + reset_ceil - scan_delay_filter - buffer,
        scan_num: 1,
        scan_period_ms: scan_period as u32,
        laser_delay_ms: readout_ceil + global_delay + reset_ceil,
        laser_duration_ms: laser_duration,
        camera_delay_ms: readout_ceil + global_delay,
        camera_duration_ms: camera_duration,
        camera_exposure_ms: camera_exposure,
    };

    Synthesis {
        timing: SliceTiming::new(fields),
        period_extended_by_ms,
    }
}

/// Advanced mode: the user's fields are used verbatim.
pub fn from_advanced(fields: TimingFields) -> SliceTiming {
    SliceTiming::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_request() -> SynthesisRequest {
        SynthesisRequest {
            desired_period_ms: 0.0,
            desired_exposure_ms: 10.0,
            camera_reset_ms: 0.5,
            camera_readout_ms: 10.0,
            camera_mode: CameraMode::Edge,
            scan_filter_freq_khz: 0.0,
            controller_has_extra_latency: false,
        }
    }

    #[test]
    fn test_minimal_period_layout() {
        let out = synthesize(&edge_request());
        let t = out.timing;

        // exposure 10.0 rounds to 10.5, scan period 11, laser 10.5
        assert_eq!(t.scan_period_ms(), 11);
        assert_eq!(t.laser_duration_ms(), 10.5);
        // minimizing always needs the period extended from 0
        assert!(out.period_was_extended());

        // readout 10, reset 0.5, no slack
        assert_eq!(t.camera_delay_ms(), 10.0);
        assert_eq!(t.laser_delay_ms(), 10.5);
        assert_eq!(t.scan_delay_ms(), 10.25);
        assert_eq!(t.camera_duration_ms(), 11.25);
        assert!((t.camera_exposure_ms() - (11.25 - 0.10 - (0.5 - 10.0))).abs() < 1e-9);
        assert_eq!(t.slice_duration_ms(), 21.25);
    }

    #[test]
    fn test_explicit_period_adds_slack() {
        let out = synthesize(&SynthesisRequest {
            desired_period_ms: 30.1,
            ..edge_request()
        });
        assert!(!out.period_was_extended());
        // 30.0 - 10 - 0.5 - 11 + 0.25 = 8.75 of slack
        assert_eq!(out.timing.camera_delay_ms(), 18.75);
        assert_eq!(out.timing.slice_duration_ms(), 30.0);
    }

    #[test]
    fn test_short_period_is_extended_not_shrunk() {
        let out = synthesize(&SynthesisRequest {
            desired_period_ms: 15.0,
            ..edge_request()
        });
        assert_eq!(out.period_extended_by_ms, Some(6.25));
        assert_eq!(out.timing.laser_duration_ms(), 10.5);
    }

    #[test]
    fn test_overlap_mode_short_trigger() {
        let out = synthesize(&SynthesisRequest {
            camera_mode: CameraMode::Overlap,
            scan_filter_freq_khz: 1.6,
            ..edge_request()
        });
        let t = out.timing;
        assert_eq!(t.camera_duration_ms(), 1.0);
        // no readout in overlap; filter delay 0.25 gives one tick back
        assert_eq!(t.camera_delay_ms(), 0.25);
        assert_eq!(t.laser_delay_ms(), 0.75);
        assert_eq!(t.scan_delay_ms(), 0.25);
    }

    #[test]
    fn test_plogic_latency_opposes_filter() {
        let base = SynthesisRequest {
            desired_period_ms: 40.0,
            scan_filter_freq_khz: 1.6,
            ..edge_request()
        };
        let without = synthesize(&base).timing;
        let with = synthesize(&SynthesisRequest {
            controller_has_extra_latency: true,
            ..base
        })
        .timing;
        assert_eq!(with.scan_delay_ms() - without.scan_delay_ms(), 0.25);
        assert_eq!(with.laser_delay_ms(), without.laser_delay_ms());
    }

    #[test]
    fn test_advanced_is_verbatim() {
        let fields = TimingFields {
            scan_delay_ms: 3.0,
            scan_num: 2,
            scan_period_ms: 7,
            ..TimingFields::default()
        };
        let t = from_advanced(fields);
        assert_eq!(t.fields(), fields);
        assert_eq!(t.slice_duration_ms(), 17.0);
    }
}
