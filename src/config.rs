//! Configuration System using Figment
//!
//! Engine configuration is loaded from:
//! 1. `config/spim.toml` (base configuration)
//! 2. Environment variables prefixed with `SPIM_DAQ_`, using `__` between
//!    nesting levels (e.g. `SPIM_DAQ_SEQUENCER__WAIT_INCREMENT_MS=250`)
//!
//! Every field has a default, so a partial file (or no file at all) yields a
//! usable configuration.
//!
//! # Example
//! ```no_run
//! use spim_daq::config::SpimConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpimConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::modes::Side;
use crate::error::{AppResult, SpimError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/spim.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SpimConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Controller capabilities
    pub controller: ControllerConfig,
    /// Sequencer overheads and timeouts
    pub sequencer: SequencerConfig,
    /// Per-side calibration
    pub setup: SetupConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "diSPIM acquisition engine".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// What the trigger controller can do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// A PLogic card is installed. It delays camera and laser triggers by one
    /// tick and is required for hardware channel switching.
    pub has_plogic: bool,
    /// Maximum channels the PLogic counter can cycle through
    pub max_hardware_channels: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            has_plogic: true,
            max_hardware_channels: 4,
        }
    }
}

/// Sequencer overheads and timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SequencerConfig {
    /// Longest single sleep while waiting for the next timepoint (1..=1000)
    pub wait_increment_ms: u64,
    /// Estimated cost of a software channel change
    pub channel_switch_overhead_ms: f64,
    /// Estimated cost of moving to the next position
    pub position_move_overhead_ms: f64,
    /// Extra time a software-timed timepoint needs beyond its duration; shorter
    /// intervals are handed to the controller
    pub hardware_timepoint_margin_ms: f64,
    /// Floor for the first-frame timeout
    pub first_frame_timeout_ms: u64,
    /// Floor for the between-frames timeout
    pub inter_frame_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            wait_increment_ms: 1000,
            channel_switch_overhead_ms: 500.0,
            position_move_overhead_ms: 1500.0,
            hardware_timepoint_margin_ms: 750.0,
            first_frame_timeout_ms: 5000,
            inter_frame_timeout_ms: 2000,
        }
    }
}

impl SequencerConfig {
    /// Longest single sleep while waiting for the next timepoint.
    pub fn wait_increment(&self) -> Duration {
        Duration::from_millis(self.wait_increment_ms)
    }
}

/// Calibration of both imaging paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SetupConfig {
    /// Path A calibration
    pub side_a: SideCalibration,
    /// Path B calibration
    pub side_b: SideCalibration,
}

impl SetupConfig {
    /// Calibration for one path.
    pub fn side(&self, side: Side) -> &SideCalibration {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }
}

/// Piezo and sheet calibration for one side.
///
/// The sheet position in degrees is `(piezo_um - sheet_offset_um) / sheet_rate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SideCalibration {
    /// Piezo center position used for the stack
    pub piezo_center_um: f64,
    /// Calibration slope, um of piezo travel per degree of sheet
    pub sheet_rate: f64,
    /// Calibration intercept
    pub sheet_offset_um: f64,
    /// Lower piezo travel limit
    pub piezo_min_um: f64,
    /// Upper piezo travel limit
    pub piezo_max_um: f64,
}

impl Default for SideCalibration {
    fn default() -> Self {
        Self {
            piezo_center_um: 0.0,
            sheet_rate: 100.0,
            sheet_offset_um: 0.0,
            piezo_min_um: -150.0,
            piezo_max_um: 150.0,
        }
    }
}

impl SpimConfig {
    /// Load configuration from `config/spim.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(SpimConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPIM_DAQ_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SpimError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.sequencer.wait_increment_ms == 0 || self.sequencer.wait_increment_ms > 1000 {
            return Err(SpimError::Configuration(format!(
                "Invalid wait_increment_ms {}. Must be 1-1000",
                self.sequencer.wait_increment_ms
            )));
        }

        if self.controller.max_hardware_channels == 0 {
            return Err(SpimError::Configuration(
                "max_hardware_channels must be at least 1".to_string(),
            ));
        }

        for side in [Side::A, Side::B] {
            let cal = self.setup.side(side);
            if cal.sheet_rate == 0.0 {
                return Err(SpimError::Configuration(format!(
                    "Sheet calibration slope for side {side} cannot be zero"
                )));
            }
            if cal.piezo_min_um >= cal.piezo_max_um {
                return Err(SpimError::Configuration(format!(
                    "Piezo limits for side {side} are inverted ({} >= {})",
                    cal.piezo_min_um, cal.piezo_max_um
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = SpimConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, SpimConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[sequencer]\nwait_increment_ms = 250\n\n[setup.side_b]\nsheet_rate = -80.0"
        )
        .unwrap();

        let config = SpimConfig::load_from(file.path()).unwrap();
        assert_eq!(config.sequencer.wait_increment_ms, 250);
        assert_eq!(config.sequencer.position_move_overhead_ms, 1500.0);
        assert_eq!(config.setup.side_b.sheet_rate, -80.0);
        assert_eq!(config.setup.side_a.sheet_rate, 100.0);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SPIM_DAQ_CONTROLLER__HAS_PLOGIC", "false");
        let config = SpimConfig::load_from("does/not/exist.toml");
        std::env::remove_var("SPIM_DAQ_CONTROLLER__HAS_PLOGIC");
        assert!(!config.unwrap().controller.has_plogic);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SpimConfig::default();
        config.application.log_level = "chatty".to_string();
        assert!(config.validate().is_err());

        let mut config = SpimConfig::default();
        config.sequencer.wait_increment_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = SpimConfig::default();
        config.setup.side_a.sheet_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = SpimConfig::default();
        config.setup.side_b.piezo_min_um = 200.0;
        assert!(config.validate().is_err());
    }
}
