//! CLI Entry Point for spim_daq
//!
//! Provides command-line access to:
//! - Timing synthesis and duration estimates for an acquisition intent
//! - Full acquisitions against the mock microscope
//!
//! # Usage
//!
//! Print the slice timing and durations:
//! ```bash
//! spim_daq timing --intent config/intent.toml --readout-ms 10
//! ```
//!
//! Run an acquisition on the mock microscope:
//! ```bash
//! spim_daq --config config/spim.toml simulate --intent config/intent.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use spim_daq::acquisition::settings::{
    assemble, plan_timing, CameraOverhead, HardwareSnapshot, SideCamera,
};
use spim_daq::acquisition::{AcquisitionStatus, RunRequest, Sequencer, Side, UserIntent};
use spim_daq::config::{SpimConfig, DEFAULT_CONFIG_PATH};
use spim_daq::hardware::{MockMicroscope, Roi};
use spim_daq::timing::format_time_lapse;
use spim_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "spim_daq")]
#[command(about = "diSPIM acquisition timing and sequencing", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize slice timing and estimate durations
    Timing {
        /// Acquisition intent (TOML); defaults apply when omitted
        #[arg(long)]
        intent: Option<PathBuf>,

        /// Camera reset time, ms
        #[arg(long, default_value_t = 10.1)]
        reset_ms: f64,

        /// Camera readout time, ms
        #[arg(long, default_value_t = 10.0)]
        readout_ms: f64,

        /// Scanner filter cutoff, kHz
        #[arg(long, default_value_t = 1.6)]
        filter_khz: f64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run an acquisition on the mock microscope
    Simulate {
        /// Acquisition intent (TOML); defaults apply when omitted
        #[arg(long)]
        intent: Option<PathBuf>,

        /// Quick test acquisition (one timepoint, nothing stored)
        #[arg(long)]
        test: bool,

        /// Restrict a test acquisition to one side (A or B)
        #[arg(long, value_parser = parse_side, requires = "test")]
        side: Option<Side>,

        /// Number of positions in the mock position list
        #[arg(long, default_value_t = 0)]
        positions: usize,
    },
}

fn parse_side(s: &str) -> Result<Side, String> {
    match s {
        "A" | "a" => Ok(Side::A),
        "B" | "b" => Ok(Side::B),
        other => Err(format!("unknown side '{other}', expected A or B")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SpimConfig::load_from(&cli.config)?;
    config.validate()?;
    tracing_setup::init(TracingConfig::from_config(&config)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Timing {
            intent,
            reset_ms,
            readout_ms,
            filter_khz,
            json,
        } => {
            let intent = load_intent(intent.as_deref()).await?;
            print_timing(&config, &intent, reset_ms, readout_ms, filter_khz, json)
        }
        Commands::Simulate {
            intent,
            test,
            side,
            positions,
        } => {
            let intent = load_intent(intent.as_deref()).await?;
            simulate(config, intent, test, side, positions).await
        }
    }
}

async fn load_intent(path: Option<&Path>) -> Result<UserIntent> {
    match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            Ok(UserIntent::from_toml(&text)?)
        }
        None => Ok(UserIntent::default()),
    }
}

fn print_timing(
    config: &SpimConfig,
    intent: &UserIntent,
    reset_ms: f64,
    readout_ms: f64,
    filter_khz: f64,
    json: bool,
) -> Result<()> {
    let camera = |name: &str| SideCamera {
        camera: name.to_string(),
        roi: Roi::default(),
        overhead: CameraOverhead {
            reset_ms,
            readout_ms,
        },
    };
    let hw = HardwareSnapshot {
        side_a: Some(camera("A")),
        side_b: Some(camera("B")),
        scan_filter_freq_khz: filter_khz,
        ..HardwareSnapshot::default()
    };

    let synthesis = plan_timing(intent, &hw, &config.controller);
    let settings = assemble(intent, &hw, synthesis.timing, false);
    let model = settings.duration_model(&config.sequencer);

    if json {
        let out = serde_json::json!({
            "timing": synthesis.timing,
            "period_extended_by_ms": synthesis.period_extended_by_ms,
            "volume_duration_ms": model.volume_duration_ms(),
            "timepoint_duration_ms": model.timepoint_duration_ms(),
            "time_lapse_duration_s": model.time_lapse_duration_s(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let t = synthesis.timing;
    println!("Slice timing (ms)");
    println!("  scan delay       {:>8.2}", t.scan_delay_ms());
    println!("  scan period      {:>8}  x {}", t.scan_period_ms(), t.scan_num());
    println!("  laser delay      {:>8.2}", t.laser_delay_ms());
    println!("  laser duration   {:>8.2}", t.laser_duration_ms());
    println!("  camera delay     {:>8.2}", t.camera_delay_ms());
    println!("  camera duration  {:>8.2}", t.camera_duration_ms());
    println!("  camera exposure  {:>8.2}", t.camera_exposure_ms());
    println!("  slice duration   {:>8.2}", t.slice_duration_ms());
    if let Some(by_ms) = synthesis.period_extended_by_ms {
        println!("  (slice period extended by {by_ms} ms)");
    }
    println!();
    println!("Volume:     {:.1} ms", model.volume_duration_ms());
    println!("Time point: {:.1} ms", model.timepoint_duration_ms());
    println!(
        "Total:      {}",
        format_time_lapse(model.time_lapse_duration_s())
    );
    Ok(())
}

async fn simulate(
    config: SpimConfig,
    intent: UserIntent,
    test: bool,
    side: Option<Side>,
    positions: usize,
) -> Result<()> {
    let grid = (0..positions).map(|i| (i as f64 * 500.0, 0.0)).collect();
    let mock = Arc::new(MockMicroscope::new().with_positions(grid));

    let (status_tx, mut status_rx) = watch::channel(AcquisitionStatus::None);
    let sequencer =
        Sequencer::new(mock.microscope(), config).with_status_sink(Arc::new(status_tx));

    let printer = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            println!("{status}");
        }
    });

    let request = if test {
        RunRequest::test(intent, side)
    } else {
        RunRequest::acquisition(intent)
    };

    let context = Arc::clone(sequencer.context());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            context.request_cancel();
        }
    });

    let result = sequencer.run(request).await;
    // Dropping the sequencer closes the status channel and ends the printer
    drop(sequencer);
    let _ = printer.await;

    let report = result?;
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    println!(
        "{:?}: {} of {} time points, {} frames in {:.1} s{}",
        report.outcome,
        report.timepoints_done,
        report.timepoints_total,
        report.frames_received,
        report.elapsed.as_secs_f64(),
        if report.missed_images {
            " (missed images)"
        } else {
            ""
        }
    );
    Ok(())
}
