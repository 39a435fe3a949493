//! Status reporting.
//!
//! The sequencer publishes an [`AcquisitionStatus`] at each phase change
//! through a [`StatusSink`]. Publishing is synchronous and must not block; the
//! `watch` sender implementation lets any number of readers follow the latest
//! status without ever slowing the worker.

use super::validator::ValidationWarning;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Phase of the current acquisition, as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum AcquisitionStatus {
    /// Idle
    #[default]
    None,
    /// Timepoints are 1-based
    Acquiring {
        /// Timepoint being acquired
        timepoint: u32,
        /// Timepoints planned
        total: u32,
    },
    /// Sleeping until the next timepoint
    Waiting {
        /// Timepoint that starts next
        next: u32,
        /// Timepoints planned
        total: u32,
        /// Whole seconds until it starts
        seconds_remaining: u64,
    },
    /// Run over
    Done {
        /// Timepoints fully acquired
        timepoints: u32,
    },
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "No acquisition in progress."),
            Self::Acquiring { timepoint, total } => {
                write!(f, "Acquiring time point {timepoint} of {total}")
            }
            Self::Waiting {
                next,
                total,
                seconds_remaining,
            } => write!(f, "Next timepoint ({next} of {total}) in {seconds_remaining} s."),
            Self::Done { timepoints } => {
                write!(f, "Acquisition finished with {timepoints} time points.")
            }
        }
    }
}

/// Receives status updates from the acquisition worker.
pub trait StatusSink: Send + Sync {
    /// Deliver one status update.
    fn publish(&self, status: AcquisitionStatus);
}

impl StatusSink for watch::Sender<AcquisitionStatus> {
    fn publish(&self, status: AcquisitionStatus) {
        self.send_replace(status);
    }
}

/// Writes every status to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, status: AcquisitionStatus) {
        tracing::info!(target: "spim_daq::status", "{status}");
    }
}

/// Keeps every published status, in order.
#[derive(Debug, Default)]
pub struct StatusRecorder {
    history: Mutex<Vec<AcquisitionStatus>>,
}

impl StatusRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status seen so far.
    pub fn history(&self) -> Vec<AcquisitionStatus> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Most recent status.
    pub fn last(&self) -> Option<AcquisitionStatus> {
        self.history.lock().ok().and_then(|h| h.last().copied())
    }
}

impl StatusSink for StatusRecorder {
    fn publish(&self, status: AcquisitionStatus) {
        if let Ok(mut history) = self.history.lock() {
            history.push(status);
        }
    }
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every timepoint was acquired.
    Completed,
    /// Stopped at an operator request.
    Cancelled,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id, also on the run's tracing span
    pub run_id: Uuid,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Completed or cancelled
    pub outcome: RunOutcome,
    /// Timepoints fully acquired
    pub timepoints_done: u32,
    /// Timepoints planned
    pub timepoints_total: u32,
    /// Frames routed to the sink
    pub frames_received: u64,
    /// At least one frame did not arrive within the between-frames timeout
    pub missed_images: bool,
    /// Warnings raised before arming
    pub warnings: Vec<ValidationWarning>,
    /// Time from request to cleanup
    pub elapsed: Duration,
}

impl RunReport {
    /// The operator stopped the run.
    pub fn was_cancelled(&self) -> bool {
        self.outcome == RunOutcome::Cancelled
    }
}
