//! Sequencer lifecycle.
//!
//! The sequencer's position in a run is a closed enum driven by a single
//! [`transition`] function, so the legal orderings can be tested without any
//! hardware attached.

use crate::error::SpimError;
use serde::{Deserialize, Serialize};

/// Acquisition sequencer state.
///
/// # State Machine
///
/// ```text
/// Idle ──Arm──> Armed ──Start──> Running ──Finish──> Done
///   ▲             │  │              │                 ▲ │
///   │             │  │Cancel   Cancel│                 │ │
///   └─Validation──┘  ▼              ▼                 │ │
///      Failed      Cancelling <──────┘ ──Finish/Fail──┘ │
///                                                       │
/// Armed/Running ──Fail──> Done         Done ──Arm──> Armed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SequencerState {
    /// No acquisition in flight, hardware lock free
    #[default]
    Idle,
    /// Settings validated, hardware being prepared
    Armed,
    /// Iterating timepoints
    Running,
    /// Stop requested; the current volume is allowed to finish
    Cancelling,
    /// Run over, devices restored
    Done,
}

/// Something that happened to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerEvent {
    /// Run requested; hardware is being read and armed.
    Arm,
    /// A feasibility check refused the run.
    ValidationFailed,
    /// Armed; the first trigger is about to go out.
    Start,
    /// Stop requested.
    Cancel,
    /// The loop ended normally or by cancel.
    Finish,
    /// A device call failed.
    Fail,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "Idle"),
            SequencerState::Armed => write!(f, "Armed"),
            SequencerState::Running => write!(f, "Running"),
            SequencerState::Cancelling => write!(f, "Cancelling"),
            SequencerState::Done => write!(f, "Done"),
        }
    }
}

impl SequencerState {
    /// Check if a new run may be armed from this state.
    pub fn can_arm(&self) -> bool {
        matches!(self, SequencerState::Idle | SequencerState::Done)
    }

    /// Check if a run is in flight (hardware may be held).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SequencerState::Armed | SequencerState::Running | SequencerState::Cancelling
        )
    }

    /// Compact encoding for [`std::sync::atomic::AtomicU8`] storage.
    pub fn as_u8(self) -> u8 {
        match self {
            SequencerState::Idle => 0,
            SequencerState::Armed => 1,
            SequencerState::Running => 2,
            SequencerState::Cancelling => 3,
            SequencerState::Done => 4,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values read as `Idle`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SequencerState::Armed,
            2 => SequencerState::Running,
            3 => SequencerState::Cancelling,
            4 => SequencerState::Done,
            _ => SequencerState::Idle,
        }
    }
}

/// Apply `event` to `state`.
pub fn transition(
    state: SequencerState,
    event: SequencerEvent,
) -> Result<SequencerState, SpimError> {
    use SequencerEvent as E;
    use SequencerState as S;

    let next = match (state, event) {
        (S::Idle | S::Done, E::Arm) => S::Armed,
        (S::Armed, E::ValidationFailed) => S::Idle,
        (S::Armed, E::Start) => S::Running,
        (S::Armed | S::Running | S::Cancelling, E::Cancel) => S::Cancelling,
        (S::Running | S::Cancelling, E::Finish) => S::Done,
        (S::Armed | S::Running | S::Cancelling, E::Fail) => S::Done,
        (state, event) => return Err(SpimError::InvalidTransition { state, event }),
    };
    Ok(next)
}
