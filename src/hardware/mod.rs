//! Hardware Collaborators
//!
//! Capability traits the acquisition engine drives, plus an in-memory mock
//! microscope for tests and the `simulate` command.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    Autofocus, CameraBank, ChannelControl, Frame, FrameCoords, ImageSink, LiveMode, Microscope,
    PositionStore, PropertyStore, Roi, SpimController,
};
pub use mock::MockMicroscope;
