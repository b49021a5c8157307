//! Calibration: finding out how loud every speaker is at a handful of
//! positions in the room.
//!
//! A room is calibrated one position at a time. At each position the
//! [`PositionStep`] waits for the listener to stand still and takes their
//! coordinate, then the [`SpeakerCalibration`] plays test tones through
//! every speaker and records what the microphone hears. The
//! [`CalibrationSession`] collects the resulting points and saves them as a
//! room, and starts a position over when the listener walks off while the
//! tones play.

mod error;
mod position;
mod session;
mod speaker;

pub use error::CalibrationError;
pub use position::{PositionStep, PositionUpdate};
pub use session::{CalibrationSession, PositionCancel, PositionOutcome};
pub use speaker::{
    CalibrationEvent, CalibrationHandle, Observer, Progress, SpeakerCalibration, SpeakerOutcome,
    SpeakerState, Volume,
};
