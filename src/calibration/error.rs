//! Errors of the calibration steps.

use crate::audio_device::AudioError;
use crate::room_store::StoreError;

use std::{borrow::Cow, error::Error, fmt::Display, sync::mpsc};

/// Returned when a calibration step fails. None of these are fatal: levels
/// have been restored by the time the error is seen, and the step may be
/// started again.
#[derive(Debug)]
pub enum CalibrationError {
    /// Returned when the output device or the tone player fails.
    Audio(AudioError),

    /// Returned when the microphone heard nothing usable. `channel` is
    /// `None` for the reference tone played before any channel is measured.
    SilentCapture { channel: Option<usize> },

    /// Returned when starting a speaker step that is already measuring.
    AlreadyRunning,

    /// Returned when the device has no output channels.
    NoChannels,

    /// Returned when a finished position does not hold a reading for every
    /// channel.
    #[allow(missing_docs)]
    IncompleteMeasurement { expected: usize, found: usize },

    /// Returned when saving a session that has no positions.
    NothingToSave,

    /// Returned when the room store refuses the session.
    Store(StoreError),

    /// Returned when the other end of an event channel hung up.
    Disconnected,
}

impl Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CalibrationError as CE;
        let msg = match self {
            CE::Audio(error) => Cow::from(format!("audio error: {}", error)),
            CE::SilentCapture { channel: None } => {
                Cow::from("the microphone did not pick up the reference tone")
            }
            CE::SilentCapture {
                channel: Some(channel),
            } => Cow::from(format!(
                "the microphone did not pick up channel {}",
                channel
            )),
            CE::AlreadyRunning => Cow::from("speaker calibration is already running"),
            CE::NoChannels => Cow::from("the output device has no channels"),
            CE::IncompleteMeasurement { expected, found } => Cow::from(format!(
                "expected readings for {} channels, got {}",
                expected, found
            )),
            CE::NothingToSave => Cow::from("no position has been calibrated yet"),
            CE::Store(error) => Cow::from(format!("could not save room: {}", error)),
            CE::Disconnected => Cow::from("event channel disconnected"),
        };

        write!(f, "{}", msg)
    }
}

impl Error for CalibrationError {}

impl From<AudioError> for CalibrationError {
    fn from(value: AudioError) -> Self {
        Self::Audio(value)
    }
}

impl From<StoreError> for CalibrationError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl<T> From<mpsc::SendError<T>> for CalibrationError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::Disconnected
    }
}

impl From<mpsc::RecvError> for CalibrationError {
    fn from(_: mpsc::RecvError) -> Self {
        Self::Disconnected
    }
}
