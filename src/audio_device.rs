//! The audio side of the outside world: an output device whose channel
//! levels we read and write, and a tone player that plays a test tone on
//! that device while recording from a microphone.

use std::{borrow::Cow, fmt, time::Duration};

/// Returned when talking to an audio device fails.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Returned when addressing a channel the device does not have.
    #[allow(missing_docs)]
    UnknownChannel { channel: usize, channels: usize },

    /// Returned when the device has gone away or refuses requests.
    Unavailable(String),

    /// Returned when the recording side of a test tone fails.
    CaptureFailed(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AudioError as AE;
        let msg = match self {
            AE::UnknownChannel { channel, channels } => Cow::from(format!(
                "channel {} requested, but the device has {}",
                channel, channels
            )),
            AE::Unavailable(reason) => Cow::from(format!("device unavailable: {}", reason)),
            AE::CaptureFailed(reason) => Cow::from(format!("capture failed: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for AudioError {}

/// `AudioDevice`
///
/// An output device with `channel_count()` independently adjustable
/// channels. Levels are scalars in `[0, 1]`. Methods take `&self` because
/// the device is shared between the fader and calibration; implementations
/// synchronise internally.
pub trait AudioDevice: Send + Sync {
    /// Number of output channels.
    fn channel_count(&self) -> usize;

    /// The current level of `channel`.
    fn channel_level(&self, channel: usize) -> Result<f32, AudioError>;

    /// Sets the level of `channel`.
    fn set_channel_level(&self, channel: usize, level: f32) -> Result<(), AudioError>;

    /// Every channel's level, in channel order.
    fn channel_levels(&self) -> Result<Vec<f32>, AudioError> {
        (0..self.channel_count())
            .map(|channel| self.channel_level(channel))
            .collect()
    }
}

/// Human-readable name of a channel in the usual surround layout.
pub fn channel_name(channel: usize) -> Cow<'static, str> {
    match channel {
        0 => Cow::from("Left"),
        1 => Cow::from("Right"),
        2 => Cow::from("Center"),
        3 => Cow::from("Sub"),
        4 => Cow::from("Rear Left"),
        5 => Cow::from("Rear Right"),
        6 => Cow::from("Surround Left"),
        7 => Cow::from("Surround Right"),
        n => Cow::from(format!("Channel {}", n + 1)),
    }
}

/// Samples recorded while a test tone played.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Capture {
    /// Samples per second.
    pub sample_rate: u32,
    /// Mono samples in `[-1, 1]`.
    pub samples: Vec<f32>,
}

/// How a test tone ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ToneEvent {
    /// The tone played for its full length.
    Finished(Capture),
    /// The tone was cut short by [`TonePlayer::stop`].
    Stopped,
    /// Playback or recording failed.
    Failed(AudioError),
}

/// Called exactly once when a tone ends, from whatever thread the player
/// likes.
pub type ToneCallback = Box<dyn FnOnce(ToneEvent) + Send>;

/// `TonePlayer`
///
/// Plays a test tone on the output device and records the input device for
/// as long as the tone plays. `play` returns immediately; the outcome is
/// reported through `done`.
pub trait TonePlayer: Send {
    /// Starts a tone of `length` and calls `done` once it ends.
    fn play(&mut self, length: Duration, done: ToneCallback) -> Result<(), AudioError>;

    /// Cuts the current tone short. Does nothing if no tone is playing.
    fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Levels(Mutex<Vec<f32>>);

    impl AudioDevice for Levels {
        fn channel_count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
        fn channel_level(&self, channel: usize) -> Result<f32, AudioError> {
            let levels = self.0.lock().unwrap();
            levels.get(channel).copied().ok_or(AudioError::UnknownChannel {
                channel,
                channels: levels.len(),
            })
        }
        fn set_channel_level(&self, channel: usize, level: f32) -> Result<(), AudioError> {
            self.0.lock().unwrap()[channel] = level;
            Ok(())
        }
    }

    #[test]
    fn levels_in_channel_order() {
        let device = Levels(Mutex::new(vec![0.1, 0.2, 0.3]));
        assert_eq!(device.channel_levels().unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn channel_names() {
        assert_eq!(channel_name(0), "Left");
        assert_eq!(channel_name(3), "Sub");
        assert_eq!(channel_name(8), "Channel 9");
    }
}
