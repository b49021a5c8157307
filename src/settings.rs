//! Every tunable number in the pipeline, grouped by the part of the
//! pipeline that uses it. All groups have defaults that match the values
//! the system was tuned with, so a settings file only needs to mention the
//! values it wants to change:
//!
//! ```text
//! (fader: (step: 0.02), control_loop: (fps: 15))
//! ```

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path, time::Duration};

/// Thresholds for merging and confirming person detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Padding, in frame pixels, used to decide that two regions belong to
    /// the same person.
    pub group_threshold: i32,
    /// How many past ticks a new region has to persist before it counts.
    pub history_size: usize,
    /// Minimum detector confidence.
    pub score_threshold: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            group_threshold: 50,
            history_size: 2,
            score_threshold: 0.1,
        }
    }
}

/// Shape of the interpolated volume field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationSettings {
    /// Side length of the coordinate space reported by the cameras.
    pub origin_size: i32,
    /// Side length of the interpolated grid.
    pub target_size: i32,
    /// Exponent of the inverse distance weights.
    pub power: f64,
}

impl Default for InterpolationSettings {
    fn default() -> Self {
        Self {
            origin_size: 500,
            target_size: 100,
            power: 1.5,
        }
    }
}

/// How quickly the output levels move towards their targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaderSettings {
    /// Level change per tick.
    pub step: f32,
    /// Distance from the target at which a channel counts as arrived.
    pub tolerance: f32,
    /// Milliseconds between ticks.
    pub tick_ms: u64,
}

impl FaderSettings {
    /// The tick interval as a [`Duration`], at least a millisecond.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl Default for FaderSettings {
    fn default() -> Self {
        Self {
            step: 0.01,
            tolerance: 0.0075,
            tick_ms: 30,
        }
    }
}

/// Test tone and calibration step timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Length of every test tone, in milliseconds.
    pub tone_length_ms: u64,
    /// Frequency of the test tone.
    pub tone_frequency: f32,
    /// The level the reference measurement is scaled to.
    pub scaling_target: f32,
    /// Time given to the listener to walk to the next position.
    pub position_grace_ms: u64,
    /// How far, in room units, the listener may drift and still count as
    /// standing still.
    pub move_threshold: i32,
    /// How long the listener has to stand still.
    pub stand_still_ms: u64,
}

impl CalibrationSettings {
    /// The tone length as a [`Duration`].
    pub fn tone_length(&self) -> Duration {
        Duration::from_millis(self.tone_length_ms)
    }

    /// The walking grace period as a [`Duration`].
    pub fn position_grace(&self) -> Duration {
        Duration::from_millis(self.position_grace_ms)
    }

    /// The stand-still period as a [`Duration`].
    pub fn stand_still(&self) -> Duration {
        Duration::from_millis(self.stand_still_ms)
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            tone_length_ms: 2000,
            tone_frequency: 2000.0,
            scaling_target: 0.5,
            position_grace_ms: 5000,
            move_threshold: 60,
            stand_still_ms: 3000,
        }
    }
}

/// Rate of the camera/balancing loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopSettings {
    /// Ticks per second.
    pub fps: u32,
}

impl ControlLoopSettings {
    /// Time between two ticks.
    pub fn period(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

impl Default for ControlLoopSettings {
    fn default() -> Self {
        Self { fps: 10 }
    }
}

/// All settings, as read from a settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Detection merging and confirmation.
    pub tracker: TrackerSettings,
    /// The volume field.
    pub interpolation: InterpolationSettings,
    /// The volume fader.
    pub fader: FaderSettings,
    /// Calibration timing and the test tone.
    pub calibration: CalibrationSettings,
    /// The control loop.
    pub control_loop: ControlLoopSettings,
}

/// Returned when a settings file cannot be read or parsed.
#[derive(Debug)]
pub enum SettingsError {
    /// Returned when the file cannot be read or written.
    IoError(std::io::Error),

    /// Returned when serialization fails.
    RonError(ron::Error),

    /// Returned when the file is not valid RON for [`Settings`].
    RonSpannedError(ron::de::SpannedError),

    /// Returned when a value parses but cannot work, like a fader that
    /// never moves.
    Invalid {
        /// The offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use SettingsError as SE;
        let msg = match self {
            SE::IoError(error) => Cow::from(format!("io error: {}", error)),
            SE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            SE::RonSpannedError(error) => Cow::from(format!("ron spanning error: {}", error)),
            SE::Invalid { field, reason } => Cow::from(format!("invalid {}: {}", field, reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    /// Reads settings from a RON file. Missing fields keep their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(SettingsError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parses settings from RON text and checks them with
    /// [`Settings::validate`].
    pub fn from_ron(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = ron::de::from_str(text).map_err(SettingsError::RonSpannedError)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.fader.step > 0.0 && self.fader.step.is_finite()) {
            return Err(SettingsError::Invalid {
                field: "fader.step",
                reason: "has to be a positive number",
            });
        }
        if !(self.fader.tolerance >= 0.0 && self.fader.tolerance.is_finite()) {
            return Err(SettingsError::Invalid {
                field: "fader.tolerance",
                reason: "cannot be negative",
            });
        }
        Ok(())
    }

    /// Writes the settings out as pretty RON.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(SettingsError::RonError)?;
        fs::write(path, text).map_err(SettingsError::IoError)
    }
}
