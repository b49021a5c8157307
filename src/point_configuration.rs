//! Calibration samples: what the microphone heard from every speaker while
//! the listener stood at one spot in the room.

use crate::Point;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What was captured for one speaker channel at one calibration position.
///
/// Stored as a `[full, half, baseline]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct ChannelReading {
    /// Scaled capture level with the channel at its baseline level.
    pub full: f32,
    /// Scaled capture level with the channel at half its baseline level.
    pub half: f32,
    /// The channel's output level when calibration started.
    pub baseline: f32,
}

impl ChannelReading {
    /// Instantiates a new [`ChannelReading`].
    pub fn new(full: f32, half: f32, baseline: f32) -> Self {
        Self {
            full,
            half,
            baseline,
        }
    }

    fn is_finite(&self) -> bool {
        self.full.is_finite() && self.half.is_finite() && self.baseline.is_finite()
    }
}

impl From<[f32; 3]> for ChannelReading {
    fn from([full, half, baseline]: [f32; 3]) -> Self {
        Self::new(full, half, baseline)
    }
}

impl From<ChannelReading> for [f32; 3] {
    fn from(r: ChannelReading) -> Self {
        [r.full, r.half, r.baseline]
    }
}

/// One calibration sample: a room coordinate and a reading for every
/// speaker channel, keyed by channel index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointConfiguration {
    /// Where the listener stood.
    pub coordinates: Point,
    /// Reading of every channel, keyed by channel index.
    pub volumes: BTreeMap<usize, ChannelReading>,
}

impl PointConfiguration {
    /// Instantiates a new [`PointConfiguration`] with the readings given in
    /// channel order.
    pub fn new(coordinates: Point, readings: impl IntoIterator<Item = ChannelReading>) -> Self {
        Self {
            coordinates,
            volumes: readings.into_iter().enumerate().collect(),
        }
    }

    /// Number of channels with a reading.
    pub fn speaker_count(&self) -> usize {
        self.volumes.len()
    }

    /// The reading of `speaker`, if it was calibrated.
    pub fn reading(&self, speaker: usize) -> Option<&ChannelReading> {
        self.volumes.get(&speaker)
    }

    /// Whether readings exist for exactly the channels `0..speaker_count`,
    /// all of them finite.
    pub fn is_complete(&self) -> bool {
        self.volumes
            .iter()
            .enumerate()
            .all(|(i, (&speaker, reading))| i == speaker && reading.is_finite())
    }
}
