//! Spreads a handful of calibration points over the whole room.
//!
//! Calibration only measures the room at a few spots. [`VolumeField`] fills
//! in everything between them using Shepard's method (inverse distance
//! weighting), once per room, on a coarse grid: room coordinates are divided
//! by `origin_size / target_size` (500 / 100 = 5 by default) to find their
//! cell. Every cell stores, per speaker,
//!
//! - the *reference* level: how loud that speaker is expected to be at that
//!   spot with the channel at its baseline output level,
//! - the *sensitivity*: how much louder it gets per percent of output level,
//! - the *baseline* output level the reference was measured with.
//!
//! To balance a position, the loudest reference anywhere in the room is
//! taken as the target, and the output level that lifts the position's
//! reference to that target is solved for.

use crate::point_configuration::PointConfiguration;
use crate::settings::InterpolationSettings;
use crate::Point;

use log::debug;
use std::{borrow::Cow, fmt};

/// Sensitivities closer to zero than this are treated as flat data.
const SENSITIVITY_EPSILON: f64 = 1e-9;

/// Returned when a [`VolumeField`] cannot be built or queried.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpolationError {
    /// Returned when building a field without any calibration points.
    NoPoints,

    /// Returned when the grid settings do not divide into whole cells.
    InvalidGrid,

    /// Returned when a point has no readings, misses a channel, or carries
    /// non-finite readings.
    #[allow(missing_docs)]
    IncompletePoint { index: usize },

    /// Returned when a point has a different channel count than the first.
    #[allow(missing_docs)]
    SpeakerCountMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    /// Returned when a point lies outside the coordinate space.
    #[allow(missing_docs)]
    PointOutOfBounds { index: usize, point: Point },

    /// Returned when a query lies outside the coordinate space.
    #[allow(missing_docs)]
    OutOfBounds { x: i32, y: i32 },

    /// Returned when querying a speaker the field has no data for.
    #[allow(missing_docs)]
    UnknownSpeaker { speaker: usize, speakers: usize },

    /// Returned when the calibration data shows no change in loudness
    /// between full and half output at the queried spot.
    #[allow(missing_docs)]
    FlatSensitivity { x: i32, y: i32, speaker: usize },
}

impl fmt::Display for InterpolationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InterpolationError as IE;
        let msg = match self {
            IE::NoPoints => Cow::from("no calibration points"),
            IE::InvalidGrid => Cow::from("origin size is not a multiple of the target size"),
            IE::IncompletePoint { index } => {
                Cow::from(format!("calibration point {} is incomplete", index))
            }
            IE::SpeakerCountMismatch {
                index,
                expected,
                found,
            } => Cow::from(format!(
                "calibration point {} has {} speakers, expected {}",
                index, found, expected
            )),
            IE::PointOutOfBounds { index, point } => Cow::from(format!(
                "calibration point {} at {} is outside the room",
                index, point
            )),
            IE::OutOfBounds { x, y } => {
                Cow::from(format!("position ({}, {}) is outside the room", x, y))
            }
            IE::UnknownSpeaker { speaker, speakers } => Cow::from(format!(
                "speaker {} requested, but only {} are calibrated",
                speaker, speakers
            )),
            IE::FlatSensitivity { x, y, speaker } => Cow::from(format!(
                "speaker {} has flat calibration data at ({}, {})",
                speaker, x, y
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for InterpolationError {}

/// Interpolated values for one speaker in one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cell {
    /// How loud the speaker is here at its baseline output level.
    pub reference: f64,
    /// How much louder it gets per percent of output level.
    pub sensitivity: f64,
    /// The output level the reference was measured with.
    pub baseline: f64,
}

/// A dense, read-only grid of interpolated calibration data for one room.
#[derive(Debug, Clone)]
pub struct VolumeField {
    origin_size: i32,
    scale: i32,
    size: usize,
    speakers: usize,
    cells: Vec<Cell>,
    targets: Vec<f64>,
}

impl VolumeField {
    /// Interpolates `points` over the whole grid.
    pub fn build(
        points: &[PointConfiguration],
        settings: &InterpolationSettings,
    ) -> Result<Self, InterpolationError> {
        if settings.target_size <= 0
            || settings.origin_size < settings.target_size
            || settings.origin_size % settings.target_size != 0
        {
            return Err(InterpolationError::InvalidGrid);
        }
        let scale = settings.origin_size / settings.target_size;
        let speakers = Self::validate(points, settings.origin_size)?;

        let size = settings.target_size as usize + 1;
        let mapped: Vec<(i32, i32)> = points
            .iter()
            .map(|p| (p.coordinates.x / scale, p.coordinates.y / scale))
            .collect();

        let mut cells = Vec::with_capacity(size * size * speakers);
        for x in 0..size as i32 {
            for y in 0..size as i32 {
                for speaker in 0..speakers {
                    cells.push(Self::interpolate(points, &mapped, x, y, speaker, settings.power));
                }
            }
        }

        let targets = (0..speakers)
            .map(|speaker| {
                cells
                    .iter()
                    .skip(speaker)
                    .step_by(speakers)
                    .map(|c| c.reference)
                    .fold(f64::NEG_INFINITY, f64::max)
            })
            .collect();

        debug!(
            "built {}x{} volume field for {} speakers from {} points",
            size,
            size,
            speakers,
            points.len()
        );

        Ok(Self {
            origin_size: settings.origin_size,
            scale,
            size,
            speakers,
            cells,
            targets,
        })
    }

    /// Factor between room coordinates and grid cells.
    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// The grid cell a room coordinate falls into.
    pub fn map_coordinate(&self, coordinate: i32) -> i32 {
        coordinate / self.scale
    }

    /// Number of cells along each side of the grid.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of calibrated speakers.
    pub fn speaker_count(&self) -> usize {
        self.speakers
    }

    /// The loudest reference level of `speaker` anywhere in the room.
    pub fn target(&self, speaker: usize) -> Option<f64> {
        self.targets.get(speaker).copied()
    }

    /// Interpolated data of one grid cell.
    pub fn cell(&self, grid_x: usize, grid_y: usize, speaker: usize) -> Option<&Cell> {
        if grid_x >= self.size || grid_y >= self.size || speaker >= self.speakers {
            return None;
        }
        self.cells
            .get((grid_x * self.size + grid_y) * self.speakers + speaker)
    }

    /// Reference levels of `speaker` as rows of constant grid x, for drawing
    /// heat maps.
    pub fn reference_grid(&self, speaker: usize) -> Option<Vec<Vec<f64>>> {
        if speaker >= self.speakers {
            return None;
        }
        Some(
            (0..self.size)
                .map(|x| {
                    (0..self.size)
                        .filter_map(|y| self.cell(x, y, speaker).map(|c| c.reference))
                        .collect()
                })
                .collect(),
        )
    }

    /// Smallest and largest reference level of `speaker`.
    pub fn min_max(&self, speaker: usize) -> Option<(f64, f64)> {
        if speaker >= self.speakers {
            return None;
        }
        Some(
            self.cells
                .iter()
                .skip(speaker)
                .step_by(self.speakers)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
                    (lo.min(c.reference), hi.max(c.reference))
                }),
        )
    }

    /// The output level, in `[0, 1]`, that `speaker` needs at `(x, y)` to
    /// be as loud as it is at the loudest calibrated spot.
    pub fn volume_for_position(
        &self,
        x: i32,
        y: i32,
        speaker: usize,
    ) -> Result<f64, InterpolationError> {
        if !(0..=self.origin_size).contains(&x) || !(0..=self.origin_size).contains(&y) {
            return Err(InterpolationError::OutOfBounds { x, y });
        }

        let cell = self
            .cell(
                self.map_coordinate(x) as usize,
                self.map_coordinate(y) as usize,
                speaker,
            )
            .ok_or(InterpolationError::UnknownSpeaker {
                speaker,
                speakers: self.speakers,
            })?;

        if !(cell.sensitivity.abs() >= SENSITIVITY_EPSILON) {
            return Err(InterpolationError::FlatSensitivity { x, y, speaker });
        }

        let difference = self.targets[speaker] - cell.reference;
        let volume = cell.baseline + difference / cell.sensitivity / 100.0;
        if !volume.is_finite() {
            return Err(InterpolationError::FlatSensitivity { x, y, speaker });
        }

        Ok(volume.clamp(0.0, 1.0))
    }

    /// [`VolumeField::volume_for_position`] for every speaker, in channel
    /// order.
    pub fn volumes_for_position(&self, x: i32, y: i32) -> Result<Vec<f32>, InterpolationError> {
        (0..self.speakers)
            .map(|speaker| self.volume_for_position(x, y, speaker).map(|v| v as f32))
            .collect()
    }

    /// Checks that the points can be interpolated, returning the speaker
    /// count.
    fn validate(points: &[PointConfiguration], origin_size: i32) -> Result<usize, InterpolationError> {
        let first = points.first().ok_or(InterpolationError::NoPoints)?;
        let speakers = first.speaker_count();

        for (index, point) in points.iter().enumerate() {
            if point.speaker_count() == 0 || !point.is_complete() {
                return Err(InterpolationError::IncompletePoint { index });
            }
            if point.speaker_count() != speakers {
                return Err(InterpolationError::SpeakerCountMismatch {
                    index,
                    expected: speakers,
                    found: point.speaker_count(),
                });
            }
            let Point { x, y } = point.coordinates;
            if !(0..=origin_size).contains(&x) || !(0..=origin_size).contains(&y) {
                return Err(InterpolationError::PointOutOfBounds {
                    index,
                    point: point.coordinates,
                });
            }
        }

        Ok(speakers)
    }

    /// Shepard's method for one cell and speaker. A point lying in the cell
    /// is used as is.
    fn interpolate(
        points: &[PointConfiguration],
        mapped: &[(i32, i32)],
        x: i32,
        y: i32,
        speaker: usize,
        power: f64,
    ) -> Cell {
        let mut total_weight = 0.0;
        let mut total_full = 0.0;
        let mut total_half = 0.0;
        let mut total_baseline = 0.0;

        for (point, &(px, py)) in points.iter().zip(mapped) {
            let reading = &point.volumes[&speaker];

            if px == x && py == y {
                return Cell {
                    reference: reading.full as f64,
                    sensitivity: sensitivity(
                        reading.full as f64,
                        reading.half as f64,
                        reading.baseline as f64,
                    ),
                    baseline: reading.baseline as f64,
                };
            }

            let dx = (px - x) as f64;
            let dy = (py - y) as f64;
            let weight = 1.0 / (dx * dx + dy * dy).sqrt().powf(power);
            total_full += weight * reading.full as f64;
            total_half += weight * reading.half as f64;
            total_baseline += weight * reading.baseline as f64;
            total_weight += weight;
        }

        let reference = total_full / total_weight;
        let baseline = total_baseline / total_weight;
        Cell {
            reference,
            sensitivity: sensitivity(reference, total_half / total_weight, baseline),
            baseline,
        }
    }
}

/// Captured loudness change per percent of output level, going from half
/// the baseline level to the full baseline level.
fn sensitivity(full: f64, half: f64, baseline: f64) -> f64 {
    let full_gain = baseline * 100.0;
    let half_gain = full_gain / 2.0;
    let gain_change = full_gain - half_gain;
    if gain_change.abs() < SENSITIVITY_EPSILON {
        return 0.0;
    }
    (full - half) / gain_change
}
