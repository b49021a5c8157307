//! Works out where the listener is standing for a calibration position.
//!
//! The listener gets a grace period to walk to the spot. After that the
//! step watches the coordinates the control loop reports: as soon as two
//! consecutive coordinates are close enough together a countdown starts, and
//! if the listener stays put until it runs out, the average of everything
//! seen during the countdown becomes the position. Moving resets the
//! countdown.

use crate::settings::CalibrationSettings;
use crate::Point;

use log::debug;
use std::time::{Duration, Instant};

/// What the position step wants the listener to know after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionUpdate {
    /// Still in the grace period.
    #[allow(missing_docs)]
    Walking { remaining: Duration },
    /// The listener is moving, or has not been seen yet.
    Moving,
    /// The listener stands still; the position is taken once `remaining`
    /// runs out.
    #[allow(missing_docs)]
    Counting { remaining: Duration },
    /// The position has been taken.
    Settled(Point),
}

/// The position part of one calibration position.
#[derive(Debug, Clone)]
pub struct PositionStep {
    move_threshold: i32,
    stand_still: Duration,
    listening_from: Instant,
    last: Option<Point>,
    countdown_start: Option<Instant>,
    samples: Vec<Point>,
    settled: Option<Point>,
}

impl PositionStep {
    /// Instantiates a new [`PositionStep`] whose grace period starts at
    /// `now`.
    pub fn new(settings: &CalibrationSettings, now: Instant) -> Self {
        Self {
            move_threshold: settings.move_threshold,
            stand_still: settings.stand_still(),
            listening_from: now + settings.position_grace(),
            last: None,
            countdown_start: None,
            samples: Vec::new(),
            settled: None,
        }
    }

    /// Feeds the coordinate of one control-loop tick, `None` if the cameras
    /// did not agree on one.
    pub fn update(&mut self, coordinates: Option<Point>, now: Instant) -> PositionUpdate {
        if let Some(point) = self.settled {
            return PositionUpdate::Settled(point);
        }
        if now < self.listening_from {
            return PositionUpdate::Walking {
                remaining: self.listening_from - now,
            };
        }

        let Some(current) = coordinates else {
            return self.status(now);
        };

        if self.did_move(current) {
            if self.countdown_start.take().is_some() {
                debug!("listener moved to {}, countdown reset", current);
            }
            self.last = Some(current);
            return PositionUpdate::Moving;
        }
        self.last = Some(current);

        match self.countdown_start {
            None => {
                debug!("listener stands still at {}", current);
                self.countdown_start = Some(now);
                self.samples.clear();
                self.samples.push(current);
            }
            Some(start) if now.duration_since(start) >= self.stand_still => {
                let point = average(&self.samples).unwrap_or(current);
                debug!("position settled at {} from {} samples", point, self.samples.len());
                self.settled = Some(point);
                return PositionUpdate::Settled(point);
            }
            Some(_) => self.samples.push(current),
        }

        self.status(now)
    }

    /// The settled position, once there is one.
    pub fn coordinates(&self) -> Option<Point> {
        self.settled
    }

    /// Keeps following the listener once the position has been taken.
    /// Returns true when `coordinates` is a move away from the coordinate
    /// seen before it. Ticks without a coordinate are ignored.
    pub fn watch(&mut self, coordinates: Option<Point>) -> bool {
        let Some(current) = coordinates else {
            return false;
        };
        let moved = self.did_move(current);
        if moved {
            debug!("listener moved from {:?} to {}", self.last, current);
        }
        self.last = Some(current);
        moved
    }

    /// Whether `coordinates` is at least the move threshold away from the
    /// last coordinate on either axis. Always true before the first
    /// coordinate.
    pub fn did_move(&self, coordinates: Point) -> bool {
        match self.last {
            None => true,
            Some(last) => {
                (coordinates.x - last.x).abs() >= self.move_threshold
                    || (coordinates.y - last.y).abs() >= self.move_threshold
            }
        }
    }

    fn status(&self, now: Instant) -> PositionUpdate {
        match self.countdown_start {
            Some(start) => PositionUpdate::Counting {
                remaining: self.stand_still.saturating_sub(now.duration_since(start)),
            },
            None => PositionUpdate::Moving,
        }
    }
}

fn average(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as i64;
    let (x, y) = points
        .iter()
        .fold((0i64, 0i64), |(x, y), p| (x + p.x as i64, y + p.y as i64));
    Some(Point::new((x / n) as i32, (y / n) as i32))
}
