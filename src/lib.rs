//! RealStereo keeps a multi-speaker mix balanced while the listener walks
//! around the room. Cameras watch the room, a person detector finds the
//! listener in every frame, and the listener's position is turned into a
//! level for every speaker channel, so that every speaker sounds as loud at
//! the listener's spot as it does at the loudest spot in the room.
//!
//! The pieces, from the bottom up:
//!
//! - [`region_tracker`] merges detector boxes and throws away one-frame
//!   ghosts, [`camera`] keeps that state per camera and reports a room
//!   coordinate.
//! - [`volume_interpolation`] spreads calibration measurements over the
//!   whole room and answers "how loud should speaker N be at (x, y)".
//! - [`calibration`] produces those measurements: it waits for the listener
//!   to stand still, then plays test tones through every speaker and records
//!   what the microphone hears.
//! - [`volume_fader`] glides the output levels to their targets.
//! - [`control_loop`] ties it all together at a fixed rate.
//!
//! Cameras, detectors and audio devices are reached through the traits in
//! [`camera`] and [`audio_device`]; [`dummy_room`] implements all of them
//! for a simulated room, and [`detection_decoder`] reads detections produced
//! by an external detector process.

#![warn(missing_docs)]
pub mod args;
pub mod audio_device;
pub mod calibration;
pub mod camera;
pub mod capture_writer;
pub mod control_loop;
pub mod detection_decoder;
pub mod dummy_room;
pub mod point_configuration;
pub mod region;
pub mod region_tracker;
pub mod room_store;
pub mod settings;
pub mod test_tone;
pub mod volume_fader;
pub mod volume_interpolation;

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A position in the room, in the coordinate space the cameras report:
/// `0..=500` along both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    #[allow(missing_docs)]
    pub x: i32,
    #[allow(missing_docs)]
    pub y: i32,
}

impl Point {
    /// Instantiates a new [`Point`].
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
