//! Cameras, and the two collaborators a camera needs: somewhere to get
//! frames from, and something that finds people in them.
//!
//! A [`Camera`] owns the tracking state for one physical camera: the people
//! it has confirmed so far and its detection [`History`]. The control loop
//! only sees cameras through the object-safe [`CameraFeed`] trait, so cameras
//! with different frame types can share one loop.

use crate::region::{DetectionBox, Region};
use crate::region_tracker::{History, RegionTracker};
use crate::Point;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Width, in pixels, that frames are scaled to before detection. Detector
/// boxes, and therefore room coordinates, live in `0..=FRAME_WIDTH`.
pub const FRAME_WIDTH: i32 = 500;

/// `FrameSource`
///
/// Hands out the next frame of a camera. `None` means there is no new frame
/// yet, which is not an error.
pub trait FrameSource: Send {
    /// What a frame looks like to the detector.
    type Frame;

    /// The next frame, if the camera has one.
    fn next_frame(&mut self) -> Option<Self::Frame>;
}

/// `PersonDetector`
///
/// Finds people in a frame and reports a scored box for each.
pub trait PersonDetector<F>: Send {
    /// Every person found in `frame`.
    fn detect(&mut self, frame: &F) -> Vec<DetectionBox>;
}

/// Which room axis a camera looks along. A camera facing the room from the
/// front sees the listener move left/right (room X); a camera on the side
/// wall sees the same listener move front/back, which becomes room Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    /// Facing the room from the front.
    Horizontal,
    /// Mounted on a side wall.
    Vertical,
}

impl Orientation {
    /// The conventional role for the `index`th camera: even cameras are
    /// horizontal, odd ones vertical.
    pub fn for_index(index: usize) -> Self {
        if index % 2 == 0 {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        }
    }
}

/// What one camera did during one tick; published for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraReport {
    /// Whether the frame source had a new frame.
    pub frame_received: bool,
    /// Detections above the score threshold for this frame.
    pub detections: Vec<DetectionBox>,
    /// People currently considered confirmed.
    pub people: Vec<Region>,
}

/// Object-safe view of a camera, used by the control loop.
pub trait CameraFeed: Send {
    /// Pulls the next frame and, if `detect_people` is set, updates the
    /// tracked people.
    fn process(&mut self, detect_people: bool) -> CameraReport;

    /// The room coordinate of the first confirmed person, or `None` if
    /// nobody has been confirmed. Only the axis matching the camera's
    /// [`Orientation`] is set, the other one is 0.
    fn coordinates(&self) -> Option<Point>;

    /// The axis this camera reports.
    fn orientation(&self) -> Orientation;
}

/// A frame source plus a detector plus the tracking state that ties them
/// together.
pub struct Camera<S, D>
where
    S: FrameSource,
    D: PersonDetector<S::Frame>,
{
    source: S,
    detector: D,
    tracker: RegionTracker,
    orientation: Orientation,
    frame: Option<S::Frame>,
    people: Option<Vec<Region>>,
    history: History,
}

impl<S, D> Camera<S, D>
where
    S: FrameSource,
    D: PersonDetector<S::Frame>,
{
    /// Instantiates a new [`Camera`].
    pub fn new(source: S, detector: D, tracker: RegionTracker, orientation: Orientation) -> Self {
        Self {
            source,
            detector,
            tracker,
            orientation,
            frame: None,
            people: None,
            history: History::new(),
        }
    }

    /// The most recent frame, if any frame has been received yet.
    pub fn frame(&self) -> Option<&S::Frame> {
        self.frame.as_ref()
    }

    /// People confirmed so far.
    pub fn people(&self) -> &[Region] {
        self.people.as_deref().unwrap_or(&[])
    }

    /// The detection history.
    pub fn history(&self) -> &History {
        &self.history
    }
}

impl<S, D> CameraFeed for Camera<S, D>
where
    S: FrameSource,
    D: PersonDetector<S::Frame>,
    S::Frame: Send,
{
    fn process(&mut self, detect_people: bool) -> CameraReport {
        let mut report = CameraReport::default();

        if let Some(frame) = self.source.next_frame() {
            self.frame = Some(frame);
            report.frame_received = true;
        }

        let frame = match (&self.frame, report.frame_received && detect_people) {
            (Some(frame), true) => frame,
            _ => {
                report.people = self.people().to_vec();
                return report;
            }
        };

        let regions = self.tracker.detect(&mut self.detector, frame);

        // nobody detected: assume nobody moved and keep the previous people
        if regions.is_empty() {
            trace!("no detections, keeping {} people", self.people().len());
            report.people = self.people().to_vec();
            return report;
        }

        let updated = self
            .tracker
            .normalize(&regions, self.people.as_deref(), &self.history);
        self.tracker
            .rotate_history(regions.iter().map(|d| d.region).collect(), &mut self.history);

        if !updated.is_empty() {
            debug!("{:?} camera confirmed {} people", self.orientation, updated.len());
            self.people = Some(updated);
        }

        report.detections = regions;
        report.people = self.people().to_vec();
        report
    }

    fn coordinates(&self) -> Option<Point> {
        // only the first person is tracked
        let person = self.people.as_ref()?.first()?;
        let mid = person.center_x();

        Some(match self.orientation {
            Orientation::Horizontal => Point::new(mid, 0),
            Orientation::Vertical => Point::new(0, mid),
        })
    }

    fn orientation(&self) -> Orientation {
        self.orientation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Each frame is simply the list of boxes the detector will "find".
    struct ScriptedSource(VecDeque<Option<Vec<DetectionBox>>>);

    impl FrameSource for ScriptedSource {
        type Frame = Vec<DetectionBox>;
        fn next_frame(&mut self) -> Option<Self::Frame> {
            self.0.pop_front().flatten()
        }
    }

    struct EchoDetector;

    impl PersonDetector<Vec<DetectionBox>> for EchoDetector {
        fn detect(&mut self, frame: &Vec<DetectionBox>) -> Vec<DetectionBox> {
            frame.clone()
        }
    }

    fn person(x: i32) -> DetectionBox {
        DetectionBox::new(Region::new(x, 100, 40, 120), 0.8)
    }

    fn camera(
        frames: Vec<Option<Vec<DetectionBox>>>,
        orientation: Orientation,
    ) -> Camera<ScriptedSource, EchoDetector> {
        Camera::new(
            ScriptedSource(frames.into()),
            EchoDetector,
            RegionTracker::default(),
            orientation,
        )
    }

    #[test]
    fn first_detection_is_accepted() {
        let mut cam = camera(vec![Some(vec![person(200)])], Orientation::Horizontal);
        let report = cam.process(true);
        assert!(report.frame_received);
        assert_eq!(report.people.len(), 1);
        assert_eq!(cam.coordinates(), Some(Point::new(220, 0)));
    }

    #[test]
    fn vertical_camera_reports_y() {
        let mut cam = camera(vec![Some(vec![person(200)])], Orientation::Vertical);
        cam.process(true);
        assert_eq!(cam.coordinates(), Some(Point::new(0, 220)));
    }

    #[test]
    fn empty_detection_keeps_people() {
        let mut cam = camera(
            vec![Some(vec![person(200)]), Some(vec![]), None],
            Orientation::Horizontal,
        );
        cam.process(true);
        let report = cam.process(true);
        assert!(report.frame_received);
        assert!(report.detections.is_empty());
        assert_eq!(cam.coordinates(), Some(Point::new(220, 0)));

        let report = cam.process(true);
        assert!(!report.frame_received);
        assert_eq!(cam.coordinates(), Some(Point::new(220, 0)));
    }

    #[test]
    fn no_detection_without_request() {
        let mut cam = camera(vec![Some(vec![person(200)])], Orientation::Horizontal);
        let report = cam.process(false);
        assert!(report.frame_received);
        assert!(cam.frame().is_some());
        assert_eq!(cam.coordinates(), None);
    }

    #[test]
    fn walking_person_is_followed() {
        let frames = (0..5).map(|i| Some(vec![person(100 + i * 20)])).collect();
        let mut cam = camera(frames, Orientation::Horizontal);
        for _ in 0..5 {
            cam.process(true);
        }
        assert_eq!(cam.coordinates(), Some(Point::new(200, 0)));
    }

    #[test]
    fn one_frame_ghost_does_not_steal_tracking() {
        let frames = vec![
            Some(vec![person(100)]),
            Some(vec![person(100)]),
            Some(vec![person(400)]),
        ];
        let mut cam = camera(frames, Orientation::Horizontal);
        for _ in 0..3 {
            cam.process(true);
        }
        assert_eq!(cam.people(), &[Region::new(100, 100, 40, 120)]);
        assert_eq!(cam.coordinates(), Some(Point::new(120, 0)));
    }
}
