//! Detections produced outside this process.
//!
//! An external person detector (or a log recorded from one) writes one line
//! per camera frame:
//!
//! ```text
//! +PDET:<camera>,<sequence>;<x>,<y>,<width>,<height>,<score>;...
//! ```
//!
//! A frame without detections is just `+PDET:<camera>,<sequence>`. The
//! [`DetectionFeed`] routes decoded lines to one queue per camera; every
//! queue acts as a [`FrameSource`] whose frames already carry their boxes,
//! so the matching detector only hands them through.

use crate::camera::{Camera, CameraFeed, FrameSource, Orientation, PersonDetector};
use crate::region::{DetectionBox, Region};
use crate::region_tracker::RegionTracker;
use crate::settings::TrackerSettings;

use log::{debug, warn};
use nom::{
    bytes::complete::tag,
    character::complete::{char, i32, u32},
    combinator::{all_consuming, map},
    error::Error,
    multi::many0,
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};
use std::{
    borrow::Cow,
    collections::VecDeque,
    fmt,
    io::{self, BufRead},
    str::FromStr,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

/// The detections of one camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionMessage {
    /// Index of the camera the frame came from.
    pub camera: usize,
    /// Frame counter of that camera.
    pub sequence: u32,
    /// Every person the detector found, possibly none.
    pub boxes: Vec<DetectionBox>,
}

fn parse_box(s: &str) -> IResult<&str, DetectionBox> {
    map(
        tuple((
            i32,
            preceded(char(','), i32),
            preceded(char(','), i32),
            preceded(char(','), i32),
            preceded(char(','), double),
        )),
        |(x, y, width, height, score)| {
            DetectionBox::new(Region::new(x, y, width, height), score)
        },
    )(s)
}

fn parse_detection_message(s: &str) -> IResult<&str, DetectionMessage> {
    map(
        tuple((
            preceded(tag("+PDET:"), u32),
            preceded(char(','), u32),
            many0(preceded(char(';'), parse_box)),
        )),
        |(camera, sequence, boxes)| DetectionMessage {
            camera: camera as usize,
            sequence,
            boxes,
        },
    )(s)
}

impl FromStr for DetectionMessage {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_detection_message)(s.trim()).finish() {
            Ok((_remaining, message)) => Ok(message),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

/// Returned when a detection line cannot be used.
#[derive(Debug, PartialEq)]
pub enum FeedError {
    /// Returned when the line is not a detection message.
    Parse(Error<String>),

    /// Returned when the message names a camera the feed does not have.
    #[allow(missing_docs)]
    UnknownCamera { camera: usize, cameras: usize },
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FeedError as FE;
        let msg = match self {
            FE::Parse(error) => Cow::from(format!("parse error: {}", error)),
            FE::UnknownCamera { camera, cameras } => Cow::from(format!(
                "detections for camera {}, but only {} cameras are fed",
                camera, cameras
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FeedError {}

impl From<Error<String>> for FeedError {
    fn from(value: Error<String>) -> Self {
        Self::Parse(value)
    }
}

type Queue = Arc<Mutex<VecDeque<DetectionMessage>>>;

/// Routes detection messages to one queue per camera.
#[derive(Debug, Clone)]
pub struct DetectionFeed {
    queues: Vec<Queue>,
}

impl DetectionFeed {
    /// Instantiates a new [`DetectionFeed`] for `cameras` cameras.
    pub fn new(cameras: usize) -> Self {
        Self {
            queues: (0..cameras).map(|_| Queue::default()).collect(),
        }
    }

    /// Number of cameras fed.
    pub fn camera_count(&self) -> usize {
        self.queues.len()
    }

    /// Decodes one line and queues it for its camera.
    pub fn push_line(&self, line: &str) -> Result<(), FeedError> {
        let message: DetectionMessage = line.parse()?;
        let queue = self
            .queues
            .get(message.camera)
            .ok_or(FeedError::UnknownCamera {
                camera: message.camera,
                cameras: self.queues.len(),
            })?;
        queue.lock().unwrap().push_back(message);
        Ok(())
    }

    /// Queues every line of `reader`. Blank lines are skipped, lines that
    /// cannot be used are logged and skipped. Returns the number of
    /// messages queued.
    pub fn read_from(&self, reader: impl BufRead) -> io::Result<usize> {
        let mut queued = 0;
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match self.push_line(&line) {
                Ok(()) => queued += 1,
                Err(error) => warn!("skipping detection line {}: {}", number + 1, error),
            }
        }
        debug!("queued {} detection messages", queued);
        Ok(queued)
    }

    /// Reads `reader` on its own thread until it ends, for detectors that
    /// write to a pipe while the control loop runs.
    pub fn spawn_reader<R>(&self, reader: R) -> JoinHandle<io::Result<usize>>
    where
        R: BufRead + Send + 'static,
    {
        let feed = self.clone();
        thread::spawn(move || feed.read_from(reader))
    }

    /// The frame source of `camera`.
    pub fn source(&self, camera: usize) -> Option<FeedSource> {
        self.queues.get(camera).map(|queue| FeedSource {
            queue: Arc::clone(queue),
        })
    }

    /// One tracked camera per fed camera, oriented by index.
    pub fn cameras(&self, tracker: &TrackerSettings) -> Vec<Box<dyn CameraFeed>> {
        self.queues
            .iter()
            .enumerate()
            .map(|(i, queue)| {
                let camera = Camera::new(
                    FeedSource {
                        queue: Arc::clone(queue),
                    },
                    PassthroughDetector,
                    RegionTracker::new(tracker.clone()),
                    Orientation::for_index(i),
                );
                Box::new(camera) as Box<dyn CameraFeed>
            })
            .collect()
    }
}

/// The queued messages of one camera, one per frame.
#[derive(Debug, Clone)]
pub struct FeedSource {
    queue: Queue,
}

impl FrameSource for FeedSource {
    type Frame = DetectionMessage;

    fn next_frame(&mut self) -> Option<DetectionMessage> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// Hands through the boxes a [`DetectionMessage`] already carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDetector;

impl PersonDetector<DetectionMessage> for PassthroughDetector {
    fn detect(&mut self, frame: &DetectionMessage) -> Vec<DetectionBox> {
        frame.boxes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Point;
    use std::io::Cursor;

    #[test]
    fn test_1() {
        let s = "+PDET:0,17;120,80,60,180,0.93;130,85,50,170,0.41";

        let (leftover, res) = parse_detection_message(s).unwrap();

        assert_eq!(leftover, "");
        assert_eq!(
            res,
            DetectionMessage {
                camera: 0,
                sequence: 17,
                boxes: vec![
                    DetectionBox::new(Region::new(120, 80, 60, 180), 0.93),
                    DetectionBox::new(Region::new(130, 85, 50, 170), 0.41),
                ],
            }
        );
    }

    #[test]
    fn test_2() {
        let s = "+PDET:1,18";

        let (leftover, res) = parse_detection_message(s).unwrap();

        assert_eq!(leftover, "");
        assert_eq!(
            res,
            DetectionMessage {
                camera: 1,
                sequence: 18,
                boxes: vec![],
            }
        );
    }

    #[test]
    fn test_3() {
        // boxes may stick out of the frame on the left
        let s = "+PDET:0,19;-12,40,70,200,1";

        let res: DetectionMessage = s.parse().unwrap();

        assert_eq!(
            res.boxes,
            vec![DetectionBox::new(Region::new(-12, 40, 70, 200), 1.0)]
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("+UUDF:0,1".parse::<DetectionMessage>().is_err());
        assert!("+PDET:0,1;10,10,10".parse::<DetectionMessage>().is_err());
        assert!("+PDET:0,1;10,10,10,10,0.5 trailing".parse::<DetectionMessage>().is_err());
    }

    #[test]
    fn lines_go_to_their_camera() {
        let feed = DetectionFeed::new(2);
        feed.push_line("+PDET:1,1;10,10,20,20,0.5").unwrap();
        assert_eq!(
            feed.push_line("+PDET:2,1"),
            Err(FeedError::UnknownCamera {
                camera: 2,
                cameras: 2
            })
        );

        assert_eq!(feed.source(0).unwrap().next_frame(), None);
        let mut second = feed.source(1).unwrap();
        assert_eq!(second.next_frame().unwrap().sequence, 1);
        assert_eq!(second.next_frame(), None);
    }

    #[test]
    fn recorded_log_drives_cameras() {
        let log = "\
+PDET:0,1;200,100,60,180,0.9
+PDET:1,1;300,100,40,180,0.8

not a detection
+PDET:0,2;205,100,60,180,0.9;207,110,50,160,0.7
+PDET:1,2
";
        let feed = DetectionFeed::new(2);
        assert_eq!(feed.read_from(Cursor::new(log)).unwrap(), 4);

        let mut cameras = feed.cameras(&TrackerSettings::default());
        for _ in 0..2 {
            for camera in cameras.iter_mut() {
                camera.process(true);
            }
        }

        // the second frame of camera 1 was empty, so it keeps its person
        assert_eq!(cameras[0].coordinates(), Some(Point::new(235, 0)));
        assert_eq!(cameras[1].coordinates(), Some(Point::new(0, 320)));
    }

    #[test]
    fn reader_thread_fills_the_feed() {
        let feed = DetectionFeed::new(1);
        let handle = feed.spawn_reader(Cursor::new("+PDET:0,1\n+PDET:0,2\n"));
        assert_eq!(handle.join().unwrap().unwrap(), 2);
        assert_eq!(feed.source(0).unwrap().next_frame().unwrap().sequence, 1);
    }
}
