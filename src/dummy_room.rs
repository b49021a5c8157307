//! A room that only exists in memory: a listener, some speakers, cameras
//! that see the listener with a bit of noise, and a microphone that hears
//! the speakers according to how far away they are.
//!
//! Nothing in here is realistic acoustics. It is just enough to drive the
//! whole pipeline (tracking, calibration, balancing) without hardware.

use crate::audio_device::{AudioDevice, AudioError, Capture, ToneCallback, ToneEvent, TonePlayer};
use crate::camera::{Camera, CameraFeed, FrameSource, Orientation, PersonDetector, FRAME_WIDTH};
use crate::region::{DetectionBox, Region};
use crate::region_tracker::RegionTracker;
use crate::settings::TrackerSettings;
use crate::test_tone::SineTone;
use crate::Point;

use log::trace;
use rand::prelude::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc, Mutex,
};
use std::thread;
use std::time::Duration;

/// Distance, in room units, at which a speaker is heard at half its
/// loudness.
const HALF_LOUDNESS_DISTANCE: f32 = 250.0;

const PERSON_HEIGHT: i32 = 200;

/// Where everybody is.
#[derive(Debug)]
pub struct SimulatedRoom {
    listener: Mutex<Point>,
    speakers: Vec<Point>,
}

impl SimulatedRoom {
    /// Instantiates a new [`SimulatedRoom`] with one speaker per entry of
    /// `speakers`, in channel order.
    pub fn new(speakers: Vec<Point>, listener: Point) -> Self {
        Self {
            listener: Mutex::new(listener),
            speakers,
        }
    }

    /// Two speakers in the front corners, listener in the middle.
    pub fn stereo() -> Self {
        Self::new(
            vec![Point::new(0, 0), Point::new(FRAME_WIDTH, 0)],
            Point::new(FRAME_WIDTH / 2, FRAME_WIDTH / 2),
        )
    }

    /// Where the listener stands.
    pub fn listener(&self) -> Point {
        *self.listener.lock().unwrap()
    }

    /// Puts the listener somewhere else.
    pub fn move_listener(&self, to: Point) {
        trace!("listener moves to {}", to);
        *self.listener.lock().unwrap() = to;
    }

    /// Number of speakers in the room.
    pub fn speaker_count(&self) -> usize {
        self.speakers.len()
    }

    /// How much of `channel`'s output reaches the listener.
    pub fn gain(&self, channel: usize) -> f32 {
        let listener = self.listener();
        self.speakers
            .get(channel)
            .map(|speaker| {
                let dx = (speaker.x - listener.x) as f32;
                let dy = (speaker.y - listener.y) as f32;
                1.0 / (1.0 + (dx * dx + dy * dy).sqrt() / HALF_LOUDNESS_DISTANCE)
            })
            .unwrap_or(0.0)
    }

    /// Total loudness at the listener for the given channel levels.
    pub fn loudness(&self, levels: &[f32]) -> f32 {
        levels
            .iter()
            .enumerate()
            .map(|(channel, level)| level * self.gain(channel))
            .sum()
    }
}

/// An output device that only stores its levels.
#[derive(Debug)]
pub struct SimulatedAudioDevice {
    levels: Mutex<Vec<f32>>,
    writes: AtomicUsize,
}

impl SimulatedAudioDevice {
    /// Instantiates a new [`SimulatedAudioDevice`] with one channel per
    /// level.
    pub fn new(levels: Vec<f32>) -> Self {
        Self {
            levels: Mutex::new(levels),
            writes: AtomicUsize::new(0),
        }
    }

    /// How many times a level was set.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl AudioDevice for SimulatedAudioDevice {
    fn channel_count(&self) -> usize {
        self.levels.lock().unwrap().len()
    }

    fn channel_level(&self, channel: usize) -> Result<f32, AudioError> {
        let levels = self.levels.lock().unwrap();
        levels
            .get(channel)
            .copied()
            .ok_or(AudioError::UnknownChannel {
                channel,
                channels: levels.len(),
            })
    }

    fn set_channel_level(&self, channel: usize, level: f32) -> Result<(), AudioError> {
        let mut levels = self.levels.lock().unwrap();
        let channels = levels.len();
        let slot = levels
            .get_mut(channel)
            .ok_or(AudioError::UnknownChannel { channel, channels })?;
        *slot = level.clamp(0.0, 1.0);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A camera whose frames are simply where the listener is. Every so often
/// it has no new frame.
pub struct SimulatedCamera {
    room: Arc<SimulatedRoom>,
    drop_rate: f64,
    rng: StdRng,
}

impl SimulatedCamera {
    /// Instantiates a new [`SimulatedCamera`] that skips a frame with
    /// probability `drop_rate`.
    pub fn new(room: Arc<SimulatedRoom>, drop_rate: f64, seed: u64) -> Self {
        Self {
            room,
            drop_rate,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl FrameSource for SimulatedCamera {
    type Frame = Point;

    fn next_frame(&mut self) -> Option<Point> {
        if self.rng.gen_bool(self.drop_rate) {
            return None;
        }
        Some(self.room.listener())
    }
}

/// Finds the listener in a [`SimulatedCamera`] frame the way a real
/// detector would: a few overlapping boxes per person, boxes that wobble,
/// the odd miss and the odd ghost.
pub struct SyntheticDetector {
    orientation: Orientation,
    /// How far, in room units, a box may be off.
    pub jitter: i32,
    /// Chance of seeing nobody.
    pub miss_rate: f64,
    /// Chance of an extra box where nobody is.
    pub ghost_rate: f64,
    /// Maximum number of boxes reported for the listener.
    pub max_boxes: usize,
    rng: StdRng,
}

impl SyntheticDetector {
    /// Instantiates a new [`SyntheticDetector`] for a camera with the given
    /// orientation. Starts out noiseless.
    pub fn new(orientation: Orientation, seed: u64) -> Self {
        Self {
            orientation,
            jitter: 0,
            miss_rate: 0.0,
            ghost_rate: 0.0,
            max_boxes: 1,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The usual amount of noise.
    pub fn noisy(self) -> Self {
        Self {
            jitter: 8,
            miss_rate: 0.05,
            ghost_rate: 0.05,
            max_boxes: 3,
            ..self
        }
    }

    fn person_box(&mut self, center: i32) -> DetectionBox {
        // even widths keep the box centred on the listener
        let width = 2 * self.rng.gen_range(35..=45);
        let top = 120 + self.rng.gen_range(-10..=10);
        DetectionBox::new(
            Region::new(center - width / 2, top, width, PERSON_HEIGHT),
            self.rng.gen_range(0.4..1.0),
        )
    }
}

impl PersonDetector<Point> for SyntheticDetector {
    fn detect(&mut self, listener: &Point) -> Vec<DetectionBox> {
        let mut boxes = Vec::new();

        if self.ghost_rate > 0.0 && self.rng.gen_bool(self.ghost_rate) {
            let x = self.rng.gen_range(0..FRAME_WIDTH - 60);
            boxes.push(DetectionBox::new(
                Region::new(x, 100, 60, 150),
                self.rng.gen_range(0.2..0.6),
            ));
        }
        if self.miss_rate > 0.0 && self.rng.gen_bool(self.miss_rate) {
            return boxes;
        }

        let along = match self.orientation {
            Orientation::Horizontal => listener.x,
            Orientation::Vertical => listener.y,
        };
        let center = along + self.rng.gen_range(-self.jitter..=self.jitter);
        let count = self.rng.gen_range(1..=self.max_boxes.max(1));
        for _ in 0..count {
            let person = self.person_box(center);
            boxes.push(person);
        }
        boxes
    }
}

/// One tracked camera per entry of `orientations`, all watching `room`.
pub fn cameras(
    room: &Arc<SimulatedRoom>,
    orientations: &[Orientation],
    tracker: &TrackerSettings,
    noisy: bool,
    seed: u64,
) -> Vec<Box<dyn CameraFeed>> {
    orientations
        .iter()
        .enumerate()
        .map(|(i, &orientation)| {
            let seed = seed.wrapping_add(i as u64 * 2);
            let detector = SyntheticDetector::new(orientation, seed.wrapping_add(1));
            let (detector, drop_rate) = if noisy {
                (detector.noisy(), 0.1)
            } else {
                (detector, 0.0)
            };
            let camera = Camera::new(
                SimulatedCamera::new(Arc::clone(room), drop_rate, seed),
                detector,
                RegionTracker::new(tracker.clone()),
                orientation,
            );
            Box::new(camera) as Box<dyn CameraFeed>
        })
        .collect()
}

/// Plays tones into a [`SimulatedRoom`]. The capture is a sine as loud as
/// the room makes the device's current levels, plus some noise.
pub struct SimulatedTonePlayer {
    device: Arc<dyn AudioDevice>,
    room: Arc<SimulatedRoom>,
    sample_rate: u32,
    frequency: f32,
    noise: f32,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SimulatedTonePlayer {
    /// Instantiates a new [`SimulatedTonePlayer`] recording at 16 kHz.
    pub fn new(device: Arc<dyn AudioDevice>, room: Arc<SimulatedRoom>, frequency: f32) -> Self {
        Self {
            device,
            room,
            sample_rate: 16000,
            frequency,
            noise: 0.001,
            stop_tx: None,
            handle: None,
        }
    }

    /// Sets the amplitude of the background noise.
    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }
}

impl TonePlayer for SimulatedTonePlayer {
    fn play(&mut self, length: Duration, done: ToneCallback) -> Result<(), AudioError> {
        self.stop();

        let amplitude = self.room.loudness(&self.device.channel_levels()?);
        let sample_rate = self.sample_rate;
        let frequency = self.frequency;
        let noise = self.noise;
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            // playing is waiting; a stop request or a dropped player cuts
            // the tone short
            if stop_rx.recv_timeout(length) != Err(mpsc::RecvTimeoutError::Timeout) {
                done(ToneEvent::Stopped);
                return;
            }

            let mut rng = StdRng::from_entropy();
            let count = (sample_rate as f64 * length.as_secs_f64()) as usize;
            let samples = SineTone::new(frequency, sample_rate)
                .with_amplitude(amplitude)
                .take(count)
                .map(|s| s + rng.gen_range(-noise..=noise))
                .collect();
            done(ToneEvent::Finished(Capture {
                sample_rate,
                samples,
            }));
        });

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedTonePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_tone::average_capture_volume;

    fn play_and_wait(player: &mut SimulatedTonePlayer, length: Duration) -> ToneEvent {
        let (tx, rx) = mpsc::channel();
        player
            .play(length, Box::new(move |event| tx.send(event).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn device_levels_stay_in_range() {
        let device = SimulatedAudioDevice::new(vec![0.5, 0.5]);
        device.set_channel_level(0, 1.5).unwrap();
        device.set_channel_level(1, -0.5).unwrap();
        assert_eq!(device.channel_levels().unwrap(), vec![1.0, 0.0]);
        assert_eq!(device.write_count(), 2);
        assert_eq!(
            device.set_channel_level(2, 0.5),
            Err(AudioError::UnknownChannel {
                channel: 2,
                channels: 2
            })
        );
    }

    #[test]
    fn nearer_speakers_are_louder() {
        let room = SimulatedRoom::stereo();
        room.move_listener(Point::new(50, 50));
        assert!(room.gain(0) > room.gain(1));
        room.move_listener(Point::new(250, 0));
        assert!((room.gain(0) - room.gain(1)).abs() < 1e-6);
        assert!((room.gain(0) - 0.5).abs() < 1e-6);
        assert_eq!(room.gain(7), 0.0);
    }

    #[test]
    fn capture_follows_levels() {
        let room = Arc::new(SimulatedRoom::stereo());
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.8, 0.0]));
        let mut player = SimulatedTonePlayer::new(device.clone(), room, 2000.0).with_noise(0.0);

        let full = match play_and_wait(&mut player, Duration::from_millis(50)) {
            ToneEvent::Finished(capture) => average_capture_volume(&capture, 2000.0).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        device.set_channel_level(0, 0.4).unwrap();
        let half = match play_and_wait(&mut player, Duration::from_millis(50)) {
            ToneEvent::Finished(capture) => average_capture_volume(&capture, 2000.0).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert!((full / half - 2.0).abs() < 0.01);
    }

    #[test]
    fn stop_cuts_tone_short() {
        let room = Arc::new(SimulatedRoom::stereo());
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5, 0.5]));
        let mut player = SimulatedTonePlayer::new(device, room, 2000.0);

        let (tx, rx) = mpsc::channel();
        player
            .play(
                Duration::from_secs(60),
                Box::new(move |event| tx.send(event).unwrap()),
            )
            .unwrap();
        player.stop();
        assert_eq!(rx.try_recv().unwrap(), ToneEvent::Stopped);
    }

    #[test]
    fn cameras_find_the_listener() {
        let room = Arc::new(SimulatedRoom::stereo());
        room.move_listener(Point::new(120, 380));
        let mut cameras = cameras(
            &room,
            &[Orientation::Horizontal, Orientation::Vertical],
            &TrackerSettings::default(),
            false,
            7,
        );

        for _ in 0..3 {
            for camera in cameras.iter_mut() {
                camera.process(true);
            }
        }
        assert_eq!(cameras[0].coordinates(), Some(Point::new(120, 0)));
        assert_eq!(cameras[1].coordinates(), Some(Point::new(0, 380)));
    }

    #[test]
    fn noisy_detector_stays_near_listener() {
        let mut detector = SyntheticDetector::new(Orientation::Horizontal, 3).noisy();
        detector.ghost_rate = 0.0;
        detector.miss_rate = 0.0;
        for _ in 0..100 {
            let boxes = detector.detect(&Point::new(300, 0));
            assert!(!boxes.is_empty() && boxes.len() <= 3);
            for b in boxes {
                assert!((b.region.center_x() - 300).abs() <= 8);
            }
        }
    }
}
