//! The fixed-rate loop that turns camera frames into speaker levels.
//!
//! Every tick pulls one frame per camera, combines the cameras' coordinates
//! into one room coordinate, and while balancing, looks up the level of
//! every channel at that coordinate and hands the levels to the
//! [`VolumeFader`]. What happened during a tick is published as a
//! [`TickReport`] to every subscriber.
//!
//! The loop itself owns the cameras and the fader. Everything other threads
//! may want to change while it runs (balancing, calibrating, the room's
//! volume field) goes through a cloneable [`ControlHandle`].

use crate::audio_device::{AudioDevice, AudioError};
use crate::camera::{CameraFeed, CameraReport, FRAME_WIDTH};
use crate::point_configuration::PointConfiguration;
use crate::settings::{InterpolationSettings, Settings};
use crate::volume_fader::VolumeFader;
use crate::volume_interpolation::{InterpolationError, VolumeField};
use crate::Point;

use log::{debug, info, warn};
use std::{
    borrow::Cow,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Why a tick with a coordinate did not produce levels.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceError {
    /// Returned when balancing without a selected room.
    NoRoom,

    /// Returned when the room was calibrated with a different number of
    /// channels than the device has.
    #[allow(missing_docs)]
    ChannelMismatch { field: usize, device: usize },

    /// Returned when the volume field cannot answer.
    Interpolation(InterpolationError),

    /// Returned when the fader refuses the levels.
    Audio(AudioError),
}

impl fmt::Display for BalanceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use BalanceError as BE;
        let msg = match self {
            BE::NoRoom => Cow::from("no room selected"),
            BE::ChannelMismatch { field, device } => Cow::from(format!(
                "room was calibrated for {} channels, device has {}",
                field, device
            )),
            BE::Interpolation(error) => Cow::from(format!("interpolation error: {}", error)),
            BE::Audio(error) => Cow::from(format!("audio error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for BalanceError {}

impl From<InterpolationError> for BalanceError {
    fn from(value: InterpolationError) -> Self {
        Self::Interpolation(value)
    }
}

impl From<AudioError> for BalanceError {
    fn from(value: AudioError) -> Self {
        Self::Audio(value)
    }
}

/// The outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// One report per camera, in camera order.
    pub cameras: Vec<CameraReport>,
    /// The combined room coordinate, if every camera saw the listener.
    pub coordinates: Option<Point>,
    /// The levels handed to the fader this tick.
    pub volumes: Option<Vec<f32>>,
    /// Why balancing was skipped despite a coordinate.
    pub error: Option<BalanceError>,
}

struct Shared {
    balancing: AtomicBool,
    calibrating: AtomicBool,
    stopped: AtomicBool,
    field: RwLock<Option<Arc<VolumeField>>>,
    subscribers: Mutex<Vec<mpsc::Sender<TickReport>>>,
    interpolation: InterpolationSettings,
}

/// Controls a [`ControlLoop`] from any thread.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    /// Turns balancing on or off. Detection runs while balancing.
    pub fn set_balancing(&self, balancing: bool) {
        self.shared.balancing.store(balancing, Ordering::SeqCst);
    }

    /// Whether balancing is on.
    pub fn is_balancing(&self) -> bool {
        self.shared.balancing.load(Ordering::SeqCst)
    }

    /// Turns calibrating on or off. Detection runs while calibrating, but
    /// no levels are set, even with balancing on.
    pub fn set_calibrating(&self, calibrating: bool) {
        self.shared.calibrating.store(calibrating, Ordering::SeqCst);
    }

    /// Whether calibrating is on.
    pub fn is_calibrating(&self) -> bool {
        self.shared.calibrating.load(Ordering::SeqCst)
    }

    /// Builds the volume field for a room and balances with it from the
    /// next tick on. The previous field stays in place if building fails.
    pub fn select_room(&self, points: &[PointConfiguration]) -> Result<(), InterpolationError> {
        let field = VolumeField::build(points, &self.shared.interpolation)?;
        info!(
            "selected room with {} points and {} speakers",
            points.len(),
            field.speaker_count()
        );
        self.set_field(Some(Arc::new(field)));
        Ok(())
    }

    /// Swaps in a prebuilt field, or removes the field with `None`.
    pub fn set_field(&self, field: Option<Arc<VolumeField>>) {
        *self.shared.field.write().unwrap() = field;
    }

    /// The field currently balanced with.
    pub fn field(&self) -> Option<Arc<VolumeField>> {
        self.shared.field.read().unwrap().clone()
    }

    /// A channel receiving every [`TickReport`] from now on. Dropping the
    /// receiver unsubscribes. The channel hangs up once the loop has
    /// stopped, right away when subscribing to a stopped loop.
    pub fn subscribe(&self) -> mpsc::Receiver<TickReport> {
        let (tx, rx) = mpsc::channel();
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        if !self.is_stopped() {
            subscribers.push(tx);
        }
        rx
    }

    /// Asks the loop to stop after the current tick.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the loop was asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

/// Cameras, device and fader, ticked at a fixed rate.
pub struct ControlLoop {
    cameras: Vec<Box<dyn CameraFeed>>,
    device: Arc<dyn AudioDevice>,
    fader: VolumeFader,
    period: Duration,
    shared: Arc<Shared>,
}

impl ControlLoop {
    /// Instantiates a new [`ControlLoop`]. Camera `i` is expected to have
    /// the orientation [`Orientation::for_index`](crate::camera::Orientation::for_index)
    /// gives it, though any mix works.
    pub fn new(
        cameras: Vec<Box<dyn CameraFeed>>,
        device: Arc<dyn AudioDevice>,
        settings: &Settings,
    ) -> Self {
        Self {
            cameras,
            fader: VolumeFader::new(Arc::clone(&device), settings.fader.clone()),
            device,
            period: settings.control_loop.period(),
            shared: Arc::new(Shared {
                balancing: AtomicBool::new(false),
                calibrating: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                field: RwLock::new(None),
                subscribers: Mutex::new(Vec::new()),
                interpolation: settings.interpolation.clone(),
            }),
        }
    }

    /// A handle for controlling this loop.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The fader the loop drives.
    pub fn fader(&self) -> &VolumeFader {
        &self.fader
    }

    /// Runs one tick and publishes its report.
    pub fn tick(&mut self) -> TickReport {
        let balancing = self.shared.balancing.load(Ordering::SeqCst);
        let calibrating = self.shared.calibrating.load(Ordering::SeqCst);
        let detect_people = balancing || calibrating;

        let mut report = TickReport::default();
        let mut combined = if self.cameras.is_empty() {
            None
        } else {
            Some(Point::default())
        };

        for camera in self.cameras.iter_mut() {
            report.cameras.push(camera.process(detect_people));
            combined = match (combined, camera.coordinates()) {
                (Some(c), Some(p)) => Some(Point::new(c.x.max(p.x), c.y.max(p.y))),
                _ => None,
            };
        }

        if let Some(at) = combined {
            let at = Point::new(at.x.clamp(0, FRAME_WIDTH), at.y.clamp(0, FRAME_WIDTH));
            report.coordinates = Some(at);

            if balancing && !calibrating {
                match self.balance(at) {
                    Ok(volumes) => report.volumes = Some(volumes),
                    Err(error) => {
                        debug!("not balancing at {}: {}", at, error);
                        report.error = Some(error);
                    }
                }
            }
        }

        self.publish(&report);
        report
    }

    /// Ticks until [`ControlHandle::stop`] is called, then cancels any fade
    /// in progress and disconnects every subscriber.
    pub fn run(mut self) {
        info!("control loop running every {:?}", self.period);
        let mut next = Instant::now();

        while !self.shared.stopped.load(Ordering::SeqCst) {
            self.tick();

            next += self.period;
            let now = Instant::now();
            if next > now {
                spin_sleep::sleep(next - now);
            } else {
                // running late, do not try to catch up
                next = now;
            }
        }

        self.fader.cancel();
        // hang up on everyone waiting for a report
        self.shared.subscribers.lock().unwrap().clear();
        info!("control loop stopped");
    }

    /// Runs the loop on its own thread.
    pub fn spawn(self) -> RunningLoop {
        let control = self.handle();
        let thread = thread::spawn(move || self.run());
        RunningLoop {
            control,
            thread: Some(thread),
        }
    }

    fn balance(&self, at: Point) -> Result<Vec<f32>, BalanceError> {
        let field = self
            .shared
            .field
            .read()
            .unwrap()
            .clone()
            .ok_or(BalanceError::NoRoom)?;

        let channels = self.device.channel_count();
        if field.speaker_count() != channels {
            return Err(BalanceError::ChannelMismatch {
                field: field.speaker_count(),
                device: channels,
            });
        }

        let volumes = field.volumes_for_position(at.x, at.y)?;
        self.fader.set(volumes.clone())?;
        Ok(volumes)
    }

    fn publish(&self, report: &TickReport) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(report.clone()).is_ok());
    }
}

/// A [`ControlLoop`] running on its own thread. Stops the loop when
/// dropped.
pub struct RunningLoop {
    control: ControlHandle,
    thread: Option<JoinHandle<()>>,
}

impl RunningLoop {
    /// The handle of the running loop.
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Stops the loop and waits for its thread.
    pub fn stop(&mut self) {
        self.control.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("control loop thread panicked");
            }
        }
    }
}

impl Drop for RunningLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Orientation;
    use crate::dummy_room::SimulatedAudioDevice;
    use crate::point_configuration::ChannelReading;

    /// A camera that always reports the same coordinate and remembers
    /// whether it was asked to detect.
    struct FixedFeed {
        orientation: Orientation,
        at: Option<i32>,
        detect_calls: Arc<Mutex<Vec<bool>>>,
    }

    impl FixedFeed {
        fn boxed(orientation: Orientation, at: Option<i32>) -> (Box<dyn CameraFeed>, Arc<Mutex<Vec<bool>>>) {
            let detect_calls = Arc::new(Mutex::new(Vec::new()));
            let feed = FixedFeed {
                orientation,
                at,
                detect_calls: detect_calls.clone(),
            };
            (Box::new(feed), detect_calls)
        }
    }

    impl CameraFeed for FixedFeed {
        fn process(&mut self, detect_people: bool) -> CameraReport {
            self.detect_calls.lock().unwrap().push(detect_people);
            CameraReport {
                frame_received: true,
                ..CameraReport::default()
            }
        }

        fn coordinates(&self) -> Option<Point> {
            self.at.map(|at| match self.orientation {
                Orientation::Horizontal => Point::new(at, 0),
                Orientation::Vertical => Point::new(0, at),
            })
        }

        fn orientation(&self) -> Orientation {
            self.orientation
        }
    }

    fn diagonal_room() -> Vec<PointConfiguration> {
        vec![
            PointConfiguration::new(Point::new(0, 0), [ChannelReading::new(0.8, 0.4, 0.6)]),
            PointConfiguration::new(Point::new(250, 250), [ChannelReading::new(0.5, 0.25, 0.5)]),
            PointConfiguration::new(Point::new(500, 500), [ChannelReading::new(0.2, 0.1, 0.3)]),
        ]
    }

    fn control_loop(
        x: Option<i32>,
        y: Option<i32>,
        device: Arc<SimulatedAudioDevice>,
    ) -> (ControlLoop, Arc<Mutex<Vec<bool>>>) {
        let (horizontal, calls) = FixedFeed::boxed(Orientation::Horizontal, x);
        let (vertical, _) = FixedFeed::boxed(Orientation::Vertical, y);
        let settings = Settings::default();
        (
            ControlLoop::new(vec![horizontal, vertical], device, &settings),
            calls,
        )
    }

    #[test]
    fn every_camera_has_to_report() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, _) = control_loop(Some(250), None, device);
        control.handle().set_balancing(true);

        let report = control.tick();
        assert_eq!(report.cameras.len(), 2);
        assert_eq!(report.coordinates, None);
        assert_eq!(report.volumes, None);
        assert_eq!(report.error, None);
    }

    #[test]
    fn coordinate_takes_max_of_each_axis() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, _) = control_loop(Some(300), Some(120), device);
        assert_eq!(control.tick().coordinates, Some(Point::new(300, 120)));
    }

    #[test]
    fn no_cameras_no_coordinate() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let mut control = ControlLoop::new(Vec::new(), device, &Settings::default());
        assert_eq!(control.tick().coordinates, None);
    }

    #[test]
    fn balancing_drives_the_fader() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, calls) = control_loop(Some(250), Some(250), device.clone());
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        handle.set_balancing(true);

        let report = control.tick();
        let volumes = report.volumes.unwrap();
        assert!((volumes[0] - 0.8).abs() < 1e-5);
        assert_eq!(control.fader().target(), volumes);
        assert_eq!(*calls.lock().unwrap(), vec![true]);

        control.fader().cancel();
    }

    #[test]
    fn calibrating_detects_without_balancing() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, calls) = control_loop(Some(250), Some(250), device.clone());
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        handle.set_calibrating(true);

        let report = control.tick();
        assert_eq!(report.coordinates, Some(Point::new(250, 250)));
        assert_eq!(report.volumes, None);
        assert_eq!(device.write_count(), 0);

        handle.set_calibrating(false);
        control.tick();
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn calibrating_wins_over_balancing() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, _) = control_loop(Some(250), Some(250), device.clone());
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        handle.set_balancing(true);
        handle.set_calibrating(true);

        let report = control.tick();
        assert_eq!(report.coordinates, Some(Point::new(250, 250)));
        assert_eq!(report.volumes, None);
        assert_eq!(report.error, None);
        assert!(!control.fader().is_running());
        assert_eq!(device.write_count(), 0);

        handle.set_calibrating(false);
        assert!(control.tick().volumes.is_some());
        control.fader().cancel();
    }

    #[test]
    fn balancing_without_room_is_reported() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, _) = control_loop(Some(250), Some(250), device);
        control.handle().set_balancing(true);
        assert_eq!(control.tick().error, Some(BalanceError::NoRoom));
    }

    #[test]
    fn channel_count_has_to_match() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5, 0.5]));
        let (mut control, _) = control_loop(Some(250), Some(250), device.clone());
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        handle.set_balancing(true);

        assert_eq!(
            control.tick().error,
            Some(BalanceError::ChannelMismatch {
                field: 1,
                device: 2
            })
        );
        assert_eq!(device.write_count(), 0);
    }

    #[test]
    fn failed_room_keeps_previous_field() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (control, _) = control_loop(None, None, device);
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        assert!(handle.select_room(&[]).is_err());
        assert!(handle.field().is_some());
    }

    #[test]
    fn reports_reach_subscribers() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let (mut control, _) = control_loop(Some(10), Some(20), device);
        let handle = control.handle();
        let first = handle.subscribe();
        let second = handle.subscribe();
        drop(second);

        let report = control.tick();
        assert_eq!(first.try_recv().unwrap(), report);
        assert_eq!(control.shared.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn stopped_loop_hangs_up() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let mut running = ControlLoop::new(Vec::new(), device, &Settings::default()).spawn();
        let handle = running.control().clone();
        let reports = handle.subscribe();
        running.stop();

        // whatever was published before the stop, then the hang-up
        let hang_up = loop {
            match reports.recv_timeout(Duration::from_secs(5)) {
                Ok(_) => {}
                Err(error) => break error,
            }
        };
        assert_eq!(hang_up, mpsc::RecvTimeoutError::Disconnected);

        let late = handle.subscribe();
        assert_eq!(
            late.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn stopping_cancels_the_fade() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.0]));
        let (control, _) = control_loop(Some(250), Some(250), device.clone());
        let handle = control.handle();
        handle.select_room(&diagonal_room()).unwrap();
        handle.set_balancing(true);
        let reports = handle.subscribe();

        let mut running = control.spawn();
        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.volumes.is_some());
        running.stop();
        assert!(running.control().is_stopped());

        // a fade from 0 to 0.8 takes far longer than this test
        let reached = device.channel_level(0).unwrap();
        assert!(reached < 0.8);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(device.channel_level(0).unwrap(), reached);
    }
}
