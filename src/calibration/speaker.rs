//! Measures how loud every speaker is at the listener's position.
//!
//! The first run plays a reference tone with every channel at its current
//! level and derives a scaling factor that maps the loudness of that tone to
//! `scaling_target`, so that readings from different microphones and rooms
//! land in a similar range. Every run after that plays two tones per
//! channel with all other channels muted: one with the channel at the level
//! it had when calibration started, one at half that level.
//!
//! Tone players report back asynchronously. Every tone gets an id and the
//! completion is posted to the calibration's event channel, so a tone that
//! ends after the calibration has moved on is recognised and ignored.

use super::CalibrationError;
use crate::audio_device::{channel_name, AudioDevice, Capture, ToneEvent, TonePlayer};
use crate::capture_writer::CaptureWriter;
use crate::point_configuration::{ChannelReading, PointConfiguration};
use crate::settings::CalibrationSettings;
use crate::test_tone::average_capture_volume;
use crate::Point;

use log::{debug, info, warn};
use std::{
    fmt,
    sync::{mpsc, Arc, Mutex},
};

/// Which of the two tones of a channel is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Volume {
    /// The channel plays at its saved level.
    Full,
    /// The channel plays at half its saved level.
    Half,
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Volume::Full => write!(f, "full"),
            Volume::Half => write!(f, "half"),
        }
    }
}

/// Where the speaker calibration is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerState {
    /// Not started yet.
    Idle,
    /// Playing the reference tone that the scaling factor is derived from.
    MeasuringBaseline,
    /// Playing a tone on `channel` at `volume`.
    Measuring {
        #[allow(missing_docs)]
        channel: usize,
        #[allow(missing_docs)]
        volume: Volume,
    },
    /// Every channel was measured and the levels are restored.
    Done,
    /// Canceled before the last channel, levels restored.
    Canceled,
    /// A tone or a capture failed.
    Failed,
}

impl SpeakerState {
    /// Whether a tone is expected to be playing.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SpeakerState::MeasuringBaseline | SpeakerState::Measuring { .. }
        )
    }
}

/// Everything the calibration reacts to while it runs.
pub enum CalibrationEvent {
    /// A tone ended. `id` tells which one.
    #[allow(missing_docs)]
    Tone { id: u64, event: ToneEvent },
    /// Someone wants the calibration to stop. The sender is signalled once
    /// the levels have been restored.
    Cancel(mpsc::Sender<()>),
}

/// Progress published to an observer while calibrating.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// What the listener should be told.
    Instructions(String),
    /// The scaled loudness of the last measurement.
    CaptureLevel(f32),
}

/// Receives [`Progress`] while calibrating.
pub type Observer = Box<dyn FnMut(Progress) + Send>;

/// How [`SpeakerCalibration::run`] ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerOutcome {
    /// Every channel has a reading.
    Completed,
    /// Canceled through a [`CalibrationHandle`].
    Canceled,
}

/// Lets another thread cancel a running [`SpeakerCalibration`].
#[derive(Clone)]
pub struct CalibrationHandle {
    tx: mpsc::Sender<CalibrationEvent>,
    running: Arc<Mutex<bool>>,
}

impl CalibrationHandle {
    /// Cancels the calibration and waits until every channel is back at its
    /// saved level. Returns immediately if nothing is running.
    pub fn cancel(&self) -> Result<(), CalibrationError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            // held while sending so `run` cannot exit without seeing the
            // request
            let running = self.running.lock().unwrap();
            if !*running {
                return Ok(());
            }
            self.tx.send(CalibrationEvent::Cancel(ack_tx))?;
        }
        ack_rx.recv()?;
        Ok(())
    }
}

/// The speaker measurement for one calibration position.
pub struct SpeakerCalibration {
    device: Arc<dyn AudioDevice>,
    player: Box<dyn TonePlayer>,
    settings: CalibrationSettings,
    state: SpeakerState,
    scaling_factor: Option<f32>,
    saved_levels: Vec<f32>,
    measured: Vec<(Option<f32>, Option<f32>)>,
    tone_id: u64,
    tx: mpsc::Sender<CalibrationEvent>,
    rx: mpsc::Receiver<CalibrationEvent>,
    running: Arc<Mutex<bool>>,
    observer: Option<Observer>,
    capture_writer: Option<CaptureWriter>,
}

impl SpeakerCalibration {
    /// Instantiates a new [`SpeakerCalibration`] measuring `device` through
    /// `player`.
    pub fn new(
        device: Arc<dyn AudioDevice>,
        player: Box<dyn TonePlayer>,
        settings: CalibrationSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            device,
            player,
            settings,
            state: SpeakerState::Idle,
            scaling_factor: None,
            saved_levels: Vec::new(),
            measured: Vec::new(),
            tone_id: 0,
            tx,
            rx,
            running: Arc::new(Mutex::new(false)),
            observer: None,
            capture_writer: None,
        }
    }

    /// Publishes progress to `observer`.
    pub fn with_observer(self, observer: impl FnMut(Progress) + Send + 'static) -> Self {
        Self {
            observer: Some(Box::new(observer)),
            ..self
        }
    }

    /// Dumps every capture through `writer`.
    pub fn with_capture_writer(self, writer: CaptureWriter) -> Self {
        Self {
            capture_writer: Some(writer),
            ..self
        }
    }

    /// A handle that cancels this calibration from another thread.
    pub fn handle(&self) -> CalibrationHandle {
        CalibrationHandle {
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Where the calibration is.
    pub fn state(&self) -> SpeakerState {
        self.state
    }

    /// The factor captures are multiplied with, once the reference tone has
    /// been measured. Kept across runs.
    pub fn scaling_factor(&self) -> Option<f32> {
        self.scaling_factor
    }

    /// Channel levels as they were when the current run started.
    pub fn saved_levels(&self) -> &[f32] {
        &self.saved_levels
    }

    /// Starts a run and processes events until it completes, fails or is
    /// canceled through a [`CalibrationHandle`]. Levels are restored in
    /// every case.
    pub fn run(&mut self) -> Result<SpeakerOutcome, CalibrationError> {
        *self.running.lock().unwrap() = true;
        let result = self.start().and_then(|_| self.pump());
        self.stop_running();
        result
    }

    /// Saves the current levels and plays the first tone. Completion of the
    /// tone arrives as an event, see [`SpeakerCalibration::handle_event`].
    pub fn start(&mut self) -> Result<(), CalibrationError> {
        if self.state.is_active() {
            return Err(CalibrationError::AlreadyRunning);
        }

        let levels = self.device.channel_levels()?;
        if levels.is_empty() {
            return Err(CalibrationError::NoChannels);
        }
        self.measured = vec![(None, None); levels.len()];
        self.saved_levels = levels;

        let started = match self.scaling_factor {
            None => {
                self.state = SpeakerState::MeasuringBaseline;
                self.instruct("Calibrating max volume".to_owned());
                self.play()
            }
            Some(_) => self.begin_measurement(0, Volume::Full),
        };
        started.map_err(|error| self.fail(error))
    }

    /// Reacts to one event. Errors have already restored the levels.
    pub fn handle_event(&mut self, event: CalibrationEvent) -> Result<(), CalibrationError> {
        match event {
            CalibrationEvent::Cancel(ack) => {
                self.cancel();
                let _ = ack.send(());
                Ok(())
            }
            CalibrationEvent::Tone { id, .. } if id != self.tone_id => {
                debug!("ignoring stale tone {}, current is {}", id, self.tone_id);
                Ok(())
            }
            CalibrationEvent::Tone { event, .. } if self.state.is_active() => match event {
                ToneEvent::Finished(capture) => self
                    .measure(capture)
                    .map_err(|error| self.fail(error)),
                ToneEvent::Failed(error) => Err(self.fail(error.into())),
                ToneEvent::Stopped => {
                    debug!("tone {} stopped", self.tone_id);
                    Ok(())
                }
            },
            CalibrationEvent::Tone { .. } => Ok(()),
        }
    }

    /// Stops the tone and puts every channel back at its saved level. The
    /// channel being measured is discarded. Safe to call at any time.
    pub fn cancel(&mut self) {
        if self.state == SpeakerState::Idle {
            return;
        }

        self.player.stop();
        if let SpeakerState::Measuring { channel, .. } = self.state {
            self.measured[channel] = (None, None);
        }
        if let Err(error) = self.restore_levels() {
            warn!("could not restore levels after cancel: {}", error);
        }
        if self.state.is_active() {
            info!("speaker calibration canceled");
            self.state = SpeakerState::Canceled;
        }
    }

    /// Restores the saved levels and returns the readings of every fully
    /// measured channel, placed at `coordinates`.
    pub fn finish(&mut self, coordinates: Point) -> Result<PointConfiguration, CalibrationError> {
        if self.state.is_active() {
            self.cancel();
        }
        self.restore_levels()?;

        let readings = self
            .measured
            .iter()
            .zip(&self.saved_levels)
            .map_while(|(&(full, half), &baseline)| {
                Some(ChannelReading::new(full?, half?, baseline))
            });
        Ok(PointConfiguration::new(coordinates, readings))
    }

    fn pump(&mut self) -> Result<SpeakerOutcome, CalibrationError> {
        loop {
            match self.state {
                SpeakerState::Done => return Ok(SpeakerOutcome::Completed),
                SpeakerState::Canceled => return Ok(SpeakerOutcome::Canceled),
                _ => {}
            }
            let event = self.rx.recv()?;
            self.handle_event(event)?;
        }
    }

    fn stop_running(&mut self) {
        *self.running.lock().unwrap() = false;

        // levels are restored in every final state, so late cancel requests
        // only need their answer
        while let Ok(event) = self.rx.try_recv() {
            if let CalibrationEvent::Cancel(ack) = event {
                let _ = ack.send(());
            }
        }
    }

    fn measure(&mut self, capture: Capture) -> Result<(), CalibrationError> {
        let level = average_capture_volume(&capture, self.settings.tone_frequency);

        match self.state {
            SpeakerState::MeasuringBaseline => {
                self.dump(&capture, "reference");
                let level = level
                    .filter(|l| *l > 0.0 && l.is_finite())
                    .ok_or(CalibrationError::SilentCapture { channel: None })?;
                let factor = self.settings.scaling_target / level;
                info!(
                    "reference tone measured at {:.4}, scaling by {:.3}",
                    level, factor
                );
                self.scaling_factor = Some(factor);
                self.report(Progress::CaptureLevel(level * factor));
                self.begin_measurement(0, Volume::Full)
            }
            SpeakerState::Measuring { channel, volume } => {
                self.dump(&capture, &format!("channel-{}-{}", channel, volume));
                let level = level.ok_or(CalibrationError::SilentCapture {
                    channel: Some(channel),
                })?;
                let scaled = level * self.scaling_factor.unwrap_or(1.0);
                debug!("channel {} at {} volume: {:.4}", channel, volume, scaled);
                self.report(Progress::CaptureLevel(scaled));

                match volume {
                    Volume::Full => {
                        self.measured[channel].0 = Some(scaled);
                        self.begin_measurement(channel, Volume::Half)
                    }
                    Volume::Half => {
                        self.measured[channel].1 = Some(scaled);
                        if channel + 1 < self.saved_levels.len() {
                            self.begin_measurement(channel + 1, Volume::Full)
                        } else {
                            self.restore_levels()?;
                            self.state = SpeakerState::Done;
                            self.instruct("Speaker calibration done".to_owned());
                            Ok(())
                        }
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn begin_measurement(&mut self, channel: usize, volume: Volume) -> Result<(), CalibrationError> {
        for other in 0..self.saved_levels.len() {
            self.device.set_channel_level(other, 0.0)?;
        }
        let level = match volume {
            Volume::Full => self.saved_levels[channel],
            Volume::Half => self.saved_levels[channel] / 2.0,
        };
        self.device.set_channel_level(channel, level)?;

        self.state = SpeakerState::Measuring { channel, volume };
        let step = match volume {
            Volume::Full => 1,
            Volume::Half => 2,
        };
        self.instruct(format!(
            "Calibrating speakers channel {} - Step {}",
            channel_name(channel),
            step
        ));
        self.play()
    }

    fn play(&mut self) -> Result<(), CalibrationError> {
        self.tone_id += 1;
        let id = self.tone_id;
        let tx = self.tx.clone();
        self.player.play(
            self.settings.tone_length(),
            Box::new(move |event| {
                // nobody may be listening any more
                let _ = tx.send(CalibrationEvent::Tone { id, event });
            }),
        )?;
        Ok(())
    }

    fn fail(&mut self, error: CalibrationError) -> CalibrationError {
        self.player.stop();
        if let Err(restore_error) = self.restore_levels() {
            warn!("could not restore levels: {}", restore_error);
        }
        warn!("speaker calibration failed: {}", error);
        self.state = SpeakerState::Failed;
        error
    }

    fn restore_levels(&self) -> Result<(), CalibrationError> {
        for (channel, &level) in self.saved_levels.iter().enumerate() {
            self.device.set_channel_level(channel, level)?;
        }
        Ok(())
    }

    fn instruct(&mut self, text: String) {
        info!("{}", text);
        self.report(Progress::Instructions(text));
    }

    fn report(&mut self, progress: Progress) {
        if let Some(observer) = self.observer.as_mut() {
            observer(progress);
        }
    }

    fn dump(&self, capture: &Capture, what: &str) {
        if let Some(writer) = &self.capture_writer {
            let name = format!("tone-{:03}-{}", self.tone_id, what);
            if let Err(error) = writer.write(&name, capture) {
                warn!("could not dump capture {}: {}", name, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_device::{AudioError, ToneCallback};
    use crate::dummy_room::SimulatedAudioDevice;
    use crate::test_tone::SineTone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Answers every tone on the spot with a sine as loud as the sum of the
    /// channel levels weighted by `gains`. From the `hold_from`th tone on it
    /// keeps the tone playing until stopped.
    struct TestPlayer {
        device: Arc<SimulatedAudioDevice>,
        gains: Vec<f32>,
        plays: Arc<AtomicUsize>,
        hold_from: Option<usize>,
        holding: Arc<AtomicBool>,
        held: Option<ToneCallback>,
    }

    impl TestPlayer {
        fn new(device: Arc<SimulatedAudioDevice>, gains: Vec<f32>) -> Self {
            Self {
                device,
                gains,
                plays: Arc::new(AtomicUsize::new(0)),
                hold_from: None,
                holding: Arc::new(AtomicBool::new(false)),
                held: None,
            }
        }
    }

    impl TonePlayer for TestPlayer {
        fn play(&mut self, _length: Duration, done: ToneCallback) -> Result<(), AudioError> {
            let n = self.plays.fetch_add(1, Ordering::SeqCst);
            if self.hold_from.map_or(false, |h| n >= h) {
                self.held = Some(done);
                self.holding.store(true, Ordering::SeqCst);
                return Ok(());
            }

            let amplitude: f32 = self
                .device
                .channel_levels()?
                .iter()
                .zip(&self.gains)
                .map(|(level, gain)| level * gain)
                .sum();
            done(ToneEvent::Finished(Capture {
                sample_rate: 16000,
                samples: SineTone::new(2000.0, 16000)
                    .with_amplitude(amplitude)
                    .take(1600)
                    .collect(),
            }));
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(done) = self.held.take() {
                done(ToneEvent::Stopped);
            }
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= b.abs() * 0.01
    }

    #[test]
    fn every_channel_is_measured_twice() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.8, 0.6]));
        let player = TestPlayer::new(device.clone(), vec![1.0, 0.5]);
        let plays = player.plays.clone();
        let mut calibration =
            SpeakerCalibration::new(device.clone(), Box::new(player), CalibrationSettings::default());

        assert_eq!(calibration.run().unwrap(), SpeakerOutcome::Completed);
        assert_eq!(calibration.state(), SpeakerState::Done);
        assert_eq!(plays.load(Ordering::SeqCst), 5);
        assert_eq!(device.channel_levels().unwrap(), vec![0.8, 0.6]);

        let point = calibration.finish(Point::new(250, 250)).unwrap();
        assert_eq!(point.coordinates, Point::new(250, 250));
        assert_eq!(point.speaker_count(), 2);

        // the reference tone had amplitude 0.8 + 0.6 * 0.5 and maps to 0.5
        let left = point.reading(0).unwrap();
        assert!(close(left.full, 0.5 * 0.8 / 1.1), "left full {}", left.full);
        assert!(close(left.half, left.full / 2.0));
        assert_eq!(left.baseline, 0.8);

        let right = point.reading(1).unwrap();
        assert!(close(right.full, 0.5 * 0.3 / 1.1), "right full {}", right.full);
        assert!(close(right.half, right.full / 2.0));
        assert_eq!(right.baseline, 0.6);
    }

    #[test]
    fn reference_tone_only_once() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5, 0.5, 0.5]));
        let player = TestPlayer::new(device.clone(), vec![1.0, 1.0, 1.0]);
        let plays = player.plays.clone();
        let mut calibration =
            SpeakerCalibration::new(device, Box::new(player), CalibrationSettings::default());

        calibration.run().unwrap();
        let factor = calibration.scaling_factor().unwrap();
        assert_eq!(plays.load(Ordering::SeqCst), 7);

        calibration.run().unwrap();
        assert_eq!(plays.load(Ordering::SeqCst), 13);
        assert_eq!(calibration.scaling_factor(), Some(factor));
        assert_eq!(
            calibration.finish(Point::default()).unwrap().speaker_count(),
            3
        );
    }

    #[test]
    fn cancel_mid_measurement_restores_levels() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.7, 0.4]));
        let mut player = TestPlayer::new(device.clone(), vec![1.0, 1.0]);
        // reference and channel 0 at full finish, channel 0 at half hangs
        player.hold_from = Some(2);
        let holding = player.holding.clone();

        let mut calibration =
            SpeakerCalibration::new(device.clone(), Box::new(player), CalibrationSettings::default());
        let handle = calibration.handle();
        let worker = thread::spawn(move || {
            let outcome = calibration.run();
            (calibration, outcome)
        });

        let start = Instant::now();
        while !holding.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.channel_levels().unwrap(), vec![0.35, 0.0]);

        handle.cancel().unwrap();
        assert_eq!(device.channel_levels().unwrap(), vec![0.7, 0.4]);

        let (mut calibration, outcome) = worker.join().unwrap();
        assert_eq!(outcome.unwrap(), SpeakerOutcome::Canceled);
        assert_eq!(calibration.state(), SpeakerState::Canceled);

        // channel 0 was in flight and is dropped
        let point = calibration.finish(Point::default()).unwrap();
        assert_eq!(point.speaker_count(), 0);
        assert_eq!(device.channel_levels().unwrap(), vec![0.7, 0.4]);

        // nothing is running any more
        handle.cancel().unwrap();
    }

    #[test]
    fn silent_reference_fails_and_can_retry() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.3, 0.9]));
        let player = TestPlayer::new(device.clone(), vec![0.0, 0.0]);
        let mut calibration =
            SpeakerCalibration::new(device.clone(), Box::new(player), CalibrationSettings::default());

        assert!(matches!(
            calibration.run(),
            Err(CalibrationError::SilentCapture { channel: None })
        ));
        assert_eq!(calibration.state(), SpeakerState::Failed);
        assert_eq!(calibration.scaling_factor(), None);
        assert_eq!(device.channel_levels().unwrap(), vec![0.3, 0.9]);

        // still silent, but starting again is allowed
        assert!(calibration.run().is_err());
    }

    #[test]
    fn stale_tones_are_ignored() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let mut player = TestPlayer::new(device.clone(), vec![1.0]);
        player.hold_from = Some(0);
        let mut calibration =
            SpeakerCalibration::new(device, Box::new(player), CalibrationSettings::default());

        calibration.start().unwrap();
        assert_eq!(calibration.state(), SpeakerState::MeasuringBaseline);

        calibration
            .handle_event(CalibrationEvent::Tone {
                id: 42,
                event: ToneEvent::Failed(AudioError::CaptureFailed("old".to_owned())),
            })
            .unwrap();
        assert_eq!(calibration.state(), SpeakerState::MeasuringBaseline);
        assert!(matches!(
            calibration.start(),
            Err(CalibrationError::AlreadyRunning)
        ));
    }

    #[test]
    fn observer_hears_instructions() {
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5, 0.5]));
        let player = TestPlayer::new(device.clone(), vec![1.0, 1.0]);
        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        let mut calibration =
            SpeakerCalibration::new(device, Box::new(player), CalibrationSettings::default())
                .with_observer(move |progress| sink.lock().unwrap().push(progress));

        calibration.run().unwrap();

        let heard = heard.lock().unwrap();
        assert_eq!(
            heard[0],
            Progress::Instructions("Calibrating max volume".to_owned())
        );
        assert!(heard.contains(&Progress::Instructions(
            "Calibrating speakers channel Right - Step 2".to_owned()
        )));
        let levels = heard
            .iter()
            .filter(|p| matches!(p, Progress::CaptureLevel(_)))
            .count();
        assert_eq!(levels, 5);
    }

    #[test]
    fn captures_are_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(SimulatedAudioDevice::new(vec![0.5]));
        let player = TestPlayer::new(device.clone(), vec![1.0]);
        let mut calibration =
            SpeakerCalibration::new(device, Box::new(player), CalibrationSettings::default())
                .with_capture_writer(CaptureWriter::new(dir.path()));

        calibration.run().unwrap();

        assert!(dir.path().join("tone-001-reference.wav").exists());
        assert!(dir.path().join("tone-002-channel-0-full.wav").exists());
        assert!(dir.path().join("tone-003-channel-0-half.wav").exists());
    }
}
