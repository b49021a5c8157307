//! Calibrating a whole room: one position after the other, each made of a
//! [`PositionStep`] followed by a [`SpeakerCalibration`], until the room is
//! saved under a name.
//!
//! The listener is followed the whole time. Should they walk away while the
//! speakers are measured, the measurement no longer belongs to the position
//! that was taken, so it is canceled and the position has to be started
//! again.

use super::position::{PositionStep, PositionUpdate};
use super::speaker::{CalibrationHandle, SpeakerCalibration, SpeakerOutcome};
use super::CalibrationError;
use crate::control_loop::{ControlHandle, TickReport};
use crate::point_configuration::PointConfiguration;
use crate::room_store::RoomStore;
use crate::settings::CalibrationSettings;
use crate::Point;

use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// How long to wait for a tick report before looking for a cancel request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a calibration position ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    /// The position was measured and added to the session.
    Calibrated,
    /// The position was canceled. Nothing was added.
    Canceled,
    /// The listener moved while the speakers were measured. Nothing was
    /// added and the position should be started again.
    Moved,
}

/// Cancels the position a [`CalibrationSession`] is working on, from any
/// thread. A request made between positions cancels the next one.
#[derive(Debug, Clone)]
pub struct PositionCancel {
    requested: Arc<AtomicBool>,
}

impl PositionCancel {
    /// Asks the session to give up on the current position.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

/// The positions calibrated so far for a room that is not saved yet.
#[derive(Debug)]
pub struct CalibrationSession {
    settings: CalibrationSettings,
    points: Vec<PointConfiguration>,
    previous_balancing: Option<bool>,
    cancel: Arc<AtomicBool>,
}

impl CalibrationSession {
    /// Instantiates a new, empty [`CalibrationSession`].
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            settings,
            points: Vec::new(),
            previous_balancing: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that cancels the position in progress.
    pub fn cancel_handle(&self) -> PositionCancel {
        PositionCancel {
            requested: Arc::clone(&self.cancel),
        }
    }

    /// Switches the control loop to calibrating, remembering whether it was
    /// balancing.
    pub fn begin(&mut self, control: &ControlHandle) {
        if self.previous_balancing.is_none() {
            self.previous_balancing = Some(control.is_balancing());
        }
        control.set_calibrating(true);
        control.set_balancing(false);
    }

    /// Switches the control loop back to what it did before
    /// [`CalibrationSession::begin`].
    pub fn end(&mut self, control: &ControlHandle) {
        if let Some(balancing) = self.previous_balancing.take() {
            control.set_calibrating(false);
            control.set_balancing(balancing);
        }
    }

    /// A fresh position step whose grace period starts at `now`.
    pub fn begin_position(&self, now: Instant) -> PositionStep {
        info!("go to the position and stand still");
        PositionStep::new(&self.settings, now)
    }

    /// Feeds tick reports into a fresh [`PositionStep`] until the listener
    /// has stood still long enough, passing every update to `on_update`.
    /// Returns `None` when canceled through a [`PositionCancel`], and an
    /// error once the control loop has stopped.
    pub fn wait_for_position(
        &self,
        reports: &mpsc::Receiver<TickReport>,
        on_update: impl FnMut(PositionUpdate),
    ) -> Result<Option<Point>, CalibrationError> {
        Ok(self.settle(reports, on_update)?.map(|(at, _)| at))
    }

    /// Takes the speaker readings of a completed measurement at
    /// `coordinates`. Levels are restored even when the readings are
    /// incomplete.
    pub fn complete_position(
        &mut self,
        coordinates: Point,
        speaker: &mut SpeakerCalibration,
    ) -> Result<&PointConfiguration, CalibrationError> {
        let point = speaker.finish(coordinates)?;
        let expected = speaker.saved_levels().len();
        if point.speaker_count() != expected {
            return Err(CalibrationError::IncompleteMeasurement {
                expected,
                found: point.speaker_count(),
            });
        }

        info!(
            "position {} calibrated at {}",
            self.points.len() + 1,
            coordinates
        );
        self.points.push(point);
        Ok(&self.points[self.points.len() - 1])
    }

    /// One full position: waits for the listener to stand still, then
    /// measures the speakers while still following the listener. Only a
    /// [`PositionOutcome::Calibrated`] position is added.
    pub fn calibrate_position(
        &mut self,
        control: &ControlHandle,
        speaker: &mut SpeakerCalibration,
        on_update: impl FnMut(PositionUpdate),
    ) -> Result<PositionOutcome, CalibrationError> {
        let reports = control.subscribe();
        let Some((at, step)) = self.settle(&reports, on_update)? else {
            return Ok(PositionOutcome::Canceled);
        };

        debug!("measuring speakers at {}", at);
        let handle = speaker.handle();
        let cancel = Arc::clone(&self.cancel);
        let measuring = AtomicBool::new(true);
        let (outcome, interrupted) = thread::scope(|scope| {
            let measuring = &measuring;
            let watcher =
                scope.spawn(move || watch_listener(step, reports, &handle, &cancel, measuring));
            let outcome = speaker.run();
            measuring.store(false, Ordering::SeqCst);
            let interrupted = watcher.join().unwrap_or_else(|_| {
                warn!("listener watcher panicked");
                None
            });
            (outcome, interrupted)
        });

        match (interrupted, outcome?) {
            (Some(PositionOutcome::Moved), _) => {
                speaker.finish(at)?;
                warn!("You moved during configuration. Restarting position.");
                Ok(PositionOutcome::Moved)
            }
            (Some(_), _) | (None, SpeakerOutcome::Canceled) => {
                speaker.finish(at)?;
                Ok(PositionOutcome::Canceled)
            }
            (None, SpeakerOutcome::Completed) => {
                self.complete_position(at, speaker)?;
                Ok(PositionOutcome::Calibrated)
            }
        }
    }

    /// The positions calibrated so far.
    pub fn points(&self) -> &[PointConfiguration] {
        &self.points
    }

    /// Adds the session to the stored rooms as `name` and selects it.
    pub fn save(&self, store: &dyn RoomStore, name: &str) -> Result<(), CalibrationError> {
        if self.points.is_empty() {
            return Err(CalibrationError::NothingToSave);
        }

        let mut configuration = store.load()?;
        configuration.add_room(name, self.points.clone())?;
        configuration.select_room(name.trim())?;
        store.save(&configuration)?;

        info!("saved room {:?} with {} positions", name.trim(), self.points.len());
        Ok(())
    }

    fn settle(
        &self,
        reports: &mpsc::Receiver<TickReport>,
        mut on_update: impl FnMut(PositionUpdate),
    ) -> Result<Option<(Point, PositionStep)>, CalibrationError> {
        let mut step = self.begin_position(Instant::now());
        loop {
            if self.cancel.swap(false, Ordering::SeqCst) {
                info!("position canceled");
                return Ok(None);
            }

            let report = match reports.recv_timeout(POLL_INTERVAL) {
                Ok(report) => report,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(CalibrationError::Disconnected)
                }
            };

            let update = step.update(report.coordinates, Instant::now());
            on_update(update);
            if let PositionUpdate::Settled(at) = update {
                return Ok(Some((at, step)));
            }
        }
    }
}

/// Follows the listener while the speakers are measured. Cancels the
/// measurement when the listener moves or a cancel is requested, and tells
/// which of the two happened.
fn watch_listener(
    mut step: PositionStep,
    reports: mpsc::Receiver<TickReport>,
    speaker: &CalibrationHandle,
    cancel: &AtomicBool,
    measuring: &AtomicBool,
) -> Option<PositionOutcome> {
    let interrupted = loop {
        if !measuring.load(Ordering::SeqCst) {
            return None;
        }
        if cancel.swap(false, Ordering::SeqCst) {
            break PositionOutcome::Canceled;
        }

        match reports.recv_timeout(POLL_INTERVAL) {
            Ok(report) => {
                if step.watch(report.coordinates) {
                    break PositionOutcome::Moved;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // the loop is gone, nothing left to watch
            Err(mpsc::RecvTimeoutError::Disconnected) => return None,
        }
    };

    if let Err(error) = speaker.cancel() {
        warn!("could not cancel speaker calibration: {}", error);
    }
    Some(interrupted)
}
