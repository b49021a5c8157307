//! Glides output levels to their targets instead of jumping, so that
//! balancing is not heard as a series of clicks.
//!
//! The fader runs its own worker thread, started on demand by
//! [`VolumeFader::set`] and left to finish by itself once every channel has
//! arrived. Setting a new target while the worker runs simply replaces the
//! target it is heading for.

use crate::audio_device::{AudioDevice, AudioError};
use crate::settings::FaderSettings;

use log::{debug, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

/// State shared between the fader and its worker.
struct Shared {
    // the worker flips `running` off while holding this lock, so a target
    // written under it is never lost
    target: Mutex<Vec<f32>>,
    running: AtomicBool,
    cancel: AtomicBool,
}

/// Moves the levels of one [`AudioDevice`] towards a target vector.
pub struct VolumeFader {
    device: Arc<dyn AudioDevice>,
    settings: FaderSettings,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VolumeFader {
    /// Instantiates a new [`VolumeFader`] for `device`. No thread is started
    /// until the first [`VolumeFader::set`].
    pub fn new(device: Arc<dyn AudioDevice>, settings: FaderSettings) -> Self {
        Self {
            device,
            settings,
            shared: Arc::new(Shared {
                target: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Sets the levels to fade to, one per channel starting at channel 0.
    /// Starts the worker unless it is already running or every channel is
    /// already within tolerance of its target.
    pub fn set(&self, target: Vec<f32>) -> Result<(), AudioError> {
        let channels = self.device.channel_count();
        if target.len() > channels {
            return Err(AudioError::UnknownChannel {
                channel: target.len() - 1,
                channels,
            });
        }

        let mut shared_target = self.shared.target.lock().unwrap();
        *shared_target = target;

        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let settled = shared_target
            .iter()
            .enumerate()
            .map(|(channel, &t)| {
                self.device
                    .channel_level(channel)
                    .map(|current| (current - t).abs() <= self.settings.tolerance)
            })
            .collect::<Result<Vec<bool>, AudioError>>()?
            .into_iter()
            .all(|s| s);
        if settled {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);
        drop(shared_target);

        let mut handle = self.handle.lock().unwrap();
        if let Some(finished) = handle.take() {
            let _ = finished.join();
        }
        *handle = Some(self.spawn_worker());
        Ok(())
    }

    /// Stops a running fade. The channels keep whatever level they reached.
    /// Returns once the worker has stopped, which takes at most one tick.
    pub fn cancel(&self) {
        let mut handle = self.handle.lock().unwrap();
        if let Some(worker) = handle.take() {
            self.shared.cancel.store(true, Ordering::SeqCst);
            if worker.join().is_err() {
                warn!("volume fader worker panicked");
            }
            // the worker cleared `running` under the target lock on its way
            // out, and a `set` waiting for the handle starts a fresh one
            self.shared.cancel.store(false, Ordering::SeqCst);
        }
    }

    /// Whether a fade is in progress.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The target most recently handed to [`VolumeFader::set`].
    pub fn target(&self) -> Vec<f32> {
        self.shared.target.lock().unwrap().clone()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();

        thread::spawn(move || {
            let mut ticks = 0usize;
            loop {
                {
                    let target = shared.target.lock().unwrap();
                    if shared.cancel.load(Ordering::SeqCst) {
                        shared.running.store(false, Ordering::SeqCst);
                        debug!("fade canceled after {} ticks", ticks);
                        return;
                    }

                    match step_levels(&*device, &target, settings.step, settings.tolerance) {
                        Ok(true) => {
                            shared.running.store(false, Ordering::SeqCst);
                            debug!("fade settled after {} ticks", ticks);
                            return;
                        }
                        Ok(false) => {}
                        Err(error) => {
                            shared.running.store(false, Ordering::SeqCst);
                            warn!("fade aborted: {}", error);
                            return;
                        }
                    }
                }

                ticks += 1;
                spin_sleep::sleep(settings.tick());
            }
        })
    }
}

impl Drop for VolumeFader {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One fader tick: moves every channel that is not within `tolerance` of
/// its target by `step` towards it, landing exactly on the target when it is
/// closer than a step. Returns whether every channel was already settled.
pub fn step_levels(
    device: &dyn AudioDevice,
    target: &[f32],
    step: f32,
    tolerance: f32,
) -> Result<bool, AudioError> {
    let mut settled = true;

    for (channel, &t) in target.iter().enumerate() {
        let current = device.channel_level(channel)?;
        let difference = t - current;
        if difference.abs() <= tolerance {
            continue;
        }

        settled = false;
        let next = if difference.abs() <= step {
            t
        } else {
            current + step.copysign(difference)
        };
        device.set_channel_level(channel, next.clamp(0.0, 1.0))?;
    }

    Ok(settled)
}
