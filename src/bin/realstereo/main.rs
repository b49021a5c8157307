//! Runs RealStereo against a simulated room: calibrates a new room, or
//! balances in a calibrated one while the listener walks around.

use clap::Parser;
use realstereo::{
    args::{BalanceCommand, CalibrateCommand, CommandTask, StereoArgs},
    audio_device::AudioDevice,
    calibration::{
        CalibrationSession, PositionOutcome, PositionUpdate, Progress, SpeakerCalibration,
    },
    camera::{CameraFeed, Orientation},
    capture_writer::CaptureWriter,
    control_loop::ControlLoop,
    detection_decoder::DetectionFeed,
    dummy_room::{self, SimulatedAudioDevice, SimulatedRoom, SimulatedTonePlayer},
    room_store::{RoomStore, RonRoomStore},
    settings::Settings,
    Point,
};

use log::{debug, info, warn};
use std::{
    error::Error,
    fs::File,
    io::BufReader,
    mem,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

// Example:
// cargo run --bin realstereo --
//                            --rooms   rooms.ron
//                            calibrate
//                            --name    "Living room"
//                            --positions 5

/// Where the simulated listener is sent during calibration, in order.
const CALIBRATION_SPOTS: [(i32, i32); 5] = [(60, 60), (440, 60), (60, 440), (440, 440), (250, 250)];

/// Starting level of every simulated channel.
const DEVICE_LEVEL: f32 = 0.7;

/// How often a position is started over after the listener moved.
const ATTEMPTS: usize = 3;

/// Pause before starting a position over.
const RESTART_DELAY: Duration = Duration::from_secs(3);

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = StereoArgs::parse();

    let settings = match &args.settings {
        Some(path) => Settings::from_path(path)?,
        None => Settings::default(),
    };
    let store = RonRoomStore::new(&args.rooms);

    match args.command {
        CommandTask::Calibrate(command) => calibrate(&settings, &store, command),
        CommandTask::Balance(command) => balance(&settings, &store, command),
        CommandTask::Settings(command) => {
            settings.to_path(&command.outfile)?;
            info!("wrote settings to {}", command.outfile.display());
            Ok(())
        }
    }
}

fn calibrate(
    settings: &Settings,
    store: &dyn RoomStore,
    command: CalibrateCommand,
) -> Result<(), Box<dyn Error>> {
    let room = Arc::new(SimulatedRoom::stereo());
    let device = Arc::new(SimulatedAudioDevice::new(vec![
        DEVICE_LEVEL;
        room.speaker_count()
    ]));

    // noise would keep the listener from ever standing still
    let cameras = simulated_cameras(&room, settings, false);
    let mut running = ControlLoop::new(cameras, device.clone(), settings).spawn();
    let control = running.control().clone();

    let player = SimulatedTonePlayer::new(
        device.clone(),
        room.clone(),
        settings.calibration.tone_frequency,
    );
    let mut speaker = SpeakerCalibration::new(
        device.clone(),
        Box::new(player),
        settings.calibration.clone(),
    )
    .with_observer(|progress| match progress {
        Progress::Instructions(text) => info!("{}", text),
        Progress::CaptureLevel(level) => debug!("capture level {:.3}", level),
    });
    if let Some(directory) = &command.dump_captures {
        speaker = speaker.with_capture_writer(CaptureWriter::new(directory));
    }

    let mut session = CalibrationSession::new(settings.calibration.clone());
    session.begin(&control);

    let spots = CALIBRATION_SPOTS.iter().cycle().take(command.positions);
    for (i, &(x, y)) in spots.enumerate() {
        room.move_listener(Point::new(x, y));

        for attempt in 1..=ATTEMPTS {
            info!("position {} of {}, attempt {}", i + 1, command.positions, attempt);
            let mut last_update = None;
            let outcome = session.calibrate_position(&control, &mut speaker, |update| {
                if last_update != Some(mem::discriminant(&update)) {
                    match update {
                        PositionUpdate::Walking { .. } => {}
                        PositionUpdate::Moving => info!("go to the position and stand still"),
                        PositionUpdate::Counting { .. } => debug!("calculating coordinates"),
                        PositionUpdate::Settled(at) => info!("position taken at {}", at),
                    }
                }
                last_update = Some(mem::discriminant(&update));
            });

            match outcome {
                Ok(PositionOutcome::Calibrated) => break,
                Ok(PositionOutcome::Moved) => thread::sleep(RESTART_DELAY),
                Ok(PositionOutcome::Canceled) => {
                    warn!("position {} was canceled", i + 1);
                    break;
                }
                Err(error) => {
                    warn!("position {} failed: {}", i + 1, error);
                    break;
                }
            }
        }
    }

    session.end(&control);
    running.stop();

    session.save(store, &command.name)?;
    Ok(())
}

fn balance(
    settings: &Settings,
    store: &dyn RoomStore,
    command: BalanceCommand,
) -> Result<(), Box<dyn Error>> {
    let mut configuration = store.load()?;
    let points = match &command.name {
        Some(name) => configuration.select_room(name)?.to_vec(),
        None => configuration
            .selected_points()
            .ok_or("no room selected, calibrate one first or pass --name")?
            .to_vec(),
    };
    store.save(&configuration)?;

    let speakers = points.first().map(|p| p.speaker_count()).unwrap_or(0);
    let device = Arc::new(SimulatedAudioDevice::new(vec![DEVICE_LEVEL; speakers]));
    let room = Arc::new(SimulatedRoom::stereo());

    let cameras = match &command.script {
        Some(path) => {
            let feed = DetectionFeed::new(command.cameras);
            let queued = feed.read_from(BufReader::new(File::open(path)?))?;
            info!("replaying {} detections from {}", queued, path.display());
            feed.cameras(&settings.tracker)
        }
        None => simulated_cameras(&room, settings, true),
    };

    let control_loop = ControlLoop::new(cameras, device.clone(), settings);
    let control = control_loop.handle();
    control.select_room(&points)?;
    control.set_balancing(true);
    let reports = control.subscribe();
    let mut running = control_loop.spawn();

    let walker = {
        let room = room.clone();
        let length = Duration::from_secs(command.seconds);
        thread::spawn(move || walk_around(&room, length))
    };

    let deadline = Instant::now() + Duration::from_secs(command.seconds);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Ok(report) = reports.recv_timeout(remaining) else {
            break;
        };
        match (report.coordinates, report.volumes, report.error) {
            (Some(at), Some(volumes), _) => info!("listener at {}, levels {:.2?}", at, volumes),
            (Some(at), None, Some(error)) => warn!("listener at {}: {}", at, error),
            _ => debug!("listener not found"),
        }
    }

    running.stop();
    if walker.join().is_err() {
        warn!("listener thread panicked");
    }
    info!("final levels {:.2?}", device.channel_levels()?);
    Ok(())
}

fn simulated_cameras(
    room: &Arc<SimulatedRoom>,
    settings: &Settings,
    noisy: bool,
) -> Vec<Box<dyn CameraFeed>> {
    dummy_room::cameras(
        room,
        &[Orientation::for_index(0), Orientation::for_index(1)],
        &settings.tracker,
        noisy,
        0x5eed,
    )
}

/// Moves the simulated listener along the room's diagonal and back.
fn walk_around(room: &SimulatedRoom, length: Duration) {
    let start = Instant::now();
    while start.elapsed() < length {
        let phase = start.elapsed().as_secs_f32() / length.as_secs_f32();
        let along = 1.0 - (2.0 * phase - 1.0).abs();
        let at = (50.0 + 400.0 * along) as i32;
        room.move_listener(Point::new(at, at));
        thread::sleep(Duration::from_millis(50));
    }
}
