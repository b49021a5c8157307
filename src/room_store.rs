//! Calibrated rooms, and where they are kept between runs.
//!
//! A [`RoomConfiguration`] maps room names to the calibration points
//! measured in that room and remembers which room is currently selected.
//! It is loaded and saved through a [`RoomStore`], which callers pass
//! around explicitly; [`RonRoomStore`] keeps it in a RON file, and
//! [`MemoryRoomStore`] keeps it in memory for tests and simulations.

use crate::point_configuration::PointConfiguration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Returned when loading, saving or editing rooms fails.
#[derive(Debug)]
pub enum StoreError {
    /// Returned when the backing file cannot be read or written.
    IoError(std::io::Error),

    /// Returned when serialization fails.
    RonError(ron::Error),

    /// Returned when the backing file does not hold a valid configuration.
    RonSpannedError(ron::de::SpannedError),

    /// Returned when selecting a room that does not exist.
    UnknownRoom(String),

    /// Returned when adding a room under a name that is already taken.
    DuplicateRoom(String),

    /// Returned when adding a room without calibration points, or with a
    /// blank name.
    EmptyRoom,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use StoreError as SE;
        let msg = match self {
            SE::IoError(error) => Cow::from(format!("io error: {}", error)),
            SE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            SE::RonSpannedError(error) => Cow::from(format!("ron spanning error: {}", error)),
            SE::UnknownRoom(name) => Cow::from(format!("no room named {:?}", name)),
            SE::DuplicateRoom(name) => Cow::from(format!("room {:?} already exists", name)),
            SE::EmptyRoom => Cow::from("a room needs a name and at least one point"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for StoreError {}

/// Every calibrated room, plus the selected one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfiguration {
    /// The calibration points of every room, by room name.
    pub rooms: BTreeMap<String, Vec<PointConfiguration>>,
    /// Name of the room balancing uses.
    pub selected_room: Option<String>,
}

impl RoomConfiguration {
    /// Adds a newly calibrated room.
    pub fn add_room(
        &mut self,
        name: &str,
        points: Vec<PointConfiguration>,
    ) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() || points.is_empty() {
            return Err(StoreError::EmptyRoom);
        }
        if self.rooms.contains_key(name) {
            return Err(StoreError::DuplicateRoom(name.to_owned()));
        }
        self.rooms.insert(name.to_owned(), points);
        Ok(())
    }

    /// Selects a room, returning its points.
    pub fn select_room(&mut self, name: &str) -> Result<&[PointConfiguration], StoreError> {
        let points = self
            .rooms
            .get(name)
            .ok_or_else(|| StoreError::UnknownRoom(name.to_owned()))?;
        self.selected_room = Some(name.to_owned());
        Ok(points)
    }

    /// Points of the selected room, if a room is selected and still exists.
    pub fn selected_points(&self) -> Option<&[PointConfiguration]> {
        let name = self.selected_room.as_ref()?;
        self.rooms.get(name).map(Vec::as_slice)
    }

    /// Names of all rooms, sorted.
    pub fn room_names(&self) -> impl Iterator<Item = &str> {
        self.rooms.keys().map(String::as_str)
    }
}

/// `RoomStore`
///
/// Loads and saves the [`RoomConfiguration`].
pub trait RoomStore: Send + Sync {
    /// Reads the configuration. A store that was never written to gives an
    /// empty one.
    fn load(&self) -> Result<RoomConfiguration, StoreError>;

    /// Replaces the stored configuration.
    fn save(&self, configuration: &RoomConfiguration) -> Result<(), StoreError>;
}

/// A [`RoomStore`] backed by a RON file. A missing file loads as an empty
/// configuration.
#[derive(Debug, Clone)]
pub struct RonRoomStore {
    path: PathBuf,
}

impl RonRoomStore {
    /// Instantiates a new [`RonRoomStore`] reading and writing `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RoomStore for RonRoomStore {
    fn load(&self) -> Result<RoomConfiguration, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist yet, starting empty", self.path.display());
                return Ok(RoomConfiguration::default());
            }
            Err(error) => return Err(StoreError::IoError(error)),
        };

        ron::de::from_str(&text).map_err(StoreError::RonSpannedError)
    }

    fn save(&self, configuration: &RoomConfiguration) -> Result<(), StoreError> {
        let text = ron::ser::to_string_pretty(configuration, ron::ser::PrettyConfig::default())
            .map_err(StoreError::RonError)?;
        fs::write(&self.path, text).map_err(StoreError::IoError)?;
        info!(
            "saved {} rooms to {}",
            configuration.rooms.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// A [`RoomStore`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    configuration: Mutex<RoomConfiguration>,
}

impl MemoryRoomStore {
    /// Instantiates a new [`MemoryRoomStore`] holding `configuration`.
    pub fn new(configuration: RoomConfiguration) -> Self {
        Self {
            configuration: Mutex::new(configuration),
        }
    }
}

impl RoomStore for MemoryRoomStore {
    fn load(&self) -> Result<RoomConfiguration, StoreError> {
        Ok(self.configuration.lock().unwrap().clone())
    }

    fn save(&self, configuration: &RoomConfiguration) -> Result<(), StoreError> {
        *self.configuration.lock().unwrap() = configuration.clone();
        Ok(())
    }
}
