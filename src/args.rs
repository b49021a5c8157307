//! Commandline argument parser using clap for RealStereo

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Top level arguments of the `realstereo` binary
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct StereoArgs {
    #[command(subcommand)]
    /// Which task to perform, calibrating a room or balancing in one
    pub command: CommandTask,

    /// Settings file in RON. Anything it leaves out keeps its default
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// File the calibrated rooms are kept in
    #[arg(short = 'r', long = "rooms", default_value = "rooms.ron")]
    pub rooms: PathBuf,
}

/// The subcommands
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Calibrate a new room in the simulated room
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// Keep the speakers balanced while the listener moves
    #[command(about)]
    Balance(BalanceCommand),

    /// Write the default settings to a file, as a starting point
    #[command(about)]
    Settings(SettingsCommand),
}

/// Arguments of `calibrate`
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CalibrateCommand {
    /// Name the room is saved under
    #[arg(short = 'n', long = "name")]
    pub name: String,

    /// Number of positions to calibrate
    #[arg(short = 'p', long = "positions", default_value_t = 5)]
    pub positions: usize,

    /// Directory to write every calibration capture to, as WAV files
    #[arg(short = 'd', long = "dump-captures")]
    pub dump_captures: Option<PathBuf>,
}

/// Arguments of `balance`
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct BalanceCommand {
    /// Room to balance in. Defaults to the selected room
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Detection log to replay instead of simulating cameras
    #[arg(long = "script")]
    pub script: Option<PathBuf>,

    /// Number of cameras in the detection log
    #[arg(short = 'c', long = "cameras", default_value_t = 2)]
    pub cameras: usize,

    /// How long to balance, in seconds
    #[arg(short = 't', long = "time", default_value_t = 10)]
    pub seconds: u64,
}

/// Arguments of `settings`
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SettingsCommand {
    /// Filename for the settings to be written to
    #[arg(short = 'o', long = "out")]
    pub outfile: PathBuf,
}
