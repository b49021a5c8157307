//! Dumps what the microphone recorded during calibration to WAV files, one
//! file per measurement, so a bad calibration can be listened to afterwards.

use crate::audio_device::Capture;

use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;
use std::path::{Path, PathBuf};

/// Writes captures as mono 32-bit float WAV files into one directory.
#[derive(Debug, Clone)]
pub struct CaptureWriter {
    directory: PathBuf,
}

impl CaptureWriter {
    /// Instantiates a new [`CaptureWriter`]. The directory has to exist.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// The directory the files land in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes `capture` to `<directory>/<name>.wav`, replacing any file of
    /// that name, and returns the path written.
    pub fn write(&self, name: &str, capture: &Capture) -> Result<PathBuf, hound::Error> {
        let path = self.directory.join(format!("{}.wav", name));
        let spec = WavSpec {
            channels: 1,
            sample_rate: capture.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };

        let mut writer = WavWriter::create(&path, spec)?;
        for &sample in &capture.samples {
            writer.write_sample(sample)?;
        }
        // finalize explicitly so header errors are not swallowed by drop
        writer.finalize()?;

        debug!(
            "wrote {} samples to {}",
            capture.samples.len(),
            path.display()
        );
        Ok(path)
    }
}
