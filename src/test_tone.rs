//! The calibration test tone, and the measurement taken from what the
//! microphone records while it plays.
//!
//! The tone is a plain sine. Before measuring, the recording passes a
//! narrow band-pass around the tone frequency (a low-pass just above it,
//! then a high-pass just below it), so that background noise in the room
//! barely shows up in the measurement.

use crate::audio_device::Capture;

use std::f32::consts::PI;

/// How far above and below the tone frequency the band-pass opens.
const BAND_HALF_WIDTH: f32 = 100.0;

/// An endless sine wave.
#[derive(Debug, Clone)]
pub struct SineTone {
    frequency: f32,
    sample_rate: u32,
    amplitude: f32,
    n: u64,
}

impl SineTone {
    /// Instantiates a new full-scale [`SineTone`].
    pub fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate,
            amplitude: 1.0,
            n: 0,
        }
    }

    /// Scales the tone.
    pub fn with_amplitude(self, amplitude: f32) -> Self {
        Self { amplitude, ..self }
    }
}

impl Iterator for SineTone {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        // wrap the sample counter every second to keep the phase precise
        let t = (self.n % self.sample_rate as u64) as f32 / self.sample_rate as f32;
        self.n += 1;
        Some((2.0 * PI * self.frequency * t).sin() * self.amplitude)
    }
}

/// Second-order IIR filter with the coefficients from Robert
/// Bristow-Johnson's audio EQ cookbook.
#[derive(Debug, Clone)]
pub struct BiQuadFilter {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiQuadFilter {
    fn from_coefficients(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// A low-pass filter.
    pub fn low_pass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        Self::from_coefficients(
            (1.0 - cos_w0) / 2.0,
            1.0 - cos_w0,
            (1.0 - cos_w0) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w0,
            1.0 - alpha,
        )
    }

    /// A high-pass filter.
    pub fn high_pass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        Self::from_coefficients(
            (1.0 + cos_w0) / 2.0,
            -(1.0 + cos_w0),
            (1.0 + cos_w0) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w0,
            1.0 - alpha,
        )
    }

    /// Filters one sample.
    pub fn transform(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Runs the capture through the band-pass around `frequency`.
pub fn band_pass(capture: &Capture, frequency: f32) -> Vec<f32> {
    let rate = capture.sample_rate as f32;
    let mut low_pass = BiQuadFilter::low_pass(rate, frequency + BAND_HALF_WIDTH, 1.0);
    let mut high_pass = BiQuadFilter::high_pass(rate, frequency - BAND_HALF_WIDTH, 1.0);
    capture
        .samples
        .iter()
        .map(|&s| high_pass.transform(low_pass.transform(s)))
        .collect()
}

/// Mean absolute value of the band-passed capture, or `None` for an empty
/// capture.
pub fn average_capture_volume(capture: &Capture, frequency: f32) -> Option<f32> {
    if capture.samples.is_empty() || capture.sample_rate == 0 {
        return None;
    }
    let filtered = band_pass(capture, frequency);
    let sum: f32 = filtered.iter().map(|s| s.abs()).sum();
    Some(sum / filtered.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48000;

    fn capture_of(frequency: f32, amplitude: f32, seconds: f32) -> Capture {
        Capture {
            sample_rate: RATE,
            samples: SineTone::new(frequency, RATE)
                .with_amplitude(amplitude)
                .take((RATE as f32 * seconds) as usize)
                .collect(),
        }
    }

    #[test]
    fn sine_starts_at_zero_and_peaks() {
        let samples: Vec<f32> = SineTone::new(1000.0, 4000).take(4).collect();
        assert!(samples[0].abs() < 1e-6);
        assert!((samples[1] - 1.0).abs() < 1e-6);
        assert!(samples[2].abs() < 1e-5);
        assert!((samples[3] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn tone_passes_the_band() {
        let tone = average_capture_volume(&capture_of(2000.0, 1.0, 0.5), 2000.0).unwrap();
        // mean of |sin| is 2/pi, the filters leave the tone roughly intact
        assert!(tone > 0.4 && tone < 0.9, "tone level {}", tone);
    }

    #[test]
    fn hum_is_rejected() {
        let tone = average_capture_volume(&capture_of(2000.0, 1.0, 0.5), 2000.0).unwrap();
        let hum = average_capture_volume(&capture_of(100.0, 1.0, 0.5), 2000.0).unwrap();
        assert!(hum < tone / 10.0, "hum {} vs tone {}", hum, tone);
    }

    #[test]
    fn level_follows_amplitude() {
        let full = average_capture_volume(&capture_of(2000.0, 0.8, 0.5), 2000.0).unwrap();
        let half = average_capture_volume(&capture_of(2000.0, 0.4, 0.5), 2000.0).unwrap();
        assert!((full / half - 2.0).abs() < 0.01);
    }

    #[test]
    fn empty_capture_has_no_level() {
        assert_eq!(average_capture_volume(&Capture::default(), 2000.0), None);
    }
}
