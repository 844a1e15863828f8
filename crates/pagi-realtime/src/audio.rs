//! PCM format, frames and small sample helpers shared by capture and playback.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::time::Instant;

/// Audio format used on both sides of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz (default: 24000, the realtime protocol's PCM16 rate)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per captured frame (default: 2400 for 100ms at 24kHz)
    pub frame_samples: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            frame_samples: 2400, // 100ms at 24kHz
        }
    }
}

impl AudioFormat {
    /// Build a format whose frames last `frame_ms` milliseconds.
    pub fn with_frame_ms(sample_rate: u32, frame_ms: u32) -> Self {
        let frame_samples = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Self {
            sample_rate,
            channels: 1,
            frame_samples,
        }
    }

    /// Milliseconds represented by `samples` mono samples at this rate.
    pub fn samples_to_ms(&self, samples: u64) -> u64 {
        samples_to_ms(samples, self.sample_rate)
    }
}

/// Floor of `samples / sample_rate * 1000`.
pub fn samples_to_ms(samples: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples * 1000 / sample_rate as u64
}

/// Fixed-size PCM16 frame produced by the capture channel
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono PCM16 samples; always exactly `AudioFormat::frame_samples` long
    pub samples: Vec<i16>,

    /// When the last sample of the frame was captured
    pub timestamp: Instant,
}

/// Encode samples as little-endian PCM16 bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert normalized f32 samples (-1.0..1.0) to PCM16, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

const SPECTRUM_WINDOW: usize = 512;

/// Coarse magnitude spectrum of `samples`, `bins` values normalized to 0.0..=1.0.
///
/// Visualization only: an FFT over at most the last 512 samples, DC skipped and
/// bins spread across the positive frequencies.
pub fn spectrum(samples: &[i16], bins: usize) -> Vec<f32> {
    if bins == 0 {
        return Vec::new();
    }
    let start = samples.len().saturating_sub(SPECTRUM_WINDOW);
    let window = &samples[start..];
    if window.len() < 2 {
        return vec![0.0; bins];
    }

    let n = window.len();
    let mut buffer: Vec<Complex<f32>> = window
        .iter()
        .map(|&s| Complex::new(s as f32 / i16::MAX as f32, 0.0))
        .collect();
    FftPlanner::<f32>::new().plan_fft_forward(n).process(&mut buffer);

    let max_k = n / 2;
    (0..bins)
        .map(|b| {
            let k = 1 + (b * max_k.saturating_sub(1)) / bins;
            (buffer[k].norm() * 2.0 / n as f32).min(1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_defaults() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 24000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.frame_samples, 2400);
    }

    #[test]
    fn test_frame_ms() {
        let format = AudioFormat::with_frame_ms(16000, 30);
        assert_eq!(format.frame_samples, 480);
        assert_eq!(format.samples_to_ms(24000), 1500);
    }

    #[test]
    fn test_pcm16_odd_byte_ignored() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x09];
        assert_eq!(pcm16_from_le_bytes(&bytes), vec![1, i16::MAX]);
    }

    #[test]
    fn test_f32_clamped() {
        assert_eq!(f32_to_pcm16(&[2.0, -2.0, 0.0]), vec![i16::MAX, -i16::MAX, 0]);
    }

    #[test]
    fn test_spectrum_silence_and_tone() {
        assert!(spectrum(&[0; 256], 8).iter().all(|m| *m == 0.0));
        assert!(spectrum(&[], 4).iter().all(|m| *m == 0.0));

        let tone: Vec<i16> = (0..512)
            .map(|i| ((i as f32 * 0.3).sin() * 16000.0) as i16)
            .collect();
        let bins = spectrum(&tone, 16);
        assert_eq!(bins.len(), 16);
        assert!(bins.iter().any(|m| *m > 0.05));
    }

    #[test]
    fn test_spectrum_peaks_at_tone_bin() {
        // 32 cycles over a 512-sample window lands exactly on FFT bin 32
        let tone: Vec<i16> = (0..512)
            .map(|i| ((2.0 * std::f32::consts::PI * 32.0 * i as f32 / 512.0).sin() * 16000.0) as i16)
            .collect();
        // With 255 bins, bin b maps to k = 1 + b, so k = 32 is bin 31
        let bins = spectrum(&tone, 255);
        let (peak, _) = bins
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
        assert_eq!(peak, 31);
        assert!(bins[31] > 0.4);
        assert!(bins[100] < 0.01);
    }
}
