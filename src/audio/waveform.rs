//! In-memory audio buffers and the sample-level conversions applied to them

/// Canonical sample rate expected by the voice model
pub const CANONICAL_SAMPLE_RATE: u32 = 24_000;

/// Longest reference clip accepted for cloning, in seconds
pub const MAX_REFERENCE_SECONDS: u32 = 10;

/// An owned, interleaved f32 PCM buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Create a mono waveform
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether this buffer is already 24kHz mono
    pub fn is_canonical(&self) -> bool {
        self.sample_rate == CANONICAL_SAMPLE_RATE && self.channels == 1
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> f32 {
        calculate_peak(&self.samples)
    }

    /// Average all channels into one
    pub fn into_mono(self) -> Waveform {
        if self.channels == 1 {
            return self;
        }
        let channels = self.channels as usize;
        let samples = self
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        Waveform::mono(samples, self.sample_rate)
    }

    /// Downmix and resample to the given rate
    pub fn to_mono_at(self, rate: u32) -> Waveform {
        let mono = self.into_mono();
        if mono.sample_rate == rate {
            return mono;
        }
        let samples = resample(&mono.samples, mono.sample_rate, rate);
        Waveform::mono(samples, rate)
    }

    /// Keep at most `max_frames` frames
    pub fn truncate_frames(&mut self, max_frames: usize) {
        let max_samples = max_frames * self.channels as usize;
        self.samples.truncate(max_samples);
    }
}

/// Linear-interpolation resampling of a mono signal
///
/// The output length is computed in integer arithmetic so whole-second inputs
/// stay whole-second outputs.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples[idx.min(samples.len() - 1)]
        };

        output.push(sample);
    }

    output
}

/// Calculate RMS volume from samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Calculate peak volume from samples
pub fn calculate_peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// Compress a signal into `bars` RMS values for waveform display
pub fn waveform_bars(samples: &[f32], bars: usize) -> Vec<f32> {
    if bars == 0 {
        return Vec::new();
    }
    let per_bar = samples.len() / bars;
    (0..bars)
        .map(|i| {
            let start = i * per_bar;
            let end = ((i + 1) * per_bar).min(samples.len());
            if start < end {
                calculate_rms(&samples[start..end])
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_length() {
        let samples = vec![0.0; 44_100 * 3];
        let resampled = resample(&samples, 44_100, 24_000);
        assert_eq!(resampled.len(), 24_000 * 3);
    }

    #[test]
    fn test_resample_preserves_constant_signal() {
        let samples = vec![0.5; 1000];
        let resampled = resample(&samples, 48_000, 24_000);
        assert_eq!(resampled.len(), 500);
        assert!(resampled.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = Waveform::new(vec![1.0, 0.0, 0.5, 0.5], 24_000, 2);
        let mono = stereo.into_mono();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_duration() {
        let wave = Waveform::new(vec![0.0; 48_000], 24_000, 2);
        assert_eq!(wave.frames(), 24_000);
        assert_eq!(wave.duration_seconds(), 1.0);
    }

    #[test]
    fn test_waveform_bars() {
        let bars = waveform_bars(&[1.0; 96], 4);
        assert_eq!(bars.len(), 4);
        assert!(bars.iter().all(|b| (*b - 1.0).abs() < 1e-6));
        assert_eq!(waveform_bars(&[], 3), vec![0.0, 0.0, 0.0]);
    }
}
