//! WAV persistence using hound
//!
//! Recordings and synthesized speech are stored as 32-bit float WAV files in
//! per-purpose directories under the local data dir.

use super::Waveform;
use crate::error::{Result, VoiceCloneError};
use hound::{WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// A directory of generated WAV files
#[derive(Debug, Clone)]
pub struct WavStore {
    dir: PathBuf,
    prefix: &'static str,
}

impl WavStore {
    pub fn new(dir: impl AsRef<Path>, prefix: &'static str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix,
        }
    }

    /// Store for microphone recordings
    pub fn recordings(dir: impl AsRef<Path>) -> Self {
        Self::new(dir, "recorded")
    }

    /// Store for synthesized speech
    pub fn outputs(dir: impl AsRef<Path>) -> Self {
        Self::new(dir, "output")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the directory exists
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            VoiceCloneError::Storage(format!(
                "Failed to create directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Generate a unique filename
    pub fn generate_filename(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.dir
            .join(format!("{}_{}_{}.wav", self.prefix, timestamp, uuid))
    }

    /// Save a waveform under a generated name and return its path
    pub fn save(&self, waveform: &Waveform) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.generate_filename();
        write_wav(&path, waveform)?;
        Ok(path)
    }
}

/// Write a waveform as a 32-bit float WAV file
pub fn write_wav(path: &Path, waveform: &Waveform) -> Result<()> {
    let spec = WavSpec {
        channels: waveform.channels,
        sample_rate: waveform.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let file = File::create(path).map_err(|e| {
        VoiceCloneError::Storage(format!("Failed to create {}: {}", path.display(), e))
    })?;

    let mut writer = WavWriter::new(BufWriter::new(file), spec)
        .map_err(|e| VoiceCloneError::Storage(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in &waveform.samples {
        writer
            .write_sample(sample)
            .map_err(|e| VoiceCloneError::Storage(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| VoiceCloneError::Storage(format!("Failed to finalize WAV file: {}", e)))
}

/// Load a WAV file with any integer or float encoding hound understands
pub fn read_wav(path: &Path) -> std::result::Result<Waveform, hound::Error> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max_value = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    Ok(Waveform::new(samples, spec.sample_rate, spec.channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = WavStore::outputs(dir.path().join("output"));
        let wave = Waveform::mono(vec![0.25, -0.25, 0.5], 24_000);

        let path = store.save(&wave).unwrap();
        assert!(path.starts_with(store.dir()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("output_"));
        assert!(name.ends_with(".wav"));

        assert_eq!(read_wav(&path).unwrap(), wave);
    }

    #[test]
    fn test_read_int_wav_scales_to_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("int.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(i16::MIN).unwrap();
        writer.write_sample(16_384i16).unwrap();
        writer.finalize().unwrap();

        let wave = read_wav(&path).unwrap();
        assert_eq!(wave.channels, 2);
        assert_eq!(wave.sample_rate, 44_100);
        assert_eq!(wave.samples, vec![-1.0, 0.5]);
    }
}
