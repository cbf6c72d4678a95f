//! Conversion of arbitrary audio into canonical reference waveforms
//!
//! WAV and FLAC decode in-process. MP3, M4A and AIFF (and WAV/FLAC files the
//! in-process decoders reject) go through an external transcoder, `ffmpeg` by
//! default. Whatever the source, the result is 24kHz mono and no longer than
//! the reference clip limit.

use super::wav::read_wav;
use super::waveform::{Waveform, CANONICAL_SAMPLE_RATE, MAX_REFERENCE_SECONDS};
use crate::error::{Result, VoiceCloneError};
use crate::process::{last_line, run_with_timeout, CommandLine, RunOutcome};
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with sources longer than the reference clip limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlengthPolicy {
    /// Keep the first `MAX_REFERENCE_SECONDS` seconds
    #[default]
    Truncate,
    /// Refuse the clip with `InvalidInput`
    Reject,
}

impl OverlengthPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlengthPolicy::Truncate => "truncate",
            OverlengthPolicy::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "truncate" => Some(OverlengthPolicy::Truncate),
            "reject" => Some(OverlengthPolicy::Reject),
            _ => None,
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            OverlengthPolicy::Truncate => OverlengthPolicy::Reject,
            OverlengthPolicy::Reject => OverlengthPolicy::Truncate,
        }
    }
}

/// Container formats accepted as voice samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Wav,
    Flac,
    Mp3,
    M4a,
    Aiff,
}

impl SourceFormat {
    /// Detect the format from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "wave" => Some(SourceFormat::Wav),
            "flac" => Some(SourceFormat::Flac),
            "mp3" => Some(SourceFormat::Mp3),
            "m4a" => Some(SourceFormat::M4a),
            "aiff" | "aif" => Some(SourceFormat::Aiff),
            _ => None,
        }
    }

    /// Whether we can decode it without the transcoder
    pub fn is_native(&self) -> bool {
        matches!(self, SourceFormat::Wav | SourceFormat::Flac)
    }

    /// Extensions shown in the file picker hint
    pub fn supported_list() -> &'static str {
        "WAV, MP3, M4A, AIFF, FLAC"
    }
}

/// Normalizer configuration
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub target_rate: u32,
    pub max_seconds: u32,
    pub policy: OverlengthPolicy,
    pub transcoder: CommandLine,
    pub transcode_timeout: Duration,
    /// Where transcoder output lands before it is decoded
    pub scratch_dir: PathBuf,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            target_rate: CANONICAL_SAMPLE_RATE,
            max_seconds: MAX_REFERENCE_SECONDS,
            policy: OverlengthPolicy::default(),
            transcoder: CommandLine::new("ffmpeg"),
            transcode_timeout: Duration::from_secs(60),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Turns files and captured buffers into canonical reference waveforms
#[derive(Debug, Clone, Default)]
pub struct FormatNormalizer {
    config: NormalizerConfig,
}

impl FormatNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn with_policy(mut self, policy: OverlengthPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Decode, downmix, resample and length-check an audio file
    pub fn normalize_file(&self, path: &Path) -> Result<Waveform> {
        if !path.is_file() {
            return Err(VoiceCloneError::InvalidInput(format!(
                "File not found: {}",
                path.display()
            )));
        }

        let format = SourceFormat::from_path(path).ok_or_else(|| {
            VoiceCloneError::InvalidInput(format!(
                "Unsupported audio format: {}. Supported formats: {}",
                path.display(),
                SourceFormat::supported_list()
            ))
        })?;

        let decoded = if format.is_native() {
            match decode_native(path, format) {
                Ok(wave) => wave,
                Err(e) => {
                    warn!(
                        "In-process decoding of {} failed ({}), falling back to transcoder",
                        path.display(),
                        e
                    );
                    self.transcode(path)?
                }
            }
        } else {
            self.transcode(path)?
        };

        info!(
            "Decoded {} ({}Hz, {} ch, {:.1}s)",
            path.display(),
            decoded.sample_rate,
            decoded.channels,
            decoded.duration_seconds()
        );

        self.normalize(decoded)
    }

    /// Apply downmix, resampling and the length policy to an in-memory buffer
    pub fn normalize(&self, waveform: Waveform) -> Result<Waveform> {
        if waveform.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "The audio contains no samples".to_string(),
            ));
        }

        let mut wave = waveform.to_mono_at(self.config.target_rate);
        let max_frames = (self.config.max_seconds as u64 * self.config.target_rate as u64) as usize;

        if wave.frames() > max_frames {
            match self.config.policy {
                OverlengthPolicy::Truncate => {
                    info!(
                        "Truncating {:.1}s clip to the first {}s",
                        wave.duration_seconds(),
                        self.config.max_seconds
                    );
                    wave.truncate_frames(max_frames);
                }
                OverlengthPolicy::Reject => {
                    return Err(VoiceCloneError::InvalidInput(format!(
                        "Audio is too long ({:.1} seconds). Maximum allowed: {} seconds.",
                        wave.duration_seconds(),
                        self.config.max_seconds
                    )));
                }
            }
        }

        Ok(wave)
    }

    /// Convert through the external transcoder and decode its WAV output
    fn transcode(&self, input: &Path) -> Result<Waveform> {
        std::fs::create_dir_all(&self.config.scratch_dir).map_err(|e| {
            VoiceCloneError::Storage(format!("Failed to create scratch directory: {}", e))
        })?;
        let output = self
            .config
            .scratch_dir
            .join(format!("voiceclone_{}.wav", uuid::Uuid::new_v4()));

        let result = self.run_transcoder(input, &output);
        let decoded = result.and_then(|_| {
            read_wav(&output).map_err(|e| {
                VoiceCloneError::TranscodeFailed(format!(
                    "{} produced an unreadable file: {}",
                    self.config.transcoder.display_name(),
                    e
                ))
            })
        });

        if output.exists() {
            if let Err(e) = std::fs::remove_file(&output) {
                debug!("Failed to remove {}: {}", output.display(), e);
            }
        }

        decoded
    }

    fn run_transcoder(&self, input: &Path, output: &Path) -> Result<()> {
        let name = self.config.transcoder.display_name();
        let mut command = self.config.transcoder.command();
        command
            .arg("-nostdin")
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-ar")
            .arg(self.config.target_rate.to_string())
            .arg("-ac")
            .arg("1")
            .arg(output);

        debug!("Running transcoder: {:?}", command);

        let outcome = run_with_timeout(command, self.config.transcode_timeout).map_err(|e| {
            VoiceCloneError::TranscodeFailed(format!("Could not launch {}: {}", name, e))
        })?;

        match outcome {
            RunOutcome::Exited { status, .. } if status.success() => Ok(()),
            RunOutcome::Exited { status, stderr } => {
                let detail = last_line(&stderr);
                Err(VoiceCloneError::TranscodeFailed(if detail.is_empty() {
                    format!("{} exited with {}", name, status)
                } else {
                    format!("{} exited with {}: {}", name, status, detail)
                }))
            }
            RunOutcome::TimedOut => Err(VoiceCloneError::TranscodeFailed(format!(
                "{} timed out after {}s",
                name,
                self.config.transcode_timeout.as_secs()
            ))),
        }
    }
}

fn decode_native(path: &Path, format: SourceFormat) -> std::result::Result<Waveform, String> {
    match format {
        SourceFormat::Wav => read_wav(path).map_err(|e| e.to_string()),
        SourceFormat::Flac => read_flac(path),
        _ => Err(format!("{:?} is not decoded in-process", format)),
    }
}

fn read_flac(path: &Path) -> std::result::Result<Waveform, String> {
    let file = File::open(path).map_err(|e| format!("Failed to open FLAC file: {}", e))?;
    let mut reader = claxon::FlacReader::new(BufReader::new(file))
        .map_err(|e| format!("Failed to read FLAC header: {:?}", e))?;

    let info = reader.streaminfo();
    let scale = (1u64 << (info.bits_per_sample.max(1) - 1)) as f32;

    let samples = reader
        .samples()
        .map(|s| s.map(|v| v as f32 / scale))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| format!("Failed to decode FLAC samples: {:?}", e))?;

    Ok(Waveform::new(samples, info.sample_rate, info.channels as u16))
}
