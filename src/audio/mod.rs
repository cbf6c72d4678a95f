//! Audio capture, conversion and playback
//!
//! This module provides:
//! - Fixed-length microphone capture via PipeWire with live levels
//! - Conversion of files and buffers into 24kHz mono reference clips
//! - Non-blocking playback with stop handles
//! - WAV persistence via hound

mod capture;
mod normalize;
mod playback;
pub mod wav;
mod waveform;

pub use capture::{finish_capture, AudioCapture, SharedCaptureState, DEFAULT_RECORD_SECONDS};
pub use normalize::{FormatNormalizer, NormalizerConfig, OverlengthPolicy, SourceFormat};
pub use playback::{PlaybackHandle, PlaybackService, SharedPlaybackState};
pub use wav::WavStore;
pub use waveform::{Waveform, CANONICAL_SAMPLE_RATE, MAX_REFERENCE_SECONDS};
