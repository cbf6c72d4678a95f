//! Session data: reference clips, synthesis requests and their outputs

use crate::audio::{Waveform, MAX_REFERENCE_SECONDS};
use crate::error::{Result, VoiceCloneError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a reference clip came from
#[derive(Debug, Clone, PartialEq)]
pub enum ClipSource {
    Recorded { saved_to: Option<PathBuf> },
    File(PathBuf),
}

/// A canonical voice sample used as the cloning reference
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceClip {
    waveform: Waveform,
    pub display_name: String,
    pub source: ClipSource,
}

impl ReferenceClip {
    /// Accept a normalized waveform as a reference clip
    ///
    /// The waveform must be 24kHz mono, non-empty and at most ten seconds.
    pub fn new(waveform: Waveform, display_name: impl Into<String>, source: ClipSource) -> Result<Self> {
        if !waveform.is_canonical() {
            return Err(VoiceCloneError::InvalidInput(format!(
                "Reference clip must be 24kHz mono (got {}Hz, {} channels)",
                waveform.sample_rate, waveform.channels
            )));
        }
        if waveform.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "Reference clip is empty".to_string(),
            ));
        }
        if waveform.duration_seconds() > MAX_REFERENCE_SECONDS as f64 {
            return Err(VoiceCloneError::InvalidInput(format!(
                "Reference clip is too long ({:.1} seconds). Maximum allowed: {} seconds.",
                waveform.duration_seconds(),
                MAX_REFERENCE_SECONDS
            )));
        }

        Ok(Self {
            waveform,
            display_name: display_name.into(),
            source,
        })
    }

    /// Reference clip loaded from a user file
    pub fn from_file(waveform: Waveform, path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(waveform, name, ClipSource::File(path.to_path_buf()))
    }

    /// Reference clip captured from the microphone
    pub fn recorded(waveform: Waveform, saved_to: Option<PathBuf>) -> Result<Self> {
        let name = format!("Recorded {}", Local::now().format("%H:%M:%S"));
        Self::new(waveform, name, ClipSource::Recorded { saved_to })
    }

    pub fn waveform(&self) -> &Waveform {
        &self.waveform
    }

    pub fn duration_seconds(&self) -> f64 {
        self.waveform.duration_seconds()
    }

    /// Label shown in the drop zone, e.g. `voice.mp3 (4.2s)`
    pub fn label(&self) -> String {
        format!("{} ({:.1}s)", self.display_name, self.duration_seconds())
    }
}

/// Immutable pairing of a reference clip with the text to speak
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    reference: Arc<ReferenceClip>,
    text: String,
}

impl SynthesisRequest {
    pub fn new(reference: Arc<ReferenceClip>, text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "Please enter some text to speak.".to_string(),
            ));
        }
        Ok(Self {
            reference,
            text: text.to_string(),
        })
    }

    pub fn reference(&self) -> &ReferenceClip {
        &self.reference
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Speech produced from one synthesis request
#[derive(Debug, Clone)]
pub struct SynthesizedOutput {
    pub waveform: Waveform,
    pub saved_to: Option<PathBuf>,
    pub text: String,
    pub created: DateTime<Local>,
}

impl SynthesizedOutput {
    pub fn new(waveform: Waveform, text: impl Into<String>, saved_to: Option<PathBuf>) -> Self {
        Self {
            waveform,
            saved_to,
            text: text.into(),
            created: Local::now(),
        }
    }

    pub fn label(&self) -> String {
        let name = self
            .saved_to
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("Generated {}", self.created.format("%H:%M:%S")));
        format!("{} ({:.1}s)", name, self.waveform.duration_seconds())
    }
}
