//! Error taxonomy shared by capture, normalization, synthesis and playback
//!
//! Every variant carries a human readable message because all errors end up
//! in the status line of the UI.

use thiserror::Error;

/// Errors produced by the audio and voice model layers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceCloneError {
    /// No usable input/output device, or the OS refused access
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The external transcoder failed, could not be launched, or timed out
    #[error("Audio conversion failed: {0}")]
    TranscodeFailed(String),

    /// Required model artifacts are missing from the local cache
    #[error("Voice model not found: {0}")]
    ModelNotFound(String),

    /// The model artifacts exist but the engine could not be started
    #[error("Voice model failed to load: {0}")]
    ModelLoadFailed(String),

    /// The model reported a runtime failure while synthesizing
    #[error("Speech generation failed: {0}")]
    InferenceError(String),

    /// Empty text, unsupported file type, or an unacceptable reference clip
    #[error("{0}")]
    InvalidInput(String),

    /// Reading or writing audio files on disk failed
    #[error("{0}")]
    Storage(String),
}

impl VoiceCloneError {
    /// Whether this error makes the voice model unusable for the rest of the process
    pub fn disables_model(&self) -> bool {
        matches!(
            self,
            VoiceCloneError::ModelNotFound(_) | VoiceCloneError::ModelLoadFailed(_)
        )
    }

    /// Short title used for the error banner
    pub fn title(&self) -> &'static str {
        match self {
            VoiceCloneError::DeviceUnavailable(_) => "Audio device unavailable",
            VoiceCloneError::TranscodeFailed(_) => "Conversion error",
            VoiceCloneError::ModelNotFound(_) => "Model not found",
            VoiceCloneError::ModelLoadFailed(_) => "Model loading error",
            VoiceCloneError::InferenceError(_) => "Generation error",
            VoiceCloneError::InvalidInput(_) => "Invalid input",
            VoiceCloneError::Storage(_) => "File error",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceCloneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_errors_disable_model() {
        assert!(VoiceCloneError::ModelNotFound("x".into()).disables_model());
        assert!(VoiceCloneError::ModelLoadFailed("x".into()).disables_model());
        assert!(!VoiceCloneError::InferenceError("x".into()).disables_model());
        assert!(!VoiceCloneError::DeviceUnavailable("x".into()).disables_model());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = VoiceCloneError::TranscodeFailed("ffmpeg exited with status 1".into());
        assert_eq!(
            err.to_string(),
            "Audio conversion failed: ffmpeg exited with status 1"
        );
    }
}
