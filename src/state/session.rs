//! Session state machine
//!
//! `Session` is owned by the UI thread. Long-running work (recording, file
//! normalization, synthesis) happens elsewhere and reports back through the
//! `*_complete` / `*_failed` methods tagged with the `JobId` handed out when
//! the job started. Refused requests return a `Refusal` and leave the session
//! untouched.

use crate::error::VoiceCloneError;
use crate::models::{ReferenceClip, SynthesisRequest, SynthesizedOutput};
use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Recording,
    Ready,
    Synthesizing,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Record,
    Normalize,
    Synthesize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// What is coming out of the speakers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSource {
    Reference,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("Please wait for the current operation to finish.")]
    Busy,
    #[error("That action is not available while {0:?}.")]
    WrongPhase(Phase),
    #[error("Record or upload a voice sample first.")]
    NoReferenceClip,
    #[error("Please enter some text to speak.")]
    EmptyText,
    #[error("The voice model is unavailable.")]
    ModelUnavailable,
}

#[derive(Debug)]
struct ActiveJob {
    id: JobId,
    kind: JobKind,
    /// Set by `reset`; the result is dropped when the job reports back
    discarded: bool,
}

enum JobReport {
    Current,
    Discarded,
    Unknown,
}

pub struct Session {
    phase: Phase,
    clip: Option<Arc<ReferenceClip>>,
    text: String,
    output: Option<SynthesizedOutput>,
    job: Option<ActiveJob>,
    next_job: u64,
    playing: Option<PlaybackSource>,
    last_error: Option<VoiceCloneError>,
    /// Sticky once the model is known to be missing or broken
    model_error: Option<VoiceCloneError>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            clip: None,
            text: String::new(),
            output: None,
            job: None,
            next_job: 1,
            playing: None,
            last_error: None,
            model_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn clip(&self) -> Option<&Arc<ReferenceClip>> {
        self.clip.as_ref()
    }

    pub fn output(&self) -> Option<&SynthesizedOutput> {
        self.output.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Kind of the job occupying the worker slot, discarded jobs included
    pub fn active_job(&self) -> Option<JobKind> {
        self.job.as_ref().map(|job| job.kind)
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    pub fn playing(&self) -> Option<PlaybackSource> {
        self.playing
    }

    pub fn last_error(&self) -> Option<&VoiceCloneError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn model_error(&self) -> Option<&VoiceCloneError> {
        self.model_error.as_ref()
    }

    /// Mark the model unusable; generation is refused from now on
    pub fn model_unavailable(&mut self, error: VoiceCloneError) {
        info!("Voice model unavailable: {}", error);
        self.model_error = Some(error);
    }

    /// Clear a missing-model marker after the checkpoints were installed
    pub fn model_installed(&mut self) {
        if matches!(self.model_error, Some(VoiceCloneError::ModelNotFound(_))) {
            self.model_error = None;
        }
    }

    pub fn can_generate(&self) -> bool {
        self.check_generate().is_ok()
    }

    /// Phase to settle in when nothing is running
    fn resting_phase(&self) -> Phase {
        if self.clip.is_some() {
            Phase::Ready
        } else {
            Phase::Idle
        }
    }

    fn is_resting(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Ready)
    }

    fn begin_job(&mut self, kind: JobKind) -> Result<JobId, Refusal> {
        if self.job.is_some() {
            return Err(Refusal::Busy);
        }
        if !self.is_resting() {
            return Err(Refusal::WrongPhase(self.phase));
        }
        let id = JobId(self.next_job);
        self.next_job += 1;
        self.job = Some(ActiveJob {
            id,
            kind,
            discarded: false,
        });
        self.last_error = None;
        debug!("Started {:?} job {:?}", kind, id);
        Ok(id)
    }

    fn report(&mut self, id: JobId) -> JobReport {
        match &self.job {
            Some(job) if job.id == id => {
                let discarded = job.discarded;
                self.job = None;
                if discarded {
                    debug!("Dropping result of discarded job {:?}", id);
                    JobReport::Discarded
                } else {
                    JobReport::Current
                }
            }
            _ => JobReport::Unknown,
        }
    }

    fn fail(&mut self, error: VoiceCloneError) {
        if error.disables_model() {
            self.model_error = Some(error.clone());
        }
        self.last_error = Some(error);
        self.phase = self.resting_phase();
    }

    // Recording

    pub fn start_recording(&mut self) -> Result<JobId, Refusal> {
        let id = self.begin_job(JobKind::Record)?;
        self.phase = Phase::Recording;
        Ok(id)
    }

    /// Returns whether the clip was accepted
    pub fn capture_complete(&mut self, id: JobId, clip: ReferenceClip) -> bool {
        match self.report(id) {
            JobReport::Current => {
                self.clip = Some(Arc::new(clip));
                self.phase = Phase::Ready;
                true
            }
            _ => false,
        }
    }

    pub fn capture_failed(&mut self, id: JobId, error: VoiceCloneError) {
        if let JobReport::Current = self.report(id) {
            self.fail(error);
        }
    }

    // File upload

    /// Start normalizing a user file; the phase is unchanged meanwhile
    pub fn begin_file_load(&mut self) -> Result<JobId, Refusal> {
        self.begin_job(JobKind::Normalize)
    }

    pub fn file_loaded(&mut self, id: JobId, clip: ReferenceClip) -> bool {
        match self.report(id) {
            JobReport::Current => {
                self.clip = Some(Arc::new(clip));
                self.phase = Phase::Ready;
                true
            }
            _ => false,
        }
    }

    pub fn file_failed(&mut self, id: JobId, error: VoiceCloneError) {
        if let JobReport::Current = self.report(id) {
            self.fail(error);
        }
    }

    // Synthesis

    fn check_generate(&self) -> Result<Arc<ReferenceClip>, Refusal> {
        if self.job.is_some() {
            return Err(Refusal::Busy);
        }
        let clip = self.clip.clone().ok_or(Refusal::NoReferenceClip)?;
        if self.text.trim().is_empty() {
            return Err(Refusal::EmptyText);
        }
        if self.model_error.is_some() {
            return Err(Refusal::ModelUnavailable);
        }
        if self.phase != Phase::Ready {
            return Err(Refusal::WrongPhase(self.phase));
        }
        Ok(clip)
    }

    /// Snapshot the clip and text into a request and enter `Synthesizing`
    pub fn generate(&mut self) -> Result<(JobId, SynthesisRequest), Refusal> {
        let clip = self.check_generate()?;
        let request = SynthesisRequest::new(clip, &self.text).map_err(|_| Refusal::EmptyText)?;
        let id = self.begin_job(JobKind::Synthesize)?;
        self.phase = Phase::Synthesizing;
        Ok((id, request))
    }

    /// Store the output and move to `Playing`; the caller starts the stream
    pub fn synthesis_complete(&mut self, id: JobId, output: SynthesizedOutput) -> bool {
        match self.report(id) {
            JobReport::Current => {
                self.output = Some(output);
                self.phase = Phase::Playing;
                self.playing = Some(PlaybackSource::Output);
                true
            }
            _ => false,
        }
    }

    pub fn synthesis_failed(&mut self, id: JobId, error: VoiceCloneError) {
        if let JobReport::Current = self.report(id) {
            self.fail(error);
        }
    }

    // Playback

    fn begin_playback(&mut self, source: PlaybackSource) -> Result<(), Refusal> {
        if self.job.is_some() {
            return Err(Refusal::Busy);
        }
        if !self.is_resting() {
            return Err(Refusal::WrongPhase(self.phase));
        }
        self.phase = Phase::Playing;
        self.playing = Some(source);
        Ok(())
    }

    /// Enter `Playing` for the reference clip and hand it back for streaming
    pub fn play_reference(&mut self) -> Result<Arc<ReferenceClip>, Refusal> {
        let clip = self.clip.clone().ok_or(Refusal::NoReferenceClip)?;
        self.begin_playback(PlaybackSource::Reference)?;
        Ok(clip)
    }

    /// Enter `Playing` for the last generated output
    pub fn replay_output(&mut self) -> Result<&SynthesizedOutput, Refusal> {
        if self.output.is_none() {
            return Err(Refusal::WrongPhase(self.phase));
        }
        self.begin_playback(PlaybackSource::Output)?;
        self.output.as_ref().ok_or(Refusal::WrongPhase(self.phase))
    }

    /// The stream ran to the end
    pub fn playback_finished(&mut self) {
        if self.phase == Phase::Playing {
            self.playing = None;
            self.phase = self.resting_phase();
        }
    }

    /// User pressed stop; returns whether anything was playing
    pub fn stop_playback(&mut self) -> bool {
        let was_playing = self.phase == Phase::Playing;
        self.playback_finished();
        was_playing
    }

    /// The output device refused the stream
    pub fn playback_failed(&mut self, error: VoiceCloneError) {
        self.playing = None;
        self.fail(error);
    }

    // Housekeeping

    /// Drop the reference clip; the previous output stays replayable
    pub fn remove_clip(&mut self) -> Result<(), Refusal> {
        if self.job.is_some() {
            return Err(Refusal::Busy);
        }
        if self.phase != Phase::Ready {
            return Err(Refusal::WrongPhase(self.phase));
        }
        self.clip = None;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Back to `Idle` from anywhere
    ///
    /// A running job is not interrupted. It keeps the worker slot until it
    /// reports back and its result is then thrown away.
    pub fn reset(&mut self) {
        if let Some(job) = self.job.as_mut() {
            debug!("Discarding {:?} job {:?}", job.kind, job.id);
            job.discarded = true;
        }
        self.phase = Phase::Idle;
        self.clip = None;
        self.output = None;
        self.text.clear();
        self.playing = None;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FormatNormalizer, Waveform};
    use crate::voice::testing::CountingLoader;
    use crate::voice::VoiceModelAdapter;

    fn clip() -> ReferenceClip {
        ReferenceClip::recorded(Waveform::mono(vec![0.2; 48_000], 24_000), None).unwrap()
    }

    fn output() -> SynthesizedOutput {
        SynthesizedOutput::new(Waveform::mono(vec![0.1; 2400], 24_000), "hello", None)
    }

    fn ready_session() -> Session {
        let mut session = Session::new();
        let id = session.begin_file_load().unwrap();
        assert!(session.file_loaded(id, clip()));
        session
    }

    #[test]
    fn test_record_success_and_failure() {
        let mut session = Session::new();
        let id = session.start_recording().unwrap();
        assert_eq!(session.phase(), Phase::Recording);
        assert_eq!(session.active_job(), Some(JobKind::Record));
        assert!(session.capture_complete(id, clip()));
        assert_eq!(session.phase(), Phase::Ready);
        assert!(session.clip().is_some());

        let mut session = Session::new();
        let id = session.start_recording().unwrap();
        session.capture_failed(id, VoiceCloneError::DeviceUnavailable("no mic".to_string()));
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.last_error().is_some());
        assert!(!session.is_busy());
    }

    #[test]
    fn test_rerecord_failure_keeps_existing_clip() {
        let mut session = ready_session();
        let before = session.clip().cloned();
        let id = session.start_recording().unwrap();
        session.capture_failed(id, VoiceCloneError::DeviceUnavailable("gone".to_string()));
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(session.clip().cloned(), before);
    }

    #[test]
    fn test_file_load_failure_returns_to_idle() {
        let mut session = Session::new();
        let id = session.begin_file_load().unwrap();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.is_busy());
        session.file_failed(id, VoiceCloneError::TranscodeFailed("bad".to_string()));
        assert_eq!(session.phase(), Phase::Idle);
        assert!(matches!(
            session.last_error(),
            Some(VoiceCloneError::TranscodeFailed(_))
        ));
    }

    #[test]
    fn test_only_one_job_at_a_time() {
        let mut session = Session::new();
        let _id = session.start_recording().unwrap();
        assert_eq!(session.start_recording(), Err(Refusal::Busy));
        assert_eq!(session.begin_file_load(), Err(Refusal::Busy));

        let mut session = ready_session();
        session.set_text("hello");
        let (_id, _request) = session.generate().unwrap();
        assert_eq!(session.start_recording(), Err(Refusal::Busy));
        assert_eq!(session.generate().err(), Some(Refusal::Busy));
        assert_eq!(session.play_reference().err(), Some(Refusal::Busy));
    }

    #[test]
    fn test_generate_refusals_leave_state_untouched() {
        let mut session = Session::new();
        session.set_text("hello");
        assert_eq!(session.generate().err(), Some(Refusal::NoReferenceClip));
        assert_eq!(session.phase(), Phase::Idle);

        let mut session = ready_session();
        session.set_text("   ");
        assert_eq!(session.generate().err(), Some(Refusal::EmptyText));
        assert_eq!(session.phase(), Phase::Ready);
        assert!(!session.is_busy());

        session.set_text("hello");
        session.model_unavailable(VoiceCloneError::ModelNotFound("missing".to_string()));
        assert_eq!(session.generate().err(), Some(Refusal::ModelUnavailable));
        assert!(!session.can_generate());

        session.model_installed();
        assert!(session.can_generate());
    }

    #[test]
    fn test_synthesis_complete_starts_playing() {
        let mut session = ready_session();
        session.set_text("  hello  ");
        let (id, request) = session.generate().unwrap();
        assert_eq!(request.text(), "hello");
        assert_eq!(session.phase(), Phase::Synthesizing);

        assert!(session.synthesis_complete(id, output()));
        assert_eq!(session.phase(), Phase::Playing);
        assert_eq!(session.playing(), Some(PlaybackSource::Output));

        session.playback_finished();
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(session.playing(), None);
    }

    #[test]
    fn test_synthesis_failure_retains_clip() {
        let mut session = ready_session();
        session.set_text("hello");
        let (id, _) = session.generate().unwrap();
        session.synthesis_failed(id, VoiceCloneError::InferenceError("nan".to_string()));
        assert_eq!(session.phase(), Phase::Ready);
        assert!(session.clip().is_some());
        assert!(session.model_error().is_none());
        assert!(session.can_generate());
    }

    #[test]
    fn test_model_load_failure_disables_generation() {
        let mut session = ready_session();
        session.set_text("hello");
        let (id, _) = session.generate().unwrap();
        session.synthesis_failed(id, VoiceCloneError::ModelLoadFailed("oom".to_string()));
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(session.generate().err(), Some(Refusal::ModelUnavailable));

        // A broken model stays broken even after a download
        session.model_installed();
        assert_eq!(session.generate().err(), Some(Refusal::ModelUnavailable));

        // Recording still works
        assert!(session.start_recording().is_ok());
    }

    #[test]
    fn test_stop_playback() {
        let mut session = ready_session();
        session.play_reference().unwrap();
        assert_eq!(session.phase(), Phase::Playing);
        assert_eq!(session.playing(), Some(PlaybackSource::Reference));
        assert!(session.stop_playback());
        assert_eq!(session.phase(), Phase::Ready);
        assert!(!session.stop_playback());
        assert_eq!(session.phase(), Phase::Ready);
    }

    #[test]
    fn test_playback_failure_is_surfaced() {
        let mut session = ready_session();
        session.set_text("hello");
        let (id, _) = session.generate().unwrap();
        assert!(session.synthesis_complete(id, output()));

        session.playback_failed(VoiceCloneError::DeviceUnavailable("no sink".into()));
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(session.playing(), None);
        assert!(matches!(
            session.last_error(),
            Some(VoiceCloneError::DeviceUnavailable(_))
        ));
        // The output survives for a later replay
        assert!(session.output().is_some());
    }

    #[test]
    fn test_missing_model_cleared_after_install() {
        let mut session = ready_session();
        session.set_text("hello");
        let (id, _) = session.generate().unwrap();
        session.synthesis_failed(id, VoiceCloneError::ModelNotFound("none".into()));
        assert!(!session.can_generate());

        session.model_installed();
        assert!(session.model_error().is_none());
        assert!(session.can_generate());
    }

    #[test]
    fn test_replay_output() {
        let mut session = ready_session();
        assert!(session.replay_output().is_err());

        session.set_text("hello");
        let (id, _) = session.generate().unwrap();
        session.synthesis_complete(id, output());
        assert_eq!(session.replay_output().err(), Some(Refusal::WrongPhase(Phase::Playing)));
        session.stop_playback();

        assert_eq!(session.replay_output().unwrap().text, "hello");
        assert_eq!(session.phase(), Phase::Playing);
    }

    #[test]
    fn test_remove_clip() {
        let mut session = Session::new();
        assert_eq!(session.remove_clip(), Err(Refusal::WrongPhase(Phase::Idle)));

        let mut session = ready_session();
        session.remove_clip().unwrap();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.clip().is_none());
    }

    #[test]
    fn test_reset_discards_running_job() {
        let mut session = ready_session();
        session.set_text("hello");
        let (id, _) = session.generate().unwrap();

        session.reset();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.clip().is_none());
        assert_eq!(session.text(), "");

        // The discarded job still holds the slot
        assert_eq!(session.start_recording(), Err(Refusal::Busy));
        assert_eq!(session.active_job(), Some(JobKind::Synthesize));

        assert!(!session.synthesis_complete(id, output()));
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.output().is_none());
        assert!(session.start_recording().is_ok());
    }

    #[test]
    fn test_reset_from_every_phase() {
        let mut recording = Session::new();
        recording.start_recording().unwrap();

        let mut playing = ready_session();
        playing.play_reference().unwrap();

        for mut session in [Session::new(), recording, ready_session(), playing] {
            session.reset();
            assert_eq!(session.phase(), Phase::Idle);
            assert_eq!(session.playing(), None);
        }
    }

    #[test]
    fn test_unknown_job_reports_are_ignored() {
        let mut session = Session::new();
        let first = session.start_recording().unwrap();
        session.capture_failed(first, VoiceCloneError::DeviceUnavailable("x".to_string()));

        let second = session.start_recording().unwrap();
        assert!(!session.capture_complete(first, clip()));
        assert_eq!(session.phase(), Phase::Recording);
        assert!(session.capture_complete(second, clip()));
    }

    #[test]
    fn test_sample_file_to_playback_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let sample = dir.path().join("sample.wav");
        let stereo = Waveform::new(vec![0.25; 44_100 * 3 * 2], 44_100, 2);
        crate::audio::wav::write_wav(&sample, &stereo).unwrap();

        let mut session = Session::new();
        let id = session.begin_file_load().unwrap();
        let waveform = FormatNormalizer::default().normalize_file(&sample).unwrap();
        assert_eq!(waveform.sample_rate, 24_000);
        assert_eq!(waveform.channels, 1);
        assert!((waveform.duration_seconds() - 3.0).abs() < 1e-6);
        assert!(session.file_loaded(id, ReferenceClip::from_file(waveform, &sample).unwrap()));

        let adapter = VoiceModelAdapter::new(CountingLoader::answering(Waveform::mono(
            vec![0.1; 24_000],
            24_000,
        )));

        session.set_text("hello");
        let (id, request) = session.generate().unwrap();
        assert_eq!(session.phase(), Phase::Synthesizing);
        let speech = adapter.synthesize_request(&request).unwrap();
        assert!(!speech.is_empty());
        assert!(session.synthesis_complete(id, SynthesizedOutput::new(speech, request.text(), None)));
        assert_eq!(session.phase(), Phase::Playing);

        session.set_text("unspeakable");
        session.stop_playback();
        let (id, request) = session.generate().unwrap();
        match adapter.synthesize_request(&request) {
            Err(e) => session.synthesis_failed(id, e),
            Ok(_) => panic!("expected an inference error"),
        }
        assert_eq!(session.phase(), Phase::Ready);
        assert!(session.clip().is_some());
        assert!(matches!(
            session.last_error(),
            Some(VoiceCloneError::InferenceError(_))
        ));
    }

    #[test]
    fn test_record_without_input_device_scenario() {
        let mut session = Session::new();
        let id = session.start_recording().unwrap();
        let result = crate::audio::finish_capture(Waveform::mono(Vec::new(), 24_000));
        match result {
            Err(e) => session.capture_failed(id, e),
            Ok(_) => panic!("expected DeviceUnavailable"),
        }
        assert_eq!(session.phase(), Phase::Idle);
        assert!(matches!(
            session.last_error(),
            Some(VoiceCloneError::DeviceUnavailable(_))
        ));
    }
}
