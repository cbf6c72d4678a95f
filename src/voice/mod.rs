//! Voice cloning model access
//!
//! The model is expensive to load, so it lives in a single `ModelSlot` that
//! loads on first use and stays resident until `shutdown`. A failed load is
//! remembered and every later request reports the same error.

pub mod device;
pub mod manager;
pub mod worker;

pub use device::{ComputeDevice, DevicePreference};
pub use manager::{ModelDownloadProgress, ModelManager, ProgressTracker};
pub use worker::{WorkerCommand, WorkerLoader};

use crate::audio::{Waveform, CANONICAL_SAMPLE_RATE};
use crate::error::{Result, VoiceCloneError};
use crate::models::{ReferenceClip, SynthesisRequest};
use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A loaded voice cloning model
pub trait VoiceEngine: Send {
    /// Speak `text` in the voice of `reference` (24kHz mono)
    fn synthesize(&mut self, reference: &Waveform, text: &str) -> Result<Waveform>;

    /// Release the model; later calls may fail
    fn shutdown(&mut self) {}
}

/// Produces the engine on first use
pub trait EngineLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn VoiceEngine>>;
}

enum SlotState {
    Unloaded,
    Loaded(Box<dyn VoiceEngine>),
    Failed(VoiceCloneError),
    ShutDown,
}

/// What the slot currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    NotLoaded,
    Loaded,
    Failed(VoiceCloneError),
    ShutDown,
}

/// Process-wide home of the model
///
/// `engine` serializes load and inference, so at most one synthesis runs at
/// a time. `status` is only ever held briefly and stays readable while the
/// engine is busy.
pub struct ModelSlot {
    loader: Box<dyn EngineLoader>,
    engine: Mutex<SlotState>,
    status: Mutex<ModelStatus>,
}

impl ModelSlot {
    pub fn new(loader: impl EngineLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            engine: Mutex::new(SlotState::Unloaded),
            status: Mutex::new(ModelStatus::NotLoaded),
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status.lock().unwrap().clone()
    }

    fn publish(&self, state: &SlotState) {
        *self.status.lock().unwrap() = match state {
            SlotState::Unloaded => ModelStatus::NotLoaded,
            SlotState::Loaded(_) => ModelStatus::Loaded,
            SlotState::Failed(e) => ModelStatus::Failed(e.clone()),
            SlotState::ShutDown => ModelStatus::ShutDown,
        };
    }

    /// Run `f` against the engine, loading it first if needed
    fn with_engine<T>(&self, f: impl FnOnce(&mut dyn VoiceEngine) -> Result<T>) -> Result<T> {
        let mut state = self.engine.lock().unwrap();

        if let SlotState::Unloaded = *state {
            let started = Instant::now();
            match self.loader.load() {
                Ok(engine) => {
                    info!("Model ready in {:.1}s", started.elapsed().as_secs_f32());
                    *state = SlotState::Loaded(engine);
                }
                Err(e) => {
                    error!("Model load failed: {}", e);
                    *state = SlotState::Failed(e);
                }
            }
            self.publish(&state);
        }

        match &mut *state {
            SlotState::Loaded(engine) => f(engine.as_mut()),
            SlotState::Failed(e) => Err(e.clone()),
            SlotState::ShutDown => Err(VoiceCloneError::ModelLoadFailed(
                "The voice model has been shut down".to_string(),
            )),
            SlotState::Unloaded => Err(VoiceCloneError::ModelLoadFailed(
                "The voice model is not loaded".to_string(),
            )),
        }
    }

    /// Forget a missing-model failure so the next request loads again
    ///
    /// Load failures of an installed model stay remembered.
    pub fn model_installed(&self) {
        let mut state = self.engine.lock().unwrap();
        if let SlotState::Failed(VoiceCloneError::ModelNotFound(_)) = *state {
            debug!("Model installed, clearing earlier not-found failure");
            *state = SlotState::Unloaded;
            self.publish(&state);
        }
    }

    /// Release the model; the slot refuses further work afterwards
    ///
    /// Waits for a running synthesis to finish first.
    pub fn shutdown(&self) {
        let mut state = self.engine.lock().unwrap();
        if let SlotState::Loaded(engine) = &mut *state {
            debug!("Shutting down voice model");
            engine.shutdown();
        }
        *state = SlotState::ShutDown;
        self.publish(&state);
    }
}

/// Cloneable handle used by the UI to request synthesis
#[derive(Clone)]
pub struct VoiceModelAdapter {
    slot: Arc<ModelSlot>,
}

impl VoiceModelAdapter {
    pub fn new(loader: impl EngineLoader + 'static) -> Self {
        Self {
            slot: Arc::new(ModelSlot::new(loader)),
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.slot.status()
    }

    /// Generate speech for `text` in the voice of `reference`
    ///
    /// Blocks for the whole inference, plus the model load on first call.
    /// The result is always 24kHz mono.
    pub fn synthesize(&self, reference: &ReferenceClip, text: &str) -> Result<Waveform> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "Please enter some text to speak.".to_string(),
            ));
        }
        let waveform = reference.waveform();
        if !waveform.is_canonical() || waveform.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "Reference clip must be non-empty 24kHz mono audio".to_string(),
            ));
        }

        let started = Instant::now();
        let output = self.slot.with_engine(|engine| engine.synthesize(waveform, text))?;
        if output.is_empty() {
            return Err(VoiceCloneError::InferenceError(
                "The model produced no audio".to_string(),
            ));
        }
        let output = output.to_mono_at(CANONICAL_SAMPLE_RATE);
        info!(
            "Generated {:.1}s of speech in {:.1}s",
            output.duration_seconds(),
            started.elapsed().as_secs_f32()
        );
        Ok(output)
    }

    /// Called after an explicit download succeeds
    pub fn model_installed(&self) {
        self.slot.model_installed();
    }

    pub fn synthesize_request(&self, request: &SynthesisRequest) -> Result<Waveform> {
        self.synthesize(request.reference(), request.text())
    }

    pub fn shutdown(&self) {
        self.slot.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingLoader;
    use super::*;
    use std::sync::atomic::Ordering;

    fn clip() -> ReferenceClip {
        ReferenceClip::recorded(Waveform::mono(vec![0.2; 24_000], 24_000), None).unwrap()
    }

    #[test]
    fn test_model_loads_once() {
        let loader = CountingLoader::answering(Waveform::mono(vec![0.1; 12_000], 24_000));
        let loads = loader.loads.clone();
        let adapter = VoiceModelAdapter::new(loader);
        assert_eq!(adapter.status(), ModelStatus::NotLoaded);

        for _ in 0..3 {
            let out = adapter.synthesize(&clip(), "hello").unwrap();
            assert_eq!(out.frames(), 12_000);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.status(), ModelStatus::Loaded);
    }

    #[test]
    fn test_load_failure_is_remembered() {
        let loader = CountingLoader::failing(VoiceCloneError::ModelLoadFailed("oom".to_string()));
        let loads = loader.loads.clone();
        let adapter = VoiceModelAdapter::new(loader);

        for _ in 0..2 {
            assert_eq!(
                adapter.synthesize(&clip(), "hello"),
                Err(VoiceCloneError::ModelLoadFailed("oom".to_string()))
            );
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(matches!(adapter.status(), ModelStatus::Failed(_)));
    }

    #[test]
    fn test_empty_text_never_loads_model() {
        let loader = CountingLoader::answering(Waveform::mono(vec![0.1; 10], 24_000));
        let loads = loader.loads.clone();
        let adapter = VoiceModelAdapter::new(loader);

        assert!(matches!(
            adapter.synthesize(&clip(), "  \n "),
            Err(VoiceCloneError::InvalidInput(_))
        ));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_output_is_converted_to_canonical() {
        let stereo_48k = Waveform::new(vec![0.3; 48_000 * 2], 48_000, 2);
        let adapter = VoiceModelAdapter::new(CountingLoader::answering(stereo_48k));
        let out = adapter.synthesize(&clip(), "hello").unwrap();
        assert!(out.is_canonical());
        assert_eq!(out.frames(), 24_000);
    }

    #[test]
    fn test_inference_error_keeps_model_loaded() {
        let adapter =
            VoiceModelAdapter::new(CountingLoader::answering(Waveform::mono(vec![0.1; 10], 24_000)));
        assert!(matches!(
            adapter.synthesize(&clip(), "unspeakable"),
            Err(VoiceCloneError::InferenceError(_))
        ));
        assert!(adapter.synthesize(&clip(), "fine").is_ok());
        assert_eq!(adapter.status(), ModelStatus::Loaded);
    }

    struct SlowEngine;

    impl VoiceEngine for SlowEngine {
        fn synthesize(&mut self, reference: &Waveform, _text: &str) -> Result<Waveform> {
            std::thread::sleep(std::time::Duration::from_millis(800));
            Ok(reference.clone())
        }
    }

    struct SlowLoader;

    impl EngineLoader for SlowLoader {
        fn load(&self) -> Result<Box<dyn VoiceEngine>> {
            Ok(Box::new(SlowEngine))
        }
    }

    #[test]
    fn test_status_readable_during_synthesis() {
        let adapter = VoiceModelAdapter::new(SlowLoader);
        let worker = adapter.clone();
        let job = std::thread::spawn(move || worker.synthesize(&clip(), "hello"));

        // Let the job take the engine lock
        std::thread::sleep(std::time::Duration::from_millis(100));
        let asked = Instant::now();
        let status = adapter.status();
        assert!(
            asked.elapsed() < std::time::Duration::from_millis(50),
            "status() waited {:?}",
            asked.elapsed()
        );
        assert_eq!(status, ModelStatus::Loaded);

        assert!(job.join().unwrap().is_ok());
    }

    #[test]
    fn test_missing_model_retried_after_install() {
        let loader = CountingLoader::failing(VoiceCloneError::ModelNotFound("none".to_string()));
        let loads = loader.loads.clone();
        let adapter = VoiceModelAdapter::new(loader);

        assert!(adapter.synthesize(&clip(), "hello").is_err());
        assert!(adapter.synthesize(&clip(), "hello").is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        adapter.model_installed();
        assert_eq!(adapter.status(), ModelStatus::NotLoaded);
        assert!(adapter.synthesize(&clip(), "hello").is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_failure_survives_install() {
        let loader = CountingLoader::failing(VoiceCloneError::ModelLoadFailed("oom".to_string()));
        let loads = loader.loads.clone();
        let adapter = VoiceModelAdapter::new(loader);

        assert!(adapter.synthesize(&clip(), "hello").is_err());
        adapter.model_installed();
        assert!(adapter.synthesize(&clip(), "hello").is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_releases_engine() {
        let loader = CountingLoader::answering(Waveform::mono(vec![0.1; 10], 24_000));
        let shutdowns = loader.shutdowns.clone();
        let adapter = VoiceModelAdapter::new(loader);
        adapter.synthesize(&clip(), "hello").unwrap();

        adapter.shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.status(), ModelStatus::ShutDown);
        assert!(adapter.synthesize(&clip(), "hello").is_err());
    }
}
