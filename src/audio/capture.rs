//! Microphone capture using PipeWire
//!
//! Records a fixed-length clip from the default source while exposing live
//! levels for the recording meter.

use super::waveform::{calculate_rms, Waveform};
use crate::error::{Result, VoiceCloneError};
use log::{debug, info};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default length of a microphone recording
pub const DEFAULT_RECORD_SECONDS: u32 = 5;

/// Captures quieter than this are treated as a muted or blocked microphone
pub const SILENCE_PEAK_THRESHOLD: f32 = 0.001;

/// Number of meter bars kept for the recording display
const METER_HISTORY: usize = 48;

/// Current state of audio capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Error,
}

/// Shared state for audio capture - thread-safe
#[derive(Clone)]
pub struct SharedCaptureState {
    inner: Arc<Mutex<CaptureStateInner>>,
}

struct CaptureStateInner {
    /// Smoothed RMS volume level (0.0 - 1.0)
    volume_level: f32,
    /// Recent averaged RMS values for the meter
    meter: Vec<f32>,
    /// Captured mono samples
    samples: Vec<f32>,
    /// Captured duration in seconds
    duration: f64,
    state: CaptureState,
    error: Option<String>,
    sample_rate: u32,
    meter_counter: u32,
    meter_rms_sum: f32,
}

impl SharedCaptureState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureStateInner {
                volume_level: 0.0,
                meter: Vec::with_capacity(METER_HISTORY),
                samples: Vec::new(),
                duration: 0.0,
                state: CaptureState::Idle,
                error: None,
                sample_rate: 48000,
                meter_counter: 0,
                meter_rms_sum: 0.0,
            })),
        }
    }

    pub fn volume_level(&self) -> f32 {
        self.inner.lock().unwrap().volume_level
    }

    pub fn meter(&self) -> Vec<f32> {
        self.inner.lock().unwrap().meter.clone()
    }

    pub fn state(&self) -> CaptureState {
        self.inner.lock().unwrap().state
    }

    pub fn duration(&self) -> f64 {
        self.inner.lock().unwrap().duration
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    pub fn set_state(&self, state: CaptureState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn set_error(&self, error: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = Some(error);
        inner.state = CaptureState::Error;
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        inner.meter.clear();
        inner.duration = 0.0;
        inner.volume_level = 0.0;
        inner.error = None;
        inner.state = CaptureState::Idle;
        inner.meter_counter = 0;
        inner.meter_rms_sum = 0.0;
    }

    /// Take the captured audio as a mono waveform
    pub fn take_waveform(&self) -> Waveform {
        let mut inner = self.inner.lock().unwrap();
        let samples = std::mem::take(&mut inner.samples);
        Waveform::mono(samples, inner.sample_rate)
    }

    /// Process incoming mono samples
    pub fn process_samples(&self, samples: &[f32], sample_rate: u32) {
        let mut inner = self.inner.lock().unwrap();
        if sample_rate > 0 {
            inner.sample_rate = sample_rate;
        }

        if samples.is_empty() {
            return;
        }

        let rms = calculate_rms(samples);
        inner.volume_level = inner.volume_level * 0.7 + rms * 0.3;

        // Average over a few callbacks so the meter scrolls at a readable pace
        const METER_DECIMATION: u32 = 4;
        inner.meter_rms_sum += rms;
        inner.meter_counter += 1;
        if inner.meter_counter >= METER_DECIMATION {
            let avg = inner.meter_rms_sum / METER_DECIMATION as f32;
            inner.meter.push(avg);
            if inner.meter.len() > METER_HISTORY {
                inner.meter.remove(0);
            }
            inner.meter_counter = 0;
            inner.meter_rms_sum = 0.0;
        }

        inner.samples.extend_from_slice(samples);
        inner.duration = inner.samples.len() as f64 / inner.sample_rate as f64;
    }
}

impl Default for SharedCaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-duration microphone capture on the default PipeWire source
pub struct AudioCapture {
    state: SharedCaptureState,
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
}

enum PipeWireCommand {
    Stop,
}

impl AudioCapture {
    /// Create a capture that reports into `state`
    pub fn new(state: SharedCaptureState) -> Self {
        Self {
            state,
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sender: None,
        }
    }

    /// Record `duration` of audio from the default input device
    ///
    /// Blocks for the whole duration; call it from a background task.
    pub fn record(&mut self, duration: Duration) -> Result<Waveform> {
        info!("Recording {:.1}s from the default input", duration.as_secs_f32());
        self.start()?;
        thread::sleep(duration);
        self.stop();

        if let Some(error) = self.state.error() {
            return Err(VoiceCloneError::DeviceUnavailable(error));
        }
        finish_capture(self.state.take_waveform())
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(VoiceCloneError::DeviceUnavailable(
                "Capture already running".to_string(),
            ));
        }

        self.state.reset();
        self.state.set_state(CaptureState::Capturing);
        self.is_running.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        let is_running = self.is_running.clone();

        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        self.sender = Some(sender);

        let handle = thread::spawn(move || {
            if let Err(e) = run_capture_loop(state.clone(), receiver) {
                state.set_error(e);
            }
            is_running.store(false, Ordering::SeqCst);
        });

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        self.is_running.store(false, Ordering::SeqCst);
        if self.state.state() == CaptureState::Capturing {
            self.state.set_state(CaptureState::Idle);
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Validate a finished capture
///
/// No samples means no source was connected; near-silence means the device is
/// muted or the OS withheld microphone access.
pub fn finish_capture(waveform: Waveform) -> Result<Waveform> {
    if waveform.is_empty() {
        return Err(VoiceCloneError::DeviceUnavailable(
            "No audio was received from the input device. Check that a microphone is connected."
                .to_string(),
        ));
    }

    let peak = waveform.peak();
    debug!("Capture finished: {:.2}s, peak {:.4}", waveform.duration_seconds(), peak);
    if peak < SILENCE_PEAK_THRESHOLD {
        return Err(VoiceCloneError::DeviceUnavailable(
            "Recording appears to be silent. Check that the microphone is not muted and that \
             microphone access is allowed."
                .to_string(),
        ));
    }

    Ok(waveform)
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    state: SharedCaptureState,
    receiver: pw::channel::Receiver<PipeWireCommand>,
) -> std::result::Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedCaptureState,
    }

    let user_data = UserData {
        format: Default::default(),
        state: state.clone(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Voiceclone",
    };

    let stream = pw::stream::StreamBox::new(&core, "voiceclone-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                user_data
                    .state
                    .set_error(format!("Failed to parse audio format: {:?}", e));
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let sample_rate = user_data.format.rate();
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            if let Some(raw_samples) = data.data() {
                // Keep the first channel of each frame
                let mut mono_samples = Vec::with_capacity((n_samples / n_channels) as usize);

                for i in (0..n_samples).step_by(n_channels as usize) {
                    let start = i as usize * std::mem::size_of::<f32>();
                    let end = start + std::mem::size_of::<f32>();
                    if end <= raw_samples.len() {
                        let sample = f32::from_le_bytes(
                            raw_samples[start..end].try_into().unwrap_or([0; 4]),
                        );
                        mono_samples.push(sample);
                    }
                }

                user_data.state.process_samples(&mono_samples, sample_rate);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // F32LE at the device's native rate
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format parameters")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect capture stream: {}", e))?;

    mainloop.run();

    Ok(())
}
