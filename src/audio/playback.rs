//! Audio playback using PipeWire
//!
//! `PlaybackService` owns at most one active stream. Starting a new one stops
//! the previous, and stopping is idempotent.

use super::waveform::{waveform_bars, Waveform};
use crate::error::{Result, VoiceCloneError};
use log::{debug, error};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Shared state for audio playback - thread-safe
#[derive(Clone)]
pub struct SharedPlaybackState {
    inner: Arc<Mutex<PlaybackStateInner>>,
}

struct PlaybackStateInner {
    /// Mono samples to play
    samples: Vec<f32>,
    sample_rate: u32,
    /// Current playback position (sample index)
    position: usize,
    is_playing: bool,
    /// Pre-computed RMS bars for visualization
    waveform: Vec<f32>,
    /// Why the stream thread gave up, if it did
    error: Option<String>,
}

impl SharedPlaybackState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackStateInner {
                samples: Vec::new(),
                sample_rate: 24000,
                position: 0,
                is_playing: false,
                waveform: Vec::new(),
                error: None,
            })),
        }
    }

    /// Load mono samples for playback
    pub fn load(&self, samples: Vec<f32>, sample_rate: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.waveform = waveform_bars(&samples, 48);
        inner.samples = samples;
        inner.sample_rate = sample_rate;
        inner.position = 0;
        inner.error = None;
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().unwrap().sample_rate
    }

    /// Get current playback position in seconds
    pub fn current_time(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.position as f64 / inner.sample_rate.max(1) as f64
    }

    /// Get total duration in seconds
    pub fn duration(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.samples.len() as f64 / inner.sample_rate.max(1) as f64
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().is_playing
    }

    pub fn waveform(&self) -> Vec<f32> {
        self.inner.lock().unwrap().waveform.clone()
    }

    /// Get playback progress as fraction (0.0 - 1.0)
    pub fn progress(&self) -> f32 {
        let inner = self.inner.lock().unwrap();
        if inner.samples.is_empty() {
            0.0
        } else {
            inner.position as f32 / inner.samples.len() as f32
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.inner.lock().unwrap().is_playing = playing;
    }

    /// Record a stream failure; playback counts as finished
    pub fn set_error(&self, error: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = Some(error);
        inner.is_playing = false;
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Reset playback position to start
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.position = 0;
        inner.is_playing = false;
    }

    /// Pull up to `count` samples, advancing the position
    ///
    /// Returns `None` once the buffer is exhausted.
    pub fn next_samples(&self, count: usize) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.position >= inner.samples.len() {
            inner.is_playing = false;
            return None;
        }

        let end = (inner.position + count).min(inner.samples.len());
        let samples = inner.samples[inner.position..end].to_vec();
        inner.position = end;

        if inner.position >= inner.samples.len() {
            inner.is_playing = false;
        }

        Some(samples)
    }
}

impl Default for SharedPlaybackState {
    fn default() -> Self {
        Self::new()
    }
}

/// A sink that drains a `SharedPlaybackState` on its own thread
pub trait OutputDevice: Send {
    /// Start streaming; returns once the stream thread is running
    fn start(&mut self, state: SharedPlaybackState) -> Result<()>;

    /// Stop streaming; must be safe to call when nothing is playing
    fn stop(&mut self);
}

/// Identifies one `play` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(u64);

/// Plays waveforms on the default output, one stream at a time
pub struct PlaybackService<D: OutputDevice = PipeWireOutput> {
    device: D,
    state: SharedPlaybackState,
    current: Option<PlaybackHandle>,
    next_id: u64,
}

impl PlaybackService<PipeWireOutput> {
    pub fn new() -> Self {
        Self::with_device(PipeWireOutput::new())
    }
}

impl Default for PlaybackService<PipeWireOutput> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: OutputDevice> PlaybackService<D> {
    pub fn with_device(device: D) -> Self {
        Self {
            device,
            state: SharedPlaybackState::new(),
            current: None,
            next_id: 1,
        }
    }

    /// Shared state for UI progress display
    pub fn shared_state(&self) -> SharedPlaybackState {
        self.state.clone()
    }

    /// Start playing `waveform`, stopping whatever was playing before
    pub fn play(&mut self, waveform: &Waveform) -> Result<PlaybackHandle> {
        if let Some(previous) = self.current {
            self.stop(previous);
        }

        if waveform.is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "Nothing to play: the audio is empty".to_string(),
            ));
        }

        let mono = waveform.clone().into_mono();
        self.state.load(mono.samples, mono.sample_rate);
        self.state.set_playing(true);

        if let Err(e) = self.device.start(self.state.clone()) {
            self.state.reset();
            return Err(e);
        }

        let handle = PlaybackHandle(self.next_id);
        self.next_id += 1;
        self.current = Some(handle);
        debug!("Playback {:?} started ({:.1}s)", handle, self.state.duration());
        Ok(handle)
    }

    /// Stop `handle`; a no-op for finished or superseded handles
    pub fn stop(&mut self, handle: PlaybackHandle) {
        if self.current != Some(handle) {
            return;
        }
        self.device.stop();
        self.state.reset();
        self.current = None;
        debug!("Playback {:?} stopped", handle);
    }

    /// Stop whatever is playing
    pub fn stop_all(&mut self) {
        if let Some(handle) = self.current {
            self.stop(handle);
        }
    }

    /// Whether `handle` has played to the end or been stopped
    pub fn is_finished(&self, handle: PlaybackHandle) -> bool {
        self.current != Some(handle) || !self.state.is_playing()
    }

    /// Why `handle` ended early, if its stream failed
    ///
    /// Only meaningful before `stop`, which forgets the handle.
    pub fn failure(&self, handle: PlaybackHandle) -> Option<VoiceCloneError> {
        if self.current != Some(handle) {
            return None;
        }
        self.state.error().map(VoiceCloneError::DeviceUnavailable)
    }

    /// Handle of the active stream, if any
    pub fn current(&self) -> Option<PlaybackHandle> {
        self.current
    }
}

/// PipeWire sink running its main loop on a dedicated thread
pub struct PipeWireOutput {
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
}

enum PlaybackCommand {
    Stop,
}

impl PipeWireOutput {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sender: None,
        }
    }
}

impl Default for PipeWireOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for PipeWireOutput {
    fn start(&mut self, state: SharedPlaybackState) -> Result<()> {
        self.stop();

        self.is_running.store(true, Ordering::SeqCst);
        let is_running = self.is_running.clone();

        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();
        self.sender = Some(sender);

        let handle = thread::Builder::new()
            .name("voiceclone-playback".to_string())
            .spawn(move || {
                match run_playback_loop(state.clone(), receiver) {
                    Ok(()) => state.set_playing(false),
                    Err(e) => {
                        error!("Playback error: {}", e);
                        state.set_error(e);
                    }
                }
                is_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.is_running.store(false, Ordering::SeqCst);
                VoiceCloneError::DeviceUnavailable(format!("Failed to start playback thread: {}", e))
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // Fails harmlessly if the loop already quit at end of stream
            let _ = sender.send(PlaybackCommand::Stop);
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Drop for PipeWireOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    state: SharedPlaybackState,
    receiver: pw::channel::Receiver<PlaybackCommand>,
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
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedPlaybackState,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let sample_rate = state.sample_rate();
    let user_data = UserData {
        format: Default::default(),
        state: state.clone(),
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::APP_NAME => "Voiceclone",
    };

    let stream = pw::stream::StreamBox::new(&core, "voiceclone-playback", props)
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
                error!("Failed to parse playback format: {:?}", e);
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
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;

            match user_data.state.next_samples(n_frames) {
                Some(samples) => {
                    // Same sample on every channel of the frame
                    for (i, &sample) in samples.iter().enumerate() {
                        let bytes = sample.to_le_bytes();
                        for ch in 0..n_channels {
                            let offset = i * stride + ch * 4;
                            if offset + 4 <= slice.len() {
                                slice[offset..offset + 4].copy_from_slice(&bytes);
                            }
                        }
                    }
                    let written = samples.len() * stride;
                    if written < slice.len() {
                        slice[written..].fill(0);
                    }

                    let chunk = data.chunk_mut();
                    *chunk.offset_mut() = 0;
                    *chunk.stride_mut() = stride as i32;
                    *chunk.size_mut() = written as u32;
                }
                None => {
                    if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                        mainloop.quit();
                    }
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Mono F32LE at the waveform's own rate; PipeWire converts for the sink
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(1);

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
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect playback stream: {}", e))?;

    mainloop.run();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records calls instead of touching audio hardware
    #[derive(Clone, Default)]
    struct FakeOutput {
        starts: Arc<Mutex<u32>>,
        stops: Arc<Mutex<u32>>,
        fail: bool,
        /// Start fine, then have the stream thread fail
        fail_later: bool,
    }

    impl OutputDevice for FakeOutput {
        fn start(&mut self, state: SharedPlaybackState) -> Result<()> {
            if self.fail {
                return Err(VoiceCloneError::DeviceUnavailable("no sink".into()));
            }
            *self.starts.lock().unwrap() += 1;
            if self.fail_later {
                state.set_error("Failed to connect playback stream".into());
            }
            Ok(())
        }

        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    fn tone() -> Waveform {
        Waveform::mono(vec![0.1; 2400], 24_000)
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let device = FakeOutput::default();
        let mut service = PlaybackService::with_device(device.clone());
        let handle = service.play(&tone()).unwrap();

        service.stop(handle);
        service.stop(handle);

        assert_eq!(*device.stops.lock().unwrap(), 1);
        assert!(service.is_finished(handle));
        assert_eq!(service.current(), None);
    }

    #[test]
    fn test_new_play_stops_previous() {
        let device = FakeOutput::default();
        let mut service = PlaybackService::with_device(device.clone());
        let first = service.play(&tone()).unwrap();
        let second = service.play(&tone()).unwrap();

        assert_ne!(first, second);
        assert_eq!(*device.starts.lock().unwrap(), 2);
        assert_eq!(*device.stops.lock().unwrap(), 1);
        assert!(service.is_finished(first));
        assert!(!service.is_finished(second));

        // Stopping the superseded handle must not touch the active stream
        service.stop(first);
        assert_eq!(service.current(), Some(second));
    }

    #[test]
    fn test_drained_stream_is_finished() {
        let mut service = PlaybackService::with_device(FakeOutput::default());
        let handle = service.play(&tone()).unwrap();
        let state = service.shared_state();

        while state.next_samples(1000).is_some() {}
        assert!(service.is_finished(handle));
        assert_eq!(state.progress(), 1.0);
        service.stop(handle);
    }

    #[test]
    fn test_stereo_is_downmixed_for_playback() {
        let mut service = PlaybackService::with_device(FakeOutput::default());
        service
            .play(&Waveform::new(vec![0.2, 0.4, 0.2, 0.4], 24_000, 2))
            .unwrap();
        let state = service.shared_state();
        let samples = state.next_samples(10).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_device_failure_is_reported() {
        let mut service = PlaybackService::with_device(FakeOutput {
            fail: true,
            ..FakeOutput::default()
        });
        let result = service.play(&tone());
        assert!(matches!(result, Err(VoiceCloneError::DeviceUnavailable(_))));
        assert_eq!(service.current(), None);
        assert!(!service.shared_state().is_playing());
    }

    #[test]
    fn test_stream_failure_is_reported() {
        let mut service = PlaybackService::with_device(FakeOutput {
            fail_later: true,
            ..FakeOutput::default()
        });
        let handle = service.play(&tone()).unwrap();

        assert!(service.is_finished(handle));
        assert_eq!(
            service.failure(handle),
            Some(VoiceCloneError::DeviceUnavailable(
                "Failed to connect playback stream".into()
            ))
        );

        service.stop(handle);
        assert_eq!(service.failure(handle), None);

        // A fresh play starts with a clean slate
        let mut service = PlaybackService::with_device(FakeOutput::default());
        service.shared_state().set_error("old".into());
        let handle = service.play(&tone()).unwrap();
        assert_eq!(service.failure(handle), None);
    }

    #[test]
    fn test_drained_stream_has_no_failure() {
        let mut service = PlaybackService::with_device(FakeOutput::default());
        let handle = service.play(&tone()).unwrap();
        while service.shared_state().next_samples(1000).is_some() {}
        assert!(service.is_finished(handle));
        assert_eq!(service.failure(handle), None);
    }

    #[test]
    fn test_empty_waveform_is_rejected() {
        let mut service = PlaybackService::with_device(FakeOutput::default());
        let result = service.play(&Waveform::mono(Vec::new(), 24_000));
        assert!(matches!(result, Err(VoiceCloneError::InvalidInput(_))));
    }
}
