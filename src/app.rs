//! Main application component for Voiceclone

use crate::assets::icons;
use crate::audio::{
    AudioCapture, FormatNormalizer, OverlengthPolicy, PlaybackHandle, PlaybackService,
    SharedCaptureState, SharedPlaybackState, SourceFormat, WavStore, MAX_REFERENCE_SECONDS,
};
use crate::error::{Result, VoiceCloneError};
use crate::models::{ReferenceClip, SynthesisRequest, SynthesizedOutput};
use crate::settings::{self, AppConfig};
use crate::state::{JobId, JobKind, Phase, PlaybackSource, Refusal, Session};
use crate::tokio_runtime;
use crate::voice::{ModelManager, ModelStatus, ProgressTracker, VoiceModelAdapter, WorkerLoader};
use gpui::prelude::*;
use gpui::{InteractiveElement, *};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// The root application view
pub struct VoiceClone {
    session: Session,
    config: AppConfig,
    normalizer: FormatNormalizer,
    adapter: VoiceModelAdapter,
    model_manager: ModelManager,
    capture_state: SharedCaptureState,
    playback: PlaybackService,
    playback_state: SharedPlaybackState,
    /// Stream started for the current `Playing` phase
    playback_handle: Option<PlaybackHandle>,
    recordings: WavStore,
    outputs: WavStore,
    /// Seconds left before the microphone opens
    countdown: Option<u32>,
    synth_started: Option<Instant>,
    /// Model download in progress
    active_download: Option<ProgressTracker>,
    download_error: Option<String>,
    /// Refused actions and other transient messages
    notice: Option<String>,
    text_focused: bool,
    focus_handle: FocusHandle,
    refresh_running: bool,
    _ui_refresh_task: Option<Task<()>>,
}

impl VoiceClone {
    pub fn new(config: AppConfig, cx: &mut Context<Self>) -> Self {
        let model_manager = ModelManager::new(config.model_dir.clone());
        let loader = WorkerLoader::new(
            config.worker.clone(),
            model_manager.clone(),
            config.device,
            config.scratch_dir(),
            config.worker_dir(),
        );

        let mut session = Session::new();
        if let Err(e) = model_manager.locate() {
            session.model_unavailable(e);
        }

        let playback = PlaybackService::new();
        let playback_state = playback.shared_state();

        Self {
            session,
            normalizer: FormatNormalizer::new(config.normalizer_config()),
            adapter: VoiceModelAdapter::new(loader),
            model_manager,
            capture_state: SharedCaptureState::new(),
            playback,
            playback_state,
            playback_handle: None,
            recordings: WavStore::recordings(config.recordings_dir()),
            outputs: WavStore::outputs(config.output_dir()),
            countdown: None,
            synth_started: None,
            active_download: None,
            download_error: None,
            notice: None,
            text_focused: false,
            focus_handle: cx.focus_handle(),
            refresh_running: false,
            _ui_refresh_task: None,
            config,
        }
    }

    fn refuse(&mut self, refusal: Refusal) {
        info!("Refused: {}", refusal);
        self.notice = Some(refusal.to_string());
    }

    /// Whether something on screen is animating
    fn needs_refresh(&self) -> bool {
        self.countdown.is_some()
            || self.session.phase() == Phase::Recording
            || self.session.phase() == Phase::Synthesizing
            || self.playback_handle.is_some()
            || self.active_download.is_some()
    }

    /// Redraw at ~30fps while anything is live, and notice finished playback
    fn ensure_ui_refresh(&mut self, cx: &mut Context<Self>) {
        if self.refresh_running {
            return;
        }
        self.refresh_running = true;
        self._ui_refresh_task = Some(cx.spawn({
            async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
                loop {
                    cx.background_executor()
                        .timer(Duration::from_millis(33))
                        .await;

                    let Some(this) = this.upgrade() else {
                        break;
                    };
                    let should_continue = cx.update_entity(&this, |this, cx| {
                        this.poll_playback();
                        let keep_going = this.needs_refresh();
                        if !keep_going {
                            this.refresh_running = false;
                        }
                        cx.notify();
                        keep_going
                    });

                    match should_continue {
                        Ok(true) => continue,
                        _ => break,
                    }
                }
            }
        }));
    }

    fn poll_playback(&mut self) {
        if let Some(handle) = self.playback_handle {
            if self.playback.is_finished(handle) {
                let failure = self.playback.failure(handle);
                self.playback.stop(handle);
                self.playback_handle = None;
                match failure {
                    Some(e) => {
                        warn!("Playback failed: {}", e);
                        self.session.playback_failed(e);
                    }
                    None => self.session.playback_finished(),
                }
            }
        }
    }

    // Recording

    fn start_recording(&mut self, cx: &mut Context<Self>) {
        let id = match self.session.start_recording() {
            Ok(id) => id,
            Err(refusal) => return self.refuse(refusal),
        };
        self.notice = None;
        self.text_focused = false;

        let countdown = self.config.countdown_seconds;
        let duration = self.config.record_duration();
        let capture_state = self.capture_state.clone();
        let normalizer = self.normalizer.clone();
        let store = self.config.save_recordings.then(|| self.recordings.clone());

        self.countdown = (countdown > 0).then_some(countdown);
        self.ensure_ui_refresh(cx);

        cx.spawn(async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
            for remaining in (1..=countdown).rev() {
                let updated = this.update(cx, |this, cx| {
                    // Reset clears the countdown; keep it cleared
                    if this.session.phase() == Phase::Recording {
                        this.countdown = Some(remaining);
                    }
                    cx.notify();
                });
                if updated.is_err() {
                    return;
                }
                cx.background_executor().timer(Duration::from_secs(1)).await;
            }

            let started = this.update(cx, |this, cx| {
                this.countdown = None;
                cx.notify();
            });
            if started.is_err() {
                return;
            }

            let result = cx
                .background_executor()
                .spawn(async move { record_clip(capture_state, duration, &normalizer, store) })
                .await;

            let Some(this) = this.upgrade() else {
                return;
            };
            let _ = cx.update_entity(&this, |this, cx| {
                this.finish_recording(id, result);
                cx.notify();
            });
        })
        .detach();
    }

    fn finish_recording(&mut self, id: JobId, result: Result<ReferenceClip>) {
        match result {
            Ok(clip) => {
                let label = clip.label();
                if self.session.capture_complete(id, clip) {
                    info!("Recorded reference clip {}", label);
                }
            }
            Err(e) => {
                warn!("Recording failed: {}", e);
                self.session.capture_failed(id, e);
            }
        }
    }

    // Uploads

    fn browse_for_file(&mut self, cx: &mut Context<Self>) {
        if let Err(refusal) = self.check_can_load() {
            return self.refuse(refusal);
        }
        let paths = cx.prompt_for_paths(PathPromptOptions {
            files: true,
            directories: false,
            multiple: false,
            prompt: Some("Use as voice sample".into()),
        });

        cx.spawn(async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
            let Ok(Ok(Some(paths))) = paths.await else {
                return;
            };
            let Some(path) = paths.into_iter().next() else {
                return;
            };
            let Some(this) = this.upgrade() else {
                return;
            };
            let _ = cx.update_entity(&this, |this, cx| {
                this.load_file(path, cx);
            });
        })
        .detach();
    }

    /// Uploads are accepted from the same phases that start a job
    fn check_can_load(&self) -> std::result::Result<(), Refusal> {
        if self.session.is_busy() {
            return Err(Refusal::Busy);
        }
        match self.session.phase() {
            Phase::Idle | Phase::Ready => Ok(()),
            phase => Err(Refusal::WrongPhase(phase)),
        }
    }

    fn load_file(&mut self, path: PathBuf, cx: &mut Context<Self>) {
        let id = match self.session.begin_file_load() {
            Ok(id) => id,
            Err(refusal) => return self.refuse(refusal),
        };
        self.notice = None;
        info!("Loading voice sample {}", path.display());

        let normalizer = self.normalizer.clone();
        cx.spawn(async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
            let result = cx
                .background_executor()
                .spawn(async move { load_clip(&normalizer, &path) })
                .await;

            let Some(this) = this.upgrade() else {
                return;
            };
            let _ = cx.update_entity(&this, |this, cx| {
                match result {
                    Ok(clip) => {
                        this.session.file_loaded(id, clip);
                    }
                    Err(e) => {
                        warn!("Could not use voice sample: {}", e);
                        this.session.file_failed(id, e);
                    }
                }
                cx.notify();
            });
        })
        .detach();
    }

    fn remove_clip(&mut self) {
        if let Err(refusal) = self.session.remove_clip() {
            self.refuse(refusal);
        }
    }

    fn toggle_overlength_policy(&mut self) {
        let policy = self.config.overlength_policy.toggled();
        self.config.overlength_policy = policy;
        self.normalizer = FormatNormalizer::new(self.config.normalizer_config());
        settings::set_overlength_policy(policy);
        info!("Overlength policy: {}", policy.as_str());
    }

    // Synthesis

    fn generate(&mut self, cx: &mut Context<Self>) {
        let (id, request) = match self.session.generate() {
            Ok(job) => job,
            Err(refusal) => return self.refuse(refusal),
        };
        self.notice = None;
        self.text_focused = false;
        self.synth_started = Some(Instant::now());
        self.ensure_ui_refresh(cx);

        let adapter = self.adapter.clone();
        let outputs = self.outputs.clone();
        cx.spawn(async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
            let result = cx
                .background_executor()
                .spawn(async move { synthesize_output(&adapter, &request, &outputs) })
                .await;

            let Some(this) = this.upgrade() else {
                return;
            };
            let _ = cx.update_entity(&this, |this, cx| {
                this.synth_started = None;
                match result {
                    Ok((output, storage_error)) => {
                        if this.session.synthesis_complete(id, output) {
                            if let Some(e) = storage_error {
                                this.notice = Some(format!("{}: {}", e.title(), e));
                            }
                            this.start_output_playback(cx);
                        }
                    }
                    Err(e) => {
                        warn!("Generation failed: {}", e);
                        this.session.synthesis_failed(id, e);
                    }
                }
                cx.notify();
            });
        })
        .detach();
    }

    // Playback

    /// Stream the output the session just entered `Playing` for
    fn start_output_playback(&mut self, cx: &mut Context<Self>) {
        let Some(waveform) = self.session.output().map(|o| o.waveform.clone()) else {
            return;
        };
        match self.playback.play(&waveform) {
            Ok(handle) => {
                self.playback_handle = Some(handle);
                self.ensure_ui_refresh(cx);
            }
            Err(e) => {
                warn!("Playback failed: {}", e);
                self.session.playback_failed(e);
            }
        }
    }

    fn play_reference(&mut self, cx: &mut Context<Self>) {
        let clip = match self.session.play_reference() {
            Ok(clip) => clip,
            Err(refusal) => return self.refuse(refusal),
        };
        match self.playback.play(clip.waveform()) {
            Ok(handle) => {
                self.playback_handle = Some(handle);
                self.ensure_ui_refresh(cx);
            }
            Err(e) => self.session.playback_failed(e),
        }
    }

    fn replay_output(&mut self, cx: &mut Context<Self>) {
        if let Err(refusal) = self.session.replay_output() {
            return self.refuse(refusal);
        }
        self.start_output_playback(cx);
    }

    fn stop_playback(&mut self) {
        if let Some(handle) = self.playback_handle.take() {
            self.playback.stop(handle);
        }
        self.session.stop_playback();
    }

    fn reset(&mut self) {
        self.playback.stop_all();
        self.playback_handle = None;
        self.session.reset();
        self.countdown = None;
        self.notice = None;
        self.text_focused = false;
    }

    // Model download

    fn download_model(&mut self, cx: &mut Context<Self>) {
        if self.active_download.is_some() {
            return;
        }
        let progress = ProgressTracker::new();
        self.active_download = Some(progress.clone());
        self.download_error = None;

        let cache_dir = self.model_manager.cache_dir().to_path_buf();
        let repo_id = self.model_manager.repo_id().to_string();
        let download = tokio_runtime::spawn(
            cx,
            ModelManager::download_with_progress(cache_dir, repo_id, progress),
        );

        cx.spawn(async move |this: WeakEntity<Self>, cx: &mut AsyncApp| {
            let result = download.await;
            let Some(this) = this.upgrade() else {
                return;
            };
            let _ = cx.update_entity(&this, |this, cx| {
                this.active_download = None;
                match result {
                    Ok(Ok(dir)) => {
                        info!("Model downloaded to {}", dir.display());
                        if this.model_manager.is_model_available() {
                            this.adapter.model_installed();
                            this.session.model_installed();
                        }
                    }
                    Ok(Err(e)) => this.download_error = Some(e),
                    Err(e) => this.download_error = Some(format!("Download task failed: {}", e)),
                }
                cx.notify();
            });
        })
        .detach();

        self.ensure_ui_refresh(cx);
    }

    fn cancel_download(&mut self) {
        if let Some(progress) = &self.active_download {
            progress.cancel();
        }
    }

    // Text entry

    fn edit_text(&mut self, edit: impl FnOnce(&mut String)) {
        let mut text = self.session.text().to_string();
        edit(&mut text);
        self.session.set_text(text);
        self.session.clear_error();
        self.notice = None;
    }

    fn paste(&mut self, cx: &mut Context<Self>) {
        if let Some(pasted) = cx.read_from_clipboard().and_then(|item| item.text()) {
            self.edit_text(|text| text.push_str(&pasted));
        }
    }

    fn handle_key(&mut self, event: &KeyDownEvent, window: &mut Window, cx: &mut Context<Self>) {
        let keystroke = &event.keystroke;
        let ctrl = keystroke.modifiers.control;
        match keystroke.key.as_str() {
            "q" if ctrl => self.quit(window, cx),
            "enter" if ctrl => self.generate(cx),
            "v" if ctrl && self.text_focused => self.paste(cx),
            "escape" => {
                if self.session.phase() == Phase::Playing {
                    self.stop_playback();
                } else {
                    self.text_focused = false;
                }
            }
            "backspace" if self.text_focused => self.edit_text(|text| {
                text.pop();
            }),
            "enter" if self.text_focused => self.edit_text(|text| text.push('\n')),
            "space" if !self.text_focused => self.start_recording(cx),
            _ if self.text_focused && !ctrl => {
                if let Some(typed) = keystroke.key_char.as_ref() {
                    if !typed.chars().any(char::is_control) {
                        let typed = typed.clone();
                        self.edit_text(|text| text.push_str(&typed));
                    }
                }
            }
            _ => return,
        }
        cx.notify();
    }

    fn quit(&mut self, window: &mut Window, cx: &mut Context<Self>) {
        self.playback.stop_all();
        // A running synthesis holds the model; the worker exits with us
        if self.session.active_job() != Some(JobKind::Synthesize) {
            self.adapter.shutdown();
        }
        window.remove_window();
        cx.quit();
    }

    fn status_line(&self) -> String {
        if let Some(seconds) = self.countdown {
            return format!("Recording starts in {}...", seconds);
        }
        match self.session.phase() {
            Phase::Idle if self.session.active_job() == Some(JobKind::Normalize) => {
                "Converting audio...".to_string()
            }
            Phase::Idle => "Record or upload a voice sample to begin".to_string(),
            Phase::Recording => {
                let elapsed = self.capture_state.duration();
                let left = (self.config.record_seconds as f64 - elapsed).max(0.0).ceil();
                format!("Recording... {}s left", left as u32)
            }
            Phase::Ready if self.session.active_job() == Some(JobKind::Normalize) => {
                "Converting audio...".to_string()
            }
            Phase::Ready if self.session.text().trim().is_empty() => {
                "Type what the cloned voice should say".to_string()
            }
            Phase::Ready => "Ready to generate".to_string(),
            Phase::Synthesizing => {
                let dots = self
                    .synth_started
                    .map(|t| (t.elapsed().as_millis() / 400) as usize % 4)
                    .unwrap_or(0);
                format!("Generating speech{}", ".".repeat(dots))
            }
            Phase::Playing => match self.session.playing() {
                Some(PlaybackSource::Reference) => "Playing voice sample".to_string(),
                _ => "Playing generated speech".to_string(),
            },
        }
    }
}

/// Record, normalize and optionally keep a microphone clip
fn record_clip(
    capture_state: SharedCaptureState,
    duration: Duration,
    normalizer: &FormatNormalizer,
    store: Option<WavStore>,
) -> Result<ReferenceClip> {
    let mut capture = AudioCapture::new(capture_state);
    let waveform = normalizer.normalize(capture.record(duration)?)?;

    let saved_to = store.and_then(|store| match store.save(&waveform) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Could not keep recording: {}", e);
            None
        }
    });
    ReferenceClip::recorded(waveform, saved_to)
}

fn load_clip(normalizer: &FormatNormalizer, path: &Path) -> Result<ReferenceClip> {
    let waveform = normalizer.normalize_file(path)?;
    ReferenceClip::from_file(waveform, path)
}

/// Run the model and write the result to the output directory
///
/// A failed write keeps the generated audio and comes back as the second
/// element so it can still be played.
fn synthesize_output(
    adapter: &VoiceModelAdapter,
    request: &SynthesisRequest,
    outputs: &WavStore,
) -> Result<(SynthesizedOutput, Option<VoiceCloneError>)> {
    let waveform = adapter.synthesize_request(request)?;
    let (saved_to, storage_error) = match outputs.save(&waveform) {
        Ok(path) => {
            info!("Saved generated speech to {}", path.display());
            (Some(path), None)
        }
        Err(e) => {
            warn!("Could not save generated speech: {}", e);
            (None, Some(e))
        }
    };
    Ok((
        SynthesizedOutput::new(waveform, request.text(), saved_to),
        storage_error,
    ))
}

impl Focusable for VoiceClone {
    fn focus_handle(&self, _cx: &App) -> FocusHandle {
        self.focus_handle.clone()
    }
}

impl Render for VoiceClone {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        div()
            .size_full()
            .flex()
            .flex_col()
            .bg(rgb(0x0f0f1a))
            .key_context("VoiceClone")
            .track_focus(&self.focus_handle)
            .on_key_down(cx.listener(|this, event: &KeyDownEvent, window, cx| {
                this.handle_key(event, window, cx);
            }))
            .on_mouse_down(
                MouseButton::Left,
                cx.listener(|this, _event: &MouseDownEvent, window, _cx| {
                    this.text_focused = false;
                    window.focus(&this.focus_handle);
                }),
            )
            .child(self.render_titlebar(cx))
            .child(
                div()
                    .id("content")
                    .flex()
                    .flex_col()
                    .flex_grow()
                    .gap_4()
                    .p_6()
                    .bg(rgb(0x16213e))
                    .overflow_y_scroll()
                    .child(
                        div()
                            .flex()
                            .flex_col()
                            .gap_1()
                            .child(
                                div()
                                    .text_2xl()
                                    .font_weight(FontWeight::BOLD)
                                    .text_color(rgb(0xffffff))
                                    .child("Voice Clone"),
                            )
                            .child(
                                div()
                                    .text_sm()
                                    .text_color(rgb(0x888888))
                                    .child("Clone a voice from a short sample and make it say anything"),
                            ),
                    )
                    .child(self.render_reference_card(cx))
                    .child(self.render_text_card(cx))
                    .child(self.render_output_card(cx))
                    .child(self.render_model_card(cx))
                    .child(self.render_status(cx)),
            )
    }
}

impl VoiceClone {
    fn render_titlebar(&self, cx: &mut Context<Self>) -> impl IntoElement {
        div()
            .id("titlebar")
            .flex()
            .items_center()
            .justify_between()
            .w_full()
            .h(px(36.0))
            .bg(rgb(0x12121f))
            .border_b_1()
            .border_color(rgb(0x2d2d44))
            .child(
                div()
                    .id("titlebar-drag-area")
                    .flex()
                    .flex_grow()
                    .items_center()
                    .h_full()
                    .px_4()
                    .on_mouse_down(
                        MouseButton::Left,
                        cx.listener(|_this, _event: &MouseDownEvent, window, _cx| {
                            window.start_window_move();
                        }),
                    )
                    .child(
                        div()
                            .text_sm()
                            .font_weight(FontWeight::SEMIBOLD)
                            .text_color(rgb(0xcccccc))
                            .child("Voiceclone"),
                    ),
            )
            .child(
                div()
                    .id("close-button")
                    .w(px(46.0))
                    .h(px(36.0))
                    .flex()
                    .items_center()
                    .justify_center()
                    .cursor_pointer()
                    .hover(|style| style.bg(rgb(0xe81123)))
                    .on_click(cx.listener(|this, _, window, cx| {
                        this.quit(window, cx);
                    }))
                    .child(
                        svg()
                            .path(icons::CLOSE)
                            .size(px(14.0))
                            .text_color(rgb(0xcccccc)),
                    ),
            )
    }

    fn render_reference_card(&self, cx: &mut Context<Self>) -> impl IntoElement {
        let phase = self.session.phase();
        let clip_label = self.session.clip().map(|clip| clip.label());
        let converting = self.session.active_job() == Some(JobKind::Normalize);
        let recording = phase == Phase::Recording || self.countdown.is_some();
        let playing_reference =
            phase == Phase::Playing && self.session.playing() == Some(PlaybackSource::Reference);
        let truncate = self.config.overlength_policy == OverlengthPolicy::Truncate;
        let meter = self.capture_state.meter();
        let level = self.capture_state.volume_level();

        card("Voice sample")
            .child(
                div()
                    .id("drop-zone")
                    .flex()
                    .flex_col()
                    .items_center()
                    .justify_center()
                    .gap_2()
                    .h(px(120.0))
                    .rounded_lg()
                    .border_2()
                    .border_color(rgb(0x2d2d44))
                    .bg(rgb(0x12121f))
                    .cursor_pointer()
                    .hover(|style| style.border_color(rgb(0x4a4a6a)))
                    .drag_over::<ExternalPaths>(|style, _, _, _| {
                        style.border_color(rgb(0xe94560)).bg(rgb(0x1f1f35))
                    })
                    .on_drop(cx.listener(|this, paths: &ExternalPaths, _window, cx| {
                        if let Some(path) = paths.paths().first() {
                            this.load_file(path.clone(), cx);
                        }
                        cx.notify();
                    }))
                    .on_click(cx.listener(|this, _, _w, cx| {
                        this.browse_for_file(cx);
                        cx.notify();
                    }))
                    .child(
                        svg()
                            .path(icons::UPLOAD)
                            .size(px(24.0))
                            .text_color(rgb(0x888888)),
                    )
                    .child(
                        div()
                            .text_sm()
                            .text_color(rgb(0xcccccc))
                            .child(match (&clip_label, converting) {
                                (_, true) => "Converting audio...".to_string(),
                                (Some(label), false) => label.clone(),
                                (None, false) => "Drop an audio file here or click to browse".to_string(),
                            }),
                    )
                    .child(
                        div()
                            .text_xs()
                            .text_color(rgb(0x666666))
                            .child(format!(
                                "{}, up to {} seconds",
                                SourceFormat::supported_list(),
                                MAX_REFERENCE_SECONDS
                            )),
                    ),
            )
            .child(
                div()
                    .flex()
                    .items_center()
                    .gap_3()
                    .child(
                        button("btn-record", "Record", Some(icons::MIC), rgb(0xe94560), !self.session.is_busy())
                            .on_click(cx.listener(|this, _, _w, cx| {
                                this.start_recording(cx);
                                cx.notify();
                            })),
                    )
                    .when(clip_label.is_some(), |el| {
                        el.child(if playing_reference {
                            button("btn-stop-sample", "Stop", Some(icons::STOP), rgb(0x666666), true)
                                .on_click(cx.listener(|this, _, _w, cx| {
                                    this.stop_playback();
                                    cx.notify();
                                }))
                        } else {
                            button(
                                "btn-play-sample",
                                "Play sample",
                                Some(icons::PLAY),
                                rgb(0x4CAF50),
                                phase == Phase::Ready,
                            )
                            .on_click(cx.listener(|this, _, _w, cx| {
                                this.play_reference(cx);
                                cx.notify();
                            }))
                        })
                        .child(
                            button("btn-remove-sample", "Remove", Some(icons::CLOSE), rgb(0x444444), phase == Phase::Ready)
                                .on_click(cx.listener(|this, _, _w, cx| {
                                    this.remove_clip();
                                    cx.notify();
                                })),
                        )
                    })
                    .when(recording, |el| {
                        el.child(render_meter(&meter, level, self.countdown.is_some()))
                    }),
            )
            .child(
                div()
                    .id("toggle-overlength")
                    .flex()
                    .items_center()
                    .justify_between()
                    .cursor_pointer()
                    .on_click(cx.listener(|this, _, _w, cx| {
                        this.toggle_overlength_policy();
                        cx.notify();
                    }))
                    .child(
                        div()
                            .flex()
                            .flex_col()
                            .child(
                                div()
                                    .text_sm()
                                    .text_color(rgb(0xcccccc))
                                    .child("Trim long samples"),
                            )
                            .child(div().text_xs().text_color(rgb(0x666666)).child(if truncate {
                                format!("Samples longer than {}s are cut to fit", MAX_REFERENCE_SECONDS)
                            } else {
                                format!("Samples longer than {}s are refused", MAX_REFERENCE_SECONDS)
                            })),
                    )
                    .child(toggle_switch(truncate)),
            )
    }

    fn render_text_card(&self, cx: &mut Context<Self>) -> impl IntoElement {
        let text = self.session.text().to_string();
        let focused = self.text_focused;
        let synthesizing = self.session.phase() == Phase::Synthesizing;
        let can_generate = self.session.can_generate();

        card("Text to speak")
            .child(
                div()
                    .id("text-input")
                    .min_h(px(100.0))
                    .p_3()
                    .rounded_lg()
                    .border_1()
                    .border_color(if focused { rgb(0xe94560) } else { rgb(0x2d2d44) })
                    .bg(rgb(0x12121f))
                    .cursor_text()
                    .on_mouse_down(
                        MouseButton::Left,
                        cx.listener(|this, _event: &MouseDownEvent, window, cx| {
                            this.text_focused = true;
                            window.focus(&this.focus_handle);
                            cx.stop_propagation();
                            cx.notify();
                        }),
                    )
                    .child(if text.is_empty() && !focused {
                        div()
                            .text_sm()
                            .text_color(rgb(0x666666))
                            .child("Click here and type what the voice should say")
                    } else {
                        div()
                            .text_sm()
                            .text_color(rgb(0xffffff))
                            .child(if focused { format!("{}|", text) } else { text })
                    }),
            )
            .child(
                button(
                    "btn-generate",
                    if synthesizing { "Generating..." } else { "Generate & Play" },
                    Some(icons::PLAY),
                    rgb(0xe94560),
                    can_generate,
                )
                .justify_center()
                .on_click(cx.listener(|this, _, _w, cx| {
                    this.generate(cx);
                    cx.notify();
                })),
            )
            .child(
                div()
                    .text_xs()
                    .text_color(rgb(0x666666))
                    .child("Ctrl+Enter to generate, Space to record, Esc to stop playback"),
            )
    }

    fn render_output_card(&self, cx: &mut Context<Self>) -> impl IntoElement {
        let output_label = self.session.output().map(|o| o.label());
        let playing_output =
            self.session.phase() == Phase::Playing && self.session.playing() == Some(PlaybackSource::Output);
        let progress = if self.playback_handle.is_some() {
            self.playback_state.progress()
        } else {
            0.0
        };
        let bars = self.playback_state.waveform();
        let time = format!(
            "{:.1}s / {:.1}s",
            self.playback_state.current_time(),
            self.playback_state.duration()
        );

        card("Generated speech").child(match output_label {
            None => div()
                .text_sm()
                .text_color(rgb(0x666666))
                .child("Nothing generated yet"),
            Some(label) => div()
                .flex()
                .flex_col()
                .gap_2()
                .child(
                    div()
                        .flex()
                        .items_center()
                        .justify_between()
                        .child(div().text_sm().text_color(rgb(0xcccccc)).child(label))
                        .child(if playing_output {
                            button("btn-stop-output", "Stop", Some(icons::STOP), rgb(0x666666), true)
                                .on_click(cx.listener(|this, _, _w, cx| {
                                    this.stop_playback();
                                    cx.notify();
                                }))
                        } else {
                            button(
                                "btn-replay",
                                "Replay",
                                Some(icons::PLAY),
                                rgb(0x4CAF50),
                                !self.session.is_busy(),
                            )
                            .on_click(cx.listener(|this, _, _w, cx| {
                                this.replay_output(cx);
                                cx.notify();
                            }))
                        }),
                )
                .when(playing_output, |el| {
                    el.child(render_playback_bars(&bars, progress))
                        .child(div().text_xs().text_color(rgb(0x888888)).child(time))
                }),
        })
    }

    fn render_model_card(&self, cx: &mut Context<Self>) -> impl IntoElement {
        let model_error = self.session.model_error().cloned();
        let download = self.active_download.as_ref().map(|p| p.get_progress());

        let body = if let Some(progress) = download {
            div()
                .flex()
                .flex_col()
                .gap_2()
                .child(progress_bar(progress.progress))
                .child(
                    div()
                        .flex()
                        .items_center()
                        .justify_between()
                        .child(div().text_xs().text_color(rgb(0x888888)).child(format!(
                            "Downloading {} ({:.0}%)",
                            progress.current_file.unwrap_or_else(|| "IndexTTS-2".to_string()),
                            progress.progress * 100.0
                        )))
                        .child(
                            button("btn-cancel-download", "Cancel", None, rgb(0x666666), true)
                                .on_click(cx.listener(|this, _, _w, cx| {
                                    this.cancel_download();
                                    cx.notify();
                                })),
                        ),
                )
        } else {
            match model_error {
                Some(VoiceCloneError::ModelNotFound(msg)) => div()
                    .flex()
                    .flex_col()
                    .gap_2()
                    .child(div().text_xs().text_color(rgb(0xFF9800)).child(msg))
                    .child(
                        button("btn-download", "Download IndexTTS-2", None, rgb(0x4a90d9), true)
                            .on_click(cx.listener(|this, _, _w, cx| {
                                this.download_model(cx);
                                cx.notify();
                            })),
                    ),
                Some(error) => div()
                    .text_xs()
                    .text_color(rgb(0xe94560))
                    .child(error.to_string()),
                None => div().text_xs().text_color(rgb(0x888888)).child(
                    match self.adapter.status() {
                        ModelStatus::NotLoaded => "IndexTTS-2 loads on first generation",
                        ModelStatus::Loaded => "IndexTTS-2 loaded",
                        ModelStatus::Failed(_) => "IndexTTS-2 failed to load",
                        ModelStatus::ShutDown => "IndexTTS-2 shut down",
                    },
                ),
            }
        };

        card("Voice model")
            .child(body)
            .when_some(self.download_error.clone(), |el, error| {
                el.child(div().text_xs().text_color(rgb(0xe94560)).child(error))
            })
    }

    fn render_status(&self, cx: &mut Context<Self>) -> impl IntoElement {
        let error = self.session.last_error().cloned();
        let notice = self.notice.clone();
        let status = self.status_line();

        div()
            .flex()
            .items_center()
            .justify_between()
            .gap_4()
            .child(
                div()
                    .flex()
                    .flex_col()
                    .gap_1()
                    .child(div().text_sm().text_color(rgb(0xcccccc)).child(status))
                    .when_some(error, |el, error| {
                        el.child(
                            div()
                                .text_sm()
                                .text_color(rgb(0xe94560))
                                .child(format!("{}: {}", error.title(), error)),
                        )
                    })
                    .when_some(notice, |el, notice| {
                        el.child(div().text_sm().text_color(rgb(0xFF9800)).child(notice))
                    }),
            )
            .child(
                button("btn-reset", "Start over", None, rgb(0x444444), true).on_click(cx.listener(
                    |this, _, _w, cx| {
                        this.reset();
                        cx.notify();
                    },
                )),
            )
    }
}

fn card(title: &str) -> Div {
    div()
        .flex()
        .flex_col()
        .gap_3()
        .p_4()
        .rounded_lg()
        .bg(rgb(0x1a1a2e))
        .border_1()
        .border_color(rgb(0x2d2d44))
        .child(
            div()
                .text_sm()
                .font_weight(FontWeight::SEMIBOLD)
                .text_color(rgb(0xffffff))
                .child(title.to_string()),
        )
}

fn button(
    id: &'static str,
    label: &'static str,
    icon: Option<&'static str>,
    color: Rgba,
    enabled: bool,
) -> Stateful<Div> {
    div()
        .id(id)
        .flex()
        .items_center()
        .gap_2()
        .px_4()
        .py_2()
        .rounded_lg()
        .bg(color)
        .text_sm()
        .text_color(rgb(0xffffff))
        .font_weight(FontWeight::SEMIBOLD)
        .when(enabled, |el| el.cursor_pointer().hover(|style| style.opacity(0.9)))
        .when(!enabled, |el| el.opacity(0.4))
        .when_some(icon, |el, icon| {
            el.child(svg().path(icon).size(px(14.0)).text_color(rgb(0xffffff)))
        })
        .child(label)
}

/// Scrolling input meter; the rightmost bar tracks the live level
fn render_meter(history: &[f32], level: f32, waiting: bool) -> impl IntoElement {
    let num_bars = 24usize;
    let mut levels = history.to_vec();
    levels.push(level);
    let skip = levels.len().saturating_sub(num_bars);
    let recent = &levels[skip..];
    let first_with_data = num_bars - recent.len();

    div()
        .flex()
        .items_end()
        .gap_1()
        .h(px(32.0))
        .children((0..num_bars).map(|i| {
            let height = if waiting || i < first_with_data {
                3.0
            } else {
                (recent[i - first_with_data] * 120.0).clamp(3.0, 32.0)
            };
            div().w(px(3.0)).h(px(height)).rounded_sm().bg(if waiting {
                rgb(0x444444)
            } else if height > 28.0 {
                rgb(0xe94560)
            } else if height > 18.0 {
                rgb(0xFF9800)
            } else {
                rgb(0x4CAF50)
            })
        }))
}

/// Output waveform with the played part highlighted
fn render_playback_bars(bars: &[f32], progress: f32) -> impl IntoElement {
    let peak = bars.iter().copied().fold(0.0f32, f32::max).max(1e-4);
    let played = (progress.clamp(0.0, 1.0) * bars.len() as f32) as usize;

    div()
        .flex()
        .items_center()
        .gap_1()
        .h(px(40.0))
        .children(bars.iter().enumerate().map(|(i, bar)| {
            let height = (bar / peak * 40.0).clamp(2.0, 40.0);
            div()
                .w(px(4.0))
                .h(px(height))
                .rounded_sm()
                .bg(if i < played { rgb(0xe94560) } else { rgb(0x444444) })
        }))
}

fn progress_bar(fraction: f32) -> impl IntoElement {
    div()
        .w_full()
        .h(px(6.0))
        .rounded_full()
        .bg(rgb(0x2d2d44))
        .child(
            div()
                .h_full()
                .rounded_full()
                .bg(rgb(0xe94560))
                .w(relative(fraction.clamp(0.0, 1.0))),
        )
}

fn toggle_switch(is_on: bool) -> impl IntoElement {
    let bg = if is_on { rgb(0x4CAF50) } else { rgb(0x2d2d44) };
    let dot_position = if is_on { px(22.0) } else { px(2.0) };

    div()
        .w(px(44.0))
        .h(px(24.0))
        .rounded_full()
        .bg(bg)
        .relative()
        .child(
            div()
                .absolute()
                .top(px(2.0))
                .left(dot_position)
                .w(px(20.0))
                .h(px(20.0))
                .rounded_full()
                .bg(rgb(0xffffff)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Waveform;
    use crate::voice::testing::CountingLoader;
    use std::prelude::rust_2021::test;
    use std::sync::Arc;

    fn request(text: &str) -> SynthesisRequest {
        let clip =
            ReferenceClip::recorded(Waveform::mono(vec![0.2; 24_000], 24_000), None).unwrap();
        SynthesisRequest::new(Arc::new(clip), text).unwrap()
    }

    #[test]
    fn test_output_saved_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let adapter =
            VoiceModelAdapter::new(CountingLoader::answering(Waveform::mono(vec![0.1; 2_400], 24_000)));
        let outputs = WavStore::outputs(dir.path());

        let (output, storage_error) = synthesize_output(&adapter, &request("hello"), &outputs).unwrap();
        assert!(storage_error.is_none());
        let saved = output.saved_to.unwrap();
        assert!(saved.starts_with(dir.path()));
        assert!(saved.exists());
    }

    #[test]
    fn test_unwritable_output_dir_keeps_audio() {
        // A regular file where the output directory should be
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let adapter =
            VoiceModelAdapter::new(CountingLoader::answering(Waveform::mono(vec![0.1; 2_400], 24_000)));
        let outputs = WavStore::outputs(blocker.path().join("output"));

        let (output, storage_error) = synthesize_output(&adapter, &request("hello"), &outputs).unwrap();
        assert!(matches!(storage_error, Some(VoiceCloneError::Storage(_))));
        assert!(output.saved_to.is_none());
        assert_eq!(output.waveform.frames(), 2_400);
        assert_eq!(output.text, "hello");
    }

    #[test]
    fn test_inference_failure_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let adapter =
            VoiceModelAdapter::new(CountingLoader::answering(Waveform::mono(vec![0.1; 10], 24_000)));
        let outputs = WavStore::outputs(dir.path().join("output"));

        assert!(matches!(
            synthesize_output(&adapter, &request("unspeakable"), &outputs),
            Err(VoiceCloneError::InferenceError(_))
        ));
        assert!(!dir.path().join("output").exists());
    }
}
