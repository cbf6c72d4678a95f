//! Voiceclone - a voice cloning desktop app for Linux
//!
//! Record or upload a short voice sample, type some text and hear it spoken
//! in that voice by IndexTTS-2.

mod app;
mod assets;
mod audio;
mod cli;
mod error;
mod models;
mod process;
mod settings;
mod state;
mod tokio_runtime;
mod voice;

use app::VoiceClone;
use assets::Assets;
use clap::Parser;
use gpui::prelude::*;
use gpui::*;
use log::info;
use settings::AppConfig;

const APP_ID: &str = "com.voiceclone.App";

fn main() {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    let config = AppConfig::load();
    info!("Starting Voiceclone (data in {})", config.data_dir.display());

    Application::new().with_assets(Assets).run(move |cx: &mut App| {
        // hf-hub needs a Tokio runtime for the model download
        tokio_runtime::init(cx);
        let bounds = Bounds::centered(None, size(px(600.0), px(800.0)), cx);
        cx.open_window(
            WindowOptions {
                window_bounds: Some(WindowBounds::Windowed(bounds)),
                titlebar: None,
                window_decorations: Some(WindowDecorations::Client),
                app_id: Some(APP_ID.to_string()),
                ..Default::default()
            },
            |window, cx| {
                window.set_app_id(APP_ID);
                let view = cx.new(|cx| VoiceClone::new(config, cx));
                window.focus(&view.read(cx).focus_handle(cx));
                view
            },
        )
        .expect("Failed to open window");
    });
}
