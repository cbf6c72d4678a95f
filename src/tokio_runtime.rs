//! Tokio runtime for the model download
//!
//! gpui drives its own executor, but hf-hub's async client needs Tokio. A
//! small runtime is created at startup and futures spawned on it are bridged
//! back into gpui tasks.

use gpui::{App, Context, Task};
use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::Runtime;

static TOKIO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Create the runtime. Call once during app startup.
pub fn init(_cx: &mut App) {
    TOKIO_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("voiceclone-tokio")
            .enable_all()
            .build()
            .expect("Failed to create Tokio runtime")
    });
}

fn handle() -> tokio::runtime::Handle {
    TOKIO_RUNTIME
        .get()
        .expect("Tokio runtime not initialized - call tokio_runtime::init() first")
        .handle()
        .clone()
}

/// Run `future` on Tokio and await it from gpui
pub fn spawn<T, R, F>(cx: &mut Context<T>, future: F) -> Task<Result<R, tokio::task::JoinError>>
where
    R: Send + 'static,
    F: Future<Output = R> + Send + 'static,
{
    let join_handle = handle().spawn(future);
    cx.foreground_executor().spawn(join_handle)
}
