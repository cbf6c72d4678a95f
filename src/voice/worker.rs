//! Voice engine hosted in a persistent worker subprocess
//!
//! The worker loads IndexTTS-2 once at startup and then serves synthesis
//! requests over a JSON-lines protocol on stdin/stdout. Audio crosses the
//! boundary as WAV files in a scratch directory.

use super::device::DevicePreference;
use super::manager::ModelManager;
use super::{EngineLoader, VoiceEngine};
use crate::audio::wav::{read_wav, write_wav};
use crate::audio::Waveform;
use crate::error::{Result, VoiceCloneError};
use crate::process::CommandLine;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Bridge script shipped inside the binary
const WORKER_SCRIPT: &str = include_str!("indextts_worker.py");
const WORKER_SCRIPT_NAME: &str = "indextts_worker.py";

/// How to launch the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// The embedded IndexTTS-2 bridge run by this interpreter
    Embedded { python: String },
    /// A user-supplied command speaking the same protocol
    Custom(CommandLine),
}

/// Request line sent to the worker
#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    reference: &'a Path,
    text: &'a str,
    output: &'a Path,
}

/// Event line emitted by the worker
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WorkerEvent {
    Ready,
    Done,
    Error { message: String },
}

/// Starts `WorkerEngine`s
pub struct WorkerLoader {
    command: WorkerCommand,
    models: ModelManager,
    device: DevicePreference,
    /// Scratch space for reference/output WAVs
    scratch_dir: PathBuf,
    /// Where the embedded script is written
    script_dir: PathBuf,
}

impl WorkerLoader {
    pub fn new(
        command: WorkerCommand,
        models: ModelManager,
        device: DevicePreference,
        scratch_dir: PathBuf,
        script_dir: PathBuf,
    ) -> Self {
        Self {
            command,
            models,
            device,
            scratch_dir,
            script_dir,
        }
    }

    /// Resolve the command line, materializing the embedded script if needed
    fn command_line(&self) -> Result<CommandLine> {
        match &self.command {
            WorkerCommand::Custom(command) => Ok(command.clone()),
            WorkerCommand::Embedded { python } => {
                let script = self.script_dir.join(WORKER_SCRIPT_NAME);
                let up_to_date = std::fs::read_to_string(&script)
                    .map(|current| current == WORKER_SCRIPT)
                    .unwrap_or(false);
                if !up_to_date {
                    std::fs::create_dir_all(&self.script_dir)
                        .and_then(|_| std::fs::write(&script, WORKER_SCRIPT))
                        .map_err(|e| {
                            VoiceCloneError::ModelLoadFailed(format!(
                                "Failed to install worker script at {}: {}",
                                script.display(),
                                e
                            ))
                        })?;
                }
                Ok(CommandLine::new(python).arg("-u").arg(script))
            }
        }
    }
}

impl EngineLoader for WorkerLoader {
    fn load(&self) -> Result<Box<dyn VoiceEngine>> {
        let model_dir = self.models.locate()?;
        let device = self.device.resolve();
        let command_line = self.command_line()?;

        info!(
            "Starting voice model worker ({}) on {} with {}",
            command_line.display_name(),
            device,
            model_dir.display()
        );

        let mut command = command_line.command();
        command
            .arg("--model-dir")
            .arg(&model_dir)
            .arg("--device")
            .arg(device.as_arg())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            VoiceCloneError::ModelLoadFailed(format!(
                "Could not launch {}: {}",
                command_line.display_name(),
                e
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(VoiceCloneError::ModelLoadFailed(
                "Worker pipes were not available".to_string(),
            ));
        };

        let mut engine = WorkerEngine {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            scratch_dir: self.scratch_dir.clone(),
        };

        match engine.next_event() {
            Some(WorkerEvent::Ready) => {
                info!("Voice model loaded");
                Ok(Box::new(engine))
            }
            Some(WorkerEvent::Error { message }) => {
                engine.shutdown();
                Err(VoiceCloneError::ModelLoadFailed(message))
            }
            Some(WorkerEvent::Done) => {
                engine.shutdown();
                Err(VoiceCloneError::ModelLoadFailed(
                    "Worker answered before it was ready".to_string(),
                ))
            }
            None => {
                engine.shutdown();
                Err(VoiceCloneError::ModelLoadFailed(
                    "Worker exited while loading the model".to_string(),
                ))
            }
        }
    }
}

/// A running worker process with the model loaded
pub struct WorkerEngine {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    scratch_dir: PathBuf,
}

impl WorkerEngine {
    /// Read stdout until the next protocol event; `None` on EOF
    fn next_event(&mut self) -> Option<WorkerEvent> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.stdout.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerEvent>(trimmed) {
                Ok(event) => return Some(event),
                Err(_) => debug!(target: "worker", "{}", trimmed),
            }
        }
    }

    fn send(&mut self, request: &WorkerRequest<'_>) -> Result<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| VoiceCloneError::InferenceError(format!("Failed to encode request: {}", e)))?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VoiceCloneError::InferenceError("Worker has been shut down".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| VoiceCloneError::InferenceError(format!("Worker is not running: {}", e)))
    }

    fn run_request(&mut self, reference: &Path, text: &str, output: &Path) -> Result<Waveform> {
        self.send(&WorkerRequest {
            reference,
            text,
            output,
        })?;

        match self.next_event() {
            Some(WorkerEvent::Done) => read_wav(output).map_err(|e| {
                VoiceCloneError::InferenceError(format!("Worker output is unreadable: {}", e))
            }),
            Some(WorkerEvent::Error { message }) => Err(VoiceCloneError::InferenceError(message)),
            Some(WorkerEvent::Ready) => Err(VoiceCloneError::InferenceError(
                "Worker restarted unexpectedly".to_string(),
            )),
            None => Err(VoiceCloneError::InferenceError(
                "Worker exited during generation".to_string(),
            )),
        }
    }
}

impl VoiceEngine for WorkerEngine {
    fn synthesize(&mut self, reference: &Waveform, text: &str) -> Result<Waveform> {
        std::fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            VoiceCloneError::Storage(format!("Failed to create scratch directory: {}", e))
        })?;
        let id = uuid::Uuid::new_v4();
        let reference_path = self.scratch_dir.join(format!("reference_{}.wav", id));
        let output_path = self.scratch_dir.join(format!("generated_{}.wav", id));

        write_wav(&reference_path, reference)?;
        let result = self.run_request(&reference_path, text, &output_path);

        for path in [&reference_path, &output_path] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        result
    }

    fn shutdown(&mut self) {
        // Closing stdin ends the worker's request loop
        if self.stdin.take().is_none() {
            return;
        }
        match self.child.wait_timeout(Duration::from_secs(3)) {
            Ok(Some(status)) => debug!("Worker exited with {}", status),
            _ => {
                debug!("Worker did not exit, killing it");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Route worker stderr through our logging system
fn forward_stderr(stderr: std::process::ChildStderr) {
    let spawned = thread::Builder::new()
        .name("voiceclone-worker-log".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    trace!(target: "worker", "{}", trimmed);
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to forward worker output: {}", e);
    }
}
