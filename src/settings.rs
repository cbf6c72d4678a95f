//! Application configuration
//!
//! Values are layered: built-in defaults, then user choices persisted in
//! dconf under `/com/voiceclone/app/`, then `VOICECLONE_*` environment
//! variables.

use crate::audio::{NormalizerConfig, OverlengthPolicy, DEFAULT_RECORD_SECONDS};
use crate::process::CommandLine;
use crate::voice::{DevicePreference, WorkerCommand};
use log::{error, warn};
use std::path::PathBuf;
use std::time::Duration;

const DCONF_PATH: &str = "/com/voiceclone/app/";

/// Keys for dconf settings
mod keys {
    pub const OVERLENGTH_POLICY: &str = "overlength-policy";
    pub const COMPUTE_DEVICE: &str = "compute-device";
    pub const SAVE_RECORDINGS: &str = "save-recordings";
}

/// Environment variable names
mod env {
    pub const RECORD_SECONDS: &str = "VOICECLONE_RECORD_SECONDS";
    pub const COUNTDOWN_SECONDS: &str = "VOICECLONE_COUNTDOWN_SECONDS";
    pub const OVERLENGTH: &str = "VOICECLONE_OVERLENGTH";
    pub const DEVICE: &str = "VOICECLONE_DEVICE";
    pub const MODEL_DIR: &str = "VOICECLONE_MODEL_DIR";
    pub const WORKER: &str = "VOICECLONE_WORKER";
    pub const PYTHON: &str = "VOICECLONE_PYTHON";
    pub const TRANSCODER: &str = "VOICECLONE_TRANSCODER";
    pub const TRANSCODE_TIMEOUT: &str = "VOICECLONE_TRANSCODE_TIMEOUT";
    pub const OUTPUT_DIR: &str = "VOICECLONE_OUTPUT_DIR";
}

fn dconf_key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Get the persisted overlength policy from dconf
pub fn get_overlength_policy() -> Option<OverlengthPolicy> {
    dconf_rs::get_string(&dconf_key(keys::OVERLENGTH_POLICY))
        .ok()
        .and_then(|v| OverlengthPolicy::parse(&v))
}

/// Persist the overlength policy in dconf
pub fn set_overlength_policy(policy: OverlengthPolicy) {
    if let Err(e) = dconf_rs::set_string(&dconf_key(keys::OVERLENGTH_POLICY), policy.as_str()) {
        error!("Failed to save overlength policy to dconf: {}", e);
    }
}

/// Get the persisted compute device from dconf
pub fn get_compute_device() -> Option<DevicePreference> {
    dconf_rs::get_string(&dconf_key(keys::COMPUTE_DEVICE))
        .ok()
        .and_then(|v| DevicePreference::parse(&v))
}

/// Get whether recordings are kept on disk (defaults to true)
pub fn get_save_recordings() -> Option<bool> {
    dconf_rs::get_boolean(&dconf_key(keys::SAVE_RECORDINGS)).ok()
}

/// Values read from dconf; `None` means unset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSettings {
    pub overlength_policy: Option<OverlengthPolicy>,
    pub compute_device: Option<DevicePreference>,
    pub save_recordings: Option<bool>,
}

impl StoredSettings {
    pub fn load() -> Self {
        Self {
            overlength_policy: get_overlength_policy(),
            compute_device: get_compute_device(),
            save_recordings: get_save_recordings(),
        }
    }
}

/// Resolved runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub record_seconds: u32,
    pub countdown_seconds: u32,
    pub overlength_policy: OverlengthPolicy,
    pub device: DevicePreference,
    pub model_dir: Option<PathBuf>,
    pub worker: WorkerCommand,
    pub transcoder: CommandLine,
    pub transcode_timeout: Duration,
    pub save_recordings: bool,
    /// Root for recordings, the worker script and (by default) outputs
    pub data_dir: PathBuf,
    /// Where generated speech goes when not under `data_dir`
    pub output_override: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            record_seconds: DEFAULT_RECORD_SECONDS,
            countdown_seconds: 3,
            overlength_policy: OverlengthPolicy::default(),
            device: DevicePreference::default(),
            model_dir: None,
            worker: WorkerCommand::Embedded {
                python: "python3".to_string(),
            },
            transcoder: CommandLine::new("ffmpeg"),
            transcode_timeout: Duration::from_secs(60),
            save_recordings: true,
            data_dir: default_data_dir(),
            output_override: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("voiceclone")
}

impl AppConfig {
    /// Configuration from dconf and the process environment
    pub fn load() -> Self {
        Self::from_sources(StoredSettings::load(), |name| std::env::var(name).ok())
    }

    /// Layer `stored` and then `lookup`-provided variables over the defaults
    pub fn from_sources(stored: StoredSettings, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(policy) = stored.overlength_policy {
            config.overlength_policy = policy;
        }
        if let Some(device) = stored.compute_device {
            config.device = device;
        }
        if let Some(save) = stored.save_recordings {
            config.save_recordings = save;
        }

        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(value) = var(env::RECORD_SECONDS) {
            match value.trim().parse::<u32>() {
                Ok(secs) if (1..=30).contains(&secs) => config.record_seconds = secs,
                _ => warn!("Ignoring {}={:?}: expected 1-30 seconds", env::RECORD_SECONDS, value),
            }
        }
        if let Some(value) = var(env::COUNTDOWN_SECONDS) {
            match value.trim().parse::<u32>() {
                Ok(secs) if secs <= 10 => config.countdown_seconds = secs,
                _ => warn!("Ignoring {}={:?}: expected 0-10 seconds", env::COUNTDOWN_SECONDS, value),
            }
        }
        if let Some(value) = var(env::OVERLENGTH) {
            match OverlengthPolicy::parse(&value) {
                Some(policy) => config.overlength_policy = policy,
                None => warn!("Ignoring {}={:?}: expected truncate or reject", env::OVERLENGTH, value),
            }
        }
        if let Some(value) = var(env::DEVICE) {
            match DevicePreference::parse(&value) {
                Some(device) => config.device = device,
                None => warn!("Ignoring {}={:?}: expected auto, cuda, mps or cpu", env::DEVICE, value),
            }
        }
        if let Some(value) = var(env::MODEL_DIR) {
            config.model_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = var(env::PYTHON) {
            config.worker = WorkerCommand::Embedded { python: value };
        }
        if let Some(value) = var(env::WORKER) {
            match CommandLine::parse(&value) {
                Some(command) => config.worker = WorkerCommand::Custom(command),
                None => warn!("Ignoring empty {}", env::WORKER),
            }
        }
        if let Some(value) = var(env::TRANSCODER) {
            if let Some(command) = CommandLine::parse(&value) {
                config.transcoder = command;
            }
        }
        if let Some(value) = var(env::TRANSCODE_TIMEOUT) {
            match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.transcode_timeout = Duration::from_secs(secs),
                _ => warn!("Ignoring {}={:?}: expected seconds", env::TRANSCODE_TIMEOUT, value),
            }
        }
        if let Some(value) = var(env::OUTPUT_DIR) {
            config.output_override = Some(PathBuf::from(value));
        }

        config
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_override
            .clone()
            .unwrap_or_else(|| self.data_dir.join("output"))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }

    pub fn worker_dir(&self) -> PathBuf {
        self.data_dir.join("worker")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        std::env::temp_dir().join("voiceclone")
    }

    pub fn record_duration(&self) -> Duration {
        Duration::from_secs(self.record_seconds as u64)
    }

    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            policy: self.overlength_policy,
            transcoder: self.transcoder.clone(),
            transcode_timeout: self.transcode_timeout,
            scratch_dir: self.scratch_dir(),
            ..NormalizerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::ComputeDevice;
    use std::collections::HashMap;

    fn config_with(stored: StoredSettings, vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_sources(stored, |name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(StoredSettings::default(), &[]);
        assert_eq!(config.record_seconds, 5);
        assert_eq!(config.countdown_seconds, 3);
        assert_eq!(config.overlength_policy, OverlengthPolicy::Truncate);
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(config.save_recordings);
        assert_eq!(config.transcoder, CommandLine::new("ffmpeg"));
        assert_eq!(
            config.worker,
            WorkerCommand::Embedded {
                python: "python3".to_string()
            }
        );
    }

    #[test]
    fn test_environment_overrides_dconf() {
        let stored = StoredSettings {
            overlength_policy: Some(OverlengthPolicy::Reject),
            compute_device: Some(DevicePreference::Fixed(ComputeDevice::Cuda)),
            save_recordings: Some(false),
        };
        let config = config_with(stored.clone(), &[]);
        assert_eq!(config.overlength_policy, OverlengthPolicy::Reject);
        assert!(!config.save_recordings);

        let config = config_with(
            stored,
            &[
                ("VOICECLONE_OVERLENGTH", "truncate"),
                ("VOICECLONE_DEVICE", "cpu"),
                ("VOICECLONE_RECORD_SECONDS", "8"),
                ("VOICECLONE_OUTPUT_DIR", "/srv/voices"),
            ],
        );
        assert_eq!(config.overlength_policy, OverlengthPolicy::Truncate);
        assert_eq!(config.device, DevicePreference::Fixed(ComputeDevice::Cpu));
        assert_eq!(config.record_duration(), Duration::from_secs(8));
        assert_eq!(config.output_dir(), PathBuf::from("/srv/voices"));
        // Only outputs move
        assert_eq!(config.recordings_dir(), default_data_dir().join("recordings"));
        assert_eq!(config.worker_dir(), default_data_dir().join("worker"));
    }

    #[test]
    fn test_invalid_environment_is_ignored() {
        let config = config_with(
            StoredSettings::default(),
            &[
                ("VOICECLONE_RECORD_SECONDS", "forever"),
                ("VOICECLONE_OVERLENGTH", "squash"),
                ("VOICECLONE_TRANSCODE_TIMEOUT", "0"),
            ],
        );
        assert_eq!(config.record_seconds, 5);
        assert_eq!(config.overlength_policy, OverlengthPolicy::Truncate);
        assert_eq!(config.transcode_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_worker_command_selection() {
        let config = config_with(
            StoredSettings::default(),
            &[("VOICECLONE_PYTHON", "/opt/venv/bin/python")],
        );
        assert_eq!(
            config.worker,
            WorkerCommand::Embedded {
                python: "/opt/venv/bin/python".to_string()
            }
        );

        let config = config_with(
            StoredSettings::default(),
            &[
                ("VOICECLONE_PYTHON", "/opt/venv/bin/python"),
                ("VOICECLONE_WORKER", "/usr/local/bin/tts-worker --quiet"),
            ],
        );
        assert_eq!(
            config.worker,
            WorkerCommand::Custom(CommandLine::new("/usr/local/bin/tts-worker").arg("--quiet"))
        );
    }

    #[test]
    fn test_normalizer_config_follows_policy() {
        let config = config_with(
            StoredSettings::default(),
            &[("VOICECLONE_OVERLENGTH", "reject"), ("VOICECLONE_TRANSCODER", "avconv")],
        );
        let normalizer = config.normalizer_config();
        assert_eq!(normalizer.policy, OverlengthPolicy::Reject);
        assert_eq!(normalizer.transcoder, CommandLine::new("avconv"));
        assert_eq!(normalizer.target_rate, 24_000);
    }
}
