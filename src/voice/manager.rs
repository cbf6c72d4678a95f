//! IndexTTS-2 model artifact discovery and user-initiated download
//!
//! Inference never downloads anything. When the artifacts are missing the UI
//! offers an explicit download from Hugging Face with progress tracking.

use crate::error::{Result, VoiceCloneError};
use hf_hub::api::tokio::{ApiBuilder, Progress};
use hf_hub::Cache;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Hugging Face repository holding the model checkpoints
pub const MODEL_REPO: &str = "IndexTeam/IndexTTS-2";

/// Files that must exist before the worker is started
pub const REQUIRED_FILES: &[&str] = &[
    "config.yaml",
    "bpe.model",
    "gpt.pth",
    "s2mel.pth",
    "wav2vec2bert_stats.pt",
    "feat1.pt",
    "feat2.pt",
];

/// Progress information for model download
#[derive(Debug, Clone, Default)]
pub struct ModelDownloadProgress {
    /// Overall progress as fraction (0.0 - 1.0)
    pub progress: f32,
    /// File currently downloading
    pub current_file: Option<String>,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Thread-safe progress tracker for downloads
#[derive(Clone)]
pub struct ProgressTracker {
    downloaded: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    files_done: Arc<AtomicU64>,
    files_total: Arc<AtomicU64>,
    current_file: Arc<Mutex<Option<String>>>,
    is_complete: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
    cancelled: Arc<AtomicBool>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            downloaded: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            files_done: Arc::new(AtomicU64::new(0)),
            files_total: Arc::new(AtomicU64::new(REQUIRED_FILES.len() as u64)),
            current_file: Arc::new(Mutex::new(None)),
            is_complete: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn begin_file(&self, name: &str, size: u64) {
        *self.current_file.lock().unwrap() = Some(name.to_string());
        self.total.store(size, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
    }

    fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    fn finish_file(&self) {
        self.files_done.fetch_add(1, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }

    pub fn set_complete(&self) {
        self.is_complete.store(true, Ordering::SeqCst);
        *self.current_file.lock().unwrap() = None;
    }

    pub fn set_error(&self, msg: String) {
        *self.error.lock().unwrap() = Some(msg);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn get_progress(&self) -> ModelDownloadProgress {
        let downloaded = self.downloaded.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let files_done = self.files_done.load(Ordering::SeqCst);
        let files_total = self.files_total.load(Ordering::SeqCst).max(1);
        let is_complete = self.is_complete.load(Ordering::SeqCst);

        let file_fraction = if total > 0 {
            downloaded as f32 / total as f32
        } else {
            0.0
        };
        let progress = if is_complete {
            1.0
        } else {
            ((files_done as f32 + file_fraction) / files_total as f32).min(1.0)
        };

        ModelDownloadProgress {
            progress,
            current_file: self.current_file.lock().unwrap().clone(),
            is_complete,
            error: self.error.lock().unwrap().clone(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrapper to implement hf-hub's Progress trait for ProgressTracker
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: ProgressTracker,
}

impl ProgressReporter {
    pub fn new(tracker: ProgressTracker) -> Self {
        Self { tracker }
    }
}

impl Progress for ProgressReporter {
    async fn init(&mut self, size: usize, filename: &str) {
        self.tracker.begin_file(filename, size as u64);
    }

    async fn update(&mut self, size: usize) {
        self.tracker.add_downloaded(size as u64);
    }

    async fn finish(&mut self) {
        self.tracker.finish_file();
    }
}

/// Locates IndexTTS-2 checkpoints on disk
#[derive(Debug, Clone)]
pub struct ModelManager {
    /// Hugging Face hub cache directory
    cache_dir: PathBuf,
    repo_id: String,
    /// Explicitly configured model directory, searched first
    override_dir: Option<PathBuf>,
    /// Flat directory some installs use instead of the hub layout
    legacy_dir: Option<PathBuf>,
}

impl ModelManager {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        let cache = Cache::default();
        let legacy_dir = dirs::home_dir().map(|home| {
            home.join(".cache")
                .join("huggingface")
                .join("IndexTeam")
                .join("IndexTTS-2")
        });

        Self {
            cache_dir: cache.path().to_path_buf(),
            repo_id: MODEL_REPO.to_string(),
            override_dir,
            legacy_dir,
        }
    }

    /// Manager that only looks inside `cache_dir`
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            repo_id: MODEL_REPO.to_string(),
            override_dir: None,
            legacy_dir: None,
        }
    }

    /// Look only in `dir` for the checkpoints
    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Directory where hf-hub keeps this repo
    fn repo_cache_dir(&self) -> PathBuf {
        let repo_folder = self.repo_id.replace('/', "--");
        self.cache_dir.join(format!("models--{}", repo_folder))
    }

    /// Required files missing from `dir`
    pub fn missing_files(dir: &Path) -> Vec<&'static str> {
        REQUIRED_FILES
            .iter()
            .copied()
            .filter(|name| {
                let path = dir.join(name);
                !fs::metadata(&path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
            })
            .collect()
    }

    fn is_complete_dir(dir: &Path) -> bool {
        dir.is_dir() && Self::missing_files(dir).is_empty()
    }

    /// Hub snapshot directory containing every required file, if any
    pub fn cached_snapshot(&self) -> Option<PathBuf> {
        let snapshots_dir = self.repo_cache_dir().join("snapshots");
        let entries = fs::read_dir(&snapshots_dir).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .find(|path| Self::is_complete_dir(path))
    }

    /// Find a directory holding all required artifacts
    ///
    /// Search order: configured directory, hub cache snapshots, legacy flat
    /// directory. Scans only; never downloads.
    pub fn locate(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.override_dir {
            let missing = Self::missing_files(dir);
            if missing.is_empty() {
                return Ok(dir.clone());
            }
            return Err(VoiceCloneError::ModelNotFound(format!(
                "{} is missing {}",
                dir.display(),
                missing.join(", ")
            )));
        }

        if let Some(snapshot) = self.cached_snapshot() {
            debug!("Found model snapshot at {}", snapshot.display());
            return Ok(snapshot);
        }

        if let Some(legacy) = self.legacy_dir.as_ref().filter(|d| Self::is_complete_dir(d)) {
            debug!("Found model at {}", legacy.display());
            return Ok(legacy.clone());
        }

        let mut searched = vec![self.repo_cache_dir().display().to_string()];
        if let Some(legacy) = &self.legacy_dir {
            searched.push(legacy.display().to_string());
        }
        Err(VoiceCloneError::ModelNotFound(format!(
            "IndexTTS-2 checkpoints were not found. Searched: {}",
            searched.join(", ")
        )))
    }

    pub fn is_model_available(&self) -> bool {
        self.locate().is_ok()
    }

    /// Download every required file into the hub cache
    ///
    /// Static so callers don't hold the manager while the download runs.
    pub async fn download_with_progress(
        cache_dir: PathBuf,
        repo_id: String,
        progress: ProgressTracker,
    ) -> std::result::Result<PathBuf, String> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir)
            .build()
            .map_err(|e| format!("Failed to create HuggingFace API: {}", e))?;

        let repo = api.model(repo_id);
        let mut model_dir = None;

        for file in REQUIRED_FILES {
            if progress.is_cancelled() {
                let msg = "Download cancelled".to_string();
                progress.set_error(msg.clone());
                return Err(msg);
            }

            info!("Downloading {}", file);
            let reporter = ProgressReporter::new(progress.clone());
            let path = repo
                .download_with_progress(file, reporter)
                .await
                .map_err(|e| {
                    let msg = format!("Failed to download {}: {}", file, e);
                    progress.set_error(msg.clone());
                    msg
                })?;

            model_dir = path.parent().map(Path::to_path_buf);
        }

        progress.set_complete();
        model_dir.ok_or_else(|| "Download produced no files".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for name in REQUIRED_FILES {
            fs::write(dir.join(name), b"weights").unwrap();
        }
    }

    #[test]
    fn test_locate_finds_hub_snapshot() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = cache
            .path()
            .join("models--IndexTeam--IndexTTS-2")
            .join("snapshots")
            .join("abc123");
        populate(&snapshot);

        let manager = ModelManager::with_cache_dir(cache.path());
        assert_eq!(manager.locate().unwrap(), snapshot);
        assert!(manager.is_model_available());
    }

    #[test]
    fn test_incomplete_snapshot_is_not_found() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = cache
            .path()
            .join("models--IndexTeam--IndexTTS-2")
            .join("snapshots")
            .join("abc123");
        populate(&snapshot);
        fs::remove_file(snapshot.join("gpt.pth")).unwrap();

        let manager = ModelManager::with_cache_dir(cache.path());
        assert!(matches!(
            manager.locate(),
            Err(VoiceCloneError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_override_dir_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), b"cfg").unwrap();

        let manager =
            ModelManager::with_cache_dir(dir.path().join("hub")).with_override_dir(dir.path());
        match manager.locate() {
            Err(VoiceCloneError::ModelNotFound(msg)) => {
                assert!(msg.contains("gpt.pth"));
                assert!(!msg.contains("config.yaml"));
            }
            other => panic!("expected ModelNotFound, got {:?}", other),
        }

        populate(dir.path());
        assert_eq!(manager.locate().unwrap(), dir.path());
    }

    #[test]
    fn test_progress_spans_all_files() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.get_progress().progress, 0.0);

        tracker.begin_file("config.yaml", 100);
        tracker.add_downloaded(50);
        let half_first = tracker.get_progress();
        assert_eq!(half_first.current_file.as_deref(), Some("config.yaml"));
        let expected = 0.5 / REQUIRED_FILES.len() as f32;
        assert!((half_first.progress - expected).abs() < 1e-6);

        tracker.finish_file();
        tracker.set_complete();
        let done = tracker.get_progress();
        assert!(done.is_complete);
        assert_eq!(done.progress, 1.0);
    }
}
