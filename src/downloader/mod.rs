pub mod batch;
pub mod pipeline;
pub mod ytdlp;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AudioFormat;
use crate::metadata::lyrics::LyricsStats;
use crate::processing::covers::CoverStats;
use crate::progress::ProgressSender;

/// Fixed gap between job starts in parallel mode.
pub const START_STAGGER: Duration = Duration::from_secs(2);

/// One download target: a destination folder and the URL to pull into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub folder: PathBuf,
    pub url: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadJob {
    pub fn new(folder: PathBuf, url: impl Into<String>) -> Self {
        Self {
            id: crate::utils::generate_job_id(),
            folder,
            url: url.into(),
            status: JobStatus::Queued,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Processing,
    Done,
    Failed,
}

/// Per-job knobs, derived from `AppConfig` and passed explicitly.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub format: AudioFormat,
    pub music_only: bool,
    pub lyrics_enabled: bool,
    pub filename_template: String,
    pub cookies_file: Option<PathBuf>,
    pub cookies_browser: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        crate::config::AppConfig::default().download_options()
    }
}

/// Scheduling knobs for a batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_workers: usize,
    pub parallel: bool,
    pub stagger: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_workers: 2,
            parallel: true,
            stagger: START_STAGGER,
        }
    }
}

impl BatchOptions {
    /// Effective worker count: serial mode pins the pool to one worker.
    pub fn worker_count(&self) -> usize {
        if self.parallel {
            self.max_workers.max(1)
        } else {
            1
        }
    }
}

/// Outcome record for one job. Always produced, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub folder: PathBuf,
    pub url: String,
    pub success: bool,
    pub tracks: usize,
    pub covers: CoverStats,
    pub lyrics: Option<LyricsStats>,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl JobResult {
    pub fn failed(job: &DownloadJob, error: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            job_id: job.id.clone(),
            folder: job.folder.clone(),
            url: job.url.clone(),
            success: false,
            tracks: 0,
            covers: CoverStats::default(),
            lyrics: None,
            error: Some(error.into()),
            duration_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<JobResult>,
    pub duration_seconds: f64,
}

/// Seam between the batch scheduler and the per-job pipeline.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: DownloadJob, events: &ProgressSender) -> JobResult;
}
