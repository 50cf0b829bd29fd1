//! The per-job pipeline: download, cover pass, lyrics pass, sidecar
//! cleanup. Every run returns a `JobResult` and emits exactly one terminal
//! event; stage problems after a successful download are counted, not
//! fatal.

use std::path::Path;
use std::time::Instant;

use log::{error, info, warn};

use crate::downloader::ytdlp::{self, YtdlpOutput, YTDLP_CMD};
use crate::downloader::{DownloadJob, DownloadOptions, JobResult, JobRunner, JobStatus};
use crate::metadata::lyrics::{self, LrclibClient, LyricsSource, LyricsStats};
use crate::metadata::FFPROBE_CMD;
use crate::processing::covers::{CoverFixer, CoverStats};
use crate::progress::{ProcessingStep, ProgressEvent, ProgressSender};
use crate::utils;

pub struct DownloadPipeline {
    options: DownloadOptions,
    ytdlp_cmd: String,
    ffprobe_cmd: String,
    cover_fixer: CoverFixer,
    lyrics_source: Box<dyn LyricsSource>,
}

impl DownloadPipeline {
    pub fn new(options: DownloadOptions) -> Self {
        Self {
            options,
            ytdlp_cmd: YTDLP_CMD.to_string(),
            ffprobe_cmd: FFPROBE_CMD.to_string(),
            cover_fixer: CoverFixer::new(),
            lyrics_source: Box::new(LrclibClient::new()),
        }
    }

    pub fn with_ytdlp_path(mut self, path: impl Into<String>) -> Self {
        self.ytdlp_cmd = path.into();
        self
    }

    pub fn with_lyrics_source(mut self, source: Box<dyn LyricsSource>) -> Self {
        self.lyrics_source = source;
        self
    }

    pub async fn run_job(&self, mut job: DownloadJob, events: &ProgressSender) -> JobResult {
        let started = Instant::now();
        job.url = utils::clean_url(&job.url);
        info!("Job {} starting: {} -> {:?}", job.id, job.url, job.folder);

        if let Err(e) = utils::ensure_dir_exists(&job.folder).await {
            error!("Cannot create {:?}: {}", job.folder, e);
            return self.fail(&job, events, e.to_string(), started);
        }

        job.status = JobStatus::Downloading;
        let mut kickoff = ProgressEvent::for_job(&job, JobStatus::Downloading);
        kickoff.percent = Some(0.0);
        events.emit(kickoff);

        let output_template = job
            .folder
            .join(&self.options.filename_template)
            .to_string_lossy()
            .into_owned();
        let args = ytdlp::build_args(&output_template, &job.url, &self.options);

        let output = match ytdlp::stream_download(&self.ytdlp_cmd, &args, &job, events).await {
            Ok(output) => output,
            Err(e) => {
                error!("Download failed to start for {}: {}", job.url, e);
                return self.fail(&job, events, e.to_string(), started);
            }
        };

        if !output.success {
            log_ytdlp_failure(&job.url, &output);
            if count_audio_files(&job.folder) == 0 {
                let message = match output.exit_code {
                    Some(code) => format!("yt-dlp failed (exit {})", code),
                    None => "yt-dlp terminated by signal".to_string(),
                };
                return self.fail(&job, events, message, started);
            }
            warn!("yt-dlp exited non-zero for {} but audio was produced, continuing", job.url);
        }

        let tracks = count_audio_files(&job.folder);

        job.status = JobStatus::Processing;
        events.emit(step_event(&job, ProcessingStep::Covers));
        let covers = match self.cover_fixer.fix_folder(&job.folder).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Cover pass failed for {:?}: {}", job.folder, e);
                CoverStats::default()
            }
        };

        let lyrics = if self.options.lyrics_enabled {
            events.emit(step_event(&job, ProcessingStep::Lyrics));
            match lyrics::scan_folder(self.lyrics_source.as_ref(), &self.ffprobe_cmd, &job.folder).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!("Lyrics scan failed for {:?}: {}", job.folder, e);
                    Some(LyricsStats::default())
                }
            }
        } else {
            None
        };

        events.emit(step_event(&job, ProcessingStep::Cleanup));
        cleanup_sidecars(&job.folder).await;

        job.status = JobStatus::Done;
        let duration_seconds = started.elapsed().as_secs_f64();
        let mut done = ProgressEvent::for_job(&job, JobStatus::Done);
        done.tracks = Some(tracks);
        events.emit(done);
        info!("Job {} done: {} track(s) in {:.1}s", job.id, tracks, duration_seconds);

        JobResult {
            job_id: job.id,
            folder: job.folder,
            url: job.url,
            success: true,
            tracks,
            covers,
            lyrics,
            error: None,
            duration_seconds,
        }
    }

    fn fail(
        &self,
        job: &DownloadJob,
        events: &ProgressSender,
        error: String,
        started: Instant,
    ) -> JobResult {
        let mut event = ProgressEvent::for_job(job, JobStatus::Failed);
        event.error = Some(error.clone());
        events.emit(event);
        JobResult::failed(job, error, started.elapsed().as_secs_f64())
    }
}

#[async_trait::async_trait]
impl JobRunner for DownloadPipeline {
    async fn run(&self, job: DownloadJob, events: &ProgressSender) -> JobResult {
        self.run_job(job, events).await
    }
}

fn step_event(job: &DownloadJob, step: ProcessingStep) -> ProgressEvent {
    let mut event = ProgressEvent::for_job(job, JobStatus::Processing);
    event.step = Some(step);
    event
}

fn log_ytdlp_failure(url: &str, output: &YtdlpOutput) {
    let tail = output.tail_lower();
    if tail.contains("does not match filter") {
        warn!("Filter mismatch for {}", url);
    } else if tail.contains("video unavailable") || tail.contains("403") {
        warn!("Unavailable/Forbidden for {}", url);
    } else {
        error!(
            "yt-dlp error for {}: {}",
            url,
            output.tail.last().map(String::as_str).unwrap_or("no output")
        );
    }
}

fn count_audio_files(folder: &Path) -> usize {
    let Ok(read_dir) = std::fs::read_dir(folder) else {
        return 0;
    };
    read_dir
        .flatten()
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    ext == "flac" || ext == "mp3"
                })
                .unwrap_or(false)
        })
        .count()
}

/// Best-effort removal of the `*.info.json` sidecars yt-dlp leaves behind.
async fn cleanup_sidecars(folder: &Path) {
    let Ok(read_dir) = std::fs::read_dir(folder) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        let is_sidecar = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(".info.json"))
            .unwrap_or(false);
        if is_sidecar {
            let _ = utils::retry_file_op("info.json removal", || std::fs::remove_file(&path)).await;
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::AudioFormat;
    use crate::errors::Result;
    use crate::progress::progress_channel;
    use std::path::PathBuf;

    struct StubLyrics;

    #[async_trait::async_trait]
    impl LyricsSource for StubLyrics {
        async fn get_exact(&self, _artist: &str, _title: &str, _album: Option<&str>)
            -> Result<Option<String>>
        {
            Ok(Some("[00:01.00] stub".to_string()))
        }

        async fn search(&self, _artist: &str, _title: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn options(lyrics: bool) -> DownloadOptions {
        DownloadOptions {
            format: AudioFormat::Flac,
            music_only: false,
            lyrics_enabled: lyrics,
            filename_template: "%(title)s.%(ext)s".to_string(),
            cookies_file: None,
            cookies_browser: None,
        }
    }

    /// Writes an executable stand-in for yt-dlp that ignores its arguments.
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_run_finishes_done_and_cleans_sidecars() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");
        let body = format!(
            "mkdir -p '{folder}'\n\
             printf '[download] Destination: {folder}/01 Song.flac\\n'\n\
             printf '[download]  40.0%% of ~2.00MiB at 1.00MiB/s ETA 00:02\\n'\n\
             touch '{folder}/01 Song.flac'\n\
             touch '{folder}/01 Song.info.json'",
            folder = folder.display()
        );
        let tool = fake_tool(base.path(), "fake-ytdlp-ok", &body);

        let pipeline = DownloadPipeline::new(options(false))
            .with_ytdlp_path(tool.to_string_lossy().into_owned());
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(folder.clone(), "https://music.youtube.com/watch?v=ok1");

        let result = pipeline.run_job(job, &sender).await;
        assert!(result.success);
        assert_eq!(result.tracks, 1);
        assert!(result.error.is_none());
        assert!(result.lyrics.is_none());
        assert!(!folder.join("01 Song.info.json").exists());

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().status, JobStatus::Downloading);
        assert_eq!(events.first().unwrap().percent, Some(0.0));
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.status, JobStatus::Done | JobStatus::Failed))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, JobStatus::Done);
        assert_eq!(terminal[0].tracks, Some(1));
        let steps: Vec<_> = events.iter().filter_map(|e| e.step).collect();
        assert_eq!(steps, vec![ProcessingStep::Covers, ProcessingStep::Cleanup]);
    }

    #[tokio::test]
    async fn nonzero_exit_without_audio_fails_the_job() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");
        let tool = fake_tool(
            base.path(),
            "fake-ytdlp-err",
            "echo 'ERROR: Video unavailable' >&2\nexit 1",
        );

        let pipeline = DownloadPipeline::new(options(false))
            .with_ytdlp_path(tool.to_string_lossy().into_owned());
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(folder, "https://music.youtube.com/watch?v=gone");

        let result = pipeline.run_job(job, &sender).await;
        assert!(!result.success);
        assert_eq!(result.tracks, 0);
        assert_eq!(result.error.as_deref(), Some("yt-dlp failed (exit 1)"));

        let events = drain(&mut rx);
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.status, JobStatus::Done | JobStatus::Failed))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, JobStatus::Failed);
        assert!(terminal[0].error.as_deref().map_or(false, |e| !e.is_empty()));
    }

    #[tokio::test]
    async fn nonzero_exit_with_audio_counts_as_partial_success() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");
        let body = format!(
            "mkdir -p '{folder}'\ntouch '{folder}/01 Kept.flac'\nexit 1",
            folder = folder.display()
        );
        let tool = fake_tool(base.path(), "fake-ytdlp-partial", &body);

        let pipeline = DownloadPipeline::new(options(false))
            .with_ytdlp_path(tool.to_string_lossy().into_owned());
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(folder, "https://music.youtube.com/watch?v=part");

        let result = pipeline.run_job(job, &sender).await;
        assert!(result.success);
        assert_eq!(result.tracks, 1);

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn missing_tool_returns_failed_result_not_error() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");

        let pipeline = DownloadPipeline::new(options(false))
            .with_ytdlp_path("/nonexistent/fake-ytdlp");
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(folder, "https://music.youtube.com/watch?v=x");

        let result = pipeline.run_job(job, &sender).await;
        assert!(!result.success);
        assert!(result.error.is_some());

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn lyrics_stage_runs_when_enabled() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");
        let body = format!(
            "mkdir -p '{folder}'\ntouch '{folder}/01 Song.flac'",
            folder = folder.display()
        );
        let tool = fake_tool(base.path(), "fake-ytdlp-lyr", &body);

        let pipeline = DownloadPipeline::new(options(true))
            .with_ytdlp_path(tool.to_string_lossy().into_owned())
            .with_lyrics_source(Box::new(StubLyrics));
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(folder.clone(), "https://music.youtube.com/watch?v=lyr");

        let result = pipeline.run_job(job, &sender).await;
        assert!(result.success);
        let lyrics = result.lyrics.unwrap();
        assert_eq!(lyrics.scanned, 1);
        assert_eq!(lyrics.fetched, 1);
        assert!(folder.join("01 Song.lrc").exists());

        let steps: Vec<_> = drain(&mut rx).iter().filter_map(|e| e.step).collect();
        assert_eq!(
            steps,
            vec![ProcessingStep::Covers, ProcessingStep::Lyrics, ProcessingStep::Cleanup]
        );
    }

    #[tokio::test]
    async fn job_url_is_cleaned_before_download() {
        let base = tempfile::tempdir().unwrap();
        let folder = base.path().join("Album");
        let tool = fake_tool(base.path(), "fake-ytdlp-clean", "exit 1");

        let pipeline = DownloadPipeline::new(options(false))
            .with_ytdlp_path(tool.to_string_lossy().into_owned());
        let (sender, _rx) = progress_channel();
        let job = DownloadJob::new(
            folder,
            "https://music.youtube.com/watch?v=abc&si=tracking#frag",
        );

        let result = pipeline.run_job(job, &sender).await;
        assert!(result.url.contains("v=abc"));
        assert!(!result.url.contains("si="));
        assert!(!result.url.contains("#frag"));
    }
}
