//! yt-dlp invocation: the argument contract and the streaming runner that
//! feeds output lines through the progress parser while the process runs.

use std::collections::VecDeque;
use std::process::Stdio;

use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::downloader::{DownloadJob, DownloadOptions, JobStatus};
use crate::errors::{AppError, Result};
use crate::progress::{LineProgress, ProgressEvent, ProgressParser, ProgressSender};

pub const YTDLP_CMD: &str = "yt-dlp";

/// Output lines kept for post-mortem when the process fails.
const OUTPUT_TAIL_LINES: usize = 60;

/// What a finished yt-dlp run left behind.
#[derive(Debug)]
pub struct YtdlpOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub tail: Vec<String>,
}

impl YtdlpOutput {
    pub fn tail_lower(&self) -> String {
        self.tail.join("\n").to_lowercase()
    }
}

/// Assembles the yt-dlp argument list. A cookies file wins over a
/// configured browser source; the URL goes last.
pub fn build_args(output_template: &str, url: &str, options: &DownloadOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-warnings",
        "--ignore-errors",
        "--no-cache-dir",
        "--extract-audio",
        "--write-info-json",
        "--add-metadata",
        "--windows-filenames",
        "--js-runtimes",
        "node",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(cookies_file) = &options.cookies_file {
        args.push("--cookies".to_string());
        args.push(cookies_file.to_string_lossy().into_owned());
    } else if let Some(browser) = &options.cookies_browser {
        args.push("--cookies-from-browser".to_string());
        args.push(browser.clone());
    }

    if options.music_only {
        args.push("--match-filter".to_string());
        args.push("track".to_string());
    }

    args.push("--audio-format".to_string());
    args.push(options.format.extension().to_string());
    args.push("--audio-quality".to_string());
    args.push("0".to_string());

    args.push("--write-thumbnail".to_string());
    args.push("--convert-thumbnails".to_string());
    args.push("jpg".to_string());
    args.push("--ppa".to_string());
    args.push("ThumbnailsConvertor:-q:v 2".to_string());
    args.push("--output".to_string());
    args.push(output_template.to_string());
    args.push(url.to_string());

    args
}

/// Spawns yt-dlp and pumps stdout and stderr line-by-line until both pipes
/// close and the process exits. Progress fragments become `downloading`
/// events; every line lands in a bounded tail for diagnostics. Only the
/// spawn itself can fail here; a non-zero exit is reported in the output.
pub async fn stream_download(
    ytdlp_cmd: &str,
    args: &[String],
    job: &DownloadJob,
    events: &ProgressSender,
) -> Result<YtdlpOutput> {
    let mut child = Command::new(ytdlp_cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Download(format!("failed to start {}: {}", ytdlp_cmd, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Download("yt-dlp stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Download("yt-dlp stderr not captured".to_string()))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    let parser = ProgressParser::new();
    let mut tail: VecDeque<String> = VecDeque::new();

    while !(out_done && err_done) {
        let line: Option<String> = tokio::select! {
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => { out_done = true; None }
                Err(e) => { debug!("yt-dlp stdout read error: {}", e); out_done = true; None }
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => { err_done = true; None }
                Err(e) => { debug!("yt-dlp stderr read error: {}", e); err_done = true; None }
            },
        };

        let Some(line) = line else { continue };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(fragment) = parser.parse_line(line) {
            events.emit(progress_event(job, fragment));
        }

        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    let status = child.wait().await?;
    Ok(YtdlpOutput {
        success: status.success(),
        exit_code: status.code(),
        tail: tail.into_iter().collect(),
    })
}

fn progress_event(job: &DownloadJob, fragment: LineProgress) -> ProgressEvent {
    let mut event = ProgressEvent::for_job(job, JobStatus::Downloading);
    match fragment {
        LineProgress::Progress { percent, size, speed, eta } => {
            event.percent = Some(percent);
            event.size = Some(size);
            event.speed = Some(speed);
            event.eta = Some(eta);
        }
        LineProgress::Percent { percent } => {
            event.percent = Some(percent);
        }
        LineProgress::Destination { path } => {
            event.current_file = Some(path);
        }
    }
    event
}
