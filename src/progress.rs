//! Progress event model and the parser for yt-dlp's stdout progress lines.
//!
//! Workers publish `ProgressEvent` snapshots over an unbounded channel;
//! whoever holds the receiver (CLI renderer, websocket bridge) coalesces
//! them by `job_id`. Emitting is fire-and-forget: a dropped receiver never
//! blocks or fails a job.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::downloader::{DownloadJob, JobStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStep {
    Covers,
    Lyrics,
    Cleanup,
}

/// Snapshot of one job's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub folder: PathBuf,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<ProcessingStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracks: Option<usize>,
}

impl ProgressEvent {
    /// Identity fields from the job, everything else unset.
    pub fn for_job(job: &DownloadJob, status: JobStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            status,
            folder: job.folder.clone(),
            url: job.url.clone(),
            step: None,
            percent: None,
            size: None,
            speed: None,
            eta: None,
            current_file: None,
            error: None,
            tracks: None,
        }
    }
}

/// Sending half of the progress channel handed to workers.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

pub fn progress_channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, rx)
}

impl ProgressSender {
    /// Publishes a snapshot. Send errors mean nobody is listening anymore,
    /// which is not the worker's problem.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fragment extracted from a single yt-dlp output line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineProgress {
    /// Full progress line: percent, total size, speed and ETA.
    Progress {
        percent: f32,
        size: String,
        speed: String,
        eta: String,
    },
    /// Degenerate progress line carrying only a percentage.
    Percent { percent: f32 },
    /// Destination announcement naming the file being written.
    Destination { path: String },
}

/// Parser for the `[download]` lines yt-dlp writes to stdout. The three
/// patterns are mutually exclusive and tried in priority order; any other
/// line yields `None`.
pub struct ProgressParser {
    full: Regex,
    percent_only: Regex,
    destination: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            full: Regex::new(r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)")
                .expect("static progress pattern"),
            percent_only: Regex::new(r"\[download\]\s+(\d+\.?\d*)%")
                .expect("static progress pattern"),
            destination: Regex::new(r"\[download\]\s+Destination:\s+(.+)")
                .expect("static progress pattern"),
        }
    }

    pub fn parse_line(&self, line: &str) -> Option<LineProgress> {
        if let Some(caps) = self.full.captures(line) {
            return Some(LineProgress::Progress {
                percent: caps[1].parse().ok()?,
                size: caps[2].to_string(),
                speed: caps[3].to_string(),
                eta: caps[4].to_string(),
            });
        }

        if let Some(caps) = self.percent_only.captures(line) {
            return Some(LineProgress::Percent {
                percent: caps[1].parse().ok()?,
            });
        }

        if let Some(caps) = self.destination.captures(line) {
            return Some(LineProgress::Destination {
                path: caps[1].trim().to_string(),
            });
        }

        None
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parser() -> ProgressParser {
        ProgressParser::new()
    }

    #[test]
    fn parses_full_progress_line() {
        let line = "[download]  45.0% of ~3.45MiB at 2.00MiB/s ETA 00:01";
        let parsed = parser().parse_line(line).unwrap();
        assert_eq!(
            parsed,
            LineProgress::Progress {
                percent: 45.0,
                size: "3.45MiB".to_string(),
                speed: "2.00MiB/s".to_string(),
                eta: "00:01".to_string(),
            }
        );
    }

    #[test]
    fn parses_full_line_without_size_tilde() {
        let line = "[download] 100.0% of 10.55MiB at 5.20MiB/s ETA 00:00";
        match parser().parse_line(line).unwrap() {
            LineProgress::Progress { percent, size, .. } => {
                assert_eq!(percent, 100.0);
                assert_eq!(size, "10.55MiB");
            }
            other => panic!("expected full progress, got {:?}", other),
        }
    }

    #[test]
    fn parses_percent_only_line() {
        let parsed = parser().parse_line("[download]  12.5%").unwrap();
        assert_eq!(parsed, LineProgress::Percent { percent: 12.5 });
    }

    #[test]
    fn parses_destination_line() {
        let line = "[download] Destination: /music/Album/01 Track.flac";
        let parsed = parser().parse_line(line).unwrap();
        assert_eq!(
            parsed,
            LineProgress::Destination {
                path: "/music/Album/01 Track.flac".to_string(),
            }
        );
    }

    #[test]
    fn ignores_unrelated_lines() {
        let parser = parser();
        assert_eq!(parser.parse_line("[youtube] abc123: Downloading webpage"), None);
        assert_eq!(parser.parse_line("[ExtractAudio] Destination: x.flac"), None);
        assert_eq!(parser.parse_line(""), None);
        assert_eq!(parser.parse_line("Deleting original file foo.webm"), None);
    }

    #[test]
    fn event_serialization_skips_unset_fields() {
        let job = DownloadJob::new(PathBuf::from("/music/A"), "https://example.com");
        let event = ProgressEvent::for_job(&job, JobStatus::Downloading);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"downloading\""));
        assert!(!json.contains("percent"));
        assert!(!json.contains("error"));
    }

    #[tokio::test]
    async fn channel_delivers_events_and_tolerates_closed_receiver() {
        let (sender, mut rx) = progress_channel();
        let job = DownloadJob::new(PathBuf::from("/music/A"), "https://example.com");
        sender.emit(ProgressEvent::for_job(&job, JobStatus::Queued));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id, job.id);

        drop(rx);
        // Must not panic or error once the receiver is gone.
        sender.emit(ProgressEvent::for_job(&job, JobStatus::Done));
    }
}
