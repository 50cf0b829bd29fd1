mod config;
mod downloader;
mod errors;
mod metadata;
mod processing;
mod progress;
mod utils;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use tokio::sync::mpsc;

use config::{AppConfig, AudioFormat};
use downloader::pipeline::DownloadPipeline;
use downloader::ytdlp::YTDLP_CMD;
use downloader::{batch, BatchResult, DownloadJob, JobRunner, JobStatus};
use errors::{AppError, Result};
use metadata::lyrics::{self, LrclibClient, LyricsStats};
use metadata::FFPROBE_CMD;
use processing::covers::FFMPEG_CMD;
use processing::CoverFixer;
use progress::{progress_channel, ProcessingStep, ProgressEvent};

#[derive(Parser)]
#[command(name = "ytm-downloader", version)]
#[command(about = "Batch music downloader for YouTube Music with square covers and synced lyrics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download one URL into a folder under the music root
    Download {
        url: String,
        /// Target folder relative to the music root, e.g. "Artist/Album"
        #[arg(long, default_value = "Downloads")]
        folder: String,
        /// Audio format for this run, overriding the configured preference
        #[arg(long)]
        format: Option<AudioFormat>,
    },
    /// Run every job in a manifest file of "folder|url" lines
    Batch {
        /// Manifest path; blank lines and lines starting with '#' are ignored
        file: PathBuf,
        /// Audio format for this run, overriding the configured preference
        #[arg(long)]
        format: Option<AudioFormat>,
    },
    /// Re-run the cover pass over an album folder
    Covers { folder: PathBuf },
    /// Fetch missing lyrics for a folder, or the whole library with --all
    Lyrics {
        /// Album folder to scan (absolute, or relative to the music root)
        #[arg(required_unless_present = "all")]
        folder: Option<PathBuf>,
        /// Scan every folder under the music root instead
        #[arg(long, conflicts_with = "folder")]
        all: bool,
    },
    /// Delete leftover .info.json files under the music root
    Cleanup,
    /// Check that the external tools and cookies this program needs are present
    Doctor,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration ({}), using defaults", e);
            AppConfig::default()
        }
    };

    let outcome = match cli.command {
        Command::Download { url, folder, format } => {
            cmd_download(&config, &url, &folder, format).await
        }
        Command::Batch { file, format } => cmd_batch(&config, &file, format).await,
        Command::Covers { folder } => cmd_covers(&config, &folder).await,
        Command::Lyrics { folder, all } => cmd_lyrics(&config, folder.as_deref(), all).await,
        Command::Cleanup => cmd_cleanup(&config).await,
        Command::Doctor => cmd_doctor(&config).await,
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn cmd_download(
    config: &AppConfig,
    url: &str,
    folder: &str,
    format: Option<AudioFormat>,
) -> Result<i32> {
    let root = config.download_root()?;
    let job = DownloadJob::new(root.join(folder), url);
    let batch = run_jobs(config, format, vec![job]).await;
    print_summary(&batch, &root);
    Ok(if batch.failed == 0 { 0 } else { 1 })
}

async fn cmd_batch(config: &AppConfig, file: &Path, format: Option<AudioFormat>) -> Result<i32> {
    let root = config.download_root()?;
    let manifest = tokio::fs::read_to_string(file).await?;
    let jobs = parse_manifest(&manifest, &root)?;
    if jobs.is_empty() {
        warn!("Manifest {:?} contains no jobs", file);
        return Ok(0);
    }

    let batch = run_jobs(config, format, jobs).await;
    print_summary(&batch, &root);
    Ok(if batch.failed == 0 { 0 } else { 1 })
}

async fn cmd_covers(config: &AppConfig, folder: &Path) -> Result<i32> {
    let target = resolve_folder(config, folder)?;
    info!("Cover pass over {:?}", target);
    let stats = CoverFixer::new().fix_folder(&target).await?;
    println!(
        "Covers: {} file(s) processed, {} embedded, {} without usable art",
        stats.processed, stats.succeeded, stats.failed
    );
    Ok(0)
}

async fn cmd_lyrics(config: &AppConfig, folder: Option<&Path>, all: bool) -> Result<i32> {
    let client = LrclibClient::new();

    let totals = if all {
        let root = config.download_root()?;
        let folders = audio_folders(&root);
        if folders.is_empty() {
            warn!("No folders with audio files under {:?}", root);
            return Ok(0);
        }
        info!("Scanning {} folder(s) for missing lyrics", folders.len());
        let mut totals = LyricsStats::default();
        for folder in folders {
            let stats = lyrics::scan_folder(&client, FFPROBE_CMD, &folder).await?;
            totals.scanned += stats.scanned;
            totals.fetched += stats.fetched;
            totals.skipped += stats.skipped;
            totals.failed += stats.failed;
        }
        totals
    } else {
        let folder = folder.ok_or_else(|| {
            AppError::InvalidInput("a folder is required unless --all is given".to_string())
        })?;
        let target = resolve_folder(config, folder)?;
        lyrics::scan_folder(&client, FFPROBE_CMD, &target).await?
    };

    println!(
        "Lyrics: {} track(s) scanned, {} fetched, {} already had lyrics, {} without a match",
        totals.scanned, totals.fetched, totals.skipped, totals.failed
    );
    Ok(0)
}

async fn cmd_cleanup(config: &AppConfig) -> Result<i32> {
    let root = config.download_root()?;
    info!("Scanning {:?} for leftover .info.json files", root);
    let result = utils::cleanup_junk(&root).await;
    println!(
        "Cleanup: removed {} file(s), {:.2} MB freed",
        result.files_removed,
        result.bytes_freed as f64 / (1024.0 * 1024.0)
    );
    Ok(0)
}

async fn cmd_doctor(config: &AppConfig) -> Result<i32> {
    println!("Music root: {}", config.download_root()?.display());

    let checks = [
        ("yt-dlp", YTDLP_CMD, "--version", true),
        ("ffmpeg", FFMPEG_CMD, "-version", true),
        ("ffprobe", FFPROBE_CMD, "-version", true),
        ("node", "node", "--version", false),
    ];

    let mut missing_required = false;
    for (label, cmd, flag, required) in checks {
        match tool_version(cmd, flag).await {
            Some(version) => println!("  {:<8} ok ({})", label, version),
            None if required => {
                println!("  {:<8} MISSING (required)", label);
                missing_required = true;
            }
            None => println!("  {:<8} missing (some YouTube streams need it)", label),
        }
    }

    match config.find_cookies_file() {
        Some(path) => println!("  cookies  ok ({})", path.display()),
        None => match &config.cookies_from_browser {
            Some(browser) => println!("  cookies  from browser '{}'", browser),
            None => println!("  cookies  none (age-restricted content may fail)"),
        },
    }

    Ok(if missing_required { 1 } else { 0 })
}

/// Schedules jobs with the configured pipeline and renders progress until
/// every worker is finished.
async fn run_jobs(
    config: &AppConfig,
    format: Option<AudioFormat>,
    jobs: Vec<DownloadJob>,
) -> BatchResult {
    let mut download_options = config.download_options();
    if let Some(format) = format {
        download_options.format = format;
    }
    let runner: Arc<dyn JobRunner> = Arc::new(DownloadPipeline::new(download_options));
    let options = config.batch_options();
    let (events, rx) = progress_channel();
    let ui = spawn_progress_ui(rx);

    let batch = batch::run_batch(runner, jobs, &options, &events).await;

    // Closing the last sender ends the render task.
    drop(events);
    let _ = ui.await;
    batch
}

/// Renders progress events as one bar per job until the channel closes.
fn spawn_progress_ui(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mp = MultiProgress::new();
        let style = ProgressStyle::with_template(
            "{prefix:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}",
        )
        .expect("static progress template")
        .progress_chars("=> ");

        let mut bars: HashMap<String, ProgressBar> = HashMap::new();

        while let Some(event) = rx.recv().await {
            let bar = bars.entry(event.job_id.clone()).or_insert_with(|| {
                let bar = mp.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(display_folder_name(&event.folder));
                bar
            });

            match event.status {
                JobStatus::Queued => bar.set_message("queued"),
                JobStatus::Downloading => {
                    if let Some(percent) = event.percent {
                        bar.set_position(percent.round() as u64);
                    }
                    if let Some(file) = event.current_file {
                        let name = Path::new(&file)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned());
                        bar.set_message(name.unwrap_or(file));
                    } else if let (Some(size), Some(speed), Some(eta)) =
                        (event.size, event.speed, event.eta)
                    {
                        bar.set_message(format!("{} at {} ETA {}", size, speed, eta));
                    }
                }
                JobStatus::Processing => {
                    bar.set_position(100);
                    bar.set_message(match event.step {
                        Some(ProcessingStep::Covers) => "embedding covers",
                        Some(ProcessingStep::Lyrics) => "fetching lyrics",
                        Some(ProcessingStep::Cleanup) => "cleaning up",
                        None => "processing",
                    });
                }
                JobStatus::Done => {
                    bar.finish_with_message(format!(
                        "done, {} track(s)",
                        event.tracks.unwrap_or(0)
                    ));
                }
                JobStatus::Failed => {
                    bar.abandon_with_message(format!(
                        "FAILED: {}",
                        event.error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                }
            }
        }
    })
}

fn print_summary(batch: &BatchResult, root: &Path) {
    println!();
    println!(
        "Finished: {}/{} succeeded in {:.1}s",
        batch.success, batch.total, batch.duration_seconds
    );
    for result in &batch.results {
        let folder = result.folder.strip_prefix(root).unwrap_or(&result.folder);
        if result.success {
            let lyrics = result
                .lyrics
                .map(|l| format!(", lyrics {}/{}", l.fetched, l.scanned))
                .unwrap_or_default();
            println!(
                "  ok      {} ({} track(s), covers {}/{}{})",
                folder.display(),
                result.tracks,
                result.covers.succeeded,
                result.covers.processed,
                lyrics
            );
        } else {
            println!(
                "  failed  {} ({})",
                folder.display(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

/// Parses "folder|url" manifest lines. Blank lines and '#' comments are
/// skipped; folders resolve relative to the music root (absolute paths
/// pass through as-is).
fn parse_manifest(content: &str, root: &Path) -> Result<Vec<DownloadJob>> {
    let mut jobs = Vec::new();
    for (number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((folder, url)) = line.split_once('|') else {
            return Err(AppError::InvalidInput(format!(
                "manifest line {} has no '|' separator: {}",
                number + 1,
                line
            )));
        };
        let folder = folder.trim();
        let url = url.trim();
        if folder.is_empty() || url.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "manifest line {} is missing a folder or url",
                number + 1
            )));
        }
        jobs.push(DownloadJob::new(root.join(folder), url));
    }
    Ok(jobs)
}

/// Accepts a path as given, or a name relative to the music root.
fn resolve_folder(config: &AppConfig, folder: &Path) -> Result<PathBuf> {
    if folder.exists() {
        return Ok(folder.to_path_buf());
    }
    let under_root = config.download_root()?.join(folder);
    if under_root.exists() {
        return Ok(under_root);
    }
    Err(AppError::InvalidInput(format!(
        "folder {:?} not found (also tried under the music root)",
        folder
    )))
}

/// Folders that directly contain audio files, recursively under `root`.
fn audio_folders(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut has_audio = false;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if metadata::is_audio_file(&path) {
                has_audio = true;
            }
        }
        if has_audio {
            found.push(dir);
        }
    }
    found.sort();
    found
}

fn display_folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string())
}

/// First line of `<cmd> <flag>` output, if the tool runs at all.
async fn tool_version(cmd: &str, flag: &str) -> Option<String> {
    let output = tokio::process::Command::new(cmd)
        .arg(flag)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or("").trim().to_string();
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}
