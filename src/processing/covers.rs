//! Cover art pipeline: thumbnail discovery, center-crop to a 500x500
//! JPEG, embed as attached picture. Thumbnails are consumed on the way,
//! successful or not, so a folder pass is idempotent.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::{AppError, Result};
use crate::utils::retry_file_op;

pub const FFMPEG_CMD: &str = "ffmpeg";

/// Center-crop to square on the shorter side, then scale. No letterboxing.
const SQUARE_FILTER: &str = "crop='min(iw,ih):(min(iw,ih))',scale=500:500";

/// Same-stem thumbnail extensions, best first.
const THUMB_EXTENSIONS: &[&str] = &["jpg", "webp", "png"];

/// Folder-level artwork names, best first.
const FALLBACK_NAMES: &[&str] = &["folder.jpg", "cover.jpg", "front.jpg", "album.jpg"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoverStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct CoverFixer {
    ffmpeg_cmd: String,
}

impl CoverFixer {
    pub fn new() -> Self {
        Self {
            ffmpeg_cmd: FFMPEG_CMD.to_string(),
        }
    }

    /// Runs the cover pass over every `.flac` and `.mp3` in `folder`.
    /// Per-file problems are counted, never raised.
    pub async fn fix_folder(&self, folder: &Path) -> Result<CoverStats> {
        let mut stats = CoverStats::default();

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(folder).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        for target_ext in ["flac", "mp3"] {
            for path in entries.iter().filter(|p| has_extension(p, target_ext)) {
                stats.processed += 1;
                if self.fix_file(path).await {
                    stats.succeeded += 1;
                } else {
                    stats.failed += 1;
                }
            }
        }

        info!(
            "Cover pass on {:?}: {} processed, {} succeeded, {} failed",
            folder, stats.processed, stats.succeeded, stats.failed
        );
        Ok(stats)
    }

    /// Embeds artwork into one audio file. Returns whether a cover ended up
    /// embedded. Work files and loose thumbnails are cleaned up in every
    /// outcome.
    pub async fn fix_file(&self, path: &Path) -> bool {
        let folder = path.parent().unwrap_or_else(|| Path::new("."));
        let Some(thumb) = find_thumbnail(path).or_else(|| find_folder_cover(folder)) else {
            return false;
        };

        let cover500 = path.with_extension("cover500.jpg");
        let mut ok = match self.normalize_and_embed(path, &thumb, &cover500).await {
            Ok(()) => {
                info!("Embedded 500x500 cover -> {:?}", path.file_name().unwrap_or_default());
                true
            }
            Err(e) => {
                error!("Cover embed failed for {:?}: {}", path.file_name().unwrap_or_default(), e);
                false
            }
        };

        if cover500.exists() {
            if let Err(e) = retry_file_op("cover work file removal", || std::fs::remove_file(&cover500)).await {
                warn!("Could not remove work file {:?}: {}", cover500, e);
                ok = false;
            }
        }
        for ext in THUMB_EXTENSIONS {
            let loose = path.with_extension(ext);
            if loose.exists() {
                // Thumbnails are disposable; a stuck one is not a failure.
                let _ = retry_file_op("thumbnail removal", || std::fs::remove_file(&loose)).await;
            }
        }

        ok
    }

    async fn normalize_and_embed(&self, audio: &Path, thumb: &Path, cover500: &Path) -> Result<()> {
        self.make_square(thumb, cover500).await?;
        self.embed_cover(audio, cover500).await
    }

    /// Center-crop + scale into a fresh JPEG work file.
    async fn make_square(&self, input: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg_cmd);
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-vf", SQUARE_FILTER, "-q:v", "1"])
            .arg(output);
        self.run_ffmpeg(cmd).await
    }

    /// Re-mux with the audio stream copied and the cover attached, writing
    /// to a temp path that atomically replaces the original.
    async fn embed_cover(&self, audio: &Path, cover: &Path) -> Result<()> {
        let ext = audio
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "flac".to_string());
        let mut tmp_name = audio.as_os_str().to_os_string();
        tmp_name.push(format!(".tmp.{}", ext));
        let tmp = PathBuf::from(tmp_name);

        let mut cmd = Command::new(&self.ffmpeg_cmd);
        cmd.arg("-y")
            .arg("-i")
            .arg(audio)
            .arg("-i")
            .arg(cover)
            .args(["-map", "0:a", "-map", "1:v", "-c:a", "copy", "-c:v", "mjpeg"]);
        if ext == "mp3" {
            cmd.args(["-id3v2_version", "3"]);
        }
        cmd.args(["-disposition:v:0", "attached_pic"]).arg(&tmp);

        self.run_ffmpeg(cmd).await?;
        retry_file_op("cover replace", || std::fs::rename(&tmp, audio)).await?;
        Ok(())
    }

    async fn run_ffmpeg(&self, mut cmd: Command) -> Result<()> {
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no output");
            return Err(AppError::Processing(format!(
                "ffmpeg exited with {}: {}",
                output.status, reason
            )));
        }
        Ok(())
    }
}

impl Default for CoverFixer {
    fn default() -> Self {
        Self::new()
    }
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

fn find_thumbnail(audio: &Path) -> Option<PathBuf> {
    THUMB_EXTENSIONS
        .iter()
        .map(|ext| audio.with_extension(ext))
        .find(|p| p.exists())
}

fn find_folder_cover(folder: &Path) -> Option<PathBuf> {
    FALLBACK_NAMES
        .iter()
        .map(|name| folder.join(name))
        .find(|p| p.exists())
}
