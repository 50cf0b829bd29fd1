pub mod lyrics;

use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::errors::Result;

/// Extensions the lyrics scan considers audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "wav", "ogg"];

pub const FFPROBE_CMD: &str = "ffprobe";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackMetadata {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derives a title from the filename, stripping any leading track number
/// (`01 `, `03.`, `12-`). Returns `None` when nothing usable remains.
pub fn title_from_filename(path: &Path) -> Option<String> {
    static TRACK_PREFIX: OnceLock<Regex> = OnceLock::new();
    let re = TRACK_PREFIX
        .get_or_init(|| Regex::new(r"^\d+[\s._-]+").expect("static track number pattern"));
    let stem = path.file_stem()?.to_string_lossy();
    let cleaned = re.replace(&stem, "").trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Reads artist/title/album tags via ffprobe. Tag keys are matched
/// case-insensitively. Any probe problem degrades to the filename
/// fallback for the title; artist and album stay unset.
pub async fn probe_metadata(ffprobe_cmd: &str, path: &Path) -> TrackMetadata {
    let mut meta = match read_tags(ffprobe_cmd, path).await {
        Ok(meta) => meta,
        Err(e) => {
            debug!("ffprobe failed for {:?}: {}", path, e);
            TrackMetadata::default()
        }
    };

    if meta.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        meta.title = title_from_filename(path);
    }
    meta
}

async fn read_tags(ffprobe_cmd: &str, path: &Path) -> Result<TrackMetadata> {
    let output = Command::new(ffprobe_cmd)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        return Ok(TrackMetadata::default());
    }

    let json: Value = serde_json::from_slice(&output.stdout)?;
    let mut meta = TrackMetadata::default();
    if let Some(tags) = json["format"]["tags"].as_object() {
        for (key, value) in tags {
            let Some(value) = value.as_str() else { continue };
            match key.to_ascii_lowercase().as_str() {
                "artist" => meta.artist = Some(value.to_string()),
                "title" => meta.title = Some(value.to_string()),
                "album" => meta.album = Some(value.to_string()),
                _ => {}
            }
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn title_fallback_strips_leading_track_numbers() {
        assert_eq!(
            title_from_filename(Path::new("01 Blinding Lights.flac")).as_deref(),
            Some("Blinding Lights")
        );
        assert_eq!(
            title_from_filename(Path::new("12.Some Song.mp3")).as_deref(),
            Some("Some Song")
        );
        assert_eq!(
            title_from_filename(Path::new("03-Tracked-Name.mp3")).as_deref(),
            Some("Tracked-Name")
        );
    }

    #[test]
    fn title_fallback_keeps_plain_names() {
        assert_eq!(
            title_from_filename(Path::new("Interlude.flac")).as_deref(),
            Some("Interlude")
        );
        // A bare number has no separator to strip.
        assert_eq!(title_from_filename(Path::new("01.mp3")).as_deref(), Some("01"));
    }

    #[test]
    fn audio_extension_check_is_case_insensitive() {
        assert!(is_audio_file(Path::new("a.FLAC")));
        assert!(is_audio_file(Path::new("b.mp3")));
        assert!(!is_audio_file(Path::new("c.jpg")));
        assert!(!is_audio_file(Path::new("noext")));
    }

    #[tokio::test]
    async fn probe_of_missing_file_falls_back_to_filename() {
        let meta = probe_metadata(FFPROBE_CMD, &PathBuf::from("/nonexistent/07 Ghost Town.flac")).await;
        assert_eq!(meta.title.as_deref(), Some("Ghost Town"));
        assert_eq!(meta.artist, None);
        assert_eq!(meta.album, None);
    }
}
