//! Synced lyrics fetching from LRCLIB.
//!
//! Resolution tries artist and title variants in order (full string first,
//! then the primary artist / cleaned title) against the exact lookup
//! endpoint, falling back to search. The first usable hit is written as a
//! `.lrc` sidecar next to the audio file.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::metadata::{is_audio_file, probe_metadata};

pub const LRCLIB_BASE: &str = "https://lrclib.net/api";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Collaboration markers that separate the primary artist from guests.
/// Order matters: the first one found decides the split.
const ARTIST_SEPARATORS: &[&str] = &[
    " feat.", " ft.", " feat ", " ft ", " & ", " / ", ", ", " x ",
];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LyricsStats {
    pub scanned: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Lookup backend for lyrics. The scan and resolution logic only sees this
/// trait; `LrclibClient` is the production implementation.
#[async_trait::async_trait]
pub trait LyricsSource: Send + Sync {
    /// Exact match lookup. `Ok(None)` means "not found", errors are
    /// transport problems.
    async fn get_exact(&self, artist: &str, title: &str, album: Option<&str>)
        -> Result<Option<String>>;

    /// Fuzzy search; returns the first result carrying lyrics.
    async fn search(&self, artist: &str, title: &str) -> Result<Option<String>>;
}

pub struct LrclibClient {
    client: Client,
    base_url: String,
}

impl LrclibClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: LRCLIB_BASE.to_string(),
        }
    }
}

impl Default for LrclibClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LyricsSource for LrclibClient {
    async fn get_exact(&self, artist: &str, title: &str, album: Option<&str>)
        -> Result<Option<String>>
    {
        let mut params = vec![("artist_name", artist), ("track_name", title)];
        if let Some(album) = album.filter(|a| !a.is_empty()) {
            params.push(("album_name", album));
        }

        let response = self.client
            .get(format!("{}/get", self.base_url))
            .query(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let track: Value = response.json().await?;
        Ok(usable_lyrics(&track))
    }

    async fn search(&self, artist: &str, title: &str) -> Result<Option<String>> {
        let response = self.client
            .get(format!("{}/search", self.base_url))
            .query(&[("artist_name", artist), ("track_name", title)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let results: Value = response.json().await?;
        if let Some(tracks) = results.as_array() {
            for track in tracks {
                if let Some(lyrics) = usable_lyrics(track) {
                    return Ok(Some(lyrics));
                }
            }
        }
        Ok(None)
    }
}

/// Synced lyrics win over plain ones.
fn usable_lyrics(track: &Value) -> Option<String> {
    for field in ["syncedLyrics", "plainLyrics"] {
        if let Some(lyrics) = track[field].as_str() {
            if !lyrics.trim().is_empty() {
                return Some(lyrics.to_string());
            }
        }
    }
    None
}

/// Variants to try for an artist tag: the raw string, then one candidate
/// per matching separator (everything before its first occurrence),
/// skipping duplicates. A tag like "Artist feat. Guest & Other" thus also
/// falls back to "Artist feat. Guest", not just "Artist".
pub fn artist_candidates(raw: &str) -> Vec<String> {
    let mut candidates = vec![raw.to_string()];
    let lowered = raw.to_ascii_lowercase();
    for sep in ARTIST_SEPARATORS {
        if let Some(idx) = lowered.find(sep) {
            let main = raw[..idx].trim();
            if !main.is_empty() && !candidates.iter().any(|c| c.eq_ignore_ascii_case(main)) {
                candidates.push(main.to_string());
            }
        }
    }
    candidates
}

/// Strips bracketed qualifier suffixes like "(Official Music Video)" or
/// "[Official Audio]" from a title.
pub fn clean_title(title: &str) -> String {
    static QUALIFIER: OnceLock<Regex> = OnceLock::new();
    let re = QUALIFIER.get_or_init(|| {
        Regex::new(r"(?i)\s*[\(\[](official.*?|music.*?|lyric.*?|audio.*?)[\)\]]")
            .expect("static title pattern")
    });
    re.replace_all(title, "").trim().to_string()
}

fn title_variants(title: &str) -> Vec<String> {
    let cleaned = clean_title(title);
    if cleaned != title && !cleaned.is_empty() {
        vec![title.to_string(), cleaned]
    } else {
        vec![title.to_string()]
    }
}

/// Resolves lyrics for one track and writes them to `save_path`. Transport
/// errors on individual attempts count as misses; only the sidecar write
/// can fail hard.
pub async fn fetch_lrc(
    source: &dyn LyricsSource,
    artist: &str,
    title: &str,
    album: Option<&str>,
    save_path: &Path,
) -> Result<bool> {
    for artist_name in artist_candidates(artist) {
        for title_name in title_variants(title) {
            match source.get_exact(&artist_name, &title_name, album).await {
                Ok(Some(lyrics)) => {
                    tokio::fs::write(save_path, &lyrics).await?;
                    info!("Lyrics saved: {:?}", save_path.file_name().unwrap_or_default());
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) => debug!("lrclib get failed for {} - {}: {}", artist_name, title_name, e),
            }

            match source.search(&artist_name, &title_name).await {
                Ok(Some(lyrics)) => {
                    tokio::fs::write(save_path, &lyrics).await?;
                    info!("Lyrics saved (search): {:?}", save_path.file_name().unwrap_or_default());
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) => debug!("lrclib search failed for {} - {}: {}", artist_name, title_name, e),
            }
        }
    }

    debug!("No lyrics found for {} - {}", artist, title);
    Ok(false)
}

/// Fetches lyrics for every audio file in `folder` that does not already
/// have a `.lrc` sidecar.
pub async fn scan_folder(
    source: &dyn LyricsSource,
    ffprobe_cmd: &str,
    folder: &Path,
) -> Result<LyricsStats> {
    let mut stats = LyricsStats::default();

    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();

    for path in entries.into_iter().filter(|p| is_audio_file(p)) {
        stats.scanned += 1;

        let lrc_path = path.with_extension("lrc");
        if lrc_path.exists() {
            debug!("Lyrics already present for {:?}", path.file_name().unwrap_or_default());
            stats.skipped += 1;
            continue;
        }

        let meta = probe_metadata(ffprobe_cmd, &path).await;
        let Some(title) = meta.title.filter(|t| !t.is_empty()) else {
            warn!("No usable title for {:?}", path);
            stats.failed += 1;
            continue;
        };
        let artist = meta.artist.unwrap_or_default();

        match fetch_lrc(source, &artist, &title, meta.album.as_deref(), &lrc_path).await {
            Ok(true) => stats.fetched += 1,
            Ok(false) => stats.failed += 1,
            Err(e) => {
                warn!("Lyrics fetch failed for {:?}: {}", path, e);
                stats.failed += 1;
            }
        }
    }

    info!(
        "Lyrics scan of {:?}: {} scanned, {} fetched, {} skipped, {} failed",
        folder, stats.scanned, stats.fetched, stats.skipped, stats.failed
    );
    Ok(stats)
}
