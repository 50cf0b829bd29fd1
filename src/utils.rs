use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use url::Url;

use crate::errors::Result;

/// Attempts for file operations that can hit a transient lock.
pub const FILE_OP_RETRIES: u32 = 3;
/// Delay between retry attempts.
pub const FILE_OP_DELAY: Duration = Duration::from_millis(500);

/// Retries a filesystem operation that may fail while another process
/// still holds the file (thumbnail writers, antivirus scanners). Gives up
/// after `FILE_OP_RETRIES` attempts and returns the last error.
pub async fn retry_file_op<T, F>(what: &str, mut op: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < FILE_OP_RETRIES => {
                debug!("{} failed (attempt {}/{}): {}", what, attempt, FILE_OP_RETRIES, e);
                attempt += 1;
                tokio::time::sleep(FILE_OP_DELAY).await;
            }
            Err(e) => {
                warn!("{} failed after {} attempts: {}", what, FILE_OP_RETRIES, e);
                return Err(e);
            }
        }
    }
}

/// Strips tracking parameters from a URL while preserving the video id,
/// playlist id and track index (`v`, `list`, `index`). The fragment and all
/// other parameters are dropped. Input that does not parse as a URL is
/// returned trimmed.
pub fn clean_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_string(),
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| matches!(key.as_ref(), "v" | "list" | "index"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    parsed.set_fragment(None);
    parsed.set_query(None);
    if !kept.is_empty() {
        let mut pairs = parsed.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
    }

    parsed.to_string()
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a short unique job id (8 hex chars).
pub fn generate_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Outcome of a junk sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupResult {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

/// Recursively removes the `*.info.json` sidecars yt-dlp leaves behind
/// anywhere under `root`. Files that refuse to go are logged and skipped.
pub async fn cleanup_junk(root: &Path) -> CleanupResult {
    let mut result = CleanupResult::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!("Cannot read {:?}: {}", dir, e);
                continue;
            }
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let is_junk = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".info.json"))
                .unwrap_or(false);
            if !is_junk {
                continue;
            }
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match retry_file_op("junk removal", || std::fs::remove_file(&path)).await {
                Ok(()) => {
                    result.files_removed += 1;
                    result.bytes_freed += size;
                }
                Err(e) => warn!("Could not delete {:?}: {}", path, e),
            }
        }
    }

    info!(
        "Removed {} junk file(s), {} byte(s) freed",
        result.files_removed, result.bytes_freed
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn clean_url_keeps_video_and_playlist_params() {
        let url = "https://music.youtube.com/watch?v=abc123&list=PL99&si=tracker&feature=share";
        let cleaned = clean_url(url);
        assert!(cleaned.contains("v=abc123"));
        assert!(cleaned.contains("list=PL99"));
        assert!(!cleaned.contains("si="));
        assert!(!cleaned.contains("feature="));
    }

    #[test]
    fn clean_url_keeps_index_and_drops_fragment() {
        let cleaned = clean_url("https://www.youtube.com/watch?v=x&index=4&t=33s#top");
        assert!(cleaned.contains("index=4"));
        assert!(!cleaned.contains("t=33s"));
        assert!(!cleaned.contains('#'));
    }

    #[test]
    fn clean_url_strips_query_without_essential_params() {
        let cleaned = clean_url("https://music.youtube.com/playlist?si=xyz");
        assert!(!cleaned.contains('?'));
    }

    #[test]
    fn clean_url_passes_through_unparseable_input() {
        assert_eq!(clean_url("  not a url  "), "not a url");
    }

    #[test]
    fn job_ids_are_short_and_unique() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn retry_file_op_recovers_from_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_file_op("test op", || {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_file_op_gives_up_after_bounded_attempts() {
        let attempts = AtomicU32::new(0);
        let result: std::io::Result<()> = retry_file_op("test op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), FILE_OP_RETRIES);
    }

    #[tokio::test]
    async fn cleanup_junk_sweeps_nested_sidecars_only() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("Artist").join("Album");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("01 Song.info.json"), b"{\"id\":1}").unwrap();
        std::fs::write(nested.join("01 Song.flac"), b"audio").unwrap();
        std::fs::write(base.path().join("top.info.json"), b"{}").unwrap();

        let result = cleanup_junk(base.path()).await;
        assert_eq!(result.files_removed, 2);
        assert!(result.bytes_freed > 0);
        assert!(nested.join("01 Song.flac").exists());
        assert!(!nested.join("01 Song.info.json").exists());
        assert!(!base.path().join("top.info.json").exists());
    }

    #[tokio::test]
    async fn cleanup_junk_on_missing_root_removes_nothing() {
        let base = tempfile::tempdir().unwrap();
        let missing = base.path().join("nope");
        let result = cleanup_junk(&missing).await;
        assert_eq!(result.files_removed, 0);
        assert_eq!(result.bytes_freed, 0);
    }
}
