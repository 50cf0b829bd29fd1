use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use log::warn;

use crate::downloader::{BatchOptions, DownloadOptions};
use crate::errors::{AppError, Result};

const APP_DIR_NAME: &str = "ytm-downloader";
const COOKIES_FILE_NAME: &str = "cookies.txt";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub music_folder: PathBuf,
    pub preferred_format: AudioFormat,
    pub music_only: bool,
    pub lyrics_enabled: bool,
    pub cookies_from_browser: Option<String>,
    pub max_workers: usize,
    pub parallel_downloads: bool,
    pub filename_template: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Flac,
    Mp3,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::Flac
    }
}

impl FromStr for AudioFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flac" => Ok(AudioFormat::Flac),
            "mp3" => Ok(AudioFormat::Mp3),
            other => Err(AppError::InvalidInput(format!(
                "unknown audio format '{}' (expected flac or mp3)",
                other
            ))),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let music_base = dirs::audio_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join("Music")))
            .unwrap_or_else(|| PathBuf::from("./music"));

        Self {
            music_folder: music_base.join(APP_DIR_NAME),
            preferred_format: AudioFormat::Flac,
            music_only: false,
            lyrics_enabled: true,
            cookies_from_browser: None,
            max_workers: 2,
            parallel_downloads: true,
            filename_template: "%(playlist_index|00|)s %(title)s.%(ext)s".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            match serde_json::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("Config file at {:?} is unreadable ({}), using defaults", config_path, e);
                    Ok(AppConfig::default())
                }
            }
        } else {
            let config = AppConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join(APP_DIR_NAME).join("config.json"))
    }

    /// Returns the music root, creating it on first use.
    pub fn download_root(&self) -> Result<PathBuf> {
        if !self.music_folder.exists() {
            std::fs::create_dir_all(&self.music_folder)?;
        }
        Ok(self.music_folder.clone())
    }

    /// Looks for an exported cookies.txt next to the config file, then in
    /// the working directory. A cookies file takes precedence over any
    /// configured browser cookie source.
    pub fn find_cookies_file(&self) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join(APP_DIR_NAME).join(COOKIES_FILE_NAME));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(COOKIES_FILE_NAME));
        }
        candidates.into_iter().find(|path| path.is_file())
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            format: self.preferred_format,
            music_only: self.music_only,
            lyrics_enabled: self.lyrics_enabled,
            filename_template: self.filename_template.clone(),
            cookies_file: self.find_cookies_file(),
            cookies_browser: self.cookies_from_browser.clone(),
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_workers: self.max_workers,
            parallel: self.parallel_downloads,
            ..BatchOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.max_workers, 2);
        assert!(back.parallel_downloads);
        assert!(back.lyrics_enabled);
        assert_eq!(back.preferred_format, AudioFormat::Flac);
    }

    #[test]
    fn audio_format_parses_case_insensitively() {
        assert_eq!("FLAC".parse::<AudioFormat>().unwrap(), AudioFormat::Flac);
        assert_eq!("mp3".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert!("ogg".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn format_extension_matches_variant() {
        assert_eq!(AudioFormat::Flac.extension(), "flac");
        assert_eq!(AudioFormat::Mp3.extension(), "mp3");
    }
}
