//! User configuration: `$HOME/.cliptransfer/config.properties`.
//!
//! The file is simple `key=value` lines (`#`/`!` comments). Out-of-range or
//! unparseable values fall back to the defaults with a warning — a broken
//! config never prevents startup.
//!
//! `send.interval` must stay strictly greater than `receive.interval` when
//! both ends share a machine, or the receiver's poll loop can miss chunks.
//! That relationship is documented, not enforced.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use tracing::{info, warn};

use crate::utils::atomic_write::atomic_write;

pub const DEFAULT_CHUNK_SIZE: u32 = 512 * 1024;
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_RECEIVE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

pub const CHUNK_SIZE_RANGE: (u32, u32) = (1024, 10 * 1024 * 1024);
pub const SEND_INTERVAL_RANGE: (u64, u64) = (100, 60_000);
pub const RECEIVE_INTERVAL_RANGE: (u64, u64) = (100, 10_000);

/// Resolved engine settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Delay between successive clipboard publishes, in milliseconds.
    pub send_interval: u64,
    /// Receiver poll period, in milliseconds.
    pub receive_interval: u64,
    /// Log filter level (`ERROR`..`TRACE`).
    pub log_level: String,
    /// Where received files are materialized.
    pub download_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_interval: DEFAULT_SEND_INTERVAL_MS,
            receive_interval: DEFAULT_RECEIVE_INTERVAL_MS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            download_path: default_download_path(),
        }
    }
}

fn default_download_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
}

impl Settings {
    /// Load settings from a properties file. A missing file yields the
    /// defaults; individually invalid values fall back per key.
    pub fn load(path: &Path) -> Self {
        let mut settings = Self::default();

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                info!(
                    event = "config_absent",
                    path = %path.display(),
                    "No configuration file, using defaults"
                );
                return settings;
            }
        };

        let properties = parse_properties(&content);
        settings.chunk_size = bounded_value(
            &properties,
            "chunk.size",
            CHUNK_SIZE_RANGE,
            DEFAULT_CHUNK_SIZE,
        );
        settings.send_interval = bounded_value(
            &properties,
            "send.interval",
            SEND_INTERVAL_RANGE,
            DEFAULT_SEND_INTERVAL_MS,
        );
        settings.receive_interval = bounded_value(
            &properties,
            "receive.interval",
            RECEIVE_INTERVAL_RANGE,
            DEFAULT_RECEIVE_INTERVAL_MS,
        );

        if let Some(level) = properties.get("log.level") {
            if level.trim().is_empty() {
                warn!(event = "config_fallback", key = "log.level", "Empty log level, using default");
            } else {
                settings.log_level = level.trim().to_string();
            }
        }

        if let Some(raw) = properties.get("download.path") {
            if raw.trim().is_empty() {
                warn!(event = "config_fallback", key = "download.path", "Empty download path, using default");
            } else {
                let candidate = PathBuf::from(raw.trim());
                settings.download_path = if candidate.is_absolute() {
                    candidate
                } else {
                    // Relative paths live under the home directory.
                    dirs::home_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join(candidate)
                };
            }
        }

        info!(
            event = "config_loaded",
            chunk_size = settings.chunk_size,
            send_interval = settings.send_interval,
            receive_interval = settings.receive_interval,
            "Configuration loaded"
        );
        settings
    }

    /// Write the settings back as a properties file (atomic replace).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = format!(
            "# ClipTransfer configuration\n\
             chunk.size={}\n\
             send.interval={}\n\
             receive.interval={}\n\
             log.level={}\n\
             download.path={}\n",
            self.chunk_size,
            self.send_interval,
            self.receive_interval,
            self.log_level,
            self.download_path.display(),
        );
        atomic_write(path, content.as_bytes())
    }
}

/// Parse `key=value` lines; `#` and `!` start comments.
fn parse_properties(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Read a numeric property, enforcing `[min, max]` with a warning fallback.
fn bounded_value<T>(
    properties: &BTreeMap<String, String>,
    key: &str,
    (min, max): (T, T),
    default: T,
) -> T
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let Some(raw) = properties.get(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value >= min && value <= max => value,
        Ok(value) => {
            warn!(
                event = "config_fallback",
                key,
                value = %value,
                min = %min,
                max = %max,
                "Configured value out of range, using default"
            );
            default
        }
        Err(_) => {
            warn!(
                event = "config_fallback",
                key,
                value = %raw,
                "Unparseable configured value, using default"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cliptransfer_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/config.properties"));
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.send_interval, DEFAULT_SEND_INTERVAL_MS);
        assert_eq!(settings.receive_interval, DEFAULT_RECEIVE_INTERVAL_MS);
        assert_eq!(settings.log_level, "INFO");
    }

    #[test]
    fn test_valid_values_load() {
        let dir = sandbox("config_valid");
        let path = dir.join("config.properties");
        std::fs::write(
            &path,
            "# comment\nchunk.size=4096\nsend.interval=500\nreceive.interval=250\nlog.level=DEBUG\ndownload.path=/tmp/dl\n",
        )
        .unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.chunk_size, 4096);
        assert_eq!(settings.send_interval, 500);
        assert_eq!(settings.receive_interval, 250);
        assert_eq!(settings.log_level, "DEBUG");
        assert_eq!(settings.download_path, PathBuf::from("/tmp/dl"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_values_fall_back_per_key() {
        let dir = sandbox("config_invalid");
        let path = dir.join("config.properties");
        std::fs::write(
            &path,
            "chunk.size=50\nsend.interval=abc\nreceive.interval=999999\nlog.level=WARN\n",
        )
        .unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE); // below 1 KiB
        assert_eq!(settings.send_interval, DEFAULT_SEND_INTERVAL_MS); // unparseable
        assert_eq!(settings.receive_interval, DEFAULT_RECEIVE_INTERVAL_MS); // above 10 s
        assert_eq!(settings.log_level, "WARN"); // still honored

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_relative_download_path_is_home_relative() {
        let dir = sandbox("config_relpath");
        let path = dir.join("config.properties");
        std::fs::write(&path, "download.path=incoming\n").unwrap();

        let settings = Settings::load(&path);
        assert!(settings.download_path.ends_with("incoming"));
        assert!(settings.download_path.is_absolute() || dirs::home_dir().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = sandbox("config_rt");
        let path = dir.join("config.properties");

        let mut settings = Settings::default();
        settings.chunk_size = 2048;
        settings.send_interval = 300;
        settings.receive_interval = 150;
        settings.log_level = "TRACE".to_string();
        settings.download_path = PathBuf::from("/tmp/elsewhere");
        settings.save(&path).unwrap();

        let back = Settings::load(&path);
        assert_eq!(back.chunk_size, 2048);
        assert_eq!(back.send_interval, 300);
        assert_eq!(back.receive_interval, 150);
        assert_eq!(back.log_level, "TRACE");
        assert_eq!(back.download_path, PathBuf::from("/tmp/elsewhere"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
