//! Stream settings - per-protocol options and dial configuration
//!
//! Loaded from `~/.resterm/streams.yaml`. Durations are given in
//! milliseconds and `0` disables an optional timeout or limit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CONFIG_DIR, DEFAULT_CLOSE_GRACE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_HISTORY_CAPACITY,
    DEFAULT_WRITE_TIMEOUT, SETTINGS_FILE,
};

/// Serde helpers for `Duration` as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Turn a zero duration into "disabled"
pub fn enabled(value: Duration) -> Option<Duration> {
    if value.is_zero() {
        None
    } else {
        Some(value)
    }
}

/// WebSocket runtime options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketOptions {
    #[serde(rename = "handshake_timeout_ms", with = "millis")]
    pub handshake_timeout: Duration,
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
    #[serde(rename = "total_timeout_ms", with = "millis")]
    pub total_timeout: Duration,
    /// Timeout for awaited sends
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// How long to wait for the peer's close reply after we sent ours
    #[serde(rename = "close_grace_ms", with = "millis")]
    pub close_grace: Duration,
    /// 0 keeps the transport default
    pub max_message_bytes: usize,
    /// permessage-deflate preference; the transport does not implement it
    pub compression: bool,
    pub subprotocols: Vec<String>,
    pub history_capacity: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        WebSocketOptions {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Duration::ZERO,
            total_timeout: Duration::ZERO,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            max_message_bytes: 0,
            compression: false,
            subprotocols: Vec::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Server-Sent Events runtime options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseOptions {
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
    #[serde(rename = "total_timeout_ms", with = "millis")]
    pub total_timeout: Duration,
    /// Stop after this many body bytes (0 = unlimited)
    pub max_bytes: u64,
    /// Stop after this many dispatched events (0 = unlimited)
    pub max_events: u64,
    pub history_capacity: usize,
}

impl Default for SseOptions {
    fn default() -> Self {
        SseOptions {
            idle_timeout: Duration::ZERO,
            total_timeout: Duration::ZERO,
            max_bytes: 0,
            max_events: 0,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Transport-level settings shared by every stream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Directory relative file payloads are resolved against
    pub base_dir: Option<PathBuf>,
    /// Searched in order when a file is not found under `base_dir`
    pub fallback_dirs: Vec<PathBuf>,
    /// Accept invalid TLS certificates
    pub insecure: bool,
    /// Extra request headers, `(name, value)`
    pub headers: Vec<(String, String)>,
}

impl DialOptions {
    /// Resolve a payload file: absolute paths as-is, otherwise `base_dir`
    /// then each fallback directory. Returns the first existing candidate,
    /// or the `base_dir` candidate when none exists.
    pub fn resolve_file(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let primary = match &self.base_dir {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        };
        if primary.exists() {
            return primary;
        }
        self.fallback_dirs
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.exists())
            .unwrap_or(primary)
    }
}

/// Contents of the settings file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub websocket: WebSocketOptions,
    pub sse: SseOptions,
    pub dial: DialOptions,
}

impl StreamSettings {
    /// `~/.resterm/streams.yaml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(SETTINGS_FILE)
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load settings; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    /// Write settings, creating the parent directory if needed
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StreamSettings::load_from(&dir.path().join("none.yaml")).unwrap();
        assert_eq!(settings, StreamSettings::default());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.yaml");
        fs::write(
            &path,
            "websocket:\n  idle_timeout_ms: 1500\n  subprotocols: [chat]\nsse:\n  max_events: 3\n",
        )
        .unwrap();

        let settings = StreamSettings::load_from(&path).unwrap();
        assert_eq!(settings.websocket.idle_timeout, Duration::from_millis(1500));
        assert_eq!(settings.websocket.subprotocols, vec!["chat".to_string()]);
        assert_eq!(settings.websocket.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(settings.sse.max_events, 3);
        assert_eq!(settings.sse.max_bytes, 0);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streams.yaml");
        let mut settings = StreamSettings::default();
        settings.sse.idle_timeout = Duration::from_millis(25);
        settings.save_to(&path).unwrap();
        assert_eq!(StreamSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.yaml");
        fs::write(&path, "websocket: [").unwrap();
        assert!(StreamSettings::load_from(&path).is_err());
    }

    #[test]
    fn test_resolve_file_uses_fallbacks() {
        let base = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();
        fs::write(fallback.path().join("payload.bin"), b"x").unwrap();

        let dial = DialOptions {
            base_dir: Some(base.path().to_path_buf()),
            fallback_dirs: vec![fallback.path().to_path_buf()],
            ..Default::default()
        };
        assert_eq!(dial.resolve_file("payload.bin"), fallback.path().join("payload.bin"));
        assert_eq!(dial.resolve_file("missing.bin"), base.path().join("missing.bin"));
    }
}
