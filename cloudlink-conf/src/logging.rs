use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    /// Used when `to` is `file` or `both`.
    pub file: PathBuf,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level::default(), file: PathBuf::from("/var/log/cloudlink/cloudlink.log") }
    }
}

impl Log {
    /// The log file, if one is needed and configured.
    #[inline]
    pub fn file_path(&self) -> Option<&Path> {
        if self.to.file() && !self.file.as_os_str().is_empty() {
            Some(self.file.as_path())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

/// Minimum record level, parsed from slog's level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    #[inline]
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&s).map(Level).map_err(|_| format!("invalid log level `{s}`"))
    }
}
