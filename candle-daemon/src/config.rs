//! Daemon configuration (JSON)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration. Every field has a default, so `{}` is valid.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Catalog key, e.g. "nissan-leaf-2011-ze0"
    pub vehicle: String,

    /// Where CAN frames come from
    pub source: SourceConfig,

    /// Record trips when the vehicle asks for it
    pub record: bool,

    pub recordings_dir: PathBuf,

    pub playback_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Synthetic drive cycle
    Demo,
    /// Replay a `candump -l` capture
    Candump {
        path: PathBuf,
        #[serde(default)]
        unpaced: bool,
    },
    /// Commands only
    None,
}

/// `<local data dir>/candle/recordings`, or `./recordings` if unknown
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("candle").join("recordings"))
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            vehicle: candle_adapters::nissan_leaf::KEY.to_string(),
            source: SourceConfig::Demo,
            record: true,
            recordings_dir: default_recordings_dir(),
            playback_interval_ms: 50,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: DaemonConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.playback_interval_ms.max(1))
    }
}
