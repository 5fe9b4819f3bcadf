use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use analysis::ShadowConfig;
use delta_ingest_core::ConnectionConfig;
use delta_ingest_replay::ReplayConfig;
use delta_ingest_sse::SseConfig;

/// Everything a session needs, read from one JSON file. Missing keys take
/// their defaults.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: Option<String>,
    pub connection: ConnectionConfig,
    pub shadow: ShadowConfig,
    pub sse: SseConfig,
    pub replay: ReplayConfig,
    /// Log a delta line every this many frames; 0 turns it off.
    pub report_every_frames: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connection: ConnectionConfig::default(),
            shadow: ShadowConfig::default(),
            sse: SseConfig::default(),
            replay: ReplayConfig::default(),
            report_every_frames: 10,
        }
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|d| d.join("delta-shadow").join("session.json"))
}

/// An explicit path must exist. Without one the per-user file is used when
/// present, defaults otherwise.
pub fn load(explicit: Option<&Path>) -> Result<SessionConfig> {
    match explicit {
        Some(p) => read(p),
        None => match default_path() {
            Some(p) if p.exists() => read(&p),
            _ => Ok(SessionConfig::default()),
        },
    }
}

fn read(path: &Path) -> Result<SessionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read session config {}", path.display()))?;
    let cfg: SessionConfig = serde_json::from_str(&text)
        .with_context(|| format!("parse session config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "session config loaded");
    Ok(cfg)
}
