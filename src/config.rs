// Engine settings, loaded at startup and written back on a clean exit.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::{DEFAULT_POLL_INTERVAL, EffectSpec};
use crate::device::DEFAULT_LATENCY_FRAMES;
use crate::shared::{DEFAULT_BPM, DEFAULT_STEP_COUNT};

const CONFIG_DIR: &str = ".steprender";
const CONFIG_FILE: &str = "engine.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output endpoint id; `None` picks the system default.
    pub output_device: Option<String>,
    pub poll_interval_ms: u64,
    pub latency_frames: u32,
    pub bpm: f32,
    pub step_count: usize,
    pub plugins: Vec<PathBuf>,
    // built-in inserts, ahead of any plugins on the master bus
    pub master_effects: Vec<EffectSpec>,
    pub demo_pattern: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            latency_frames: DEFAULT_LATENCY_FRAMES,
            bpm: DEFAULT_BPM,
            step_count: DEFAULT_STEP_COUNT,
            plugins: Vec::new(),
            master_effects: Vec::new(),
            demo_pattern: true,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// <project_dir>/.steprender/engine.json
pub fn config_file_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Missing file means defaults; a malformed one is reported and replaced by
/// defaults too, so a bad edit never keeps the engine from starting.
pub fn load_config(project_dir: &Path) -> EngineConfig {
    let path = config_file_path(project_dir);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(_) => return EngineConfig::default(),
    };
    match serde_json::from_str(&data) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("ignoring malformed {}: {e}", path.display());
            EngineConfig::default()
        }
    }
}

// Creates .steprender/ if it does not exist yet.
pub fn save_config(project_dir: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let path = config_file_path(project_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    Ok(())
}
