use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_RATIO: u64 = 4;
const DEFAULT_FRAME_INDEX_CAPACITY: usize = 8;
const DEFAULT_TRACKER_INDEX_CAPACITY: usize = 64;
const DEFAULT_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_CROP_MARGIN: f32 = 0.0;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_OUTPUT_DIR: &str = "data";
const DEFAULT_SOURCE_URI: &str = "stub://trap_camera";
const DEFAULT_SOURCE_WIDTH: u32 = 1920;
const DEFAULT_SOURCE_HEIGHT: u32 = 1080;
const DEFAULT_SOURCE_CYCLE_MS: u64 = 25;
const DEFAULT_LABELS: &[&str] = &["insect"];

#[derive(Debug, Deserialize, Default)]
struct TrapsyncConfigFile {
    ratio: Option<u64>,
    output_dir: Option<String>,
    labels: Option<Vec<String>>,
    sync: Option<SyncConfigFile>,
    crop: Option<CropConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    frame_index_capacity: Option<usize>,
    tracker_index_capacity: Option<usize>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CropConfigFile {
    margin: Option<f32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    cycles: Option<u64>,
    cycle_ms: Option<u64>,
}

/// Validated configuration handed to the pipeline. The core never parses
/// files or environment itself; it receives this struct ready to use.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Low-res cycles per high-res frame (`H = L / ratio`).
    pub ratio: u64,
    /// Pending-entry bound of the frame-side sequence index.
    pub frame_index_capacity: usize,
    /// Pending-entry bound of the tracker-side sequence index.
    pub tracker_index_capacity: usize,
    /// Bound of the producer-to-consumer channels.
    pub channel_capacity: usize,
    /// Crop padding as a fraction of box width/height per side.
    pub crop_margin: f32,
    pub jpeg_quality: u8,
    pub output_dir: PathBuf,
    /// Model class index -> label name.
    pub labels: Vec<String>,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub uri: String,
    /// High-resolution frame dimensions.
    pub width: u32,
    pub height: u32,
    /// Stop after this many low-res cycles; `None` runs until shutdown.
    pub cycles: Option<u64>,
    /// Pacing of the synthetic cadence: milliseconds per low-res cycle.
    /// Zero disables pacing (tests).
    pub cycle_ms: u64,
}

impl PipelineConfig {
    /// Load from the file named by `TRAPSYNC_CONFIG` (if set), apply
    /// `TRAPSYNC_*` environment overrides, and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAPSYNC_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as [`load`](Self::load) with an explicit file path taking
    /// precedence over the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("TRAPSYNC_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.or(env_path.as_deref()) {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrapsyncConfigFile) -> Self {
        let sync = file.sync.unwrap_or_default();
        let crop = file.crop.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        Self {
            ratio: file.ratio.unwrap_or(DEFAULT_RATIO),
            frame_index_capacity: sync
                .frame_index_capacity
                .unwrap_or(DEFAULT_FRAME_INDEX_CAPACITY),
            tracker_index_capacity: sync
                .tracker_index_capacity
                .unwrap_or(DEFAULT_TRACKER_INDEX_CAPACITY),
            channel_capacity: sync.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            crop_margin: crop.margin.unwrap_or(DEFAULT_CROP_MARGIN),
            jpeg_quality: crop.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            output_dir: PathBuf::from(
                file.output_dir.unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()),
            ),
            labels: file.labels.unwrap_or_else(|| {
                DEFAULT_LABELS.iter().map(|label| label.to_string()).collect()
            }),
            source: SourceSettings {
                uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                cycles: source.cycles,
                cycle_ms: source.cycle_ms.unwrap_or(DEFAULT_SOURCE_CYCLE_MS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("TRAPSYNC_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(uri) = std::env::var("TRAPSYNC_SOURCE_URI") {
            if !uri.trim().is_empty() {
                self.source.uri = uri;
            }
        }
        if let Ok(ratio) = std::env::var("TRAPSYNC_RATIO") {
            self.ratio = ratio
                .parse()
                .map_err(|_| anyhow!("TRAPSYNC_RATIO must be an integer"))?;
        }
        if let Ok(labels) = std::env::var("TRAPSYNC_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.labels = parsed;
            }
        }
        if let Ok(cycles) = std::env::var("TRAPSYNC_CYCLES") {
            let parsed: u64 = cycles
                .parse()
                .map_err(|_| anyhow!("TRAPSYNC_CYCLES must be an integer number of cycles"))?;
            self.source.cycles = Some(parsed);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.ratio == 0 {
            return Err(anyhow!("ratio must be at least 1"));
        }
        if self.frame_index_capacity == 0 || self.tracker_index_capacity == 0 {
            return Err(anyhow!("sequence index capacities must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel capacity must be at least 1"));
        }
        if !(0.0..0.5).contains(&self.crop_margin) {
            return Err(anyhow!("crop margin must be in [0.0, 0.5)"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("output_dir must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be nonzero"));
        }
        for label in &self.labels {
            validate_label(label)?;
        }
        Ok(())
    }
}

/// Labels become directory names and CSV fields; restrict them to a safe
/// charset instead of escaping later.
pub fn validate_label(label: &str) -> Result<()> {
    let ok = !label.is_empty()
        && label.len() <= 64
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !ok {
        return Err(anyhow!(
            "label {:?} must be 1..=64 chars of [a-z0-9_-]",
            label
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<TrapsyncConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
