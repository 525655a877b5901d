use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for rolling log files. Logs go to journald or stderr when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device index ("0"), device path, stream URL, or a directory of still images.
    #[serde(default = "default_capture_source")]
    pub source: String,

    #[serde(default = "default_capture_width")]
    pub width: u32,

    #[serde(default = "default_capture_height")]
    pub height: u32,
}

fn default_capture_source() -> String {
    "0".to_string()
}

fn default_capture_width() -> u32 {
    640
}

fn default_capture_height() -> u32 {
    480
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: default_capture_source(),
            width: default_capture_width(),
            height: default_capture_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// UltraFace detector weights. Downloaded here when missing and `download_detector` is set.
    #[serde(default = "default_detector_path")]
    pub detector: PathBuf,

    #[serde(default = "default_download_detector")]
    pub download_detector: bool,

    /// FaceNet embedder weights (160x160 input)
    #[serde(default = "default_embedder_path")]
    pub embedder: PathBuf,

    #[serde(default = "default_gallery_path")]
    pub gallery: PathBuf,

    #[serde(default = "default_classifier_path")]
    pub classifier: PathBuf,

    #[serde(default = "default_detector_confidence")]
    pub detector_confidence: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("facecast")
        .join("models")
}

fn default_detector_path() -> PathBuf {
    models_dir().join("ultraface-320.onnx")
}

fn default_download_detector() -> bool {
    true
}

fn default_embedder_path() -> PathBuf {
    models_dir().join("facenet.onnx")
}

fn default_gallery_path() -> PathBuf {
    models_dir().join("gallery.json")
}

fn default_classifier_path() -> PathBuf {
    models_dir().join("classifier.json")
}

fn default_detector_confidence() -> f32 {
    0.7
}

fn default_nms_threshold() -> f32 {
    0.3
}

fn default_intra_threads() -> usize {
    4
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector: default_detector_path(),
            download_detector: default_download_detector(),
            embedder: default_embedder_path(),
            gallery: default_gallery_path(),
            classifier: default_classifier_path(),
            detector_confidence: default_detector_confidence(),
            nms_threshold: default_nms_threshold(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Best cosine similarity must exceed this for the classifier to name a face.
    #[serde(default = "default_match_threshold")]
    pub threshold: f32,

    #[serde(default = "default_visitor_label")]
    pub visitor_label: String,
}

fn default_match_threshold() -> f32 {
    0.6
}

fn default_visitor_label() -> String {
    "Visitor".to_string()
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: default_match_threshold(),
            visitor_label: default_visitor_label(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Pacing {
    /// Sleep a full cycle after every publish; real cadence is processing time + cycle.
    #[default]
    FixedSleep,
    /// Start cycles on a fixed schedule, skipping ticks that processing overran.
    Deadline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,

    #[serde(default)]
    pub pacing: Pacing,

    /// Pause after a missed frame. Zero retries immediately.
    #[serde(default)]
    pub miss_backoff_ms: u64,

    /// Upper bound on a single subscriber send. `None` waits indefinitely.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: Option<u64>,
}

fn default_cycle_ms() -> u64 {
    30
}

fn default_send_timeout_ms() -> Option<u64> {
    Some(250)
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cycle_ms: default_cycle_ms(),
            pacing: Pacing::default(),
            miss_backoff_ms: 0,
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: None,
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            models: ModelsConfig::default(),
            matching: MatchingConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACECAST_CONFIG` or the default location, writing defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACECAST_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facecast")
    }
}
