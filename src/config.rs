use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::backend::DecodeBackend;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:5050";
const DEFAULT_CAMERA_URL: &str = "http://192.168.1.96:5000/video";
const DEFAULT_LOCAL_DEVICE: &str = "/dev/video0";
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FRAME_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_TARGET_CLASS: &str = "monkey";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_ACTIVATE_SECS: f64 = 3.0;
const DEFAULT_DEACTIVATE_SECS: f64 = 4.0;
const DEFAULT_HISTORY_DIR: &str = "detections";
const DEFAULT_HISTORY_CAPACITY: usize = 50;
const DEFAULT_HISTORY_QUALITY: u8 = 95;
const DEFAULT_STREAM_QUALITY: u8 = 85;
const DEFAULT_IDLE_POLL_MS: u64 = 100;

#[derive(Debug, Deserialize, Default)]
struct WatchdConfigFile {
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    alert: Option<AlertConfigFile>,
    history: Option<HistoryConfigFile>,
    stream: Option<StreamConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    probe_timeout_secs: Option<u64>,
    frame_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    backends: Option<Vec<String>>,
    raw_fallback: Option<bool>,
    local_device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels: Option<Vec<String>>,
    target_class: Option<String>,
    confidence_threshold: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    activate_after_secs: Option<f64>,
    deactivate_after_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    dir: Option<PathBuf>,
    capacity: Option<usize>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
    idle_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchdConfig {
    pub api_addr: String,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub alert: AlertSettings,
    pub history: HistorySettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub probe_timeout: Duration,
    /// How long a strategy may poll for its first valid frame.
    pub frame_timeout: Duration,
    /// Per-read socket timeout once a stream is open.
    pub read_timeout: Duration,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub backends: Vec<DecodeBackend>,
    pub raw_fallback: bool,
    /// `None` disables the local fallback.
    pub local_device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels: Vec<String>,
    pub target_class: String,
    pub confidence_threshold: f32,
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub activate_after: Duration,
    pub deactivate_after: Duration,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub dir: PathBuf,
    pub capacity: usize,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
    pub idle_poll: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CAMERA_URL.to_string(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            frame_timeout: Duration::from_secs(DEFAULT_FRAME_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            target_fps: DEFAULT_TARGET_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            backends: DecodeBackend::default_order(),
            raw_fallback: true,
            local_device: Some(DEFAULT_LOCAL_DEVICE.to_string()),
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            labels: vec![DEFAULT_TARGET_CLASS.to_string()],
            target_class: DEFAULT_TARGET_CLASS.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            activate_after: Duration::from_secs_f64(DEFAULT_ACTIVATE_SECS),
            deactivate_after: Duration::from_secs_f64(DEFAULT_DEACTIVATE_SECS),
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_HISTORY_DIR),
            capacity: DEFAULT_HISTORY_CAPACITY,
            jpeg_quality: DEFAULT_HISTORY_QUALITY,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_STREAM_QUALITY,
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
        }
    }
}

impl Default for WatchdConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            camera: CameraSettings::default(),
            detector: DetectorSettings::default(),
            alert: AlertSettings::default(),
            history: HistorySettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl WatchdConfig {
    /// Load from `TROOPWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TROOPWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file path (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchdConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or(defaults.api_addr);

        let camera_file = file.camera.unwrap_or_default();
        let camera_defaults = defaults.camera;
        let backends = match camera_file.backends {
            Some(names) => names
                .iter()
                .map(|name| DecodeBackend::parse(name))
                .collect::<Result<Vec<_>>>()?,
            None => camera_defaults.backends,
        };
        let local_device = match camera_file.local_device {
            Some(device) => normalize_local_device(&device),
            None => camera_defaults.local_device,
        };
        let camera = CameraSettings {
            url: camera_file.url.unwrap_or(camera_defaults.url),
            probe_timeout: camera_file
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(camera_defaults.probe_timeout),
            frame_timeout: camera_file
                .frame_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(camera_defaults.frame_timeout),
            read_timeout: camera_file
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(camera_defaults.read_timeout),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            backends,
            raw_fallback: camera_file
                .raw_fallback
                .unwrap_or(camera_defaults.raw_fallback),
            local_device,
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = defaults.detector;
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(detector_defaults.backend),
            model_path: detector_file.model_path,
            labels: detector_file.labels.unwrap_or(detector_defaults.labels),
            target_class: detector_file
                .target_class
                .unwrap_or(detector_defaults.target_class),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(detector_defaults.confidence_threshold),
            input_size: detector_file
                .input_size
                .unwrap_or(detector_defaults.input_size),
        };

        let alert_file = file.alert.unwrap_or_default();
        let alert = AlertSettings {
            activate_after: secs_f64(
                "alert.activate_after_secs",
                alert_file
                    .activate_after_secs
                    .unwrap_or(DEFAULT_ACTIVATE_SECS),
            )?,
            deactivate_after: secs_f64(
                "alert.deactivate_after_secs",
                alert_file
                    .deactivate_after_secs
                    .unwrap_or(DEFAULT_DEACTIVATE_SECS),
            )?,
        };

        let history_file = file.history.unwrap_or_default();
        let history_defaults = defaults.history;
        let history = HistorySettings {
            dir: history_file.dir.unwrap_or(history_defaults.dir),
            capacity: history_file.capacity.unwrap_or(history_defaults.capacity),
            jpeg_quality: history_file
                .jpeg_quality
                .unwrap_or(history_defaults.jpeg_quality),
        };

        let stream_file = file.stream.unwrap_or_default();
        let stream_defaults = defaults.stream;
        let stream = StreamSettings {
            jpeg_quality: stream_file
                .jpeg_quality
                .unwrap_or(stream_defaults.jpeg_quality),
            idle_poll: stream_file
                .idle_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.idle_poll),
        };

        Ok(Self {
            api_addr,
            camera,
            detector,
            alert,
            history,
            stream,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("TROOPWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("TROOPWATCH_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Ok(device) = std::env::var("TROOPWATCH_LOCAL_DEVICE") {
            self.camera.local_device = normalize_local_device(&device);
        }
        if let Some(class) = non_empty_env("TROOPWATCH_TARGET_CLASS") {
            self.detector.target_class = class;
        }
        if let Some(path) = non_empty_env("TROOPWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = non_empty_env("TROOPWATCH_HISTORY_DIR") {
            self.history.dir = PathBuf::from(dir);
        }
        if let Some(secs) = non_empty_env("TROOPWATCH_ACTIVATE_SECS") {
            let secs: f64 = secs
                .parse()
                .map_err(|_| anyhow!("TROOPWATCH_ACTIVATE_SECS must be a number of seconds"))?;
            self.alert.activate_after = secs_f64("TROOPWATCH_ACTIVATE_SECS", secs)?;
        }
        if let Some(secs) = non_empty_env("TROOPWATCH_DEACTIVATE_SECS") {
            let secs: f64 = secs
                .parse()
                .map_err(|_| anyhow!("TROOPWATCH_DEACTIVATE_SECS must be a number of seconds"))?;
            self.alert.deactivate_after = secs_f64("TROOPWATCH_DEACTIVATE_SECS", secs)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_camera_url(&self.camera.url)?;

        let threshold = self.detector.confidence_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "detector.confidence_threshold must be in (0, 1], got {}",
                threshold
            ));
        }
        if self.detector.target_class.trim().is_empty() {
            return Err(anyhow!("detector.target_class must not be empty"));
        }
        self.detector.target_class = self.detector.target_class.trim().to_string();

        if self.history.capacity == 0 {
            return Err(anyhow!("history.capacity must be at least 1"));
        }
        for (name, quality) in [
            ("history.jpeg_quality", self.history.jpeg_quality),
            ("stream.jpeg_quality", self.stream.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be in 1..=100, got {}", name, quality));
            }
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        Ok(())
    }
}

/// Accept `http(s)://` cameras and `stub://` synthetic sources.
pub fn validate_camera_url(raw: &str) -> Result<()> {
    let parsed =
        url::Url::parse(raw).map_err(|e| anyhow!("invalid camera url '{}': {}", raw, e))?;
    match parsed.scheme() {
        "http" | "https" | "stub" => Ok(()),
        other => Err(anyhow!(
            "unsupported camera url scheme '{}'; expected http(s) or stub",
            other
        )),
    }
}

/// Map a bare camera index (e.g. "0") to its device node; empty disables the fallback.
pub fn normalize_local_device(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("/dev/video{}", value));
    }
    Some(value.to_string())
}

fn read_config_file(path: &Path) -> Result<WatchdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn secs_f64(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", name))
}
