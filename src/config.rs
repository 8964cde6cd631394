use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("invalid camera source: {0:?}")]
    InvalidSource(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Where a capture worker reads frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    /// Local device index, e.g. `/dev/video0`.
    LocalIndex(u32),
    /// Network stream URL (rtsp://, http://, a file path...).
    StreamUrl(String),
}

impl CameraSource {
    /// Resolve a raw configured value: anything that parses as a small
    /// non-negative integer is a device index, everything else is a URL.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidSource(raw.to_string()));
        }
        match trimmed.parse::<u32>() {
            Ok(index) => Ok(Self::LocalIndex(index)),
            Err(_) => Ok(Self::StreamUrl(trimmed.to_string())),
        }
    }

    pub fn is_network_stream(&self) -> bool {
        match self {
            Self::LocalIndex(_) => false,
            Self::StreamUrl(url) => url.starts_with("rtsp://") || url.starts_with("rtmp://"),
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalIndex(index) => write!(f, "device {index}"),
            Self::StreamUrl(url) => write!(f, "stream {url}"),
        }
    }
}

fn default_faces_dir() -> PathBuf {
    PathBuf::from("faces_db")
}

fn default_incidents_dir() -> PathBuf {
    PathBuf::from("incidents")
}

fn default_cooldown_secs() -> f64 {
    10.0
}

fn default_tolerance() -> f32 {
    0.6
}

fn default_frame_width() -> u32 {
    640
}

fn default_process_every() -> u32 {
    2
}

fn default_queue_capacity() -> usize {
    2
}

fn default_detection_downscale() -> u32 {
    4
}

fn default_idle_sleep_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_faces_dir")]
    pub faces_dir: PathBuf,
    #[serde(default = "default_incidents_dir")]
    pub incidents_dir: PathBuf,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
    /// Maximum encoding distance for a match; lower is stricter.
    /// The ONNX engine measures cosine distance (`1 - cos`), so 0.6 accepts
    /// pairs with cosine similarity of at least 0.4.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    /// Requested capture width. Advisory, drivers may ignore it.
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_process_every")]
    pub process_every_n_frames: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Linear factor frames are shrunk by before face detection.
    #[serde(default = "default_detection_downscale")]
    pub detection_downscale: u32,
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            faces_dir: default_faces_dir(),
            incidents_dir: default_incidents_dir(),
            cooldown_secs: default_cooldown_secs(),
            tolerance: default_tolerance(),
            frame_width: default_frame_width(),
            process_every_n_frames: default_process_every(),
            queue_capacity: default_queue_capacity(),
            detection_downscale: default_detection_downscale(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

fn default_reconnect_delay() -> u64 {
    5
}

/// Upper bound on `capture.reconnect_delay_secs`.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// 0 keeps a failed camera out of the run until restart.
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 0,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

fn default_detector_model() -> PathBuf {
    PathBuf::from("models/face_detection_yunet_2023mar.onnx")
}

fn default_encoder_model() -> PathBuf {
    PathBuf::from("models/w600k_r50.onnx")
}

fn default_score_threshold() -> f32 {
    0.8
}

fn default_intra_threads() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_detector_model")]
    pub detector_model: PathBuf,
    #[serde(default = "default_encoder_model")]
    pub encoder_model: PathBuf,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector_model: default_detector_model(),
            encoder_model: default_encoder_model(),
            score_threshold: default_score_threshold(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_sink_url() -> String {
    "http://127.0.0.1:8000/alerts".to_string()
}

fn default_alert_timeout_ms() -> u64 {
    800
}

fn default_history() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Empty disables outbound notifications.
    #[serde(default = "default_sink_url")]
    pub sink_url: String,
    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_history")]
    pub history: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            sink_url: default_sink_url(),
            timeout_ms: default_alert_timeout_ms(),
            history: default_history(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    8090
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_cameras() -> Vec<String> {
    vec!["0".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default = "default_cameras")]
    pub cameras: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            capture: CaptureConfig::default(),
            engine: EngineConfig::default(),
            alerts: AlertConfig::default(),
            http: HttpConfig::default(),
            display: DisplayConfig::default(),
            cameras: default_cameras(),
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the default file is absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load_from(p),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load_from(DEFAULT_CONFIG_PATH),
            None => {
                tracing::info!("no {} found, using defaults", DEFAULT_CONFIG_PATH);
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        if self.watch.process_every_n_frames == 0 {
            return Err(ConfigError::Invalid(
                "watch.process_every_n_frames must be at least 1".into(),
            ));
        }
        if self.watch.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "watch.queue_capacity must be at least 1".into(),
            ));
        }
        if self.watch.detection_downscale == 0 {
            return Err(ConfigError::Invalid(
                "watch.detection_downscale must be at least 1".into(),
            ));
        }
        if !(self.watch.tolerance > 0.0) || !self.watch.tolerance.is_finite() {
            return Err(ConfigError::Invalid(
                "watch.tolerance must be a positive finite number".into(),
            ));
        }
        if Duration::try_from_secs_f64(self.watch.cooldown_secs).is_err() {
            return Err(ConfigError::Invalid(format!(
                "watch.cooldown_secs must be a finite, non-negative number of seconds, got {}",
                self.watch.cooldown_secs
            )));
        }
        if self.capture.reconnect_delay_secs > MAX_RECONNECT_DELAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "capture.reconnect_delay_secs must be at most {MAX_RECONNECT_DELAY_SECS}"
            )));
        }
        Ok(())
    }

    /// Cooldown window; `validate` guarantees the conversion succeeds.
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.watch.cooldown_secs).unwrap_or(Duration::ZERO)
    }

    /// Resolve the raw camera strings once, in configured order.
    pub fn camera_sources(&self) -> Result<Vec<CameraSource>, ConfigError> {
        self.cameras.iter().map(|raw| CameraSource::parse(raw)).collect()
    }
}
