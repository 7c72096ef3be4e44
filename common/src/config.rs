use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `backend.base_url` at startup.
pub const API_URL_ENV: &str = "THREAT_HUD_API_URL";

/// Backend address used when neither the config file nor the environment sets one.
pub const FALLBACK_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub hud: HudConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_mode")]
    pub mode: String,
    #[serde(default = "default_camera_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_analyze_path")]
    pub analyze_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HudConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: default_camera_mode(),
            url: default_camera_url(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            analyze_path: default_analyze_path(),
            health_path: default_health_path(),
        }
    }
}

impl Default for HudConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            autostart: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::ReadFile(path.display().to_string(), e)),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.capture.interval_ms == 0 {
            return Err(ConfigError::Invalid("capture.interval_ms must be positive".into()));
        }
        Ok(config)
    }

    /// Apply startup-time environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.backend.base_url = Some(url);
            }
        }
        self
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// JPEG quality on the encoder's 1..=100 scale.
    pub fn jpeg_quality_percent(&self) -> u8 {
        quality_percent(self.jpeg_quality)
    }
}

impl BackendConfig {
    /// The base address in effect, falling back to [`FALLBACK_BASE_URL`].
    pub fn base_url(&self) -> &str {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url,
            _ => FALLBACK_BASE_URL,
        }
    }

    pub fn analyze_url(&self) -> String {
        join_url(self.base_url(), &self.analyze_path)
    }

    pub fn health_url(&self) -> String {
        join_url(self.base_url(), &self.health_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn quality_percent(quality: f32) -> u8 {
    if !quality.is_finite() {
        return (default_jpeg_quality() * 100.0).round() as u8;
    }
    (quality.clamp(0.01, 1.0) * 100.0).round() as u8
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_camera_mode() -> String {
    "mjpeg".into()
}
fn default_camera_url() -> String {
    "http://localhost:8080/stream".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_interval_ms() -> u64 {
    500
}
fn default_jpeg_quality() -> f32 {
    0.7
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_analyze_path() -> String {
    "/analyze".into()
}
fn default_health_path() -> String {
    "/health".into()
}
fn default_bind() -> String {
    "0.0.0.0:3000".into()
}
fn default_log_level() -> String {
    "info".into()
}
