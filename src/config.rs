//! Configuration loader and validator for the fulfillment service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub segmentation: Segmentation,
    pub reconstruction: Reconstruction,
    #[serde(default)]
    pub mesh: Mesh,
    #[serde(default)]
    pub quality: Quality,
    pub dispatch: Dispatch,
    #[serde(default)]
    pub notification: Notification,
    #[serde(default)]
    pub retention: Retention,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub content_dir: String,
    /// Prefix artifact file names are joined onto, e.g. `https://shop/artifacts/`.
    pub public_base_url: String,
    pub bind_addr: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// External cutout service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segmentation {
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_segmentation_min_bytes")]
    pub min_output_bytes: u64,
    #[serde(default = "default_segmentation_timeout")]
    pub timeout_seconds: u64,
}

/// External image-to-3D service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconstruction {
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_reconstruction_min_bytes")]
    pub min_output_bytes: u64,
    #[serde(default = "default_reconstruction_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Mesh {
    #[serde(default)]
    pub require_watertight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quality {
    pub min_file_bytes: u64,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            min_file_bytes: crate::quality::DEFAULT_MIN_FILE_BYTES,
        }
    }
}

/// Print-partner endpoint and the auto-dispatch default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub endpoint: String,
    pub token: String,
    #[serde(default)]
    pub auto_dispatch: bool,
    /// Request timeout for partner submissions.
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_seconds: u64,
    /// A claim older than this may be taken over. Must outlast `timeout_seconds`.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Notification {
    /// Email relay webhook. Notifications are only logged when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retention {
    pub window_days: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            window_days: crate::sweeper::DEFAULT_RETENTION_DAYS,
            sweep_interval_seconds: 3600,
        }
    }
}

fn default_segmentation_min_bytes() -> u64 {
    1024
}

fn default_segmentation_timeout() -> u64 {
    60
}

fn default_reconstruction_min_bytes() -> u64 {
    10 * 1024
}

fn default_reconstruction_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_claim_lease() -> u64 {
    300
}

impl Config {
    /// Ensure required directories exist, including the content sub-directories
    /// the pipeline writes into.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        let content = self.content_dir();
        for sub in ["clean", "models", "originals"] {
            fs::create_dir_all(content.join(sub))?;
        }
        Ok(())
    }

    pub fn content_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.content_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/printforge.db", self.app.data_dir))
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention.window_days)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.content_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.content_dir must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.app.public_base_url).is_err() {
        return Err(ConfigError::Invalid("app.public_base_url must be an absolute URL"));
    }
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be host:port"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if reqwest::Url::parse(&cfg.segmentation.endpoint).is_err() {
        return Err(ConfigError::Invalid("segmentation.endpoint must be a URL"));
    }
    if cfg.segmentation.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("segmentation.timeout_seconds must be > 0"));
    }

    if reqwest::Url::parse(&cfg.reconstruction.endpoint).is_err() {
        return Err(ConfigError::Invalid("reconstruction.endpoint must be a URL"));
    }
    if cfg.reconstruction.token.trim().is_empty() {
        return Err(ConfigError::Invalid("reconstruction.token must be non-empty"));
    }
    if cfg.reconstruction.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("reconstruction.timeout_seconds must be > 0"));
    }
    if cfg.reconstruction.max_attempts == 0 {
        return Err(ConfigError::Invalid("reconstruction.max_attempts must be >= 1"));
    }

    if cfg.quality.min_file_bytes == 0 {
        return Err(ConfigError::Invalid("quality.min_file_bytes must be > 0"));
    }

    if reqwest::Url::parse(&cfg.dispatch.endpoint).is_err() {
        return Err(ConfigError::Invalid("dispatch.endpoint must be a URL"));
    }
    if cfg.dispatch.claim_lease_seconds == 0 {
        return Err(ConfigError::Invalid("dispatch.claim_lease_seconds must be > 0"));
    }
    if cfg.dispatch.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("dispatch.timeout_seconds must be > 0"));
    }
    if cfg.dispatch.claim_lease_seconds <= cfg.dispatch.timeout_seconds {
        return Err(ConfigError::Invalid(
            "dispatch.claim_lease_seconds must exceed dispatch.timeout_seconds",
        ));
    }

    if let Some(endpoint) = &cfg.notification.endpoint {
        if reqwest::Url::parse(endpoint).is_err() {
            return Err(ConfigError::Invalid("notification.endpoint must be a URL"));
        }
    }

    if cfg.retention.window_days <= 0 {
        return Err(ConfigError::Invalid("retention.window_days must be > 0"));
    }
    if cfg.retention.sweep_interval_seconds == 0 {
        return Err(ConfigError::Invalid("retention.sweep_interval_seconds must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  content_dir: "./data/content"
  public_base_url: "http://localhost:8080/artifacts/"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 500
  max_backoff_seconds: 600

segmentation:
  endpoint: "https://cutout.example.com/v1/remove-background"
  token: "YOUR_CUTOUT_TOKEN"
  min_output_bytes: 1024
  timeout_seconds: 60

reconstruction:
  endpoint: "https://mesh.example.com/v1/image-to-3d"
  token: "YOUR_RECONSTRUCTION_TOKEN"
  min_output_bytes: 10240
  timeout_seconds: 300
  max_attempts: 3
  backoff_base_ms: 500

mesh:
  require_watertight: false

quality:
  min_file_bytes: 10240

dispatch:
  endpoint: "https://partner.example.com/api/print-jobs"
  token: "YOUR_PARTNER_TOKEN"
  auto_dispatch: false
  timeout_seconds: 30
  claim_lease_seconds: 300

notification:
  endpoint: "https://mail.example.com/api/send"
  sender: "orders@printforge.example"

retention:
  window_days: 14
  sweep_interval_seconds: 3600
"#
}
