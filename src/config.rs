use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::model::DeviceMode;
use crate::plugins::registry::DriverContext;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmedia/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Bearer token expected on `/api` requests. `None` disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_lun_dir")]
    pub lun_dir: PathBuf,

    /// Forces the advertised mode instead of reading it from the gadget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeviceMode>,
}

impl Config {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("parse config {}", path.display()))?;
            info!("Config loaded from {}", path.display());
            Ok(config)
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Builds a config rooted entirely under `root`; used by tests and `fetch`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Config::default();
        config.storage.image_dir = root.join("images");
        config.storage.staging_dir = root.join("staging");
        config.device.lun_dir = root.join("lun.0");
        config.gate.min_free_bytes = 0;
        config
    }
}

impl DownloadConfig {
    pub fn driver_context(&self) -> DriverContext {
        DriverContext {
            user_agent: self.user_agent.clone(),
            timeout_secs: self.timeout_secs,
            retries: self.retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }

    pub fn apply_driver_context(&mut self, ctx: &DriverContext) {
        self.user_agent = ctx.user_agent.clone();
        self.timeout_secs = ctx.timeout_secs;
        self.retries = ctx.retries;
        self.retry_backoff_ms = ctx.retry_backoff_ms;
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: default_listen(), api_token: None }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            staging_dir: default_staging_dir(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stall_timeout_secs: default_stall_timeout(),
            max_duration_secs: None,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { enabled: default_true(), min_free_bytes: default_min_free_bytes() }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { lun_dir: default_lun_dir(), mode: None }
    }
}

fn default_listen() -> String { "0.0.0.0:8090".to_string() }
fn default_image_dir() -> PathBuf { PathBuf::from("/data") }
fn default_staging_dir() -> PathBuf { PathBuf::from("/data/.staging") }
fn default_image_extensions() -> Vec<String> { vec!["iso".to_string(), "img".to_string()] }
fn default_user_agent() -> String { format!("vmedia/{}", env!("CARGO_PKG_VERSION")) }
fn default_timeout() -> u64 { 60 }
fn default_retries() -> u32 { 2 }
fn default_retry_backoff_ms() -> u64 { 400 }
fn default_stall_timeout() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_min_free_bytes() -> u64 { 64 * 1024 * 1024 }
fn default_lun_dir() -> PathBuf {
    PathBuf::from("/sys/kernel/config/usb_gadget/g0/functions/mass_storage.disk0/lun.0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            [gate]
            min_free_bytes = 1024

            [device]
            mode = "cdrom"
            "#,
        )
        .unwrap();

        assert!(config.gate.enabled);
        assert_eq!(config.gate.min_free_bytes, 1024);
        assert_eq!(config.device.mode, Some(DeviceMode::Cdrom));
        assert_eq!(config.storage.image_dir, PathBuf::from("/data"));
        assert_eq!(config.download.retries, 2);
        assert_eq!(config.download.max_duration_secs, None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8090");
        assert!(config.server.api_token.is_none());
    }

    #[test]
    fn driver_context_round_trips_through_download_section() {
        let mut download = DownloadConfig::default();
        let mut ctx = download.driver_context();
        ctx.retries = 7;
        ctx.user_agent = "probe".to_string();
        download.apply_driver_context(&ctx);
        assert_eq!(download.retries, 7);
        assert_eq!(download.user_agent, "probe");
    }
}
