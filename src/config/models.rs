use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

/// Filesystem layout. Directories are created at startup if missing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_thumbnails_path")]
    pub thumbnails_path: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            storage_path: default_storage_path(),
            thumbnails_path: default_thumbnails_path(),
            log_file: default_log_file(),
        }
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/storage")
}

fn default_thumbnails_path() -> PathBuf {
    PathBuf::from("data/thumbnails")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("data/logs")
}

/// Crawl and download engine knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Worker pool size shared by crawling and downloads.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Rotated User-Agent pool.
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_ms: default_timeout_ms(),
            user_agents: default_user_agents(),
            verify_tls: default_verify_tls(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_verify_tls() -> bool {
    true
}

fn default_user_agents() -> Vec<String> {
    crate::model::Settings::default().user_agents
}

/// Presentation defaults handed to API consumers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_view")]
    pub default_view: String,
    #[serde(default = "default_notifications")]
    pub notifications_enabled: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            default_view: default_view(),
            notifications_enabled: default_notifications(),
        }
    }
}

fn default_theme() -> String {
    "dark".to_string()
}

fn default_view() -> String {
    "grid".to_string()
}

fn default_notifications() -> bool {
    true
}
