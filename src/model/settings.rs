use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Process-wide settings.
///
/// Seeded from the layered config on first boot, persisted through the
/// store, and mutable at runtime via the settings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub storage_path: PathBuf,
    pub thumbnails_path: PathBuf,
    pub data_path: PathBuf,
    pub max_concurrent: usize,
    pub default_timeout_ms: u64,
    /// Round-robin pool for the User-Agent header.
    pub user_agents: Vec<String>,
    pub log_file: PathBuf,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    pub theme: String,
    pub default_view: String,
    pub notifications_enabled: bool,
}

fn default_verify_tls() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            storage_path: PathBuf::from("data/storage"),
            thumbnails_path: PathBuf::from("data/thumbnails"),
            data_path: PathBuf::from("data"),
            max_concurrent: 5,
            default_timeout_ms: 30_000,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/17.1 Safari/605.1.15"
                    .to_string(),
            ],
            log_file: PathBuf::from("data/logs"),
            verify_tls: true,
            theme: "dark".to_string(),
            default_view: "grid".to_string(),
            notifications_enabled: true,
        }
    }
}

impl Settings {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::ScrapeError> {
        if self.max_concurrent == 0 {
            return Err(crate::error::ScrapeError::Validation(
                "max_concurrent must be >= 1".into(),
            ));
        }
        if self.user_agents.is_empty() {
            return Err(crate::error::ScrapeError::Validation(
                "at least one user agent is required".into(),
            ));
        }
        Ok(())
    }
}
