//! Configuration management.
//!
//! Layered loading, highest priority last:
//! 1. Default values embedded in the structs
//! 2. TOML file (`config/mediagrab.toml`, overridable via `MEDIAGRAB_CONFIG`)
//! 3. Environment variables `MEDIAGRAB__<SECTION>__<KEY>`
//!
//! The loaded [`AppConfig`] only seeds the store on first boot; after that
//! the persisted settings row is authoritative and runtime-mutable through
//! the settings endpoint.

mod models;
mod sources;

pub use models::{AppConfig, EngineConfig, PathsConfig, ServerConfig, UiConfig};

use thiserror::Error;

use crate::model::Settings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific path; used by tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_concurrent == 0 {
            return Err(ConfigError::Invalid("engine.max_concurrent must be >= 1".into()));
        }
        if self.engine.user_agents.is_empty() {
            return Err(ConfigError::Invalid(
                "engine.user_agents must list at least one agent".into(),
            ));
        }
        if self.engine.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("engine.default_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Collapse the config into the runtime [`Settings`] record that seeds
    /// the store on first boot.
    pub fn initial_settings(&self) -> Settings {
        Settings {
            port: self.server.bind_addr.port(),
            storage_path: self.paths.storage_path.clone(),
            thumbnails_path: self.paths.thumbnails_path.clone(),
            data_path: self.paths.data_path.clone(),
            max_concurrent: self.engine.max_concurrent,
            default_timeout_ms: self.engine.default_timeout_ms,
            user_agents: self.engine.user_agents.clone(),
            log_file: self.paths.log_file.clone(),
            verify_tls: self.engine.verify_tls,
            theme: self.ui.theme.clone(),
            default_view: self.ui.default_view.clone(),
            notifications_enabled: self.ui.notifications_enabled,
        }
    }
}
