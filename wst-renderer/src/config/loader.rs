//! Loading [`RendererConfig`] from a TOML file and the environment.

use std::env;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::{defaults, RendererConfig};
use crate::error::ConfigError;

pub const CONFIG_PATH_ENV: &str = "WESTEROS_RENDER_CONFIG";
pub const SECURE_VIDEO_ENV: &str = "WESTEROS_SECURE_VIDEO";
pub const GL_FPS_ENV: &str = "WESTEROS_GL_FPS";
pub const OVERLAY_FPS_ENV: &str = "WESTEROS_OVERLAY_FPS";
pub const FAST_RENDER_ENV: &str = "WESTEROS_FAST_RENDER";
pub const OVERLAY_BUFFERS_ENV: &str = "WESTEROS_OVERLAY_BUFFERS";
pub const DISPLAYED_TIMEOUT_ENV: &str = "WESTEROS_DISPLAYED_TIMEOUT_MS";

/// A set-but-empty variable counts as enabled, so `WESTEROS_GL_FPS=` turns
/// reporting on.
fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl RendererConfig {
    /// Reads the configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Same as [`RendererConfig::load`] with an explicit variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(&lookup)?;
        config.validate()?;
        debug!("Renderer configuration: {:?}", config);
        Ok(config)
    }

    /// Parses a TOML file. A file that is named but missing is an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loading renderer configuration from {:?}", path);
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: RendererConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `WESTEROS_*` variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(SECURE_VIDEO_ENV) {
            self.secure_video = parse_bool(SECURE_VIDEO_ENV, &value)?;
        }
        if let Some(value) = lookup(GL_FPS_ENV) {
            self.gl_fps = parse_bool(GL_FPS_ENV, &value)?;
        }
        if let Some(value) = lookup(OVERLAY_FPS_ENV) {
            self.overlay_fps = parse_bool(OVERLAY_FPS_ENV, &value)?;
        }
        if let Some(value) = lookup(FAST_RENDER_ENV) {
            let name = value.trim();
            self.fast_render = (!name.is_empty()).then(|| name.to_string());
        }
        if let Some(value) = lookup(OVERLAY_BUFFERS_ENV) {
            self.overlay_buffers = value
                .trim()
                .parse()
                .map_err(|_| invalid(OVERLAY_BUFFERS_ENV, &value))?;
        }
        if let Some(value) = lookup(DISPLAYED_TIMEOUT_ENV) {
            self.displayed_timeout_ms = value
                .trim()
                .parse()
                .map_err(|_| invalid(DISPLAYED_TIMEOUT_ENV, &value))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !defaults::OVERLAY_BUFFERS_RANGE.contains(&self.overlay_buffers) {
            return Err(invalid("overlay_buffers", &self.overlay_buffers.to_string()));
        }
        Ok(())
    }
}
