// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing file or a partial file both work.
// A file that fails to parse is reported and replaced by the defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Harness".to_string(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// fifo, mailbox, immediate or fifo_relaxed
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// PNG decoded into the quad's texture. A checkerboard stands in when
    /// it cannot be loaded.
    pub texture: PathBuf,
    /// Directory holding quad.vert.spv and quad.frag.spv
    pub shader_dir: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            texture: PathBuf::from("assets/texture.png"),
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

/// Where the configuration came from. Loading happens before the logger
/// exists (the log level is a config value), so this is reported after.
#[derive(Debug)]
pub enum ConfigSource {
    /// No file at the path
    Missing(PathBuf),
    Loaded(PathBuf),
    /// The file exists but could not be read or parsed
    Invalid(anyhow::Error),
}

impl ConfigSource {
    /// Log how the configuration was obtained. Call once logging is up.
    pub fn log(&self, config: &Config) {
        match self {
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path);
            }
            ConfigSource::Loaded(path) => {
                log::info!("Loaded configuration from {:?}", path);
            }
            ConfigSource::Invalid(e) => {
                log::warn!("{:?}. Using defaults.", e);
            }
        }
        log::debug!("Config: {:?}", config);
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is
    /// missing or broken
    pub fn load() -> (Self, ConfigSource) {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();

        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, ConfigSource::Loaded(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Present mode as Vulkan enum. Unknown names fall back to FIFO.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "fifo" => vk::PresentModeKHR::FIFO,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            other => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", other);
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            // Logger is not up yet
            eprintln!(
                "Unknown log level '{}', using info",
                self.debug.log_level
            );
            log::LevelFilter::Info
        })
    }
}
