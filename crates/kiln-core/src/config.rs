use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level kiln configuration, loaded from kiln.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub descriptors: DescriptorPoolConfig,
    #[serde(default)]
    pub swapchain: SwapchainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Color the offscreen target is cleared to at the start of every frame
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
    /// Edge length of the opaque-white fallback texture
    #[serde(default = "default_texture_size")]
    pub default_texture_size: u32,
    /// Fence wait timeout in milliseconds; unset waits forever
    #[serde(default)]
    pub fence_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Draws accepted per frame
    #[serde(default = "default_max_draws")]
    pub max_draws: usize,
    #[serde(default = "default_table_capacity")]
    pub max_buffers: usize,
    #[serde(default = "default_table_capacity")]
    pub max_textures: usize,
    #[serde(default = "default_table_capacity")]
    pub max_shaders: usize,
    #[serde(default = "default_table_capacity")]
    pub max_programs: usize,
    #[serde(default = "default_table_capacity")]
    pub max_descriptors: usize,
}

/// Sizes of the single descriptor pool the set cache allocates from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorPoolConfig {
    #[serde(default = "default_max_sets")]
    pub max_sets: u32,
    #[serde(default = "default_pool_size")]
    pub uniform_buffers: u32,
    #[serde(default = "default_pool_size")]
    pub storage_buffers: u32,
    #[serde(default = "default_pool_size")]
    pub combined_image_samplers: u32,
    #[serde(default = "default_pool_size")]
    pub storage_images: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapchainConfig {
    #[serde(default)]
    pub present_mode: PresentMode,
    /// Preferred number of swapchain images (clamped to surface limits)
    #[serde(default = "default_image_count")]
    pub image_count: u32,
}

/// Presentation mode selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresentMode {
    /// Vsync, always supported (default)
    #[default]
    #[serde(rename = "fifo")]
    Fifo,
    #[serde(rename = "mailbox")]
    Mailbox,
    #[serde(rename = "immediate")]
    Immediate,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: default_clear_color(),
            default_texture_size: default_texture_size(),
            fence_timeout_ms: None,
        }
    }
}

impl RenderConfig {
    /// Fence timeout as the driver expects it.
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms
            .map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000))
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_draws: default_max_draws(),
            max_buffers: default_table_capacity(),
            max_textures: default_table_capacity(),
            max_shaders: default_table_capacity(),
            max_programs: default_table_capacity(),
            max_descriptors: default_table_capacity(),
        }
    }
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: default_max_sets(),
            uniform_buffers: default_pool_size(),
            storage_buffers: default_pool_size(),
            combined_image_samplers: default_pool_size(),
            storage_images: default_pool_size(),
        }
    }
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            present_mode: PresentMode::default(),
            image_count: default_image_count(),
        }
    }
}

impl KilnConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CoreError> {
        let config: KilnConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.limits.max_draws == 0 {
            return Err(CoreError::ConfigError("limits.max_draws must be > 0".into()));
        }
        if self.descriptors.max_sets == 0 {
            return Err(CoreError::ConfigError(
                "descriptors.max_sets must be > 0".into(),
            ));
        }
        if self.render.default_texture_size == 0 {
            return Err(CoreError::ConfigError(
                "render.default_texture_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. `./kiln.toml` if present
/// 2. `<config dir>/kiln.toml` (see [`kiln_common::platform::config_dir`])
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("kiln.toml");
    if local.exists() {
        return local;
    }
    kiln_common::platform::config_dir().join("kiln.toml")
}

fn default_clear_color() -> [f32; 4] {
    [1.0, 1.0, 1.0, 1.0]
}

fn default_texture_size() -> u32 {
    256
}

fn default_max_draws() -> usize {
    256
}

fn default_table_capacity() -> usize {
    4096
}

fn default_max_sets() -> u32 {
    64
}

fn default_pool_size() -> u32 {
    32
}

fn default_image_count() -> u32 {
    3
}
