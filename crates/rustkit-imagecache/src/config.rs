//! Image cache configuration

use serde::{Deserialize, Serialize};

use crate::{ImageError, ImageResult};

/// Default limit on either image dimension.
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 16384;

/// Image cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Caches the provider keeps alive after their last outside reference
    pub retained_caches: usize,

    /// Largest width or height accepted when parsing
    pub max_image_dimension: u32,

    /// Bypass the network cache for every download
    pub ignore_network_cache: bool,

    /// Transport settings
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Maximum redirects followed when redirects are allowed
    pub max_redirects: usize,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            retained_caches: 64,
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            ignore_network_cache: false,
            download: DownloadConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("RustKit/{} (Image Loader)", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
        }
    }
}

impl ImageCacheConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ImageResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ImageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ImageResult<()> {
        if self.max_image_dimension == 0 {
            return Err(ImageError::Config("max_image_dimension must be positive".into()));
        }
        if self.download.timeout_secs == 0 {
            return Err(ImageError::Config("download.timeout_secs must be positive".into()));
        }
        if self.download.user_agent.trim().is_empty() {
            return Err(ImageError::Config("download.user_agent must not be empty".into()));
        }
        Ok(())
    }
}
