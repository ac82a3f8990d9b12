//! # RustKit Image Cache
//!
//! Asynchronous image acquisition and decode-cache pipeline for the RustKit browser engine.
//!
//! This crate handles:
//! - One [`ImageCache`] per cache key, owning the download lifecycle of its URI
//! - Queuing, de-duplication and cancellation of decode requests
//! - Caching of decoded surfaces keyed by the decode parameters that produced them
//! - A lazily parsed metadata view for callers that only need size information
//! - Recovery from graphics device loss through the regular failure channel
//!
//! All cache state is owned by a single thread. Network and decoder threads only
//! ever hand results back through the [`ImageTaskDispatcher`].

use thiserror::Error;

pub mod activity;
pub mod cache;
pub mod config;
pub mod decode;
pub mod decoded;
pub mod dispatcher;
pub mod download;
pub mod encoded;
pub mod logging;
pub mod metadata;
pub mod params;
pub mod provider;
pub mod request;

#[cfg(test)]
mod testing;

pub use activity::{ImageDecodeActivity, NullActivity, TracingActivity};
pub use cache::{
    CacheStats, DownloadState, ImageCache, ImageCacheServices, ImageCallback, ImageSource,
};
pub use config::{DownloadConfig, ImageCacheConfig, DEFAULT_MAX_IMAGE_DIMENSION};
pub use decode::{
    AsyncImageDecoder, CodecDecoderFactory, DecodeResult, DecodeSink, DecodedSurface, GraphicsDevice,
    ImageDecoderFactory,
};
pub use decoded::DecodedImageCache;
pub use dispatcher::{ImageTaskDispatcher, SingleFlight, Task};
pub use download::{
    DownloadHandle, DownloadOptions, DownloadRequest, DownloadResponse, DownloadService,
    DownloadSink, HttpDownloadService,
};
pub use encoded::{EncodedImageData, ImageMetadata, ParseContext};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use metadata::{ImageMetadataView, ImageMetadataViewImpl};
pub use params::{are_decode_params_equal, ImageDecodeParams, PixelFormat};
pub use provider::ImageProvider;
pub use request::{AbortableImageOperation, ImageDecodeRequest, RequestId};

/// Errors that can occur during image operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Failed to fetch image: {0}")]
    FetchError(String),

    #[error("HTTP {status} for {uri}")]
    HttpStatus { status: u16, uri: String },

    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to decode image: {0}")]
    DecodeError(String),

    #[error("Invalid image data: {0}")]
    InvalidData(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image too large: {width}x{height} exceeds maximum")]
    TooLarge { width: u32, height: u32 },

    #[error("Graphics device lost")]
    DeviceLost,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ImageError {
    /// Whether this failure came from losing the graphics device.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, ImageError::DeviceLost)
    }

    /// Whether a fresh attempt may succeed later.
    ///
    /// A fresh attempt for a transport failure needs a new [`ImageCache`], since a
    /// cache never retries its own download.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ImageError::DeviceLost | ImageError::FetchError(_) | ImageError::HttpStatus { .. }
        )
    }

    /// Short category name used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ImageError::FetchError(_) | ImageError::HttpStatus { .. } => "transport",
            ImageError::InvalidUrl(_) => "invalid_url",
            ImageError::DecodeError(_) => "decode",
            ImageError::InvalidData(_) | ImageError::UnsupportedFormat(_) => "parse",
            ImageError::TooLarge { .. } => "too_large",
            ImageError::DeviceLost => "device_lost",
            ImageError::Config(_) => "config",
        }
    }
}

impl From<image::ImageError> for ImageError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => ImageError::UnsupportedFormat(e.to_string()),
            image::ImageError::Decoding(e) => ImageError::InvalidData(e.to_string()),
            other => ImageError::DecodeError(other.to_string()),
        }
    }
}

/// Result type for image operations
pub type ImageResult<T> = Result<T, ImageError>;
