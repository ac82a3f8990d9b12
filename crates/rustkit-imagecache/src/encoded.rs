//! Downloaded, still-encoded image bytes and their lazily parsed metadata.

use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, ImageFormat};
use tracing::{debug, trace};

use crate::decode::GraphicsDevice;
use crate::download::DownloadResponse;
use crate::{ImageError, ImageResult};

/// Metadata read from the encoded image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Natural width of the image
    pub width: u32,

    /// Natural height of the image
    pub height: u32,

    pub format: ImageFormat,
    pub animated: bool,

    /// Resource scale, 100 for an unscaled asset.
    pub scale_percent: u32,

    /// Largest size worth decoding, clamped to the max root size when one is known.
    pub max_decode_width: u32,
    pub max_decode_height: u32,
}

/// Inputs that influence parsing. A change in any of them forces a re-parse.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub device: Option<Arc<GraphicsDevice>>,
    pub max_root_size: Option<(u32, u32)>,
    pub max_image_dimension: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParseKey {
    device_id: Option<u64>,
    max_root_size: Option<(u32, u32)>,
    max_image_dimension: u32,
}

impl From<&ParseContext> for ParseKey {
    fn from(ctx: &ParseContext) -> Self {
        Self {
            device_id: ctx.device.as_ref().map(|d| d.id()),
            max_root_size: ctx.max_root_size,
            max_image_dimension: ctx.max_image_dimension,
        }
    }
}

/// Raw bytes of one successful download.
///
/// Immutable once created; only the parse memo changes.
pub struct EncodedImageData {
    bytes: Vec<u8>,
    content_type: Option<String>,
    scale_percent: u32,
    format: Option<ImageFormat>,
    animated: bool,
    parsed: Mutex<Option<(ParseKey, ImageMetadata)>>,
}

impl std::fmt::Debug for EncodedImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedImageData")
            .field("len", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("scale_percent", &self.scale_percent)
            .field("format", &self.format)
            .field("animated", &self.animated)
            .finish_non_exhaustive()
    }
}

impl EncodedImageData {
    pub fn new(bytes: Vec<u8>, content_type: Option<String>, scale_percent: u32) -> Self {
        let format = image::guess_format(&bytes).ok();
        let animated = format.is_some_and(|f| sniff_animation(f, &bytes));
        trace!(len = bytes.len(), ?format, animated, "Encoded image data created");
        Self {
            bytes,
            content_type,
            scale_percent,
            format,
            animated,
            parsed: Mutex::new(None),
        }
    }

    /// Build from a finished download; the scale comes from the response URL.
    pub fn from_response(response: DownloadResponse) -> Self {
        let scale_percent = scale_percent_from_uri(&response.url);
        Self::new(response.bytes, response.content_type, scale_percent)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn scale_percent(&self) -> u32 {
        self.scale_percent
    }

    /// Animated images never share decode output across requests.
    pub fn is_animated(&self) -> bool {
        self.animated
    }

    /// Whether a parse for this exact context is already memoized.
    pub fn is_parsed(&self, ctx: &ParseContext) -> bool {
        let key = ParseKey::from(ctx);
        self.parsed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(k, _)| *k == key)
    }

    /// Read the image header.
    ///
    /// Memoized per parse context; failures are not memoized.
    pub fn parse(&self, ctx: &ParseContext) -> ImageResult<ImageMetadata> {
        let key = ParseKey::from(ctx);
        let mut parsed = self.parsed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((k, metadata)) = parsed.as_ref() {
            if *k == key {
                return Ok(metadata.clone());
            }
        }

        if ctx.device.as_ref().is_some_and(|d| d.is_lost()) {
            return Err(ImageError::DeviceLost);
        }

        let format = self.format.ok_or_else(|| {
            ImageError::UnsupportedFormat(
                self.content_type
                    .clone()
                    .unwrap_or_else(|| "unrecognized signature".into()),
            )
        })?;

        let (width, height) =
            image::ImageReader::with_format(Cursor::new(&self.bytes), format).into_dimensions()?;
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidData(format!("empty image {width}x{height}")));
        }
        if ctx.max_image_dimension > 0
            && (width > ctx.max_image_dimension || height > ctx.max_image_dimension)
        {
            return Err(ImageError::TooLarge { width, height });
        }

        let (max_decode_width, max_decode_height) = match ctx.max_root_size {
            Some(root) => fit_within((width, height), root),
            None => (width, height),
        };

        let metadata = ImageMetadata {
            width,
            height,
            format,
            animated: self.animated,
            scale_percent: self.scale_percent,
            max_decode_width,
            max_decode_height,
        };
        debug!(width, height, ?format, animated = self.animated, "Parsed image header");
        *parsed = Some((key, metadata.clone()));
        Ok(metadata)
    }
}

fn sniff_animation(format: ImageFormat, bytes: &[u8]) -> bool {
    match format {
        ImageFormat::Gif => GifDecoder::new(Cursor::new(bytes))
            .map(|decoder| decoder.into_frames().take(2).filter(|f| f.is_ok()).count() > 1)
            .unwrap_or(false),
        ImageFormat::Png => PngDecoder::new(Cursor::new(bytes))
            .and_then(|decoder| decoder.is_apng())
            .unwrap_or(false),
        ImageFormat::WebP => WebPDecoder::new(Cursor::new(bytes))
            .map(|decoder| decoder.has_animation())
            .unwrap_or(false),
        _ => false,
    }
}

/// Scale the size down (never up) so it fits inside `bounds`, preserving aspect ratio.
fn fit_within((width, height): (u32, u32), (max_w, max_h): (u32, u32)) -> (u32, u32) {
    if max_w == 0 || max_h == 0 || (width <= max_w && height <= max_h) {
        return (width, height);
    }
    let scale = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

/// Resource scale encoded in a file name: `logo.scale-200.png` or `logo@2x.png`.
pub(crate) fn scale_percent_from_uri(uri: &str) -> u32 {
    let name = uri
        .split(['?', '#'])
        .next()
        .unwrap_or(uri)
        .rsplit('/')
        .next()
        .unwrap_or_default();

    for part in name.split('.') {
        if let Some(value) = part.strip_prefix("scale-") {
            if let Ok(percent) = value.parse::<u32>() {
                return percent;
            }
        }
        if let Some((_, density)) = part.rsplit_once('@') {
            if let Ok(d) = density.trim_end_matches('x').parse::<f64>() {
                return (d * 100.0).round() as u32;
            }
        }
    }
    100
}
