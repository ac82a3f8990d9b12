//! Decode parameters and the equality rule used for caching and de-duplication.

/// Pixel layout of a decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8-bit RGBA, straight alpha.
    #[default]
    Rgba8,

    /// 8-bit BGRA, premultiplied alpha (the usual composition format).
    Bgra8Premultiplied,

    /// 8-bit single channel luminance.
    Gray8,
}

impl PixelFormat {
    /// Bytes used by one pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8Premultiplied => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// What one consumer wants a decoded image to look like.
///
/// A zero `decode_width` or `decode_height` is derived from the aspect ratio;
/// both zero means the natural size.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageDecodeParams {
    pub format: PixelFormat,
    pub decode_width: u32,
    pub decode_height: u32,

    /// Ask for GPU rather than CPU output.
    pub hardware_output: bool,

    /// Start animated images playing once decoded.
    pub autoplay: bool,

    /// Loaded-image-surface mode: the request needs a private surface and never
    /// shares a decoder or a cached result.
    pub loaded_image_surface: bool,
}

impl ImageDecodeParams {
    pub fn new(format: PixelFormat, decode_width: u32, decode_height: u32) -> Self {
        Self {
            format,
            decode_width,
            decode_height,
            ..Default::default()
        }
    }

    /// Decode at the natural size of the image.
    pub fn natural(format: PixelFormat) -> Self {
        Self::new(format, 0, 0)
    }

    pub fn hardware(mut self, hardware_output: bool) -> Self {
        self.hardware_output = hardware_output;
        self
    }

    pub fn autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn loaded_image_surface(mut self, loaded_image_surface: bool) -> Self {
        self.loaded_image_surface = loaded_image_surface;
        self
    }

    /// Whether this request may share a decoder or a cached surface with others.
    pub fn is_shareable(&self) -> bool {
        !self.loaded_image_surface
    }
}

/// Equality used for cache hits and decoder reuse.
///
/// Only the pixel format and the decode size take part. Hardware output and
/// autoplay do not change the decoded pixels.
pub fn are_decode_params_equal(a: &ImageDecodeParams, b: &ImageDecodeParams) -> bool {
    a.format == b.format && a.decode_width == b.decode_width && a.decode_height == b.decode_height
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_output_kind_and_autoplay() {
        let a = ImageDecodeParams::new(PixelFormat::Rgba8, 64, 64);
        let b = ImageDecodeParams::new(PixelFormat::Rgba8, 64, 64)
            .hardware(true)
            .autoplay(true);
        assert!(are_decode_params_equal(&a, &b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_checks_size_and_format() {
        let a = ImageDecodeParams::new(PixelFormat::Rgba8, 64, 64);
        assert!(!are_decode_params_equal(&a, &ImageDecodeParams::new(PixelFormat::Rgba8, 32, 32)));
        assert!(!are_decode_params_equal(&a, &ImageDecodeParams::new(PixelFormat::Rgba8, 64, 32)));
        assert!(!are_decode_params_equal(
            &a,
            &ImageDecodeParams::new(PixelFormat::Bgra8Premultiplied, 64, 64)
        ));
    }

    #[test]
    fn test_loaded_image_surface_is_not_shareable() {
        let params = ImageDecodeParams::natural(PixelFormat::Rgba8).loaded_image_surface(true);
        assert!(!params.is_shareable());
        assert!(ImageDecodeParams::natural(PixelFormat::Gray8).is_shareable());
        assert_eq!(PixelFormat::Gray8.bytes_per_pixel(), 1);
    }
}
