//! Decoder seams and the codec-backed decoder.
//!
//! The cache talks to decoders only through [`ImageDecoderFactory`] and
//! [`AsyncImageDecoder`]. Decoders run off the owning thread and report back
//! through a [`DecodeSink`], which posts the result onto the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use image::imageops::FilterType;
use image::DynamicImage;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cache::ImageCache;
use crate::dispatcher::ImageTaskDispatcher;
use crate::encoded::EncodedImageData;
use crate::params::{ImageDecodeParams, PixelFormat};
use crate::request::DecoderOwner;
use crate::{ImageError, ImageResult};

/// Outcome of one decode. `Ok(None)` is a successful decode that produced no surface.
pub type DecodeResult = ImageResult<Option<Arc<DecodedSurface>>>;

/// Handle to the graphics device that backs hardware surfaces.
#[derive(Debug)]
pub struct GraphicsDevice {
    id: u64,
    lost: AtomicBool,
}

impl GraphicsDevice {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            lost: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        debug!(device = self.id, "Graphics device lost");
        self.lost.store(true, Ordering::Release);
    }

    /// The device was reclaimed; decodes may be retried.
    pub fn recover(&self) {
        debug!(device = self.id, "Graphics device recovered");
        self.lost.store(false, Ordering::Release);
    }
}

impl Default for GraphicsDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded image ready for composition.
#[derive(Clone)]
pub struct DecodedSurface {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Produced for hardware output. CPU and GPU consumers share surfaces.
    pub hardware: bool,

    /// Frame index for animated images, 0 otherwise.
    pub frame_index: u32,

    pixels: Vec<u8>,
}

impl std::fmt::Debug for DecodedSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedSurface")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("hardware", &self.hardware)
            .field("frame_index", &self.frame_index)
            .finish_non_exhaustive()
    }
}

impl DecodedSurface {
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Vec<u8>) -> ImageResult<Self> {
        let expected = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(format.bytes_per_pixel());
        if pixels.len() != expected {
            return Err(ImageError::DecodeError(format!(
                "pixel buffer length mismatch: got {}, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            hardware: false,
            frame_index: 0,
            pixels,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }
}

/// A decode running off the owning thread.
///
/// Exactly one request owns a decoder at a time. Dropping it must stop delivery.
pub trait AsyncImageDecoder: Send {
    /// Stop decoding. No result is delivered after this returns.
    fn cancel(&mut self);
}

/// Creates decoders for encoded data.
pub trait ImageDecoderFactory: Send + Sync {
    /// Start decoding `data` for `params`, reporting through `sink`.
    ///
    /// Returns [`ImageError::DeviceLost`] when the graphics device is gone; the
    /// cache turns that into a deferred per-request failure.
    fn create_decoder(
        &self,
        data: Arc<EncodedImageData>,
        params: &ImageDecodeParams,
        sink: DecodeSink,
    ) -> ImageResult<Box<dyn AsyncImageDecoder>>;
}

/// Where a decoder delivers results. Safe to use from any thread.
#[derive(Clone)]
pub struct DecodeSink {
    cache: Weak<ImageCache>,
    dispatcher: ImageTaskDispatcher,
    owner: DecoderOwner,
}

impl DecodeSink {
    pub(crate) fn new(cache: Weak<ImageCache>, dispatcher: ImageTaskDispatcher, owner: DecoderOwner) -> Self {
        Self {
            cache,
            dispatcher,
            owner,
        }
    }

    /// Hand a result back to the owning cache.
    ///
    /// Never touches cache state directly; the result is posted to the
    /// dispatcher and routed to whichever request owns the decoder by then.
    pub fn deliver(&self, result: DecodeResult) {
        ImageCache::on_decode(&self.cache, &self.dispatcher, &self.owner, result);
    }
}

/// Decodes with the `image` crate on tokio's blocking pool.
pub struct CodecDecoderFactory {
    runtime: Handle,
    device: Option<Arc<GraphicsDevice>>,
}

impl CodecDecoderFactory {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            device: None,
        }
    }

    /// Use `device` for hardware output.
    pub fn with_device(mut self, device: Arc<GraphicsDevice>) -> Self {
        self.device = Some(device);
        self
    }
}

impl ImageDecoderFactory for CodecDecoderFactory {
    fn create_decoder(
        &self,
        data: Arc<EncodedImageData>,
        params: &ImageDecodeParams,
        sink: DecodeSink,
    ) -> ImageResult<Box<dyn AsyncImageDecoder>> {
        if params.hardware_output {
            match &self.device {
                None => {
                    return Err(ImageError::DecodeError(
                        "hardware output requested without a graphics device".into(),
                    ))
                }
                Some(device) if device.is_lost() => return Err(ImageError::DeviceLost),
                Some(_) => {}
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let params = params.clone();
        let device = self.device.clone();

        let task = self.runtime.spawn_blocking(move || {
            if flag.load(Ordering::Acquire) {
                return;
            }
            let mut result = decode_surface(&data, &params);
            if params.hardware_output && device.as_ref().is_some_and(|d| d.is_lost()) {
                result = Err(ImageError::DeviceLost);
            }
            if !flag.load(Ordering::Acquire) {
                sink.deliver(result.map(|surface| Some(Arc::new(surface))));
            }
        });

        Ok(Box::new(CodecDecoder { cancelled, task }))
    }
}

struct CodecDecoder {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AsyncImageDecoder for CodecDecoder {
    fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            trace!("Codec decode cancelled");
            self.task.abort();
        }
    }
}

impl Drop for CodecDecoder {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Decode the first frame of `data` into the shape `params` asks for.
pub fn decode_surface(data: &EncodedImageData, params: &ImageDecodeParams) -> ImageResult<DecodedSurface> {
    let format = data
        .format()
        .ok_or_else(|| ImageError::UnsupportedFormat("unrecognized signature".into()))?;
    let image = image::load_from_memory_with_format(data.bytes(), format)?;

    let natural = (image.width(), image.height());
    let (width, height) = target_size(natural, params.decode_width, params.decode_height);
    let image = if (width, height) != natural {
        image.resize_exact(width, height, FilterType::Triangle)
    } else {
        image
    };

    let mut surface = DecodedSurface::new(width, height, params.format, convert(&image, params.format))?;
    surface.hardware = params.hardware_output;
    Ok(surface)
}

fn target_size((natural_w, natural_h): (u32, u32), width: u32, height: u32) -> (u32, u32) {
    let aspect = natural_w as f64 / natural_h.max(1) as f64;
    match (width, height) {
        (0, 0) => (natural_w, natural_h),
        (0, h) => (((h as f64 * aspect).round() as u32).max(1), h),
        (w, 0) => (w, ((w as f64 / aspect).round() as u32).max(1)),
        (w, h) => (w, h),
    }
}

fn convert(image: &DynamicImage, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba8 => image.to_rgba8().into_raw(),
        PixelFormat::Gray8 => image.to_luma8().into_raw(),
        PixelFormat::Bgra8Premultiplied => {
            let mut raw = image.to_rgba8().into_raw();
            for px in raw.chunks_exact_mut(4) {
                let alpha = px[3];
                let (r, g, b) = (px[0], px[1], px[2]);
                px[0] = premultiply(b, alpha);
                px[1] = premultiply(g, alpha);
                px[2] = premultiply(r, alpha);
            }
            raw
        }
    }
}

fn premultiply(channel: u8, alpha: u8) -> u8 {
    ((channel as u32 * alpha as u32 + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::cache::{ImageCache, ImageCacheServices, ImageSource};
    use crate::request::RequestId;
    use crate::testing::{animated_gif_bytes, png_bytes, ManualDownloadService};

    type Results = Arc<Mutex<Vec<DecodeResult>>>;

    fn codec_cache(factory: CodecDecoderFactory) -> (Arc<ImageCache>, ImageTaskDispatcher, Arc<ManualDownloadService>) {
        let dispatcher = ImageTaskDispatcher::new();
        let downloads = Arc::new(ManualDownloadService::new());
        let services = ImageCacheServices::new(downloads.clone(), Arc::new(factory), dispatcher.clone());
        let cache = ImageCache::new(ImageSource::new("https://example.com/codec.png"), services);
        (cache, dispatcher, downloads)
    }

    /// Queue a request, complete the download and wait for the first result.
    fn decode_through_cache(factory: CodecDecoderFactory, params: ImageDecodeParams) -> Vec<DecodeResult> {
        let (cache, dispatcher, downloads) = codec_cache(factory);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let _request = cache.get_image(params, move |result| sink.lock().unwrap().push(result));

        dispatcher.run_until_idle(4);
        downloads.succeed(0, png_bytes(8, 4));
        let deadline = Instant::now() + Duration::from_secs(5);
        while results.lock().unwrap().is_empty() && Instant::now() < deadline {
            dispatcher.wait_and_drain(Duration::from_millis(50));
        }
        let delivered = results.lock().unwrap().clone();
        delivered
    }

    #[test]
    fn test_target_size() {
        assert_eq!(target_size((200, 100), 0, 0), (200, 100));
        assert_eq!(target_size((200, 100), 100, 0), (100, 50));
        assert_eq!(target_size((200, 100), 0, 10), (20, 10));
        assert_eq!(target_size((200, 100), 7, 9), (7, 9));
    }

    #[test]
    fn test_premultiply() {
        assert_eq!(premultiply(255, 255), 255);
        assert_eq!(premultiply(255, 0), 0);
        assert_eq!(premultiply(200, 128), 100);
    }

    #[test]
    fn test_decode_surface_resizes_and_converts() {
        let data = EncodedImageData::new(png_bytes(8, 4), None, 100);

        let rgba = decode_surface(&data, &ImageDecodeParams::natural(PixelFormat::Rgba8)).unwrap();
        assert_eq!((rgba.width, rgba.height), (8, 4));
        assert_eq!(rgba.byte_size(), 8 * 4 * 4);

        let gray = decode_surface(&data, &ImageDecodeParams::new(PixelFormat::Gray8, 4, 0)).unwrap();
        assert_eq!((gray.width, gray.height), (4, 2));
        assert_eq!(gray.byte_size(), 8);

        let bgra = decode_surface(
            &data,
            &ImageDecodeParams::new(PixelFormat::Bgra8Premultiplied, 2, 2).hardware(true),
        )
        .unwrap();
        assert!(bgra.hardware);
        assert_eq!(bgra.byte_size(), 16);
    }

    #[test]
    fn test_decode_surface_takes_first_frame_of_animation() {
        let data = EncodedImageData::new(animated_gif_bytes(6, 6, 3), None, 100);
        let surface = decode_surface(&data, &ImageDecodeParams::natural(PixelFormat::Rgba8)).unwrap();
        assert_eq!((surface.width, surface.height), (6, 6));
        assert_eq!(surface.frame_index, 0);
    }

    #[test]
    fn test_surface_length_is_checked() {
        assert!(DecodedSurface::new(2, 2, PixelFormat::Rgba8, vec![0; 15]).is_err());
        assert!(DecodedSurface::new(2, 2, PixelFormat::Gray8, vec![0; 4]).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_codec_decoder_delivers_through_cache() {
        let results = decode_through_cache(
            CodecDecoderFactory::new(Handle::current()),
            ImageDecodeParams::new(PixelFormat::Rgba8, 4, 0),
        );
        assert_eq!(results.len(), 1);
        match &results[0] {
            Ok(Some(surface)) => {
                assert_eq!((surface.width, surface.height), (4, 2));
                assert!(!surface.hardware);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_codec_hardware_output_on_live_device() {
        let device = Arc::new(GraphicsDevice::new());
        let results = decode_through_cache(
            CodecDecoderFactory::new(Handle::current()).with_device(device),
            ImageDecodeParams::natural(PixelFormat::Bgra8Premultiplied).hardware(true),
        );
        assert!(matches!(&results[0], Ok(Some(surface)) if surface.hardware));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_codec_hardware_output_without_device_fails() {
        let results = decode_through_cache(
            CodecDecoderFactory::new(Handle::current()),
            ImageDecodeParams::natural(PixelFormat::Rgba8).hardware(true),
        );
        assert!(matches!(&results[0], Err(ImageError::DecodeError(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_codec_lost_device_reports_device_lost() {
        let device = Arc::new(GraphicsDevice::new());
        device.mark_lost();
        let results = decode_through_cache(
            CodecDecoderFactory::new(Handle::current()).with_device(device),
            ImageDecodeParams::natural(PixelFormat::Rgba8).hardware(true),
        );
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], Err(ImageError::DeviceLost)));
    }

    #[test]
    fn test_cancelled_codec_decoder_never_delivers() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .build()
            .unwrap();
        let (release, blocked) = std::sync::mpsc::channel::<()>();
        runtime.spawn_blocking(move || blocked.recv());

        let dispatcher = ImageTaskDispatcher::new();
        let factory = CodecDecoderFactory::new(runtime.handle().clone());
        let data = Arc::new(EncodedImageData::new(png_bytes(4, 4), None, 100));
        let params = ImageDecodeParams::natural(PixelFormat::Rgba8);
        let sink = || DecodeSink::new(Weak::new(), dispatcher.clone(), DecoderOwner::new(RequestId::new()));

        let mut cancelled = factory.create_decoder(data.clone(), &params, sink()).unwrap();
        let _kept = factory.create_decoder(data, &params, sink()).unwrap();
        cancelled.cancel();
        release.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.pending() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        runtime.shutdown_timeout(Duration::from_secs(5));
        assert_eq!(dispatcher.pending(), 1);
    }

    #[test]
    fn test_graphics_device_identity_and_loss() {
        let a = GraphicsDevice::new();
        let b = GraphicsDevice::new();
        assert_ne!(a.id(), b.id());
        assert!(!a.is_lost());
        a.mark_lost();
        assert!(a.is_lost());
        a.recover();
        assert!(!a.is_lost());
    }
}
