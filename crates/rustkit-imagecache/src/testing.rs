//! Scripted collaborators for unit tests.
//!
//! Downloads and decodes only complete when the test says so, and the
//! dispatcher is drained by hand, so every interleaving is deterministic.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageFormat, Rgba, RgbaImage};

use crate::activity::ImageDecodeActivity;
use crate::decode::{AsyncImageDecoder, DecodeResult, DecodeSink, DecodedSurface, ImageDecoderFactory};
use crate::download::{DownloadHandle, DownloadRequest, DownloadResponse, DownloadService, DownloadSink};
use crate::encoded::EncodedImageData;
use crate::params::{ImageDecodeParams, PixelFormat};
use crate::request::RequestId;
use crate::{ImageError, ImageResult};

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128, 255])
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn animated_gif_bytes(width: u32, height: u32, frames: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        let frames = (0..frames).map(|i| {
            let shade = (i as u8).wrapping_mul(60);
            let image = RgbaImage::from_pixel(width, height, Rgba([shade, 0, 255 - shade, 255]));
            Frame::from_parts(image, 0, 0, Delay::from_numer_denom_ms(100, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    out
}

pub fn surface(width: u32, height: u32) -> Arc<DecodedSurface> {
    let pixels = vec![0; (width * height * 4) as usize];
    Arc::new(DecodedSurface::new(width, height, PixelFormat::Rgba8, pixels).unwrap())
}

/// Records fetches; the test completes them.
#[derive(Default)]
pub struct ManualDownloadService {
    fetches: Mutex<Vec<(DownloadRequest, DownloadSink)>>,
    start_failure: Option<ImageError>,
    aborts: Arc<AtomicUsize>,
}

impl ManualDownloadService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch fails before starting.
    pub fn failing_start(error: ImageError) -> Self {
        Self {
            start_failure: Some(error),
            ..Self::default()
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> DownloadRequest {
        self.fetches.lock().unwrap()[index].0.clone()
    }

    pub fn sink(&self, index: usize) -> DownloadSink {
        self.fetches.lock().unwrap()[index].1.clone()
    }

    pub fn succeed(&self, index: usize, bytes: Vec<u8>) {
        let response = DownloadResponse {
            url: self.request(index).absolute_uri,
            bytes,
            content_type: None,
        };
        self.sink(index).complete(Ok(response));
    }

    pub fn fail(&self, index: usize, error: ImageError) {
        self.sink(index).complete(Err(error));
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl DownloadService for ManualDownloadService {
    fn fetch(&self, request: DownloadRequest, sink: DownloadSink) -> ImageResult<Box<dyn DownloadHandle>> {
        if let Some(error) = &self.start_failure {
            return Err(error.clone());
        }
        self.fetches.lock().unwrap().push((request, sink));
        Ok(Box::new(ManualDownload {
            aborts: self.aborts.clone(),
        }))
    }
}

struct ManualDownload {
    aborts: Arc<AtomicUsize>,
}

impl DownloadHandle for ManualDownload {
    fn abort(&mut self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

struct CreatedDecoder {
    params: ImageDecodeParams,
    sink: DecodeSink,
    cancelled: Arc<AtomicBool>,
}

/// Records created decoders; the test delivers their results.
#[derive(Default)]
pub struct ManualDecoderFactory {
    created: Mutex<Vec<CreatedDecoder>>,
    failure: Mutex<Option<ImageError>>,
}

impl ManualDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `create_decoder` fail with `error`, or succeed again with `None`.
    pub fn fail_with(&self, error: Option<ImageError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn params(&self, index: usize) -> ImageDecodeParams {
        self.created.lock().unwrap()[index].params.clone()
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        self.created.lock().unwrap()[index].cancelled.load(Ordering::SeqCst)
    }

    /// Deliver through the decoder's sink, even if it was cancelled.
    pub fn deliver(&self, index: usize, result: DecodeResult) {
        let sink = self.created.lock().unwrap()[index].sink.clone();
        sink.deliver(result);
    }
}

impl ImageDecoderFactory for ManualDecoderFactory {
    fn create_decoder(
        &self,
        _data: Arc<EncodedImageData>,
        params: &ImageDecodeParams,
        sink: DecodeSink,
    ) -> ImageResult<Box<dyn AsyncImageDecoder>> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.created.lock().unwrap().push(CreatedDecoder {
            params: params.clone(),
            sink,
            cancelled: cancelled.clone(),
        });
        Ok(Box::new(ManualDecoder { cancelled }))
    }
}

struct ManualDecoder {
    cancelled: Arc<AtomicBool>,
}

impl AsyncImageDecoder for ManualDecoder {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Counts activity callbacks.
#[derive(Default)]
pub struct RecordingActivity {
    downloads_started: AtomicUsize,
    parses: AtomicUsize,
    decodes_started: AtomicUsize,
    decodes_completed: AtomicUsize,
}

impl RecordingActivity {
    pub fn downloads_started(&self) -> usize {
        self.downloads_started.load(Ordering::SeqCst)
    }

    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn decodes_started(&self) -> usize {
        self.decodes_started.load(Ordering::SeqCst)
    }

    pub fn decodes_completed(&self) -> usize {
        self.decodes_completed.load(Ordering::SeqCst)
    }
}

impl ImageDecodeActivity for RecordingActivity {
    fn download_started(&self, _uri: &str) {
        self.downloads_started.fetch_add(1, Ordering::SeqCst);
    }

    fn parse_started(&self, _image_id: u64) {
        self.parses.fetch_add(1, Ordering::SeqCst);
    }

    fn decode_started(&self, _request: RequestId, _params: &ImageDecodeParams) {
        self.decodes_started.fetch_add(1, Ordering::SeqCst);
    }

    fn decode_completed(&self, _request: RequestId, _error: Option<&ImageError>) {
        self.decodes_completed.fetch_add(1, Ordering::SeqCst);
    }
}
