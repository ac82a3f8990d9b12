//! Decode activity hooks.
//!
//! An [`ImageDecodeActivity`] is handed to the cache at construction and told
//! about every download, parse and decode. The default implementation writes
//! `tracing` events; tests plug in recorders.

use tracing::{debug, info, warn};

use crate::params::ImageDecodeParams;
use crate::request::RequestId;
use crate::ImageError;

pub trait ImageDecodeActivity: Send + Sync {
    fn download_started(&self, _uri: &str) {}

    fn download_completed(&self, _uri: &str, _error: Option<&ImageError>) {}

    fn metadata_view_requested(&self, _image_id: u64) {}

    /// A header parse is about to run. `image_id` is the caller's image id, or the
    /// raw request id for parses triggered by a decode.
    fn parse_started(&self, _image_id: u64) {}

    fn decode_started(&self, _request: RequestId, _params: &ImageDecodeParams) {}

    fn decode_completed(&self, _request: RequestId, _error: Option<&ImageError>) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullActivity;

impl ImageDecodeActivity for NullActivity {}

/// Emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivity;

impl ImageDecodeActivity for TracingActivity {
    fn download_started(&self, uri: &str) {
        info!(uri, "Image download started");
    }

    fn download_completed(&self, uri: &str, error: Option<&ImageError>) {
        match error {
            None => info!(uri, "Image download completed"),
            Some(err) => warn!(uri, error = %err, category = err.category(), "Image download failed"),
        }
    }

    fn metadata_view_requested(&self, image_id: u64) {
        debug!(image_id, "Metadata view requested");
    }

    fn parse_started(&self, image_id: u64) {
        debug!(image_id, "Parsing image header");
    }

    fn decode_started(&self, request: RequestId, params: &ImageDecodeParams) {
        debug!(
            request_id = request.raw(),
            format = ?params.format,
            width = params.decode_width,
            height = params.decode_height,
            hardware = params.hardware_output,
            "Decode started"
        );
    }

    fn decode_completed(&self, request: RequestId, error: Option<&ImageError>) {
        match error {
            None => debug!(request_id = request.raw(), "Decode completed"),
            Some(err) => warn!(request_id = request.raw(), error = %err, "Decode failed"),
        }
    }
}
