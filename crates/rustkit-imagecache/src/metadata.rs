//! Read-mostly metadata view shared by callers that only need size information.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::activity::{ImageDecodeActivity, NullActivity};
use crate::decode::GraphicsDevice;
use crate::encoded::{EncodedImageData, ImageMetadata, ParseContext};
use crate::{ImageError, ImageResult};

/// Shared handle returned by [`crate::ImageCache::get_metadata_view`].
pub type ImageMetadataView = Arc<ImageMetadataViewImpl>;

struct ViewState {
    encoded: Option<Arc<EncodedImageData>>,
    download_result: ImageResult<()>,

    /// `None` while a parse is owed.
    parsed: Option<ImageResult<ImageMetadata>>,
    progress: f32,
    device: Option<Weak<GraphicsDevice>>,
    max_root_size: Option<(u32, u32)>,
    max_image_dimension: u32,
}

/// Lazily parsed view of an image's metadata.
///
/// The header parse runs on first access and again only after the graphics
/// device or the max root size actually changes.
pub struct ImageMetadataViewImpl {
    state: Mutex<ViewState>,
}

impl ImageMetadataViewImpl {
    pub(crate) fn new(
        encoded: Option<Arc<EncodedImageData>>,
        download_error: Option<ImageError>,
        progress: f32,
        device: Option<&Arc<GraphicsDevice>>,
        max_image_dimension: u32,
    ) -> Self {
        Self {
            state: Mutex::new(ViewState {
                encoded,
                download_result: download_error.map_or(Ok(()), Err),
                parsed: None,
                progress,
                device: device.map(Arc::downgrade),
                max_root_size: None,
                max_image_dimension,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Result of the download and header parse so far.
    ///
    /// `Ok` while the download is still pending. Triggers the lazy parse once
    /// the encoded data is available.
    pub fn get_hr(&self, activity: &dyn ImageDecodeActivity, image_id: u64) -> ImageResult<()> {
        let mut state = self.lock();
        state.download_result.clone()?;
        ensure_parsed(&mut state, activity, image_id);
        match &state.parsed {
            Some(Err(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Parsed metadata, or `None` before the download finishes or after a failure.
    pub fn get_image_metadata(&self) -> Option<ImageMetadata> {
        let mut state = self.lock();
        if state.download_result.is_err() {
            return None;
        }
        ensure_parsed(&mut state, &NullActivity, 0);
        state.parsed.as_ref().and_then(|p| p.as_ref().ok()).cloned()
    }

    pub fn get_download_progress(&self) -> f32 {
        self.lock().progress
    }

    /// Re-arms the parse only when `device` differs from the current one.
    pub fn set_graphics_device(&self, device: Option<&Arc<GraphicsDevice>>) {
        let mut state = self.lock();
        let same = match (&state.device, device) {
            (None, None) => true,
            (Some(current), Some(new)) => Weak::ptr_eq(current, &Arc::downgrade(new)),
            _ => false,
        };
        if !same {
            trace!("Graphics device changed, metadata parse re-armed");
            state.device = device.map(Arc::downgrade);
            state.parsed = None;
        }
    }

    /// Re-arms the parse only when `size` differs from the current one.
    pub fn set_max_root_size(&self, size: Option<(u32, u32)>) {
        let mut state = self.lock();
        if state.max_root_size != size {
            trace!(?size, "Max root size changed, metadata parse re-armed");
            state.max_root_size = size;
            state.parsed = None;
        }
    }

    pub(crate) fn set_encoded_image_data(&self, encoded: Arc<EncodedImageData>) {
        let mut state = self.lock();
        state.encoded = Some(encoded);
        state.parsed = None;
    }

    pub(crate) fn set_download_error(&self, error: ImageError) {
        self.lock().download_result = Err(error);
    }

    pub(crate) fn set_download_progress(&self, progress: f32) {
        let mut state = self.lock();
        if progress > state.progress {
            state.progress = progress;
        }
    }
}

fn ensure_parsed(state: &mut ViewState, activity: &dyn ImageDecodeActivity, image_id: u64) {
    if state.parsed.is_some() {
        return;
    }
    let Some(encoded) = state.encoded.clone() else {
        return;
    };
    activity.parse_started(image_id);
    let ctx = ParseContext {
        device: state.device.as_ref().and_then(Weak::upgrade),
        max_root_size: state.max_root_size,
        max_image_dimension: state.max_image_dimension,
    };
    state.parsed = Some(encoded.parse(&ctx));
}
