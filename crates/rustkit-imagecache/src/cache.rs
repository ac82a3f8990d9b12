//! The per-key image cache.
//!
//! An [`ImageCache`] owns one cache key: the download of its URI, the decode
//! requests waiting on that download, the decodes in flight and the decoded
//! surfaces produced so far. Its state is only ever advanced on the thread
//! that owns its [`ImageTaskDispatcher`]; downloads and decoders post their
//! results back through sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace, warn};

use crate::activity::{ImageDecodeActivity, TracingActivity};
use crate::config::DEFAULT_MAX_IMAGE_DIMENSION;
use crate::decode::{AsyncImageDecoder, DecodeResult, DecodeSink, GraphicsDevice, ImageDecoderFactory};
use crate::decoded::DecodedImageCache;
use crate::dispatcher::{ImageTaskDispatcher, SingleFlight};
use crate::download::{DownloadHandle, DownloadOptions, DownloadRequest, DownloadResponse, DownloadService, DownloadSink};
use crate::encoded::{EncodedImageData, ParseContext};
use crate::metadata::{ImageMetadataView, ImageMetadataViewImpl};
use crate::params::{are_decode_params_equal, ImageDecodeParams};
use crate::provider::ProviderRegistry;
use crate::request::{CallbackGate, DecoderOwner, ImageDecodeRequest, RequestId};
use crate::{ImageError, ImageResult};

/// Callback invoked with each decode result for a request.
///
/// Animated images may invoke it more than once.
pub type ImageCallback = Arc<dyn Fn(DecodeResult) + Send + Sync + 'static>;

/// Where an image comes from and how it is indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// URI as written by the document
    pub uri: String,

    /// Fully resolved URI used for the fetch
    pub absolute_uri: String,

    /// Logical identity of the image. `None` for an un-indexed instance.
    pub cache_key: Option<String>,

    /// Bypass the network cache when downloading.
    pub ignore_network_cache: bool,
}

impl ImageSource {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            absolute_uri: uri.clone(),
            cache_key: Some(uri.clone()),
            uri,
            ignore_network_cache: false,
        }
    }

    pub fn with_absolute_uri(mut self, absolute_uri: impl Into<String>) -> Self {
        self.absolute_uri = absolute_uri.into();
        self
    }

    pub fn with_cache_key(mut self, cache_key: Option<String>) -> Self {
        self.cache_key = cache_key;
        self
    }

    pub fn ignore_network_cache(mut self, ignore: bool) -> Self {
        self.ignore_network_cache = ignore;
        self
    }
}

/// Collaborators injected into every cache.
#[derive(Clone)]
pub struct ImageCacheServices {
    pub downloader: Arc<dyn DownloadService>,
    pub decoders: Arc<dyn ImageDecoderFactory>,
    pub dispatcher: ImageTaskDispatcher,
    pub activity: Arc<dyn ImageDecodeActivity>,

    /// Device consulted when parsing. `None` for software-only pipelines.
    pub device: Option<Arc<GraphicsDevice>>,

    /// Images larger than this in either dimension fail to parse.
    pub max_image_dimension: u32,
}

impl ImageCacheServices {
    pub fn new(
        downloader: Arc<dyn DownloadService>,
        decoders: Arc<dyn ImageDecoderFactory>,
        dispatcher: ImageTaskDispatcher,
    ) -> Self {
        Self {
            downloader,
            decoders,
            dispatcher,
            activity: Arc::new(TracingActivity),
            device: None,
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
        }
    }

    pub fn with_activity(mut self, activity: Arc<dyn ImageDecodeActivity>) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_device(mut self, device: Arc<GraphicsDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_max_image_dimension(mut self, max: u32) -> Self {
        self.max_image_dimension = max;
        self
    }
}

/// Download lifecycle. `Downloaded` and `DownloadFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloading,
    Downloaded,
    DownloadFailed,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests answered from a decoded surface
    pub hits: u64,

    /// Requests that had to wait for a decode
    pub misses: u64,

    /// Decoders created
    pub decoders_created: u64,

    /// Requests that joined a decode already in flight
    pub decoders_reused: u64,

    /// Decoders handed to another request after their owner was released
    pub decoders_transferred: u64,

    /// Requests that received a failure
    pub failures: u64,
}

impl CacheStats {
    /// Get the hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Latest reported download progress, shared with the download sink.
pub(crate) struct ProgressCell {
    latest: AtomicU32,
    task: SingleFlight,
}

impl ProgressCell {
    fn new() -> Self {
        Self {
            latest: AtomicU32::new(0f32.to_bits()),
            task: SingleFlight::new(),
        }
    }

    fn store(&self, fraction: f32) {
        self.latest.store(fraction.to_bits(), Ordering::Release);
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.latest.load(Ordering::Acquire))
    }
}

struct AttachedDecoder {
    decoder: Box<dyn AsyncImageDecoder>,
    owner: DecoderOwner,
}

struct RequestSlot {
    params: ImageDecodeParams,
    callback: ImageCallback,
    gate: Arc<CallbackGate>,
    decoder: Option<AttachedDecoder>,

    /// Received a successful result.
    resolved: bool,
}

struct Notification {
    callback: ImageCallback,
    gate: Arc<CallbackGate>,
    result: DecodeResult,
}

impl Notification {
    fn new(slot: &RequestSlot, result: DecodeResult) -> Self {
        Self {
            callback: slot.callback.clone(),
            gate: slot.gate.clone(),
            result,
        }
    }
}

#[derive(Default)]
struct CacheState {
    state: DownloadState,
    encoded: Option<Arc<EncodedImageData>>,
    download_error: Option<ImageError>,
    download_progress: f32,
    download: Option<Box<dyn DownloadHandle>>,
    requests: HashMap<RequestId, RequestSlot>,

    /// Waiting for the download, served last-in first-out.
    decode_requests: Vec<RequestId>,

    /// Decoding or decoded, in the order they began.
    decoding_requests: Vec<RequestId>,
    decoded_images: Vec<Arc<DecodedImageCache>>,
    metadata_view: Option<ImageMetadataView>,
    stats: CacheStats,
}

impl CacheState {
    fn is_animated(&self) -> bool {
        self.encoded.as_ref().is_some_and(|e| e.is_animated())
    }

    fn find_decoded(&self, params: &ImageDecodeParams) -> Option<Arc<DecodedImageCache>> {
        if !params.is_shareable() || self.is_animated() {
            return None;
        }
        self.decoded_images
            .iter()
            .find(|entry| entry.is_valid() && are_decode_params_equal(entry.params(), params))
            .cloned()
    }

    /// An unresolved shareable decode with equal params is already under way.
    fn has_shared_decode(&self, params: &ImageDecodeParams) -> bool {
        self.decoding_requests.iter().any(|id| {
            self.requests.get(id).is_some_and(|slot| {
                !slot.resolved && slot.params.is_shareable() && are_decode_params_equal(&slot.params, params)
            })
        })
    }

    /// Requests in `decoding_requests` still waiting on someone else's decoder.
    fn is_waiter(&self, id: &RequestId, params: &ImageDecodeParams) -> bool {
        self.requests.get(id).is_some_and(|slot| {
            !slot.resolved
                && slot.decoder.is_none()
                && slot.params.is_shareable()
                && are_decode_params_equal(&slot.params, params)
        })
    }
}

/// Download and decode orchestration for one cache key.
pub struct ImageCache {
    source: ImageSource,
    services: ImageCacheServices,
    weak_self: Weak<ImageCache>,
    process_task: SingleFlight,
    progress: Arc<ProgressCell>,
    provider_released: AtomicBool,
    registry: Mutex<Option<Weak<ProviderRegistry>>>,
    inner: Mutex<CacheState>,
}

impl ImageCache {
    pub fn new(source: ImageSource, services: ImageCacheServices) -> Arc<Self> {
        debug!(uri = %source.uri, key = ?source.cache_key, "Creating image cache");
        Arc::new_cyclic(|weak_self| Self {
            source,
            services,
            weak_self: weak_self.clone(),
            process_task: SingleFlight::new(),
            progress: Arc::new(ProgressCell::new()),
            provider_released: AtomicBool::new(false),
            registry: Mutex::new(None),
            inner: Mutex::new(CacheState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach_registry(&self, registry: Weak<ProviderRegistry>) {
        *self.registry.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }

    /// Ask for the image decoded as `params`.
    ///
    /// A matching decoded surface is handed to `callback` before this returns
    /// and `None` is returned. Otherwise the request is queued and its handle
    /// returned; dropping the handle cancels it.
    #[must_use = "dropping the request cancels it"]
    pub fn get_image<F>(self: &Arc<Self>, params: ImageDecodeParams, callback: F) -> Option<ImageDecodeRequest>
    where
        F: Fn(DecodeResult) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(entry) = state.find_decoded(&params) {
            state.stats.hits += 1;
            drop(state);
            trace!(uri = %self.source.uri, entry = entry.id(), "Decoded surface cache hit");
            callback(Ok(Some(entry.surface().clone())));
            return None;
        }

        state.stats.misses += 1;
        let id = RequestId::new();
        let gate = CallbackGate::new();
        state.requests.insert(
            id,
            RequestSlot {
                params: params.clone(),
                callback: Arc::new(callback),
                gate: gate.clone(),
                decoder: None,
                resolved: false,
            },
        );
        state.decode_requests.push(id);
        drop(state);

        trace!(uri = %self.source.uri, request_id = id.raw(), "Queued decode request");
        self.trigger_process_decode_requests();
        Some(ImageDecodeRequest::new(self.clone(), id, params, gate))
    }

    /// The shared metadata view. Starts the download if nothing has started it yet.
    pub fn get_metadata_view(&self, activity: &dyn ImageDecodeActivity, image_id: u64) -> ImageMetadataView {
        activity.metadata_view_requested(image_id);

        let mut guard = self.lock();
        let state = &mut *guard;
        let view = match &state.metadata_view {
            Some(view) => view.clone(),
            None => {
                let view = Arc::new(ImageMetadataViewImpl::new(
                    state.encoded.clone(),
                    state.download_error.clone(),
                    state.download_progress,
                    self.services.device.as_ref(),
                    self.services.max_image_dimension,
                ));
                state.metadata_view = Some(view.clone());
                view
            }
        };
        let start_download = state.state == DownloadState::NotDownloaded;
        drop(guard);

        if start_download {
            self.download();
        }
        view
    }

    /// Start fetching the image.
    ///
    /// # Panics
    ///
    /// If a download was already started for this cache.
    pub fn download(&self) {
        {
            let mut state = self.lock();
            assert_eq!(
                state.state,
                DownloadState::NotDownloaded,
                "download() called for {} while not in NotDownloaded",
                self.source.uri
            );
            state.state = DownloadState::Downloading;
        }

        let request = DownloadRequest {
            uri: self.source.uri.clone(),
            absolute_uri: self.source.absolute_uri.clone(),
            options: DownloadOptions::image_defaults().resynchronize(self.source.ignore_network_cache),
        };
        self.services.activity.download_started(&self.source.absolute_uri);

        let sink = DownloadSink::new(
            self.weak_self.clone(),
            self.services.dispatcher.clone(),
            self.progress.clone(),
        );
        match self.services.downloader.fetch(request, sink.clone()) {
            Ok(handle) => self.lock().download = Some(handle),
            Err(err) => {
                warn!(uri = %self.source.absolute_uri, error = %err, "Failed to start image download");
                sink.complete(Err(err));
            }
        }
    }

    pub(crate) fn got_download_response(&self, result: ImageResult<DownloadResponse>) {
        let result = result.map(|response| Arc::new(EncodedImageData::from_response(response)));
        let mut state = self.lock();
        assert_eq!(
            state.state,
            DownloadState::Downloading,
            "download response for {} outside Downloading",
            self.source.uri
        );
        let handle = state.download.take();
        let view = state.metadata_view.clone();

        let error = match result {
            Ok(encoded) => {
                assert!(state.encoded.is_none(), "encoded image data set twice");
                debug!(
                    uri = %self.source.uri,
                    len = encoded.bytes().len(),
                    format = ?encoded.format(),
                    animated = encoded.is_animated(),
                    "Image downloaded"
                );
                state.encoded = Some(encoded.clone());
                state.state = DownloadState::Downloaded;
                state.download_progress = 1.0;
                drop(state);
                if let Some(view) = &view {
                    view.set_encoded_image_data(encoded);
                    view.set_download_progress(1.0);
                }
                None
            }
            Err(err) => {
                state.state = DownloadState::DownloadFailed;
                state.download_error = Some(err.clone());
                drop(state);
                if let Some(view) = &view {
                    view.set_download_error(err.clone());
                }
                Some(err)
            }
        };
        drop(handle);

        self.services
            .activity
            .download_completed(&self.source.absolute_uri, error.as_ref());
        self.trigger_process_decode_requests();
    }

    pub(crate) fn on_download_progress(
        cache: &Weak<ImageCache>,
        dispatcher: &ImageTaskDispatcher,
        cell: &Arc<ProgressCell>,
        fraction: f32,
    ) {
        if fraction.is_nan() {
            return;
        }
        cell.store(fraction.clamp(0.0, 1.0));
        if !cell.task.try_schedule() {
            return;
        }
        let cache = cache.clone();
        let cell = cell.clone();
        dispatcher.queue_task(Box::new(move || {
            cell.task.clear();
            if let Some(cache) = cache.upgrade() {
                cache.apply_download_progress(cell.load());
            }
        }));
    }

    fn apply_download_progress(&self, fraction: f32) {
        let mut state = self.lock();
        if state.state != DownloadState::Downloading || fraction <= state.download_progress {
            return;
        }
        state.download_progress = fraction;
        let view = state.metadata_view.clone();
        drop(state);

        trace!(uri = %self.source.uri, fraction, "Download progress");
        if let Some(view) = view {
            view.set_download_progress(fraction);
        }
    }

    fn trigger_process_decode_requests(&self) {
        if !self.process_task.try_schedule() {
            return;
        }
        let cache = self.weak_self.clone();
        self.services.dispatcher.queue_task(Box::new(move || {
            if let Some(cache) = cache.upgrade() {
                cache.process_decode_requests();
            }
        }));
    }

    fn process_decode_requests(&self) {
        self.process_task.clear();

        match self.state() {
            DownloadState::NotDownloaded => self.download(),
            DownloadState::Downloading => {}
            DownloadState::Downloaded => loop {
                let next = self.lock().decode_requests.pop();
                match next {
                    Some(id) => self.begin_decode(id),
                    None => break,
                }
            },
            DownloadState::DownloadFailed => self.fail_queued_requests(),
        }
    }

    fn fail_queued_requests(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let error = state
            .download_error
            .clone()
            .unwrap_or_else(|| ImageError::FetchError("download failed".into()));

        let mut released = Vec::new();
        let mut notifications: Vec<Notification> = Vec::new();
        for id in state.decode_requests.drain(..).rev() {
            if let Some(slot) = state.requests.remove(&id) {
                notifications.push(Notification::new(&slot, Err(error.clone())));
                released.push(slot);
                state.stats.failures += 1;
            }
        }
        drop(guard);

        if !notifications.is_empty() {
            debug!(uri = %self.source.uri, count = notifications.len(), error = %error, "Failing queued decode requests");
        }
        notify(notifications);
        drop(released);
    }

    fn parse_context(&self) -> ParseContext {
        ParseContext {
            device: self.services.device.clone(),
            max_root_size: None,
            max_image_dimension: self.services.max_image_dimension,
        }
    }

    fn begin_decode(&self, id: RequestId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(params) = state.requests.get(&id).map(|slot| slot.params.clone()) else {
            return;
        };
        let Some(encoded) = state.encoded.clone() else {
            return;
        };

        if let Some(entry) = state.find_decoded(&params) {
            state.stats.hits += 1;
            let slot = state.requests.remove(&id);
            drop(guard);
            if let Some(slot) = slot {
                notify(vec![Notification::new(&slot, Ok(Some(entry.surface().clone())))]);
            }
            return;
        }

        let reuse = !encoded.is_animated() && params.is_shareable() && state.has_shared_decode(&params);
        state.decoding_requests.push(id);
        if reuse {
            state.stats.decoders_reused += 1;
            drop(guard);
            trace!(request_id = id.raw(), "Joined decode in flight");
            return;
        }
        drop(guard);

        let activity = &self.services.activity;
        activity.decode_started(id, &params);
        let ctx = self.parse_context();
        if !encoded.is_parsed(&ctx) {
            activity.parse_started(id.raw());
        }

        let owner = DecoderOwner::new(id);
        let created = encoded.parse(&ctx).and_then(|_| {
            let sink = DecodeSink::new(self.weak_self.clone(), self.services.dispatcher.clone(), owner.clone());
            self.services.decoders.create_decoder(encoded.clone(), &params, sink)
        });

        match created {
            Ok(decoder) => {
                let mut guard = self.lock();
                let state = &mut *guard;
                let orphan = match state.requests.get_mut(&id) {
                    Some(slot) => {
                        slot.decoder = Some(AttachedDecoder { decoder, owner });
                        state.stats.decoders_created += 1;
                        None
                    }
                    None => Some(decoder),
                };
                drop(guard);
                if let Some(mut decoder) = orphan {
                    decoder.cancel();
                }
            }
            Err(ImageError::DeviceLost) => {
                debug!(request_id = id.raw(), "Graphics device lost, failing decode on the next pass");
                Self::on_decode(
                    &self.weak_self,
                    &self.services.dispatcher,
                    &owner,
                    Err(ImageError::DeviceLost),
                );
            }
            Err(err) => self.handle_decode_response(Err(err), id),
        }
    }

    /// Post a decoder result to the owning thread.
    pub(crate) fn on_decode(
        cache: &Weak<ImageCache>,
        dispatcher: &ImageTaskDispatcher,
        owner: &DecoderOwner,
        result: DecodeResult,
    ) {
        let cache = cache.clone();
        let owner = owner.clone();
        dispatcher.queue_task(Box::new(move || {
            if let Some(cache) = cache.upgrade() {
                cache.handle_decode_response(result, owner.get());
            }
        }));
    }

    fn handle_decode_response(&self, result: DecodeResult, id: RequestId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(params) = state.requests.get(&id).map(|slot| slot.params.clone()) else {
            trace!(request_id = id.raw(), "Decode result for a released request");
            return;
        };
        let share = !state.is_animated() && params.is_shareable();

        let targets: Vec<RequestId> = state
            .decoding_requests
            .iter()
            .copied()
            .filter(|other| *other == id || (share && state.is_waiter(other, &params)))
            .collect();

        let mut notifications: Vec<Notification> = Vec::with_capacity(targets.len());
        let mut released = Vec::new();
        for target in targets {
            if result.is_ok() {
                if let Some(slot) = state.requests.get_mut(&target) {
                    slot.resolved = true;
                    notifications.push(Notification::new(slot, result.clone()));
                }
            } else {
                state.decoding_requests.retain(|r| *r != target);
                if let Some(slot) = state.requests.remove(&target) {
                    notifications.push(Notification::new(&slot, result.clone()));
                    released.push(slot);
                    state.stats.failures += 1;
                }
            }
        }

        if let Ok(Some(surface)) = &result {
            let cached = state
                .decoded_images
                .iter()
                .any(|entry| entry.is_valid() && are_decode_params_equal(entry.params(), &params));
            if share && !cached {
                state.decoded_images.push(DecodedImageCache::new(
                    params.clone(),
                    surface.clone(),
                    self.weak_self.clone(),
                ));
            }
        }
        drop(guard);

        trace!(request_id = id.raw(), notified = notifications.len(), ok = result.is_ok(), "Decode response");
        self.services.activity.decode_completed(id, result.as_ref().err());
        notify(notifications);
        drop(released);
    }

    pub(crate) fn on_request_releasing(&self, id: RequestId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(mut slot) = state.requests.remove(&id) else {
            return;
        };
        state.decode_requests.retain(|r| *r != id);
        state.decoding_requests.retain(|r| *r != id);
        trace!(request_id = id.raw(), "Decode request released");

        let orphan = match slot.decoder.take() {
            Some(attached) if !slot.resolved => self.on_decoder_detached(state, &slot.params, attached),
            other => other,
        };
        drop(guard);

        if let Some(mut orphan) = orphan {
            orphan.decoder.cancel();
        }
        drop(slot);
    }

    /// Offer a released request's decoder to a compatible waiter.
    ///
    /// Returns the decoder back when nobody can take it.
    fn on_decoder_detached(
        &self,
        state: &mut CacheState,
        params: &ImageDecodeParams,
        attached: AttachedDecoder,
    ) -> Option<AttachedDecoder> {
        if state.is_animated() || !params.is_shareable() {
            return Some(attached);
        }
        let Some(heir) = state
            .decoding_requests
            .iter()
            .copied()
            .find(|other| state.is_waiter(other, params))
        else {
            return Some(attached);
        };

        attached.owner.set(heir);
        state.stats.decoders_transferred += 1;
        debug!(request_id = heir.raw(), "Decoder transferred to waiting request");
        match state.requests.get_mut(&heir) {
            Some(slot) => {
                slot.decoder = Some(attached);
                None
            }
            None => Some(attached),
        }
    }

    /// Forget an invalidated decoded surface.
    ///
    /// # Panics
    ///
    /// If called off the owning thread.
    pub fn on_cache_invalidated(&self, entry: &DecodedImageCache) {
        assert!(
            self.services.dispatcher.is_owner_thread(),
            "on_cache_invalidated must run on the owning thread"
        );
        self.lock().decoded_images.retain(|e| e.id() != entry.id());
    }

    /// Invalidate every decoded surface. Returns how many were dropped.
    pub fn reclaim_decoded_images(&self) -> usize {
        let entries = self.lock().decoded_images.clone();
        for entry in &entries {
            entry.invalidate();
        }
        entries.len()
    }

    /// The provider that indexed this cache is gone.
    pub fn on_provider_released(&self) {
        self.provider_released.store(true, Ordering::Release);
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_provider_released(&self) -> bool {
        self.provider_released.load(Ordering::Acquire)
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn uri(&self) -> &str {
        &self.source.uri
    }

    pub fn absolute_uri(&self) -> &str {
        &self.source.absolute_uri
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.source.cache_key.as_deref()
    }

    pub fn dispatcher(&self) -> &ImageTaskDispatcher {
        &self.services.dispatcher
    }

    pub fn state(&self) -> DownloadState {
        self.lock().state
    }

    pub fn download_error(&self) -> Option<ImageError> {
        self.lock().download_error.clone()
    }

    pub fn download_progress(&self) -> f32 {
        self.lock().download_progress
    }

    pub fn encoded_image_data(&self) -> Option<Arc<EncodedImageData>> {
        self.lock().encoded.clone()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Requests still waiting for the download.
    pub fn pending_request_count(&self) -> usize {
        self.lock().decode_requests.len()
    }

    pub fn decoding_request_count(&self) -> usize {
        self.lock().decoding_requests.len()
    }

    pub fn decoded_image_count(&self) -> usize {
        self.lock().decoded_images.len()
    }

    pub fn request_has_decoder(&self, id: RequestId) -> bool {
        self.lock()
            .requests
            .get(&id)
            .is_some_and(|slot| slot.decoder.is_some())
    }
}

fn notify(notifications: Vec<Notification>) {
    for Notification { callback, gate, result } in notifications {
        if !gate.deliver(|| callback(result)) {
            trace!("Skipped callback of an aborted request");
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("uri", &self.source.uri)
            .field("cache_key", &self.source.cache_key)
            .finish_non_exhaustive()
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        let state = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut download) = state.download.take() {
            trace!(uri = %self.source.uri, "Aborting download of dropped image cache");
            download.abort();
        }

        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.provider_released.load(Ordering::Acquire) {
            return;
        }
        debug_assert!(
            state.decode_requests.is_empty() && state.decoding_requests.is_empty(),
            "image cache dropped with outstanding requests"
        );
        if let (Some(registry), Some(key)) = (registry.and_then(|r| r.upgrade()), &self.source.cache_key) {
            registry.forget(key);
        }
    }
}
