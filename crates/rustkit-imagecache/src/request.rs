//! Decode request handles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::cache::ImageCache;
use crate::params::ImageDecodeParams;

/// Monotonically increasing identifier of a decode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// An outstanding operation the caller can give up on.
pub trait AbortableImageOperation {
    /// Abandon the operation. Its callback will not fire afterwards, from
    /// whichever thread this is called.
    fn abort(self);
}

/// Shared by a request handle and its slot in the cache.
///
/// Once closed, no further callback is delivered for the request.
#[derive(Debug, Default)]
pub(crate) struct CallbackGate {
    closed: AtomicBool,
    delivering: Mutex<()>,
}

impl CallbackGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Close from the owning thread, where no delivery can be in progress
    /// except the caller's own.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close from another thread. Waits out a delivery already running.
    pub(crate) fn close_and_wait(&self) {
        let _delivering = self.delivering.lock().unwrap_or_else(PoisonError::into_inner);
        self.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `deliver` unless the gate is closed. Returns whether it ran.
    pub(crate) fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let _delivering = self.delivering.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        deliver();
        true
    }
}

/// One consumer's outstanding decode.
///
/// Dropping the handle releases the request: the cache forgets it and offers any
/// attached decoder to another compatible request.
#[must_use = "dropping the request cancels it"]
pub struct ImageDecodeRequest {
    id: RequestId,
    params: ImageDecodeParams,
    gate: Arc<CallbackGate>,
    cache: Arc<ImageCache>,
}

impl ImageDecodeRequest {
    pub(crate) fn new(
        cache: Arc<ImageCache>,
        id: RequestId,
        params: ImageDecodeParams,
        gate: Arc<CallbackGate>,
    ) -> Self {
        Self {
            id,
            params,
            gate,
            cache,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn params(&self) -> &ImageDecodeParams {
        &self.params
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Whether a decoder is currently attached to this request.
    pub fn has_decoder(&self) -> bool {
        self.cache.request_has_decoder(self.id)
    }
}

impl std::fmt::Debug for ImageDecodeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDecodeRequest")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("uri", &self.cache.uri())
            .finish()
    }
}

impl AbortableImageOperation for ImageDecodeRequest {
    fn abort(self) {
        trace!(request_id = self.id.raw(), "Decode request aborted");
    }
}

impl Drop for ImageDecodeRequest {
    fn drop(&mut self) {
        let dispatcher = self.cache.dispatcher();
        if dispatcher.is_owner_thread() {
            self.gate.close();
            self.cache.on_request_releasing(self.id);
        } else {
            self.gate.close_and_wait();
            let cache = self.cache.clone();
            let id = self.id;
            dispatcher.queue_task(Box::new(move || cache.on_request_releasing(id)));
        }
    }
}

/// Which request currently owns a decoder.
///
/// Shared with the decoder's sink so a transferred decoder reports to its new owner.
#[derive(Debug, Clone)]
pub(crate) struct DecoderOwner(Arc<AtomicU64>);

impl DecoderOwner {
    pub(crate) fn new(id: RequestId) -> Self {
        Self(Arc::new(AtomicU64::new(id.raw())))
    }

    pub(crate) fn get(&self) -> RequestId {
        RequestId(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, id: RequestId) {
        self.0.store(id.raw(), Ordering::Release);
    }
}
