//! Cached decoded surfaces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::cache::ImageCache;
use crate::decode::DecodedSurface;
use crate::params::ImageDecodeParams;

/// One decoded surface, keyed by the decode parameters that produced it.
///
/// Invalidation (for example the surface being reclaimed under memory pressure)
/// is reported to the owning cache exactly once.
pub struct DecodedImageCache {
    id: u64,
    params: ImageDecodeParams,
    surface: Arc<DecodedSurface>,
    owner: Weak<ImageCache>,
    invalidated: AtomicBool,
}

impl DecodedImageCache {
    pub(crate) fn new(params: ImageDecodeParams, surface: Arc<DecodedSurface>, owner: Weak<ImageCache>) -> Arc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            params,
            surface,
            owner,
            invalidated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &ImageDecodeParams {
        &self.params
    }

    pub fn surface(&self) -> &Arc<DecodedSurface> {
        &self.surface
    }

    pub fn is_valid(&self) -> bool {
        !self.invalidated.load(Ordering::Acquire)
    }

    /// Drop the surface from the owner's cache. Later calls do nothing.
    ///
    /// Must run on the owning thread.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            entry = self.id,
            width = self.surface.width,
            height = self.surface.height,
            "Decoded surface invalidated"
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.on_cache_invalidated(self);
        }
    }
}

impl std::fmt::Debug for DecodedImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImageCache")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PixelFormat;

    #[test]
    fn test_invalidate_without_owner_is_idempotent() {
        let surface = Arc::new(DecodedSurface::new(1, 1, PixelFormat::Rgba8, vec![0; 4]).unwrap());
        let entry = DecodedImageCache::new(
            ImageDecodeParams::new(PixelFormat::Rgba8, 1, 1),
            surface,
            Weak::new(),
        );
        assert!(entry.is_valid());
        entry.invalidate();
        entry.invalidate();
        assert!(!entry.is_valid());
    }
}
