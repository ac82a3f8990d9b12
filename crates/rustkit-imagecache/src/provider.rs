//! Arena of image caches indexed by cache key.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lru::LruCache;
use tracing::{debug, info, trace};
use url::Url;

use crate::cache::{ImageCache, ImageCacheServices, ImageSource};
use crate::config::ImageCacheConfig;
use crate::{ImageError, ImageResult};

/// Key to cache index shared with the caches it created, so a dropped cache
/// can remove its own entry.
#[derive(Default)]
pub(crate) struct ProviderRegistry {
    caches: Mutex<HashMap<String, Weak<ImageCache>>>,
}

impl ProviderRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<ImageCache>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `key` unless it was already replaced by a live cache.
    pub(crate) fn forget(&self, key: &str) {
        let mut caches = self.lock();
        if caches.get(key).is_some_and(|cache| cache.strong_count() == 0) {
            trace!(key, "Image cache unregistered");
            caches.remove(key);
        }
    }
}

/// Hands out one [`ImageCache`] per cache key.
///
/// Caches live as long as someone holds them. The most recently requested
/// ones are also kept alive by the provider, up to
/// [`ImageCacheConfig::retained_caches`].
pub struct ImageProvider {
    services: ImageCacheServices,
    config: ImageCacheConfig,
    base_uri: Option<Url>,
    registry: Arc<ProviderRegistry>,
    retained: Mutex<Option<LruCache<String, Arc<ImageCache>>>>,
    released: AtomicBool,
}

impl ImageProvider {
    pub fn new(mut services: ImageCacheServices, config: ImageCacheConfig) -> ImageResult<Self> {
        config.validate()?;
        services.max_image_dimension = config.max_image_dimension;
        let retained = NonZeroUsize::new(config.retained_caches).map(LruCache::new);
        info!(retained_caches = config.retained_caches, "Image provider created");
        Ok(Self {
            services,
            config,
            base_uri: None,
            registry: Arc::new(ProviderRegistry::default()),
            retained: Mutex::new(retained),
            released: AtomicBool::new(false),
        })
    }

    /// Resolve relative URIs against `base`.
    pub fn with_base_uri(mut self, base: &str) -> ImageResult<Self> {
        let base = Url::parse(base).map_err(|e| ImageError::InvalidUrl(format!("{base}: {e}")))?;
        self.base_uri = Some(base);
        Ok(self)
    }

    pub fn config(&self) -> &ImageCacheConfig {
        &self.config
    }

    fn retained(&self) -> MutexGuard<'_, Option<LruCache<String, Arc<ImageCache>>>> {
        self.retained.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, uri: &str) -> ImageResult<Url> {
        let resolved = match &self.base_uri {
            Some(base) => base.join(uri),
            None => Url::parse(uri),
        };
        resolved.map_err(|e| ImageError::InvalidUrl(format!("{uri}: {e}")))
    }

    /// The cache for `cache_key`, created on first use.
    ///
    /// A `None` key always produces a fresh cache that is never indexed.
    pub fn get_image_cache(&self, uri: &str, cache_key: Option<&str>) -> ImageResult<Arc<ImageCache>> {
        if self.released.load(Ordering::Acquire) {
            return Err(ImageError::Config("image provider already released".into()));
        }
        let absolute = self.resolve(uri)?;
        let source = ImageSource::new(uri)
            .with_absolute_uri(absolute.as_str())
            .with_cache_key(cache_key.map(str::to_string))
            .ignore_network_cache(self.config.ignore_network_cache);

        let Some(key) = cache_key else {
            return Ok(ImageCache::new(source, self.services.clone()));
        };

        let cache = {
            let mut caches = self.registry.lock();
            match caches.get(key).and_then(Weak::upgrade) {
                Some(existing) => {
                    trace!(key, "Reusing image cache");
                    existing
                }
                None => {
                    let cache = ImageCache::new(source, self.services.clone());
                    cache.attach_registry(Arc::downgrade(&self.registry));
                    caches.insert(key.to_string(), Arc::downgrade(&cache));
                    cache
                }
            }
        };

        let evicted = self
            .retained()
            .as_mut()
            .and_then(|lru| lru.push(key.to_string(), cache.clone()));
        if let Some((evicted_key, _)) = &evicted {
            if evicted_key != key {
                trace!(key = %evicted_key, "Image cache no longer retained");
            }
        }
        drop(evicted);
        Ok(cache)
    }

    fn live_caches(&self) -> Vec<Arc<ImageCache>> {
        self.registry.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Caches that are still alive, whether retained here or held elsewhere.
    pub fn live_cache_count(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|cache| cache.strong_count() > 0)
            .count()
    }

    pub fn retained_count(&self) -> usize {
        self.retained().as_ref().map_or(0, LruCache::len)
    }

    /// Invalidate every decoded surface and stop retaining idle caches.
    ///
    /// Must run on the owning thread. Returns the number of surfaces dropped.
    pub fn handle_memory_pressure(&self) -> usize {
        let caches = self.live_caches();
        let reclaimed: usize = caches.iter().map(|cache| cache.reclaim_decoded_images()).sum();

        let idle: Vec<_> = self
            .retained()
            .as_mut()
            .map(|lru| {
                let mut drained = Vec::with_capacity(lru.len());
                while let Some(entry) = lru.pop_lru() {
                    drained.push(entry);
                }
                drained
            })
            .unwrap_or_default();
        debug!(reclaimed, released = idle.len(), "Handled memory pressure");
        drop(idle);
        drop(caches);
        reclaimed
    }

    /// Detach every cache from this provider. Later lookups fail.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let caches: Vec<_> = self
            .registry
            .lock()
            .drain()
            .filter_map(|(_, cache)| cache.upgrade())
            .collect();
        for cache in &caches {
            cache.on_provider_released();
        }
        let retained = self.retained().take();
        debug!(caches = caches.len(), "Image provider released");
        drop(retained);
        drop(caches);
    }
}

impl Drop for ImageProvider {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ImageTaskDispatcher;
    use crate::params::{ImageDecodeParams, PixelFormat};
    use crate::testing::{png_bytes, surface, ManualDecoderFactory, ManualDownloadService};
    use crate::NullActivity;

    struct Fixture {
        provider: ImageProvider,
        dispatcher: ImageTaskDispatcher,
        downloads: Arc<ManualDownloadService>,
        decoders: Arc<ManualDecoderFactory>,
    }

    fn fixture(config: ImageCacheConfig) -> Fixture {
        let dispatcher = ImageTaskDispatcher::new();
        let downloads = Arc::new(ManualDownloadService::new());
        let decoders = Arc::new(ManualDecoderFactory::new());
        let services = ImageCacheServices::new(downloads.clone(), decoders.clone(), dispatcher.clone())
            .with_activity(Arc::new(NullActivity));
        Fixture {
            provider: ImageProvider::new(services, config).unwrap(),
            dispatcher,
            downloads,
            decoders,
        }
    }

    fn retaining(count: usize) -> ImageCacheConfig {
        ImageCacheConfig {
            retained_caches: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_key_same_cache() {
        let f = fixture(ImageCacheConfig::default());
        let a = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        let b = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.cache_key(), Some("a"));

        let other = f.provider.get_image_cache("https://example.com/a.png", Some("a@2x")).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(f.provider.live_cache_count(), 2);
    }

    #[test]
    fn test_missing_key_is_never_shared() {
        let f = fixture(ImageCacheConfig::default());
        let a = f.provider.get_image_cache("https://example.com/a.png", None).unwrap();
        let b = f.provider.get_image_cache("https://example.com/a.png", None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(f.provider.live_cache_count(), 0);
        assert_eq!(f.provider.retained_count(), 0);
    }

    #[test]
    fn test_relative_uri_resolves_against_base() {
        let services = ImageCacheServices::new(
            Arc::new(ManualDownloadService::new()),
            Arc::new(ManualDecoderFactory::new()),
            ImageTaskDispatcher::new(),
        );
        let provider = ImageProvider::new(services, ImageCacheConfig::default())
            .unwrap()
            .with_base_uri("https://example.com/gallery/index.html")
            .unwrap();

        let cache = provider.get_image_cache("img/cat.png", Some("cat")).unwrap();
        assert_eq!(cache.uri(), "img/cat.png");
        assert_eq!(cache.absolute_uri(), "https://example.com/gallery/img/cat.png");
    }

    #[test]
    fn test_invalid_uri_is_rejected() {
        let f = fixture(ImageCacheConfig::default());
        assert!(matches!(
            f.provider.get_image_cache("not a url", Some("x")),
            Err(ImageError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_unretained_cache_unregisters_on_drop() {
        let f = fixture(retaining(0));
        let cache = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        assert_eq!(f.provider.registry.lock().len(), 1);
        drop(cache);
        assert_eq!(f.provider.registry.lock().len(), 0);
    }

    #[test]
    fn test_lru_retention() {
        let f = fixture(retaining(1));
        let a = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        let a_ptr = Arc::as_ptr(&a);
        drop(a);
        assert_eq!(f.provider.live_cache_count(), 1);

        let again = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        assert_eq!(Arc::as_ptr(&again), a_ptr);
        drop(again);

        let b = f.provider.get_image_cache("https://example.com/b.png", Some("b")).unwrap();
        drop(b);
        assert_eq!(f.provider.live_cache_count(), 1);
        assert_eq!(f.provider.retained_count(), 1);
        assert!(!f.provider.registry.lock().contains_key("a"));
    }

    #[test]
    fn test_config_applies_to_caches() {
        let config = ImageCacheConfig {
            ignore_network_cache: true,
            ..Default::default()
        };
        let f = fixture(config);
        let cache = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        cache.download();
        assert!(f.downloads.request(0).options.resynchronize);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let services = ImageCacheServices::new(
            Arc::new(ManualDownloadService::new()),
            Arc::new(ManualDecoderFactory::new()),
            ImageTaskDispatcher::new(),
        );
        let config = ImageCacheConfig {
            max_image_dimension: 0,
            ..Default::default()
        };
        assert!(matches!(ImageProvider::new(services, config), Err(ImageError::Config(_))));
    }

    #[test]
    fn test_memory_pressure_reclaims_surfaces() {
        let f = fixture(retaining(4));
        let cache = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        let _request = cache.get_image(ImageDecodeParams::new(PixelFormat::Rgba8, 8, 8), |_| {});
        f.dispatcher.run_until_idle(8);
        f.downloads.succeed(0, png_bytes(8, 8));
        f.dispatcher.run_until_idle(8);
        f.decoders.deliver(0, Ok(Some(surface(8, 8))));
        f.dispatcher.run_until_idle(8);
        assert_eq!(cache.decoded_image_count(), 1);

        assert_eq!(f.provider.handle_memory_pressure(), 1);
        assert_eq!(cache.decoded_image_count(), 0);
        assert_eq!(f.provider.retained_count(), 0);
        assert_eq!(f.provider.live_cache_count(), 1);
    }

    #[test]
    fn test_release_detaches_caches() {
        let f = fixture(ImageCacheConfig::default());
        let cache = f.provider.get_image_cache("https://example.com/a.png", Some("a")).unwrap();
        f.provider.release();
        assert!(cache.is_provider_released());
        assert_eq!(f.provider.retained_count(), 0);
        assert!(matches!(
            f.provider.get_image_cache("https://example.com/a.png", Some("a")),
            Err(ImageError::Config(_))
        ));
        drop(cache);
    }
}
