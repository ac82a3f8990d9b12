//! Download seam and the reqwest-backed transport.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{ImageCache, ProgressCell};
use crate::config::DownloadConfig;
use crate::dispatcher::ImageTaskDispatcher;
use crate::{ImageError, ImageResult};

/// Largest buffer reserved up front from a `Content-Length` header.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Fetch options passed to the download service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadOptions {
    pub allow_cross_domain: bool,
    pub allow_redirects: bool,
    pub share_download_stream: bool,
    pub allow_media_permissions: bool,

    /// Bypass the network cache and re-fetch the bytes.
    pub resynchronize: bool,
}

impl DownloadOptions {
    /// The fixed option set used for every image fetch.
    pub fn image_defaults() -> Self {
        Self {
            allow_cross_domain: true,
            allow_redirects: true,
            share_download_stream: true,
            allow_media_permissions: true,
            resynchronize: false,
        }
    }

    pub fn resynchronize(mut self, resynchronize: bool) -> Self {
        self.resynchronize = resynchronize;
        self
    }
}

/// One image fetch.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub uri: String,
    pub absolute_uri: String,
    pub options: DownloadOptions,
}

/// Bytes of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    /// Final URL after redirects.
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// An in-flight fetch.
pub trait DownloadHandle: Send {
    /// Stop the fetch. The sink receives nothing afterwards.
    fn abort(&mut self);
}

/// Network transport used by [`ImageCache`].
pub trait DownloadService: Send + Sync {
    /// Start fetching. Progress and completion go to `sink` from any thread.
    ///
    /// An `Err` means the fetch never started; the cache routes it through the
    /// same completion path as an asynchronous failure.
    fn fetch(&self, request: DownloadRequest, sink: DownloadSink) -> ImageResult<Box<dyn DownloadHandle>>;
}

/// Where a download reports progress and completion. Safe to use from any thread.
#[derive(Clone)]
pub struct DownloadSink {
    cache: Weak<ImageCache>,
    dispatcher: ImageTaskDispatcher,
    progress: Arc<ProgressCell>,
}

impl DownloadSink {
    pub(crate) fn new(
        cache: Weak<ImageCache>,
        dispatcher: ImageTaskDispatcher,
        progress: Arc<ProgressCell>,
    ) -> Self {
        Self {
            cache,
            dispatcher,
            progress,
        }
    }

    /// Report progress in `[0, 1]`. Bursts coalesce into one dispatcher task.
    pub fn progress(&self, fraction: f32) {
        ImageCache::on_download_progress(&self.cache, &self.dispatcher, &self.progress, fraction);
    }

    /// Report the outcome. Runs on the owning thread via the dispatcher.
    pub fn complete(self, result: ImageResult<DownloadResponse>) {
        let cache = self.cache;
        self.dispatcher.queue_task(Box::new(move || {
            if let Some(cache) = cache.upgrade() {
                cache.got_download_response(result);
            }
        }));
    }
}

/// Fetches images over HTTP(S), `file:` and `data:` URLs.
pub struct HttpDownloadService {
    runtime: Handle,
    client: Client,
    no_redirect_client: Client,
}

impl HttpDownloadService {
    pub fn new(runtime: Handle, config: &DownloadConfig) -> ImageResult<Self> {
        Ok(Self {
            runtime,
            client: build_client(config, Policy::limited(config.max_redirects))?,
            no_redirect_client: build_client(config, Policy::none())?,
        })
    }
}

fn build_client(config: &DownloadConfig, redirect: Policy) -> ImageResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.as_str())
        .redirect(redirect)
        .build()
        .map_err(|e| ImageError::FetchError(format!("Failed to create HTTP client: {e}")))
}

impl DownloadService for HttpDownloadService {
    fn fetch(&self, request: DownloadRequest, sink: DownloadSink) -> ImageResult<Box<dyn DownloadHandle>> {
        let url = Url::parse(&request.absolute_uri)
            .map_err(|e| ImageError::InvalidUrl(format!("{}: {e}", request.absolute_uri)))?;

        match url.scheme() {
            "data" => {
                let result = decode_data_url(&url);
                if result.is_ok() {
                    sink.progress(1.0);
                }
                sink.complete(result);
                Ok(Box::new(FinishedDownload))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| ImageError::InvalidUrl(format!("not a local path: {url}")))?;
                let task = self.runtime.spawn(async move {
                    let result = tokio::fs::read(&path)
                        .await
                        .map(|bytes| DownloadResponse {
                            url: url.to_string(),
                            bytes,
                            content_type: None,
                        })
                        .map_err(|e| ImageError::FetchError(format!("{}: {e}", path.display())));
                    sink.complete(result);
                });
                Ok(Box::new(HttpDownload { task }))
            }
            "http" | "https" => {
                let client = if request.options.allow_redirects {
                    self.client.clone()
                } else {
                    self.no_redirect_client.clone()
                };
                let resynchronize = request.options.resynchronize;
                debug!(url = %url, resynchronize, "Fetching image");
                let task = self.runtime.spawn(async move {
                    let result = fetch_http(client, url, resynchronize, &sink).await;
                    if let Err(err) = &result {
                        warn!(error = %err, "Image fetch failed");
                    }
                    sink.complete(result);
                });
                Ok(Box::new(HttpDownload { task }))
            }
            other => Err(ImageError::InvalidUrl(format!("unsupported scheme: {other}"))),
        }
    }
}

async fn fetch_http(
    client: Client,
    url: Url,
    resynchronize: bool,
    sink: &DownloadSink,
) -> ImageResult<DownloadResponse> {
    let mut builder = client.get(url.clone());
    if resynchronize {
        builder = builder
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache");
    }

    let response = builder
        .send()
        .await
        .map_err(|e| ImageError::FetchError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ImageError::HttpStatus {
            status: status.as_u16(),
            uri: url.to_string(),
        });
    }

    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let total = response.content_length().filter(|t| *t > 0);

    let mut bytes = Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ImageError::FetchError(e.to_string()))?;
        bytes.extend_from_slice(&chunk);
        if let Some(total) = total {
            sink.progress((bytes.len() as f64 / total as f64).min(1.0) as f32);
        }
    }
    trace!(url = %final_url, len = bytes.len(), "Image fetch complete");

    Ok(DownloadResponse {
        url: final_url,
        bytes,
        content_type,
    })
}

/// Decode a `data:[<mediatype>][;base64],<data>` URL.
pub fn decode_data_url(url: &Url) -> ImageResult<DownloadResponse> {
    let path = url.path();
    let comma_pos = path
        .find(',')
        .ok_or_else(|| ImageError::InvalidUrl("Invalid data URL format".into()))?;

    let metadata = &path[..comma_pos];
    let data = &path[comma_pos + 1..];

    let bytes = if metadata.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ImageError::InvalidData(format!("Base64 decode error: {e}")))?
    } else {
        urlencoding::decode_binary(data.as_bytes()).into_owned()
    };

    let media_type = metadata.split(';').next().unwrap_or_default();
    Ok(DownloadResponse {
        url: url.to_string(),
        bytes,
        content_type: (!media_type.is_empty()).then(|| media_type.to_string()),
    })
}

struct HttpDownload {
    task: JoinHandle<()>,
}

impl DownloadHandle for HttpDownload {
    fn abort(&mut self) {
        trace!("Aborting image fetch");
        self.task.abort();
    }
}

struct FinishedDownload;

impl DownloadHandle for FinishedDownload {
    fn abort(&mut self) {}
}
