//! Subscriber setup for embedders that want the image pipeline's events.
//!
//! The crate only emits `tracing` events; installing a subscriber is left to
//! the application. These helpers scope the filter to the pipeline and keep
//! the HTTP stack quiet unless asked.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Filter target of this crate's events.
pub const LOG_TARGET: &str = "rustkit_imagecache";

/// Transport crates whose events are capped at `transport_level`.
const TRANSPORT_TARGETS: [&str; 3] = ["reqwest", "hyper", "hyper_util"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for cache, download and decode events.
    pub level: Level,
    /// Level for the HTTP client underneath the downloader.
    pub transport_level: Level,
    pub format: LogFormat,
    /// Extra directives appended after the defaults (e.g. "wiremock=debug").
    pub filter: Option<String>,
    /// Let `RUST_LOG` replace the directives when it is set.
    pub honor_env: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            transport_level: Level::WARN,
            format: LogFormat::Pretty,
            filter: None,
            honor_env: true,
        }
    }
}

impl LogConfig {
    /// Every request, decode and dispatcher pass.
    pub fn trace() -> Self {
        Self {
            level: Level::TRACE,
            format: LogFormat::Compact,
            ..Default::default()
        }
    }

    /// JSON output for log collectors.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The filter directives this configuration installs.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let transport = self.transport_level.as_str().to_ascii_lowercase();
        let mut directives = vec![format!("{LOG_TARGET}={level}")];
        directives.extend(TRANSPORT_TARGETS.iter().map(|t| format!("{t}={transport}")));
        if let Some(extra) = &self.filter {
            directives.push(extra.clone());
        }
        directives.join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        if self.honor_env {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        EnvFilter::try_new(self.directives()).unwrap_or_else(|_| EnvFilter::new(format!("{LOG_TARGET}=info")))
    }
}

/// Install a global subscriber for `config`.
///
/// # Panics
///
/// If a global subscriber is already installed.
pub fn init_logging(config: LogConfig) {
    if let Err(err) = try_init_logging(config) {
        panic!("failed to install tracing subscriber: {err}");
    }
}

/// Like [`init_logging`], but reports an already-installed subscriber as an error.
pub fn try_init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let filter = config.env_filter();
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_thread_names(true)).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
}
