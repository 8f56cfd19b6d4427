//! Nocturna chart renderer
//!
//! Turns structured astrological chart data into PNG, JPEG or SVG images by
//! running a client-side wheel-drawing library inside a pooled headless
//! browser and capturing the result.
//!
//! # Features
//!
//! - **CDP Backend** (default): drives headless Chrome through `headless_chrome`
//! - **Admission control**: a hard ceiling on concurrent pages, rejecting
//!   rather than queueing when full
//! - **Bounded waits**: every step of completion detection has a deadline
//!
//! # Example
//!
//! ```no_run
//! use nocturna_render::{RenderConfig, RenderRequest, Renderer};
//!
//! # #[cfg(feature = "cdp")]
//! # async fn run(body: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let renderer = Renderer::with_cdp(RenderConfig::from_env());
//! let request: RenderRequest = serde_json::from_str(body)?;
//! let result = renderer
//!     .render_chart(request.chart, request.render_options, None)
//!     .await?;
//! println!("{} bytes of {}", result.size, result.format);
//! renderer.shutdown(std::time::Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod assets;
pub mod backend;
pub mod chart;
pub mod pool;
pub mod prepare;
pub mod probe;
pub mod renderer;
pub mod server;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use chart::{ApiVersion, ChartKind, ChartRequest, OutputFormat, RenderOptions, RenderRequest};
pub use pool::{ContextPool, PoolConfig};
pub use prepare::{inject_config, prepare_config, ChartConfig};
pub use renderer::{HealthReport, RenderResult, Renderer};

/// How the rendering library reaches the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LibraryMode {
    /// Inlined into the document at the library placeholder
    #[default]
    Inline,
    /// Loaded by URL from the content server
    Served,
}

/// What to do when a drawing shows no visible primitives before its deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyContentPolicy {
    /// Log a warning and capture whatever is there
    #[default]
    Proceed,
    /// Fail the render with a timeout
    Fail,
}

/// Configuration for the render pipeline
///
/// Defaults are conservative and match a small single-host deployment:
/// five concurrent pages, ten-second render timeout, assets under
/// `./assets`.
///
/// # Examples
///
/// ```
/// let cfg = nocturna_render::RenderConfig::default();
/// assert_eq!(cfg.max_concurrent_renders, 5);
/// ```
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Browser binary override; auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Ceiling on simultaneously open pages
    pub max_concurrent_renders: usize,
    /// Bound for navigation and for the drawing-structure wait, in milliseconds
    pub render_timeout_ms: u64,
    /// Bound for the visible-content wait (capped by `render_timeout_ms`)
    pub content_timeout_ms: u64,
    /// Bound for embedded images to settle
    pub asset_timeout_ms: u64,
    /// Root holding `templates/` and `lib/`
    pub assets_dir: PathBuf,
    /// Library bundle file name inside `lib/`
    pub library_file: String,
    pub library_mode: LibraryMode,
    pub empty_content_policy: EmptyContentPolicy,
    /// Re-read templates and the library on every render
    pub dev_mode: bool,
    /// How long shutdown waits for in-flight renders
    pub shutdown_grace_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            max_concurrent_renders: pool::DEFAULT_MAX_CONTEXTS,
            render_timeout_ms: 10_000,
            content_timeout_ms: 15_000,
            asset_timeout_ms: 2_000,
            assets_dir: PathBuf::from("assets"),
            library_file: "nocturna-wheel.bundle.js".to_string(),
            library_mode: LibraryMode::Inline,
            empty_content_policy: EmptyContentPolicy::Proceed,
            dev_mode: false,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl RenderConfig {
    /// Defaults overlaid with any parseable environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(path) = lookup("CHROME_EXECUTABLE_PATH").filter(|p| !p.is_empty()) {
            cfg.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("NOCTURNA_ASSETS_DIR").filter(|p| !p.is_empty()) {
            cfg.assets_dir = PathBuf::from(dir);
        }
        parse_into(&lookup, "MAX_CONCURRENT_RENDERS", &mut cfg.max_concurrent_renders);
        parse_into(&lookup, "RENDER_TIMEOUT", &mut cfg.render_timeout_ms);
        parse_into(&lookup, "CONTENT_TIMEOUT", &mut cfg.content_timeout_ms);
        parse_into(&lookup, "SHUTDOWN_GRACE", &mut cfg.shutdown_grace_ms);
        parse_into(&lookup, "NOCTURNA_DEV", &mut cfg.dev_mode);
        if lookup("NODE_ENV").as_deref() == Some("development") {
            cfg.dev_mode = true;
        }
        cfg
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    /// Visible-content wait: the smaller of the content and render timeouts.
    pub fn content_timeout(&self) -> Duration {
        Duration::from_millis(self.content_timeout_ms.min(self.render_timeout_ms))
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_millis(self.asset_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_contexts: self.max_concurrent_renders,
            launch: backend::LaunchConfig { chrome_path: self.chrome_path.clone(), extra_args: Vec::new() },
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!("Ignoring unparsable {}={:?}", key, raw),
    }
}
