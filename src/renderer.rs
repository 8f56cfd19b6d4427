//! Render orchestrator
//!
//! Drives one render through
//! `Acquiring → Preparing → Loading → AwaitingStructure → AwaitingContent →
//! AwaitingAssets → Capturing → Releasing`. The pooled page and the content
//! server live in a [`RenderJob`] whose drop closes both, so release happens
//! on every exit path. Backend failures are folded into [`Error`] kinds here;
//! nothing from the transport layer escapes.

use crate::assets::{AssetCache, LIBRARY_DIR};
use crate::backend::{CaptureFormat, Clip, TimedOut};
use crate::chart::{ApiVersion, ChartKind, ChartRequest, OutputFormat, RenderOptions};
use crate::pool::{ContextPool, PooledContext};
use crate::prepare::{inject_config, inline_library, prepare_config, reference_library};
use crate::probe::{poll_until, Backoff, Probe, SVG_MARKUP_SCRIPT};
use crate::server::ContentServer;
use crate::{EmptyContentPolicy, Error, LibraryMode, RenderConfig, Result};
use base64::Engine as Base64Engine;
use image::codecs::jpeg::JpegDecoder;
use image::codecs::png::PngDecoder;
use image::ImageDecoder;
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a render currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Acquiring,
    Preparing,
    Loading,
    AwaitingStructure,
    AwaitingContent,
    AwaitingAssets,
    Capturing,
    Releasing,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenderStage::Acquiring => "acquiring a page",
            RenderStage::Preparing => "preparing the document",
            RenderStage::Loading => "loading the document",
            RenderStage::AwaitingStructure => "awaiting drawing structure",
            RenderStage::AwaitingContent => "awaiting drawing content",
            RenderStage::AwaitingAssets => "awaiting embedded images",
            RenderStage::Capturing => "capturing the image",
            RenderStage::Releasing => "releasing the page",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A finished render. Serializes with the image as base64.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    #[serde(serialize_with = "as_base64")]
    pub image: Vec<u8>,
    pub format: OutputFormat,
    pub size: usize,
    pub dimensions: Dimensions,
    #[serde(serialize_with = "as_millis")]
    pub render_time: Duration,
}

impl RenderResult {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.image)
    }
}

fn as_base64<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Snapshot of renderer readiness for a health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub browser_ready: bool,
    pub accepting: bool,
    pub active_renders: usize,
    pub max_concurrent_renders: usize,
}

/// Per-render state. Dropping it closes the page, then stops the server.
struct RenderJob {
    kind: ChartKind,
    started: Instant,
    stage: RenderStage,
    ctx: PooledContext,
    server: Option<ContentServer>,
}

impl Drop for RenderJob {
    fn drop(&mut self) {
        self.stage = RenderStage::Releasing;
        debug!("{} render {} after {}ms", self.kind, self.stage, self.started.elapsed().as_millis());
    }
}

struct Inner {
    config: RenderConfig,
    pool: Arc<ContextPool>,
    assets: AssetCache,
    backoff: Backoff,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
}

/// Counts a render as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Render entry point shared by every request. Cheap to clone.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<Inner>,
}

impl Renderer {
    pub fn new(config: RenderConfig, pool: Arc<ContextPool>) -> Self {
        Self::with_backoff(config, pool, Backoff::default())
    }

    /// Like [`new`](Self::new) with a custom probe polling schedule.
    pub fn with_backoff(config: RenderConfig, pool: Arc<ContextPool>, backoff: Backoff) -> Self {
        let assets = AssetCache::new(config.assets_dir.clone(), config.library_file.clone(), config.dev_mode);
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                assets,
                backoff,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A renderer backed by headless Chrome, launched lazily on first render.
    #[cfg(feature = "cdp")]
    pub fn with_cdp(config: RenderConfig) -> Self {
        let pool = ContextPool::new(Arc::new(crate::cdp::CdpLauncher), config.pool_config());
        Self::new(config, Arc::new(pool))
    }

    pub fn config(&self) -> &RenderConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ContextPool {
        &self.inner.pool
    }

    /// Render a chart without blocking the async runtime.
    pub async fn render_chart(
        &self,
        request: ChartRequest,
        options: RenderOptions,
        version: Option<ApiVersion>,
    ) -> Result<RenderResult> {
        let renderer = self.clone();
        tokio::task::spawn_blocking(move || renderer.render_chart_blocking(&request, &options, version))
            .await
            .map_err(|e| Error::Render(format!("Render task failed: {}", e)))?
    }

    /// Render a chart on the calling thread.
    pub fn render_chart_blocking(
        &self,
        request: &ChartRequest,
        options: &RenderOptions,
        version: Option<ApiVersion>,
    ) -> Result<RenderResult> {
        let inner = &self.inner;
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&inner.in_flight);
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let kind = request.kind();
        let started = Instant::now();
        info!(
            "Starting {} chart render ({}, {}x{})",
            kind, options.format, options.width, options.height
        );

        let outcome = self.run(kind, started, request, options, version.unwrap_or_default());
        let elapsed = started.elapsed().as_millis();
        match &outcome {
            Ok(result) => info!(
                "Chart rendered successfully in {}ms (type: {}, size: {})",
                elapsed, kind, result.size
            ),
            Err(e) => error!("Chart render failed (type: {}, code: {}, {}ms): {}", kind, e.code(), elapsed, e),
        }
        outcome
    }

    fn run(
        &self,
        kind: ChartKind,
        started: Instant,
        request: &ChartRequest,
        options: &RenderOptions,
        version: ApiVersion,
    ) -> Result<RenderResult> {
        // Acquiring: nothing to clean up if this fails.
        let ctx = self.inner.pool.acquire_context()?;
        let mut job = RenderJob { kind, started, stage: RenderStage::Preparing, ctx, server: None };
        self.drive(&mut job, request, options, version)
    }

    fn drive(
        &self,
        job: &mut RenderJob,
        request: &ChartRequest,
        options: &RenderOptions,
        version: ApiVersion,
    ) -> Result<RenderResult> {
        let cfg = &self.inner.config;
        let backoff = self.inner.backoff;

        job.stage = RenderStage::Preparing;
        let document = self.prepare_document(request, options, version)?;

        job.stage = RenderStage::Loading;
        let page = job.ctx.page();
        page.set_viewport(options.width, options.height)
            .map_err(|e| self.normalize(job.stage, e, cfg.render_timeout()))?;
        let server = ContentServer::start(document, self.inner.assets.library_dir())?;
        let url = server.base_url().to_string();
        job.server = Some(server);
        page.navigate(&url, cfg.render_timeout())
            .map_err(|e| self.normalize(job.stage, e, cfg.render_timeout()))?;

        job.stage = RenderStage::AwaitingStructure;
        let drawn = poll_until(page, Probe::Structure, cfg.render_timeout(), backoff)
            .map_err(|e| self.normalize(job.stage, e, cfg.render_timeout()))?;
        if !drawn {
            return Err(timeout(job.stage, cfg.render_timeout()));
        }

        job.stage = RenderStage::AwaitingContent;
        let has_content = poll_until(page, Probe::Content, cfg.content_timeout(), backoff)
            .map_err(|e| self.normalize(job.stage, e, cfg.content_timeout()))?;
        if !has_content {
            match cfg.empty_content_policy {
                EmptyContentPolicy::Proceed => {
                    warn!("No visible chart elements after {}ms; capturing anyway", cfg.content_timeout().as_millis())
                }
                EmptyContentPolicy::Fail => return Err(timeout(job.stage, cfg.content_timeout())),
            }
        }

        job.stage = RenderStage::AwaitingAssets;
        match poll_until(page, Probe::Assets, cfg.asset_timeout(), backoff) {
            Ok(true) => {}
            Ok(false) => warn!("Embedded images still loading after {}ms", cfg.asset_timeout().as_millis()),
            Err(e) => warn!("Could not check embedded images: {}", e),
        }

        job.stage = RenderStage::Capturing;
        let (image, format) = self.capture(job, options)?;

        Ok(RenderResult {
            size: image.len(),
            image,
            format,
            dimensions: Dimensions { width: options.width, height: options.height },
            render_time: job.started.elapsed(),
        })
    }

    fn prepare_document(&self, request: &ChartRequest, options: &RenderOptions, version: ApiVersion) -> Result<String> {
        let assets = &self.inner.assets;
        let template = assets.template(version.template_name())?;
        let config = prepare_config(request, options);
        let document = inject_config(&template, &config)?;

        // A missing bundle fails every render, served or inlined.
        let bundle = assets.library()?;
        let placed = match self.inner.config.library_mode {
            LibraryMode::Inline => inline_library(&document, &bundle),
            LibraryMode::Served => {
                let src = format!("/{}/{}", LIBRARY_DIR, self.inner.config.library_file);
                reference_library(&document, &src)
            }
        };
        match placed {
            Some(inlined) => Ok(inlined),
            None => {
                debug!("Template has no library slot; it loads the bundle itself");
                Ok(document)
            }
        }
    }

    fn capture(&self, job: &RenderJob, options: &RenderOptions) -> Result<(Vec<u8>, OutputFormat)> {
        let page = job.ctx.page();
        let clip = Clip { width: options.width, height: options.height };
        let capture_err = |e: anyhow::Error| Error::Capture(e.to_string());

        match options.format {
            OutputFormat::Png => {
                let bytes = page.capture(CaptureFormat::Png, clip).map_err(capture_err)?;
                verify_dimensions(&bytes, OutputFormat::Png, clip)?;
                Ok((bytes, OutputFormat::Png))
            }
            OutputFormat::Jpeg => {
                let quality = options.quality.clamp(1, 100);
                let bytes = page.capture(CaptureFormat::Jpeg { quality }, clip).map_err(capture_err)?;
                verify_dimensions(&bytes, OutputFormat::Jpeg, clip)?;
                Ok((bytes, OutputFormat::Jpeg))
            }
            OutputFormat::Svg => {
                let limit = self.inner.config.render_timeout();
                let markup = page
                    .evaluate(SVG_MARKUP_SCRIPT, limit)
                    .map_err(|e| match e.downcast_ref::<TimedOut>() {
                        Some(_) => timeout(RenderStage::Capturing, limit),
                        None => Error::Capture(e.to_string()),
                    })?;
                if let Some(svg) = markup.as_str().filter(|s| !s.is_empty()) {
                    return Ok((svg.as_bytes().to_vec(), OutputFormat::Svg));
                }
                warn!("Vector markup unavailable; rasterizing to PNG instead");
                let bytes = page.capture(CaptureFormat::Png, clip).map_err(capture_err)?;
                verify_dimensions(&bytes, OutputFormat::Png, clip)?;
                Ok((bytes, OutputFormat::Png))
            }
        }
    }

    fn normalize(&self, stage: RenderStage, err: anyhow::Error, limit: Duration) -> Error {
        if err.downcast_ref::<TimedOut>().is_some() {
            return timeout(stage, limit);
        }
        match err.downcast::<Error>() {
            Ok(known) => known,
            Err(other) => Error::Render(format!("{} failed: {}", stage, other)),
        }
    }

    /// Stop admitting renders, wait up to `grace` for in-flight ones, then
    /// close the browser regardless.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        info!(
            "Shutting down renderer ({} renders in flight, grace {}ms)",
            inner.in_flight.load(Ordering::SeqCst),
            grace.as_millis()
        );

        let deadline = tokio::time::Instant::now() + grace;
        while inner.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let remaining = inner.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("Grace period elapsed with {} renders in flight; closing browser", remaining);
        }
        inner.pool.shutdown();
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthReport {
        let browser_ready = self.inner.pool.is_healthy();
        HealthReport {
            status: if browser_ready { HealthStatus::Healthy } else { HealthStatus::Degraded },
            browser_ready,
            accepting: self.is_accepting(),
            active_renders: self.inner.pool.active_count(),
            max_concurrent_renders: self.inner.pool.max_contexts(),
        }
    }
}

fn timeout(stage: RenderStage, limit: Duration) -> Error {
    Error::RenderTimeout { stage: stage.to_string(), timeout_ms: limit.as_millis() as u64 }
}

/// Check that encoded image bytes declare exactly the clip size.
fn verify_dimensions(bytes: &[u8], format: OutputFormat, clip: Clip) -> Result<()> {
    let unreadable = |e: image::ImageError| Error::Capture(format!("Captured {} is unreadable: {}", format, e));
    let (width, height) = match format {
        OutputFormat::Png => PngDecoder::new(Cursor::new(bytes)).map_err(unreadable)?.dimensions(),
        OutputFormat::Jpeg => JpegDecoder::new(Cursor::new(bytes)).map_err(unreadable)?.dimensions(),
        OutputFormat::Svg => return Ok(()),
    };
    if (width, height) != (clip.width, clip.height) {
        return Err(Error::Capture(format!(
            "Captured image is {}x{}, expected {}x{}",
            width, height, clip.width, clip.height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn dimensions_must_match_clip() {
        let png = encoded(40, 30, image::ImageFormat::Png);
        assert!(verify_dimensions(&png, OutputFormat::Png, Clip { width: 40, height: 30 }).is_ok());
        assert!(matches!(
            verify_dimensions(&png, OutputFormat::Png, Clip { width: 41, height: 30 }),
            Err(Error::Capture(_))
        ));

        let jpeg = encoded(16, 24, image::ImageFormat::Jpeg);
        assert!(verify_dimensions(&jpeg, OutputFormat::Jpeg, Clip { width: 16, height: 24 }).is_ok());
    }

    #[test]
    fn garbage_bytes_are_a_capture_error() {
        let err = verify_dimensions(b"not an image", OutputFormat::Png, Clip { width: 1, height: 1 });
        assert!(matches!(err, Err(Error::Capture(_))));
    }

    #[test]
    fn result_serializes_image_as_base64() {
        let result = RenderResult {
            image: vec![1, 2, 3],
            format: OutputFormat::Png,
            size: 3,
            dimensions: Dimensions { width: 800, height: 800 },
            render_time: Duration::from_millis(1234),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["image"], "AQID");
        assert_eq!(json["format"], "png");
        assert_eq!(json["renderTime"], 1234);
        assert_eq!(json["dimensions"]["width"], 800);
        assert_eq!(result.to_base64(), "AQID");
    }

    #[test]
    fn stage_names_read_as_progress() {
        assert_eq!(RenderStage::AwaitingStructure.to_string(), "awaiting drawing structure");
        let err = timeout(RenderStage::Loading, Duration::from_millis(500));
        assert_eq!(err.to_string(), "Render timed out while loading the document (after 500ms)");
    }
}
