//! Completion detection
//!
//! The rendering library draws asynchronously and signals nothing when it is
//! done, so completion is observed by polling small DOM probes until they
//! report `true` or a deadline passes.

use crate::backend::{PageContext, TimedOut};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Element the document template draws the chart into.
pub const CONTAINER_SELECTOR: &str = "#chart-container";

/// True once the container holds an `<svg>` root with at least one child.
pub const STRUCTURE_PROBE: &str = r#"(() => {
    const svg = document.querySelector('#chart-container svg');
    return !!svg && svg.childElementCount > 0;
})()"#;

/// True once the drawing holds at least one visible primitive.
pub const CONTENT_PROBE: &str = r#"(() => {
    const svg = document.querySelector('#chart-container svg');
    return !!svg && svg.querySelector('image, path, line, text, circle, polyline') !== null;
})()"#;

/// True once every embedded raster image has loaded or failed.
pub const ASSETS_PROBE: &str = r#"(() => {
    const container = document.querySelector('#chart-container');
    if (!container) return true;
    const seen = window.__chartAssets || (window.__chartAssets = new Map());
    let pending = 0;
    container.querySelectorAll('svg image, img').forEach((el) => {
        if (el.tagName.toLowerCase() === 'img') {
            if (!el.complete) pending++;
            return;
        }
        const href = el.getAttribute('href') || el.getAttribute('xlink:href');
        if (!href) return;
        if (!seen.has(href)) {
            const img = new Image();
            img.src = href;
            seen.set(href, img);
        }
        if (!seen.get(href).complete) pending++;
    });
    return pending === 0;
})()"#;

/// Serialized markup of the drawing, or `null` when there is none.
pub const SVG_MARKUP_SCRIPT: &str = r#"(() => {
    const svg = document.querySelector('#chart-container svg');
    return svg ? new XMLSerializer().serializeToString(svg) : null;
})()"#;

/// One completion condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Structure,
    Content,
    Assets,
}

impl Probe {
    pub fn script(&self) -> &'static str {
        match self {
            Probe::Structure => STRUCTURE_PROBE,
            Probe::Content => CONTENT_PROBE,
            Probe::Assets => ASSETS_PROBE,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Probe::Structure => "drawing structure",
            Probe::Content => "drawing content",
            Probe::Assets => "embedded images",
        })
    }
}

// Floor for the last evaluation before the deadline.
const MIN_EVALUATION: Duration = Duration::from_millis(1);

/// Delay schedule between probe evaluations.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(25), max: Duration::from_millis(250) }
    }
}

/// Evaluate `probe` until it yields `true` or `timeout` elapses.
///
/// Each evaluation is bounded by the time left, so a page that never answers
/// cannot hold the caller past the deadline. Returns `Ok(false)` on timeout;
/// other evaluation failures are returned as-is.
pub fn poll_until(page: &dyn PageContext, probe: Probe, timeout: Duration, backoff: Backoff) -> anyhow::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut delay = backoff.initial;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now()).max(MIN_EVALUATION);
        match page.evaluate(probe.script(), remaining) {
            Ok(value) if value.as_bool() == Some(true) => return Ok(true),
            Ok(_) => {}
            Err(e) if e.is::<TimedOut>() => return Ok(false),
            Err(e) => return Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(delay.min(deadline - now));
        delay = (delay * 2).min(backoff.max);
    }
}
