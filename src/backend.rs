//! Browser adapter traits
//!
//! The pool and the orchestrator only talk to a browser through these traits,
//! so the CDP backend can be swapped for an in-process fake in tests. Methods
//! return `anyhow::Result`; callers normalize failures into [`crate::Error`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback fired once when the browser process goes away on its own.
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Marker error a backend returns when one of its own waits timed out.
#[derive(Debug, Clone)]
pub struct TimedOut(pub String);

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out: {}", self.0)
    }
}

impl std::error::Error for TimedOut {}

/// Options for starting a browser process.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Explicit browser binary; auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Extra command-line flags appended to the fixed hardening set
    pub extra_args: Vec<String>,
}

/// Screenshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Png,
    Jpeg { quality: u8 },
}

/// Pixel rectangle to capture, anchored at the page origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    pub width: u32,
    pub height: u32,
}

/// Starts browser processes.
pub trait Launcher: Send + Sync {
    /// Start a browser. `on_disconnect` must fire if the process exits or its
    /// transport drops without [`BrowserHandle::close`] having been called,
    /// and must never be invoked from inside `launch` itself.
    fn launch(&self, config: &LaunchConfig, on_disconnect: DisconnectHook) -> anyhow::Result<Arc<dyn BrowserHandle>>;
}

/// A running browser process.
pub trait BrowserHandle: Send + Sync {
    /// Open a fresh, isolated page.
    fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>>;

    /// Whether the control transport is still connected.
    fn is_connected(&self) -> bool;

    /// Terminate the process. Must not fire the disconnect hook.
    fn close(&self);
}

/// One isolated page. Used by a single render at a time.
pub trait PageContext: Send + Sync {
    /// Resize the visible area to exactly `width`×`height` CSS pixels at scale 1.
    fn set_viewport(&self, width: u32, height: u32) -> anyhow::Result<()>;

    /// Load `url` and wait until the page and its subresources have settled.
    /// A wait that exceeds `timeout` returns a [`TimedOut`] error.
    fn navigate(&self, url: &str, timeout: Duration) -> anyhow::Result<()>;

    /// Evaluate an expression in the page, awaiting promises, and return its
    /// JSON value (`Null` for `undefined`). An evaluation still pending after
    /// `timeout` returns a [`TimedOut`] error.
    fn evaluate(&self, expression: &str, timeout: Duration) -> anyhow::Result<serde_json::Value>;

    /// Screenshot the given rectangle.
    fn capture(&self, format: CaptureFormat, clip: Clip) -> anyhow::Result<Vec<u8>>;

    fn close(&self) -> anyhow::Result<()>;

    fn is_closed(&self) -> bool;
}
