//! Error types for the render pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for render pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the render pipeline boundary.
///
/// Backend adapters work with `anyhow::Error`; the orchestrator folds every
/// such error into one of these kinds before it reaches the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// All execution contexts are in use
    #[error("Maximum concurrent renders reached ({limit})")]
    CapacityExceeded { limit: usize },

    /// The headless browser process could not be started
    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    /// The rendering library bundle is missing on disk
    #[error("Rendering library not found at {}", .0.display())]
    LibraryNotFound(PathBuf),

    /// The document template is missing or has no injection point
    #[error("Template error: {0}")]
    Template(String),

    /// A bounded wait ran past its ceiling
    #[error("Render timed out while {stage} (after {timeout_ms}ms)")]
    RenderTimeout { stage: String, timeout_ms: u64 },

    /// Screenshot or markup serialization failed after drawing succeeded
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Any other failure while preparing, loading or capturing
    #[error("Failed to render chart: {0}")]
    Render(String),

    /// Graceful shutdown has started; no new renders are admitted
    #[error("Renderer is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Error::BrowserLaunch(_) => "BROWSER_LAUNCH_ERROR",
            Error::LibraryNotFound(_) => "LIBRARY_NOT_FOUND",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::RenderTimeout { .. } => "RENDER_TIMEOUT",
            Error::Capture(_) => "CAPTURE_ERROR",
            Error::Render(_) => "RENDER_ERROR",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// HTTP-style status class a routing layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Error::CapacityExceeded { .. } => 429,
            Error::ShuttingDown => 503,
            Error::RenderTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. } | Error::RenderTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::CapacityExceeded { limit: 5 }.code(), "CAPACITY_EXCEEDED");
        assert_eq!(Error::Template("x".into()).code(), "TEMPLATE_ERROR");
        assert_eq!(
            Error::RenderTimeout { stage: "awaiting structure".into(), timeout_ms: 10 }.code(),
            "RENDER_TIMEOUT"
        );
    }

    #[test]
    fn status_classes() {
        assert_eq!(Error::CapacityExceeded { limit: 1 }.status(), 429);
        assert_eq!(Error::BrowserLaunch("no binary".into()).status(), 500);
        assert_eq!(Error::LibraryNotFound(PathBuf::from("lib.js")).status(), 500);
        assert_eq!(Error::Capture("boom".into()).status(), 500);
        assert_eq!(Error::RenderTimeout { stage: "loading".into(), timeout_ms: 1 }.status(), 504);
        assert_eq!(Error::ShuttingDown.status(), 503);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::CapacityExceeded { limit: 1 }.is_retryable());
        assert!(!Error::Template("missing".into()).is_retryable());
    }
}
