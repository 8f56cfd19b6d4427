//! Ephemeral loopback content server
//!
//! Serves one prepared document at `/` and whitelisted files from the library
//! directory under `/lib/`, so a page can load the chart from a real origin.
//! Each render owns its own server on an OS-assigned port; dropping the
//! server stops it.

use crate::assets::LIBRARY_DIR;
use crate::{Error, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Request, Response, Server, StatusCode};
use url::Url;

/// File extensions that may be served from the library directory.
pub const ASSET_EXTENSIONS: &[&str] = &["js", "mjs", "css", "map", "json", "svg", "png", "woff", "woff2"];

/// What a request path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Document,
    Favicon,
    Asset(PathBuf),
    Forbidden,
    NotFound,
}

/// Resolve a raw request target against the library directory.
pub fn route(target: &str, library_dir: &Path) -> Route {
    let path = target.split(['?', '#']).next().unwrap_or("");

    if path.split('/').any(is_escaping_segment) {
        return Route::Forbidden;
    }

    match path {
        "" | "/" | "/index.html" => return Route::Document,
        "/favicon.ico" => return Route::Favicon,
        _ => {}
    }

    let prefix = format!("/{}/", LIBRARY_DIR);
    let Some(rest) = path.strip_prefix(prefix.as_str()) else {
        return Route::NotFound;
    };

    let allowed = Path::new(rest)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ASSET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    if rest.is_empty() || !allowed {
        return Route::NotFound;
    }

    let candidate = library_dir.join(rest);
    let (Ok(root), Ok(resolved)) = (library_dir.canonicalize(), candidate.canonicalize()) else {
        return Route::NotFound;
    };
    // Symlinks may still point outside the directory.
    if !resolved.starts_with(&root) {
        return Route::Forbidden;
    }
    if !resolved.is_file() {
        return Route::NotFound;
    }
    Route::Asset(resolved)
}

fn is_escaping_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == ".." || decoded.contains('\\') || decoded.contains("%2f") || decoded.contains("%5c")
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn content_type(mime: &str) -> Option<Header> {
    Header::from_bytes(&b"Content-Type"[..], mime.as_bytes()).ok()
}

fn respond_bytes(request: Request, status: u16, mime: &str, body: Vec<u8>) {
    let mut response = Response::from_data(body).with_status_code(StatusCode(status));
    if let Some(header) = content_type(mime) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        debug!("Content server failed to respond: {}", e);
    }
}

fn handle(request: Request, document: &str, library_dir: &Path) {
    let target = request.url().to_string();
    let route = route(&target, library_dir);
    debug!("Content server {} -> {:?}", target, route);

    match route {
        Route::Document => respond_bytes(request, 200, "text/html; charset=utf-8", document.as_bytes().to_vec()),
        Route::Favicon => {
            let _ = request.respond(Response::empty(StatusCode(204)));
        }
        Route::Asset(path) => match std::fs::read(&path) {
            Ok(bytes) => respond_bytes(request, 200, mime_for(&path), bytes),
            Err(e) => {
                warn!("Failed to read asset {}: {}", path.display(), e);
                respond_bytes(request, 404, "text/plain", b"Not Found".to_vec());
            }
        },
        Route::Forbidden => respond_bytes(request, 403, "text/plain", b"Forbidden".to_vec()),
        Route::NotFound => respond_bytes(request, 404, "text/plain", b"Not Found".to_vec()),
    }
}

/// A running content server.
pub struct ContentServer {
    server: Arc<Server>,
    base_url: Url,
    worker: Option<JoinHandle<()>>,
}

impl ContentServer {
    /// Bind an ephemeral loopback port and start serving `document`.
    pub fn start(document: impl Into<Arc<str>>, library_dir: impl Into<PathBuf>) -> Result<Self> {
        let server = Server::http("127.0.0.1:0")
            .map_err(|e| Error::Render(format!("Failed to start content server: {}", e)))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| Error::Render("Content server is not bound to an IP address".into()))?;
        let base_url = Url::parse(&format!("http://{}/", addr))
            .map_err(|e| Error::Render(format!("Invalid content server address: {}", e)))?;

        let server = Arc::new(server);
        let document: Arc<str> = document.into();
        let library_dir: PathBuf = library_dir.into();
        let worker_server = server.clone();
        let worker = thread::Builder::new()
            .name("content-server".into())
            .spawn(move || {
                for request in worker_server.incoming_requests() {
                    handle(request, &document, &library_dir);
                }
            })
            .map_err(|e| Error::Render(format!("Failed to spawn content server thread: {}", e)))?;

        debug!("Content server listening on {}", base_url);
        Ok(Self { server, base_url, worker: Some(worker) })
    }

    /// URL of the document.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Stop accepting requests and wait for the worker to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.server.unblock();
            if worker.join().is_err() {
                warn!("Content server thread panicked");
            }
            debug!("Content server on {} stopped", self.base_url);
        }
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn lib_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wheel.js"), "var w;").unwrap();
        fs::write(dir.path().join("notes.txt"), "no").unwrap();
        dir
    }

    #[test]
    fn root_and_favicon() {
        let dir = lib_dir();
        assert_eq!(route("/", dir.path()), Route::Document);
        assert_eq!(route("/?v=2", dir.path()), Route::Document);
        assert_eq!(route("/favicon.ico", dir.path()), Route::Favicon);
    }

    #[test]
    fn whitelisted_asset_resolves() {
        let dir = lib_dir();
        match route("/lib/wheel.js", dir.path()) {
            Route::Asset(p) => assert!(p.ends_with("wheel.js")),
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn non_whitelisted_or_missing_is_not_found() {
        let dir = lib_dir();
        assert_eq!(route("/lib/notes.txt", dir.path()), Route::NotFound);
        assert_eq!(route("/lib/absent.js", dir.path()), Route::NotFound);
        assert_eq!(route("/other.js", dir.path()), Route::NotFound);
        assert_eq!(route("/lib/", dir.path()), Route::NotFound);
    }

    #[test]
    fn traversal_is_forbidden() {
        let dir = lib_dir();
        assert_eq!(route("/lib/../Cargo.toml", dir.path()), Route::Forbidden);
        assert_eq!(route("/lib/%2e%2e/secret.js", dir.path()), Route::Forbidden);
        assert_eq!(route("/lib/..%2fsecret.js", dir.path()), Route::Forbidden);
        assert_eq!(route("/lib/..\\secret.js", dir.path()), Route::Forbidden);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = lib_dir();
        let mut server = ContentServer::start("<html></html>", dir.path()).unwrap();
        assert_eq!(server.base_url().host_str(), Some("127.0.0.1"));
        assert_ne!(server.base_url().port(), Some(0));
        server.stop();
        server.stop();
    }
}
