//! Chrome DevTools Protocol backend (uses the `headless_chrome` crate)

use crate::backend::{
    BrowserHandle, CaptureFormat, Clip, DisconnectHook, LaunchConfig, Launcher, PageContext, TimedOut,
};
use anyhow::anyhow;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Flags passed to every browser process (`--no-sandbox` comes from `sandbox(false)`).
pub const CHROME_ARGS: &[&str] = &[
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--no-first-run",
    "--no-zygote",
    "--disable-gpu",
];

// headless_chrome drops the connection after this long without events.
const IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

/// The network counts as idle once no resource has finished loading for this long.
pub const NETWORK_IDLE: Duration = Duration::from_millis(500);

const RESOURCE_COUNT_SCRIPT: &str = "performance.getEntriesByType('resource').length";

/// Launches headless Chrome/Chromium processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CdpLauncher;

impl Launcher for CdpLauncher {
    fn launch(&self, config: &LaunchConfig, on_disconnect: DisconnectHook) -> anyhow::Result<Arc<dyn BrowserHandle>> {
        let mut args: Vec<&OsStr> = CHROME_ARGS.iter().map(OsStr::new).collect();
        args.extend(config.extra_args.iter().map(OsStr::new));

        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .path(config.chrome_path.clone())
            .args(args)
            .idle_browser_timeout(IDLE_TIMEOUT)
            .build()
            .map_err(|e| anyhow!("Failed to build launch options: {}", e))?;

        let browser = Browser::new(launch_options)?;
        let handle = Arc::new(CdpBrowser {
            browser: Mutex::new(Some(browser.clone())),
            connected: Arc::new(AtomicBool::new(true)),
            closing: Arc::new(AtomicBool::new(false)),
        });
        handle.spawn_watchdog(browser, on_disconnect)?;
        Ok(handle)
    }
}

/// A running Chrome process driven over CDP.
pub struct CdpBrowser {
    browser: Mutex<Option<Browser>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl CdpBrowser {
    // headless_chrome has no disconnect event, so poll the transport and fire
    // the hook on the first failed round-trip.
    fn spawn_watchdog(&self, browser: Browser, on_disconnect: DisconnectHook) -> anyhow::Result<()> {
        let connected = self.connected.clone();
        let closing = self.closing.clone();
        thread::Builder::new()
            .name("chrome-watchdog".into())
            .spawn(move || loop {
                thread::sleep(WATCHDOG_INTERVAL);
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = browser.get_version() {
                    connected.store(false, Ordering::SeqCst);
                    if !closing.load(Ordering::SeqCst) {
                        warn!("Browser disconnected unexpectedly: {}", e);
                        on_disconnect();
                    }
                    break;
                }
            })?;
        Ok(())
    }
}

impl BrowserHandle for CdpBrowser {
    fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
        let guard = self.browser.lock().unwrap_or_else(PoisonError::into_inner);
        let browser = guard.as_ref().ok_or_else(|| anyhow!("browser is closed"))?;
        let tab = browser.new_tab()?;
        Ok(Box::new(CdpPage { tab, closed: AtomicBool::new(false) }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.browser.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        // The process is killed once the watchdog drops its clone as well.
        let browser = self.browser.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(browser);
        debug!("Browser handle released");
    }
}

/// One tab.
pub struct CdpPage {
    tab: Arc<Tab>,
    closed: AtomicBool,
}

impl CdpPage {
    /// Wait until the finished-resource count holds still for [`NETWORK_IDLE`].
    fn wait_for_network_idle(&self, url: &str, deadline: Instant) -> anyhow::Result<()> {
        let mut settled = self.resource_count(deadline)?;
        loop {
            let now = Instant::now();
            if now + NETWORK_IDLE > deadline {
                return Err(TimedOut(format!("network idle on {}", url)).into());
            }
            thread::sleep(NETWORK_IDLE);
            let count = self.resource_count(deadline)?;
            if count == settled {
                debug!("Network idle with {} resources loaded", count);
                return Ok(());
            }
            settled = count;
        }
    }

    fn resource_count(&self, deadline: Instant) -> anyhow::Result<u64> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        Ok(self.evaluate(RESOURCE_COUNT_SCRIPT, remaining)?.as_u64().unwrap_or(0))
    }
}

impl PageContext for CdpPage {
    fn set_viewport(&self, width: u32, height: u32) -> anyhow::Result<()> {
        // The window must be at least as large as the emulated viewport.
        self.tab.set_bounds(Bounds::Normal {
            left: Some(0),
            top: Some(0),
            width: Some(width as f64),
            height: Some(height as f64),
        })?;
        self.tab.call_method(Emulation::SetDeviceMetricsOverride {
            width,
            height,
            device_scale_factor: 1.0,
            mobile: false,
            scale: None,
            screen_width: None,
            screen_height: None,
            position_x: None,
            position_y: None,
            dont_set_visible_size: None,
            screen_orientation: None,
            viewport: None,
            display_feature: None,
            device_posture: None,
        })?;
        Ok(())
    }

    fn navigate(&self, url: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        self.tab.set_default_timeout(timeout);
        self.tab.navigate_to(url)?;
        self.tab.wait_until_navigated().map_err(|e| {
            if e.downcast_ref::<headless_chrome::util::Timeout>().is_some() {
                anyhow::Error::new(TimedOut(format!("navigation to {}", url)))
            } else {
                e
            }
        })?;
        self.wait_for_network_idle(url, deadline)
    }

    fn evaluate(&self, expression: &str, timeout: Duration) -> anyhow::Result<serde_json::Value> {
        // The tab call itself has no per-call deadline, so it runs on a
        // helper thread that is abandoned once `timeout` passes.
        let (tx, rx) = mpsc::channel();
        let tab = self.tab.clone();
        let script = expression.to_string();
        thread::Builder::new().name("cdp-evaluate".into()).spawn(move || {
            let _ = tx.send(tab.evaluate(&script, true));
        })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => Ok(result?.value.unwrap_or(serde_json::Value::Null)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(TimedOut(format!("evaluation after {}ms", timeout.as_millis())).into())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("evaluation thread exited without a result")),
        }
    }

    fn capture(&self, format: CaptureFormat, clip: Clip) -> anyhow::Result<Vec<u8>> {
        let (format, quality) = match format {
            CaptureFormat::Png => (Page::CaptureScreenshotFormatOption::Png, None),
            CaptureFormat::Jpeg { quality } => (Page::CaptureScreenshotFormatOption::Jpeg, Some(quality as u32)),
        };
        let viewport = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: clip.width as f64,
            height: clip.height as f64,
            scale: 1.0,
        };
        self.tab.capture_screenshot(format, quality, Some(viewport), true)
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tab.close(false)?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdp_launch_and_close() {
        // This test requires Chrome to be installed, so we skip it in CI
        if std::env::var("CI").is_ok() {
            return;
        }
        let fired = Arc::new(AtomicBool::new(false));
        let hook_fired = fired.clone();
        let hook: DisconnectHook = Arc::new(move || hook_fired.store(true, Ordering::SeqCst));

        let browser = match CdpLauncher.launch(&LaunchConfig::default(), hook) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("Skipping CDP launch test because Chrome is not available or failed to launch: {}", e);
                return;
            }
        };
        assert!(browser.is_connected());

        let page = browser.new_context().expect("new tab");
        page.close().expect("close tab");
        assert!(page.is_closed());
        page.close().expect("second close is a no-op");

        browser.close();
        assert!(!browser.is_connected());
        thread::sleep(WATCHDOG_INTERVAL * 2);
        assert!(!fired.load(Ordering::SeqCst), "explicit close must not look like a crash");
    }
}
