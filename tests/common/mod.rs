//! Scripted in-process browser used by the integration suites.
#![allow(dead_code)]

use nocturna_render::backend::{
    BrowserHandle, CaptureFormat, Clip, DisconnectHook, LaunchConfig, Launcher, PageContext, TimedOut,
};
use nocturna_render::chart::*;
use nocturna_render::probe::{ASSETS_PROBE, CONTENT_PROBE, STRUCTURE_PROBE, SVG_MARKUP_SCRIPT};
use nocturna_render::{ContextPool, PoolConfig, RenderConfig, Renderer};
use nocturna_render::probe::Backoff;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const LIBRARY_FILE: &str = "wheel.bundle.js";

pub const TEMPLATE: &str = r#"<!DOCTYPE html>
<html><head><!-- CHART_LIBRARY --></head>
<body><div id="chart-container"></div>
<script>
/* CHART_CONFIG_PLACEHOLDER */
new NocturnaWheel.WheelChart(chartConfig).render();
</script></body></html>"#;

/// How the fake page behaves.
#[derive(Clone)]
pub struct Scenario {
    pub fail_launch: bool,
    pub fail_new_page: bool,
    pub navigate_times_out: bool,
    pub structure_ready: bool,
    pub content_ready: bool,
    pub assets_ready: bool,
    pub svg_markup: Option<String>,
    pub fail_capture: bool,
    /// Capture at this size instead of the viewport
    pub capture_size: Option<(u32, u32)>,
    /// GET the navigated URL over HTTP and keep the body
    pub fetch_document: bool,
    /// Block navigation until the gate opens
    pub gate: Option<Arc<Gate>>,
    /// Block browser launch until the gate opens
    pub launch_gate: Option<Arc<Gate>>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            fail_launch: false,
            fail_new_page: false,
            navigate_times_out: false,
            structure_ready: true,
            content_ready: true,
            assets_ready: true,
            svg_markup: Some("<svg xmlns=\"http://www.w3.org/2000/svg\"><circle r=\"1\"/></svg>".into()),
            fail_capture: false,
            capture_size: None,
            fetch_document: false,
            gate: None,
            launch_gate: None,
        }
    }
}

/// One-shot latch.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.open.lock().unwrap();
        let (guard, _) = self.cond.wait_timeout_while(guard, timeout, |open| !*open).unwrap();
        *guard
    }
}

/// Shared record of what the fake browser saw.
#[derive(Default)]
pub struct Record {
    pub launches: AtomicUsize,
    pub pages_opened: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub browsers_closed: AtomicUsize,
    pub documents: Mutex<Vec<String>>,
    pub hooks: Mutex<Vec<DisconnectHook>>,
}

impl Record {
    pub fn open_pages(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst) - self.pages_closed.load(Ordering::SeqCst)
    }

    pub fn last_document(&self) -> Option<String> {
        self.documents.lock().unwrap().last().cloned()
    }
}

pub struct FakeLauncher {
    pub scenario: Mutex<Scenario>,
    pub record: Arc<Record>,
    connected: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeLauncher {
    pub fn new(scenario: Scenario) -> Arc<Self> {
        Arc::new(Self { scenario: Mutex::new(scenario), record: Arc::default(), connected: Mutex::new(None) })
    }

    pub fn set_scenario(&self, scenario: Scenario) {
        *self.scenario.lock().unwrap() = scenario;
    }

    /// Simulate the browser process dying on its own.
    pub fn crash(&self) {
        if let Some(flag) = self.connected.lock().unwrap().as_ref() {
            flag.store(false, Ordering::SeqCst);
        }
        let hook = self.record.hooks.lock().unwrap().last().cloned();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, _: &LaunchConfig, on_disconnect: DisconnectHook) -> anyhow::Result<Arc<dyn BrowserHandle>> {
        let scenario = self.scenario.lock().unwrap().clone();
        if let Some(gate) = &scenario.launch_gate {
            if !gate.wait(Duration::from_secs(5)) {
                anyhow::bail!("launch gate never opened");
            }
        }
        if scenario.fail_launch {
            anyhow::bail!("no browser binary found");
        }
        self.record.launches.fetch_add(1, Ordering::SeqCst);
        self.record.hooks.lock().unwrap().push(on_disconnect);
        let connected = Arc::new(AtomicBool::new(true));
        *self.connected.lock().unwrap() = Some(connected.clone());
        Ok(Arc::new(FakeBrowser { scenario, record: self.record.clone(), connected }))
    }
}

struct FakeBrowser {
    scenario: Scenario,
    record: Arc<Record>,
    connected: Arc<AtomicBool>,
}

impl BrowserHandle for FakeBrowser {
    fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
        if self.scenario.fail_new_page {
            anyhow::bail!("target crashed");
        }
        self.record.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            scenario: self.scenario.clone(),
            record: self.record.clone(),
            viewport: Mutex::new((800, 600)),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.record.browsers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePage {
    scenario: Scenario,
    record: Arc<Record>,
    viewport: Mutex<(u32, u32)>,
    closed: AtomicBool,
}

impl PageContext for FakePage {
    fn set_viewport(&self, width: u32, height: u32) -> anyhow::Result<()> {
        *self.viewport.lock().unwrap() = (width, height);
        Ok(())
    }

    fn navigate(&self, url: &str, timeout: Duration) -> anyhow::Result<()> {
        if let Some(gate) = &self.scenario.gate {
            if !gate.wait(Duration::from_secs(5)) {
                anyhow::bail!("gate never opened");
            }
        }
        if self.scenario.navigate_times_out {
            std::thread::sleep(timeout.min(Duration::from_millis(20)));
            return Err(TimedOut(format!("navigation to {}", url)).into());
        }
        if self.scenario.fetch_document {
            let body = reqwest::blocking::get(url)?.error_for_status()?.text()?;
            self.record.documents.lock().unwrap().push(body);
        }
        Ok(())
    }

    fn evaluate(&self, expression: &str, _timeout: Duration) -> anyhow::Result<serde_json::Value> {
        let s = &self.scenario;
        let value = if expression == STRUCTURE_PROBE {
            serde_json::Value::Bool(s.structure_ready)
        } else if expression == CONTENT_PROBE {
            serde_json::Value::Bool(s.content_ready)
        } else if expression == ASSETS_PROBE {
            serde_json::Value::Bool(s.assets_ready)
        } else if expression == SVG_MARKUP_SCRIPT {
            s.svg_markup.clone().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        Ok(value)
    }

    fn capture(&self, format: CaptureFormat, clip: Clip) -> anyhow::Result<Vec<u8>> {
        if self.scenario.fail_capture {
            anyhow::bail!("Protocol error: target closed");
        }
        let viewport = *self.viewport.lock().unwrap();
        assert_eq!(viewport, (clip.width, clip.height), "capture clip must match viewport");
        let (width, height) = self.scenario.capture_size.unwrap_or(viewport);
        Ok(encode(width, height, format))
    }

    fn close(&self) -> anyhow::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record.pages_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn encode(width: u32, height: u32, format: CaptureFormat) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([250, 250, 250]));
    let mut out = Cursor::new(Vec::new());
    let fmt = match format {
        CaptureFormat::Png => image::ImageFormat::Png,
        CaptureFormat::Jpeg { .. } => image::ImageFormat::Jpeg,
    };
    img.write_to(&mut out, fmt).unwrap();
    out.into_inner()
}

/// An assets root with both templates and a library bundle.
pub fn assets_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_assets(dir.path(), true);
    dir
}

pub fn write_assets(root: &Path, with_library: bool) {
    std::fs::create_dir_all(root.join("templates")).unwrap();
    std::fs::create_dir_all(root.join("lib")).unwrap();
    std::fs::write(root.join("templates/chart.html"), TEMPLATE).unwrap();
    std::fs::write(root.join("templates/chart.v2.html"), TEMPLATE.replace("<body>", "<body class=\"v2\">")).unwrap();
    if with_library {
        std::fs::write(root.join("lib").join(LIBRARY_FILE), "window.NocturnaWheel = {};").unwrap();
    }
}

pub fn test_config(assets: &Path, max: usize) -> RenderConfig {
    RenderConfig {
        max_concurrent_renders: max,
        render_timeout_ms: 2_000,
        content_timeout_ms: 200,
        asset_timeout_ms: 100,
        assets_dir: assets.to_path_buf(),
        library_file: LIBRARY_FILE.to_string(),
        shutdown_grace_ms: 500,
        ..RenderConfig::default()
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff { initial: Duration::from_millis(2), max: Duration::from_millis(10) }
}

pub fn pool(launcher: &Arc<FakeLauncher>, max: usize) -> Arc<ContextPool> {
    let launcher: Arc<dyn Launcher> = launcher.clone();
    Arc::new(ContextPool::new(launcher, PoolConfig { max_contexts: max, ..PoolConfig::default() }))
}

pub fn renderer(launcher: &Arc<FakeLauncher>, config: RenderConfig) -> Renderer {
    let pool = pool(launcher, config.max_concurrent_renders);
    Renderer::with_backoff(config, pool, fast_backoff())
}

pub fn planets(offset: f64) -> Planets {
    let p = |lon: f64| Planet::at((lon + offset) % 360.0);
    Planets {
        sun: p(85.83),
        moon: p(133.21),
        mercury: p(95.45),
        venus: p(110.2),
        mars: p(45.3),
        jupiter: p(200.15),
        saturn: p(290.45),
        uranus: p(15.6),
        neptune: p(325.8),
        pluto: p(270.25),
        rahu: None,
        ketu: None,
        selena: None,
        lilith: None,
    }
}

pub fn houses(start: f64) -> Houses {
    std::array::from_fn(|i| HouseCusp { lon: (start + i as f64 * 30.0) % 360.0 })
}

pub fn natal() -> ChartRequest {
    ChartRequest::Natal(NatalChart { planets: planets(0.0), houses: houses(300.32), aspect_settings: None })
}
