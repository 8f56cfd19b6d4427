//! Execution context pool
//!
//! Owns one long-lived browser process and hands out isolated pages, never
//! more than `max_contexts` at a time. Admission is a hard gate rather than a
//! queue: an acquire beyond the ceiling fails immediately with
//! [`Error::CapacityExceeded`] and the caller decides how to back off.
//!
//! All mutation of the browser handle and the active counter happens under
//! one mutex owned by the pool. Each launch bumps a generation number; a page
//! remembers the generation it came from, so releasing a page that outlived
//! its browser (crash, restart) never disturbs the counter of the new one.

use crate::backend::{BrowserHandle, DisconnectHook, LaunchConfig, Launcher, PageContext};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

/// Default ceiling on concurrently open pages.
pub const DEFAULT_MAX_CONTEXTS: usize = 5;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_contexts: usize,
    pub launch: LaunchConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_contexts: DEFAULT_MAX_CONTEXTS, launch: LaunchConfig::default() }
    }
}

#[derive(Default)]
struct PoolState {
    browser: Option<Arc<dyn BrowserHandle>>,
    generation: u64,
    active: usize,
    /// A launch is running outside the lock
    launching: bool,
}

impl PoolState {
    /// Forget the browser and every page it had. Shared by shutdown and the
    /// disconnect hook.
    fn reset(&mut self) -> Option<Arc<dyn BrowserHandle>> {
        self.active = 0;
        self.browser.take()
    }

    fn free_slot(&mut self, generation: u64) {
        if self.generation == generation {
            self.active = self.active.saturating_sub(1);
        }
    }
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A page checked out of the pool. Dropping it closes the page and gives the
/// slot back, so every exit path releases.
pub struct PooledContext {
    page: Box<dyn PageContext>,
    generation: u64,
    released: bool,
    state: Weak<Mutex<PoolState>>,
}

impl PooledContext {
    pub fn page(&self) -> &dyn PageContext {
        self.page.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns false when the context had already been released.
    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if self.page.is_closed() {
            debug!("Page was already closed");
        } else if let Err(e) = self.page.close() {
            warn!("Error closing page: {}", e);
        }
        // The pool may be gone already; the page is closed either way.
        if let Some(state) = self.state.upgrade() {
            let mut state = lock_state(&state);
            state.free_slot(self.generation);
            debug!("Page closed. Active pages: {}", state.active);
        }
        true
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ContextPool {
    launcher: Arc<dyn Launcher>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
    launched: Condvar,
}

impl ContextPool {
    pub fn new(launcher: Arc<dyn Launcher>, config: PoolConfig) -> Self {
        Self { launcher, config, state: Arc::new(Mutex::new(PoolState::default())), launched: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock_state(&self.state)
    }

    /// Start the browser if it is not running yet and return its handle.
    pub fn initialize(&self) -> Result<Arc<dyn BrowserHandle>> {
        let state = self.lock();
        self.ensure_browser(state).map(|(browser, _)| browser)
    }

    // Only one caller launches; the others wait on `launched` for it. The
    // launch itself runs unlocked so release and health checks never queue
    // behind a slow browser start.
    fn ensure_browser<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
    ) -> Result<(Arc<dyn BrowserHandle>, MutexGuard<'a, PoolState>)> {
        loop {
            if let Some(browser) = state.browser.clone() {
                return Ok((browser, state));
            }
            if !state.launching {
                break;
            }
            state = self.launched.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        info!("Initializing headless browser...");
        state.launching = true;
        let generation = state.generation + 1;
        drop(state);

        let hook = disconnect_hook(Arc::downgrade(&self.state), generation);
        let launched = self.launcher.launch(&self.config.launch, hook);

        let mut state = self.lock();
        state.launching = false;
        self.launched.notify_all();
        let browser = launched.map_err(|e| {
            error!("Failed to initialize browser: {}", e);
            Error::BrowserLaunch(e.to_string())
        })?;

        state.generation = generation;
        state.active = 0;
        state.browser = Some(browser.clone());
        info!("Browser initialized successfully");
        Ok((browser, state))
    }

    /// Check out a fresh page, starting the browser on first use.
    pub fn acquire_context(&self) -> Result<PooledContext> {
        let (browser, generation) = {
            let (browser, mut state) = self.ensure_browser(self.lock())?;
            if state.active >= self.config.max_contexts {
                return Err(Error::CapacityExceeded { limit: self.config.max_contexts });
            }
            state.active += 1;
            (browser, state.generation)
        };

        // The slot is reserved, so the page can be opened without the lock.
        match browser.new_context() {
            Ok(page) => {
                debug!("Page created. Active pages: {}", self.active_count());
                Ok(PooledContext { page, generation, released: false, state: Arc::downgrade(&self.state) })
            }
            Err(e) => {
                self.lock().free_slot(generation);
                error!("Failed to create new page: {}", e);
                Err(Error::Render(format!("Failed to create page: {}", e)))
            }
        }
    }

    /// Close the page and give its slot back ahead of drop. Never fails; a
    /// second release of the same page does nothing.
    pub fn release_context(&self, ctx: &mut PooledContext) {
        if !ctx.release() {
            debug!("Page already released");
        }
    }

    /// Close the browser and every page, then launch a new one.
    pub fn restart(&self) -> Result<()> {
        info!("Restarting browser...");
        self.shutdown();
        self.initialize()?;
        info!("Browser restarted successfully");
        Ok(())
    }

    /// Close the browser process and reset the counter.
    pub fn shutdown(&self) {
        let browser = self.lock().reset();
        if let Some(browser) = browser {
            browser.close();
            info!("Browser closed");
        }
    }

    /// True when a browser is running and its transport is connected.
    pub fn is_healthy(&self) -> bool {
        self.lock().browser.as_ref().is_some_and(|b| b.is_connected())
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn max_contexts(&self) -> usize {
        self.config.max_contexts
    }
}

fn disconnect_hook(state: Weak<Mutex<PoolState>>, generation: u64) -> DisconnectHook {
    Arc::new(move || {
        let Some(state) = state.upgrade() else { return };
        let mut state = lock_state(&state);
        if state.generation == generation && state.browser.is_some() {
            warn!("Browser disconnected unexpectedly; pool state reset");
            // The process is already gone; nothing left to close.
            drop(state.reset());
        }
    })
}
