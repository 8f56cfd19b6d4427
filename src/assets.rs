//! On-disk document templates and the rendering library bundle
//!
//! Both are read once and kept in memory. In development mode every call goes
//! back to disk so edits show up without a restart.

use crate::{Error, Result};
use log::{debug, error};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

/// Directory under the assets root holding document templates.
pub const TEMPLATES_DIR: &str = "templates";

/// Directory under the assets root holding the library bundle and its files.
pub const LIBRARY_DIR: &str = "lib";

pub struct AssetCache {
    assets_dir: PathBuf,
    library_file: String,
    dev_mode: bool,
    templates: RwLock<HashMap<String, Arc<str>>>,
    library: RwLock<Option<Arc<str>>>,
}

impl AssetCache {
    pub fn new(assets_dir: impl Into<PathBuf>, library_file: impl Into<String>, dev_mode: bool) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            library_file: library_file.into(),
            dev_mode,
            templates: RwLock::new(HashMap::new()),
            library: RwLock::new(None),
        }
    }

    pub fn library_dir(&self) -> PathBuf {
        self.assets_dir.join(LIBRARY_DIR)
    }

    pub fn library_path(&self) -> PathBuf {
        self.library_dir().join(&self.library_file)
    }

    /// Load a document template by file name.
    pub fn template(&self, name: &str) -> Result<Arc<str>> {
        if !self.dev_mode {
            let cached = self.templates.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned();
            if let Some(t) = cached {
                return Ok(t);
            }
        }

        let path = self.assets_dir.join(TEMPLATES_DIR).join(name);
        let text: Arc<str> = std::fs::read_to_string(&path)
            .map_err(|e| {
                error!("Failed to load template {}: {}", path.display(), e);
                Error::Template(format!("Template {} not found", name))
            })?
            .into();

        if !self.dev_mode {
            self.templates
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), text.clone());
        }
        debug!("Loaded template {} ({} bytes)", name, text.len());
        Ok(text)
    }

    /// Load the rendering library bundle.
    pub fn library(&self) -> Result<Arc<str>> {
        if !self.dev_mode {
            if let Some(lib) = self.library.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
                return Ok(lib.clone());
            }
        }

        let path = self.library_path();
        let text: Arc<str> = std::fs::read_to_string(&path)
            .map_err(|e| {
                error!("Rendering library missing at {}: {}", path.display(), e);
                Error::LibraryNotFound(path.clone())
            })?
            .into();

        if !self.dev_mode {
            *self.library.write().unwrap_or_else(PoisonError::into_inner) = Some(text.clone());
        }
        debug!("Loaded rendering library ({} bytes)", text.len());
        Ok(text)
    }

    /// Drop everything cached so the next call reads from disk.
    pub fn clear(&self) {
        self.templates.write().unwrap_or_else(PoisonError::into_inner).clear();
        *self.library.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
