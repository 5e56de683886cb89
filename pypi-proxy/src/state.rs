//! # Application State Management
//!
//! [`AppState`] is built once at startup and shared with every handler as
//! `State<Arc<AppState>>`. It owns the loaded configuration and the
//! [`Fetcher`] used for all upstream traffic, so tests can swap in an
//! in-memory fetcher without touching handler code.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pypi_proxy::{AppState, Config, UpstreamClient};
//!
//! let fetcher = Arc::new(UpstreamClient::new()?);
//! let state = Arc::new(AppState::new(Config::default(), fetcher));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::Config;
use crate::upstream::Fetcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application state containing shared configuration and resources.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Upstream access for the crawler and the transload proxy
    pub fetcher: Arc<dyn Fetcher>,
}

impl AppState {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config: Arc::new(config),
            fetcher,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.config.package.cache_dir
    }

    pub fn upload_root(&self) -> &Path {
        &self.config.package.upload_dir
    }

    /// Directory holding cached files of a normalized package name.
    pub fn cache_path(&self, package: &str) -> PathBuf {
        self.cache_root().join(package)
    }

    /// Directory holding uploaded files of a normalized package name.
    pub fn upload_path(&self, package: &str) -> PathBuf {
        self.upload_root().join(package)
    }
}

/// Standardized success response for API consistency.
///
/// Serializes to: `{"message": "Operation completed successfully"}`
#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}
