//! # Configuration Management
//!
//! The proxy reads a single YAML file. Every section has serde defaults, so a
//! partial file (or none at all) still yields a usable configuration:
//!
//! - [`ServerConfig`]: listen address
//! - [`PackageConfig`]: cache and upload roots plus per-package settings
//! - [`IndexConfig`]: upstream index base URL and crawl limits
//! - [`TransloadConfig`]: timeout for remote file fetches
//! - [`LoggingConfig`]: level and output format
//!
//! ```yaml
//! server:
//!   port: 5000
//! package:
//!   cache_dir: cache
//!   upload_dir: upload
//!   packages:
//!     internal_tool:
//!       update: false
//! index:
//!   base: https://pypi.org/simple/
//!   depth: 1
//!   lifetime_hours: 24
//! ```
//!
//! Relative directories are resolved against the directory containing the
//! configuration file.

use crate::error::AppResult;
use crate::normalize_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name looked up in the working directory.
pub const CONFIG_FILENAME: &str = "pypi-proxy.yml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub transload: TransloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Storage roots and per-package policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Root for files fetched from upstream
    pub cache_dir: PathBuf,
    /// Root for files uploaded by clients
    pub upload_dir: PathBuf,
    /// Per-package overrides keyed by package name
    #[serde(default)]
    pub packages: HashMap<String, PackageSettings>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            upload_dir: PathBuf::from("upload"),
            packages: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSettings {
    /// Whether an already uploaded file may be replaced
    #[serde(default = "default_true")]
    pub update: bool,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self { update: true }
    }
}

fn default_true() -> bool {
    true
}

impl PackageConfig {
    /// Whether re-uploading an existing file of `package` is permitted.
    ///
    /// Keys of `packages` are matched after name normalization, so
    /// `Internal-Tool` configures the `internal_tool` directory.
    pub fn update_allowed(&self, package: &str) -> bool {
        let package = normalize_name(package);
        self.packages
            .iter()
            .find(|(name, _)| normalize_name(name) == package)
            .map(|(_, settings)| settings.update)
            .unwrap_or(true)
    }
}

/// Upstream index crawl settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Base URL of the upstream simple index; empty disables upstream lookups
    pub base: String,
    /// Maximum link depth followed from the package page
    pub depth: usize,
    /// Lifetime of a persisted crawl result, in hours
    pub lifetime_hours: u64,
    /// Per-page fetch timeout, in seconds
    pub timeout_secs: u64,
    /// Only treat archives whose filename starts with the package name as candidates
    pub strict_prefix: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base: "https://pypi.org/simple/".to_string(),
            depth: 1,
            lifetime_hours: 24,
            timeout_secs: 20,
            strict_prefix: true,
        }
    }
}

impl IndexConfig {
    pub fn enabled(&self) -> bool {
        !self.base.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Crawl cache lifetime, saturating for values beyond what chrono holds.
    pub fn lifetime(&self) -> chrono::Duration {
        i64::try_from(self.lifetime_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransloadConfig {
    /// Total timeout for one remote file transfer, in seconds
    pub timeout_secs: u64,
}

impl Default for TransloadConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl TransloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Relative storage directories are resolved against the file's parent
    /// directory.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or does not match the expected
    /// structure.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml_ng::from_str(&config_str)?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(root);
        Ok(config)
    }

    /// Load configuration from file with fallback to defaults.
    ///
    /// A missing file yields [`Config::default`]; a present but invalid file is
    /// still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Anchor relative storage directories at `root`.
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.package.cache_dir.is_relative() {
            self.package.cache_dir = root.join(&self.package.cache_dir);
        }
        if self.package.upload_dir.is_relative() {
            self.package.upload_dir = root.join(&self.package.upload_dir);
        }
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}
