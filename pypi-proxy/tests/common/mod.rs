//! Common test utilities and helpers
//!
//! Builds a proxy with scratch storage roots and a canned upstream so
//! integration tests never touch the network.

#![allow(dead_code)]

use axum_test::TestServer;
use pypi_proxy::{build_router, AppState, Config, StaticFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const INDEX_BASE: &str = "http://upstream.test/simple/";

/// Test server setup result
pub struct TestSetup {
    pub temp_dir: TempDir,
    pub state: Arc<AppState>,
    pub fetcher: Arc<StaticFetcher>,
    pub server: TestServer,
}

impl TestSetup {
    pub fn cache_dir(&self, package: &str) -> PathBuf {
        self.state.cache_path(package)
    }

    pub fn upload_dir(&self, package: &str) -> PathBuf {
        self.state.upload_path(package)
    }
}

/// Configuration rooted in `temp_dir` pointing at [`INDEX_BASE`].
pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.package.cache_dir = temp_dir.path().join("cache");
    config.package.upload_dir = temp_dir.path().join("upload");
    config.index.base = INDEX_BASE.to_string();
    config
}

/// Creates a routed test server with temporary storage roots
pub fn create_test_setup(fetcher: StaticFetcher) -> TestSetup {
    create_test_setup_with(fetcher, |_| {})
}

/// Like [`create_test_setup`], letting the caller adjust the configuration
pub fn create_test_setup_with(fetcher: StaticFetcher, adjust: impl FnOnce(&mut Config)) -> TestSetup {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = test_config(&temp_dir);
    adjust(&mut config);
    std::fs::create_dir_all(&config.package.cache_dir).expect("should create cache dir");
    std::fs::create_dir_all(&config.package.upload_dir).expect("should create upload dir");

    let fetcher = Arc::new(fetcher);
    let state = Arc::new(AppState::new(config, fetcher.clone()));
    let server = TestServer::new(build_router(state.clone())).expect("should create test server");

    TestSetup {
        temp_dir,
        state,
        fetcher,
        server,
    }
}

/// Minimal upstream page linking to `hrefs`
pub fn page(hrefs: &[&str]) -> String {
    let anchors: String = hrefs
        .iter()
        .map(|href| format!("<a href=\"{href}\">{href}</a>\n"))
        .collect();
    format!("<html><body>\n{anchors}</body></html>")
}
