//! # PyPI Caching Proxy
//!
//! A caching front-end for a PyPI-style simple index. Clients upload packages
//! to it, download previously uploaded or cached files from it, and discover
//! files the upstream index offers through it.
//!
//! ## Features
//!
//! - **Streaming uploads**: `multipart/form-data` bodies are parsed as they
//!   arrive and written straight to disk
//! - **Upstream discovery**: package pages are crawled breadth-first to a
//!   bounded depth, merged with local files and cached for a configurable time
//! - **Transload**: a remote file is relayed to the client while it is stored
//!   in the local cache
//! - **Integrity**: every package directory keeps an MD5 ledger
//!
//! ## Key Modules
//!
//! - [`multipart`]: incremental form-data parser and field dispatcher
//! - [`upload`]: upload session handling the `/pypi/` endpoint
//! - [`resolver`]: local inventory, crawler and listing pages
//! - [`transload`]: fetch-and-persist proxy for remote files
//! - [`checksum`]: per-directory MD5 ledger
//! - [`versioning`]: filename version ordering
//! - [`upstream`]: the [`Fetcher`] network seam

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod index;
pub mod locks;
pub mod logging;
pub mod multipart;
pub mod resolver;
pub mod server;
pub mod state;
pub mod transload;
pub mod upload;
pub mod upstream;
pub mod versioning;

pub use config::Config;
pub use error::{ApiErrorResponse, AppError, AppResult, ErrorCode};
pub use server::{build_router, run_server};
pub use state::{AppState, SuccessResponse};
pub use upstream::{Fetcher, UpstreamClient};
#[cfg(any(test, feature = "test-utils"))]
pub use upstream::StaticFetcher;

use std::path::{Path, PathBuf};

/// Normalize a package name for use as a directory name.
///
/// Lowercases the name and replaces `-` with `_`.
///
/// ```
/// # use pypi_proxy::normalize_name;
/// assert_eq!(normalize_name("Django-REST-framework"), "django_rest_framework");
/// assert_eq!(normalize_name("some_package"), "some_package");
/// ```
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace('-', "_")
}

/// Longest accepted path component, in bytes.
const MAX_COMPONENT_LEN: usize = 255;

/// Validate a single path component received from a client.
///
/// Package names and filenames end up as directory entries below the
/// storage roots, so anything that could escape a directory or collide with
/// the hidden ledger and crawl-cache files is refused.
///
/// ```
/// # use pypi_proxy::validate_filename;
/// assert!(validate_filename("foo-1.0.tar.gz").is_ok());
/// assert!(validate_filename("../etc/passwd").is_err());
/// assert!(validate_filename(".md5").is_err());
/// assert!(validate_filename("file\0name").is_err());
/// ```
pub fn validate_filename(filename: &str) -> Result<(), AppError> {
    let problem = if filename.is_empty() {
        Some("is empty")
    } else if filename.len() > MAX_COMPONENT_LEN {
        Some("is too long")
    } else if filename.chars().any(char::is_control) {
        Some("contains control characters")
    } else if filename.contains("..") {
        Some("contains a parent reference")
    } else if filename.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if filename.starts_with('.') {
        Some("is hidden")
    } else {
        None
    };

    match problem {
        Some(problem) => {
            tracing::warn!(name = ?filename, problem, "Rejected path component");
            Err(AppError::BadRequest(format!("Path component {filename:?} {problem}")))
        }
        None => Ok(()),
    }
}

/// Resolve a client supplied `package/filename` path below `root`.
///
/// Every component is checked with [`validate_filename`].
pub fn resolve_relative(root: &Path, relpath: &str) -> Result<PathBuf, AppError> {
    let mut path = root.to_path_buf();
    let mut components = 0;
    for component in relpath.split('/').filter(|c| !c.is_empty()) {
        validate_filename(component)?;
        path.push(component);
        components += 1;
    }
    if components == 0 {
        return Err(AppError::BadRequest("Empty path".to_string()));
    }
    Ok(path)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Foo-Bar"), "foo_bar");
        assert_eq!(normalize_name("foo_bar"), "foo_bar");
        assert_eq!(normalize_name(" Requests "), "requests");
    }

    #[test]
    fn test_valid_filenames_pass() {
        let valid_filenames = [
            "foo-1.0.tar.gz",
            "foo-1.0-py3-none-any.whl",
            "my.package.zip",
            "a",
            &"a".repeat(255),
        ];
        for filename in &valid_filenames {
            assert!(
                validate_filename(filename).is_ok(),
                "Valid filename '{}' should pass validation",
                filename
            );
        }
    }

    #[test]
    fn test_unsafe_filenames_blocked() {
        let unsafe_filenames = [
            "",
            "../etc/passwd",
            "..\\windows\\system32",
            "dir/file.tar.gz",
            "dir\\file.tar.gz",
            ".md5",
            ".cache",
            "file\0name",
            "file\nname",
            &"a".repeat(256),
        ];
        for filename in &unsafe_filenames {
            assert!(
                matches!(validate_filename(filename), Err(AppError::BadRequest(_))),
                "Unsafe filename {:?} should be rejected",
                filename
            );
        }
    }

    #[test]
    fn test_resolve_relative() {
        let root = Path::new("/srv/cache");
        assert_eq!(
            resolve_relative(root, "foo/foo-1.0.tar.gz").unwrap(),
            PathBuf::from("/srv/cache/foo/foo-1.0.tar.gz")
        );
        assert!(resolve_relative(root, "foo/../../etc/passwd").is_err());
        assert!(resolve_relative(root, "foo/.md5").is_err());
        assert!(resolve_relative(root, "/").is_err());
    }
}
