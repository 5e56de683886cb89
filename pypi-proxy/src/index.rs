//! Package index page and local file downloads.

use crate::error::{AppError, AppResult};
use crate::resolve_relative;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::header,
    response::{Html, Response},
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

async fn package_dirs(root: &Path) -> AppResult<Vec<String>> {
    let mut names = Vec::new();
    let mut dir = match fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if !name.starts_with('.') => names.push(name),
            Ok(_) => {}
            Err(name) => warn!(name = ?name, "Skipping non UTF-8 package directory"),
        }
    }
    Ok(names)
}

/// Names of all packages with uploaded or cached files, sorted
/// case-insensitively.
pub async fn known_packages(state: &AppState) -> AppResult<Vec<String>> {
    let mut packages: BTreeSet<String> = package_dirs(state.upload_root()).await?.into_iter().collect();
    packages.extend(package_dirs(state.cache_root()).await?);

    let mut packages: Vec<String> = packages.into_iter().collect();
    packages.sort_by_key(|name| name.to_lowercase());
    Ok(packages)
}

/// List every known package.
///
/// # Route
/// `GET /simple/`
pub async fn simple_index(State(state): State<Arc<AppState>>) -> AppResult<Html<String>> {
    info!("Generating package index");
    let packages = known_packages(&state).await?;

    let mut html = String::from(
        "<html>\n<head>\n    <title>Cached and uploaded packages</title>\n</head>\n<body>\n",
    );
    for package in &packages {
        html.push_str(&format!("<a href=\"/simple/{package}/\">{package}</a><br>\n"));
    }
    html.push_str("</body>\n</html>");

    debug!(count = packages.len(), "Package index generated");
    Ok(Html(html))
}

/// Download a local package file, preferring uploads over the cache.
///
/// # Route
/// `GET /package/cache/{*path}`
pub async fn serve_cached(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
) -> AppResult<Response> {
    let upload_file = resolve_relative(state.upload_root(), &path)?;
    let cache_file = resolve_relative(state.cache_root(), &path)?;

    let file_path = if upload_file.is_file() {
        upload_file
    } else if cache_file.is_file() {
        cache_file
    } else {
        return Err(AppError::NotFound(format!("Package file not found: {path}")));
    };

    let file = fs::File::open(&file_path).await?;
    let length = file.metadata().await?.len();
    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    info!(path = %file_path.display(), size = length, "Serving package file");

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::InternalError(format!("Failed to build download response: {e}")))
}
