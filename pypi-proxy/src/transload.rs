//! Write-through proxy for remote package files.
//!
//! `GET /package/remote/<package>/<file>?link=<url>` relays the file at
//! `link` to the client and stores it under the cache root at the same time.
//! Every chunk is hashed, written to a hidden partial file and then handed to
//! the client. Once the transfer completes the partial file is renamed to its
//! final name and the digest is recorded in the package ledger.
//!
//! A transfer that fails midway, or whose client goes away, leaves no file
//! behind. Files already present locally are never fetched again: the client
//! is redirected to `/package/cache/`.

use crate::checksum::{partial_path, Ledger};
use crate::error::{AppError, AppResult};
use crate::resolve_relative;
use crate::state::AppState;
use crate::upstream::ByteStream;
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use md5::{Digest, Md5};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Deserialize)]
pub struct TransloadQuery {
    pub link: Option<String>,
}

/// Removes the file on drop unless the transfer completed.
struct PartialFile {
    path: PathBuf,
    complete: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        warn!(path = %self.path.display(), "Removing incomplete transload");
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove incomplete transload");
            }
        }
    }
}

struct Transfer {
    body: ByteStream,
    file: fs::File,
    hasher: Md5,
    partial: PartialFile,
    target: PathBuf,
    received: u64,
}

impl Transfer {
    async fn write(&mut self, chunk: &Bytes) -> AppResult<()> {
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        self.received += chunk.len() as u64;
        Ok(())
    }

    async fn complete(mut self) -> AppResult<()> {
        self.file.flush().await?;
        let hash = format!("{:x}", self.hasher.finalize());
        let path = self.target.clone();

        let (Some(dir), Some(filename)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            return Err(AppError::InternalError(format!(
                "Invalid transload target {}",
                path.display()
            )));
        };
        fs::rename(&self.partial.path, &path).await?;
        self.partial.complete = true;
        Ledger::new(dir).update(filename, Some(&hash)).await?;

        info!(path = %path.display(), size = self.received, md5 = %hash, "Transload complete");
        Ok(())
    }
}

/// Relay the chunks of `transfer` while persisting them.
fn relay(transfer: Transfer) -> impl futures_util::Stream<Item = AppResult<Bytes>> + Send {
    stream::unfold(Some(transfer), |transfer| async move {
        let mut transfer = transfer?;
        match transfer.body.next().await {
            Some(Ok(chunk)) => match transfer.write(&chunk).await {
                Ok(()) => Some((Ok(chunk), Some(transfer))),
                Err(e) => {
                    warn!(error = %e, "Failed to store transload chunk");
                    Some((Err(e), None))
                }
            },
            Some(Err(e)) => {
                warn!(path = %transfer.partial.path.display(), error = %e, "Transload interrupted");
                Some((Err(e), None))
            }
            None => match transfer.complete().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "Failed to finalize transload");
                    Some((Err(e), None))
                }
            },
        }
    })
}

fn local_copy_exists(path: &Path) -> bool {
    path.is_file()
}

/// Relay a remote file to the client and keep a copy in the cache.
///
/// # Route
/// `GET /package/remote/{*path}?link=<url>`
///
/// # Returns
/// A redirect to `/package/cache/` when the file is already local, the file
/// body otherwise. 404 without a `link`, 502 when the upstream request fails.
pub async fn transload(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<TransloadQuery>,
) -> AppResult<Response> {
    let upload_file = resolve_relative(state.upload_root(), &path)?;
    let cache_file = resolve_relative(state.cache_root(), &path)?;

    for existing in [&upload_file, &cache_file] {
        if !local_copy_exists(existing) {
            continue;
        }
        if let (Some(dir), Some(filename)) = (
            existing.parent(),
            existing.file_name().and_then(|n| n.to_str()),
        ) {
            Ledger::new(dir).ensure(filename).await?;
        }
        debug!(path = %path, "File already local, redirecting");
        return Ok(Redirect::to(&format!("/package/cache/{}", path.trim_start_matches('/'))).into_response());
    }

    let link = query
        .link
        .filter(|link| !link.trim().is_empty())
        .ok_or_else(|| AppError::NotFound(format!("Package file not found: {path}")))?;
    let url = Url::parse(link.trim())
        .map_err(|e| AppError::BadRequest(format!("Invalid link {link}: {e}")))?;

    info!(path = %path, link = %url, "Transloading remote file");
    let download = state
        .fetcher
        .open(&url, state.config.transload.timeout())
        .await?;
    if !download.status.is_success() {
        warn!(link = %url, status = %download.status, "Upstream refused transload");
        return Err(AppError::Upstream(format!(
            "{url} answered {}",
            download.status
        )));
    }

    let (Some(dir), Some(filename)) = (
        cache_file.parent(),
        cache_file.file_name().and_then(|n| n.to_str()),
    ) else {
        return Err(AppError::BadRequest(format!("Invalid package path {path}")));
    };
    let filename = filename.to_string();
    fs::create_dir_all(dir).await?;
    let partial = partial_path(dir, &filename);
    let file = fs::File::create(&partial).await?;
    debug!(path = %partial.display(), "Receiving transload into partial file");

    let mut response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            download
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        )
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        );
    if let Some(length) = download.content_length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    let transfer = Transfer {
        body: download.body,
        file,
        hasher: Md5::new(),
        partial: PartialFile {
            path: partial,
            complete: false,
        },
        target: cache_file,
        received: 0,
    };

    response
        .body(Body::from_stream(relay(transfer)))
        .map_err(|e| AppError::InternalError(format!("Failed to build transload response: {e}")))
}
