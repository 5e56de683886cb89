//! # Package upload endpoint
//!
//! `POST /pypi/` accepts the `multipart/form-data` body sent by `setup.py
//! upload` and `twine`. Three fields matter:
//!
//! - `content`: the package file, streamed to disk while it is hashed
//! - `md5_digest`: the checksum declared by the client
//! - `name`: the package name, which decides the target directory
//!
//! The file is received into a hidden partial file (`.<filename>.tmp`) and
//! renamed to its final name only once the package is known and the checksum
//! is settled, so a rejected upload never touches a stored file.
//!
//! Clients do not agree on field order. When `content` arrives before `name`
//! the partial file sits in the upload root until the name is known. Without
//! a `name` field the package name is derived from the filename. Without an
//! `md5_digest` field the computed digest is recorded as is.

use crate::checksum::{partial_path, Ledger};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::multipart::{FormDataReader, FormHandler, MultipartParser, PartHeader, Route};
use crate::state::{AppState, SuccessResponse};
use crate::{normalize_name, validate_filename};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadField {
    Content,
    Md5Digest,
    Name,
}

const UPLOAD_ROUTES: &[(&str, Route<UploadField>)] = &[
    ("content", Route::Stream(UploadField::Content)),
    ("md5_digest", Route::Value(UploadField::Md5Digest)),
    ("name", Route::Value(UploadField::Name)),
];

/// A package file stored by a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub package: String,
    pub filename: String,
    pub md5: String,
}

/// Per-request upload state.
pub struct UploadSession {
    config: Arc<Config>,
    package: Option<String>,
    filename: Option<String>,
    partial: Option<PathBuf>,
    file: Option<fs::File>,
    hasher: Option<Md5>,
    computed: Option<String>,
    declared: Option<String>,
    /// Digest accepted for the received file, recorded on install
    accepted: Option<String>,
    stored: bool,
}

impl UploadSession {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            package: None,
            filename: None,
            partial: None,
            file: None,
            hasher: None,
            computed: None,
            declared: None,
            accepted: None,
            stored: false,
        }
    }

    fn upload_root(&self) -> PathBuf {
        self.config.package.upload_dir.clone()
    }

    /// Final location of `filename` within `package`, refusing to replace a
    /// file of a package that is locked against updates.
    fn destination(&self, package: &str, filename: &str) -> AppResult<PathBuf> {
        let path = self.upload_root().join(package).join(filename);
        if !self.config.package.update_allowed(package) && path.exists() {
            warn!(package = %package, filename = %filename, "Updating package not allowed");
            return Err(AppError::UpdateForbidden(package.to_string()));
        }
        Ok(path)
    }

    /// The file is received and no digest has been accepted for it yet.
    fn awaiting_checksum(&self) -> bool {
        self.computed.is_some() && self.accepted.is_none() && !self.stored
    }

    async fn write_chunk(&mut self, data: &[u8]) -> AppResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let (Some(file), Some(hasher)) = (self.file.as_mut(), self.hasher.as_mut()) {
            file.write_all(data).await?;
            hasher.update(data);
        }
        Ok(())
    }

    async fn set_package(&mut self, package: String) -> AppResult<()> {
        validate_filename(&package)?;
        debug!(package = %package, "Package name received");
        if let Some(filename) = self.filename.clone() {
            if let Err(e) = self.destination(&package, &filename) {
                self.discard().await;
                return Err(e);
            }
        }
        self.package = Some(package);
        self.install().await
    }

    /// Rename the partial file to its final name and record its digest, once
    /// both the package and the accepted digest are known.
    async fn install(&mut self) -> AppResult<()> {
        let (Some(package), Some(filename), Some(hash), Some(partial)) = (
            self.package.clone(),
            self.filename.clone(),
            self.accepted.clone(),
            self.partial.clone(),
        ) else {
            return Ok(());
        };

        let destination = match self.destination(&package, &filename) {
            Ok(path) => path,
            Err(e) => {
                self.discard().await;
                return Err(e);
            }
        };
        let dir = self.upload_root().join(&package);
        fs::create_dir_all(&dir).await?;

        debug!(from = %partial.display(), to = %destination.display(), "Installing uploaded file");
        if let Err(e) = fs::rename(&partial, &destination).await {
            self.discard().await;
            return Err(e.into());
        }
        self.partial = None;
        self.accepted = None;
        self.stored = true;

        Ledger::new(dir).update(&filename, Some(&hash)).await?;
        Ok(())
    }

    /// Compare the declared and computed digests and install on a match.
    async fn verify(&mut self) -> AppResult<()> {
        let (Some(declared), Some(computed)) = (self.declared.clone(), self.computed.clone())
        else {
            return Ok(());
        };

        debug!(declared = %declared, computed = %computed, "Verifying upload checksum");
        if !declared.eq_ignore_ascii_case(&computed) {
            let filename = self.filename.clone().unwrap_or_default();
            warn!(filename = %filename, declared = %declared, computed = %computed, "Upload checksum conflict");
            self.discard().await;
            return Err(AppError::ChecksumMismatch {
                filename,
                declared,
                computed,
            });
        }

        self.accepted = Some(computed);
        self.install().await
    }

    /// Fill in what the form left out: the package name falls back to the
    /// filename and the checksum to the computed digest.
    async fn settle(&mut self) -> AppResult<()> {
        let Some(filename) = self.filename.clone() else {
            return Ok(());
        };

        if self.package.is_none() {
            let package = package_from_filename(&filename);
            info!(package = %package, filename = %filename, "No name field, using package name from filename");
            self.set_package(package).await?;
        }

        if self.awaiting_checksum() {
            warn!(filename = %filename, "md5_digest field not found, recording computed checksum");
            self.accepted = self.computed.clone();
        }
        self.install().await
    }

    /// Drop whatever was received but not installed.
    async fn discard(&mut self) {
        self.file = None;
        if let Some(partial) = self.partial.take() {
            remove_quietly(&partial).await;
        }
    }

    /// Close out a fully received body.
    pub async fn finish(mut self) -> AppResult<StoredUpload> {
        let Some(filename) = self.filename.clone() else {
            warn!("No content field found in multipart upload");
            return Err(AppError::BadRequest("No content field found".to_string()));
        };

        if let Err(e) = self.settle().await {
            self.discard().await;
            return Err(e);
        }

        Ok(StoredUpload {
            package: self.package.unwrap_or_default(),
            filename,
            md5: self.computed.unwrap_or_default(),
        })
    }

    /// The body stopped early. A finished file is still stored with its
    /// computed checksum; a half-written one is removed.
    pub async fn interrupted(mut self) {
        if self.file.is_some() {
            if let Some(partial) = &self.partial {
                warn!(path = %partial.display(), "Removing partially uploaded file");
            }
            self.discard().await;
            return;
        }
        if self.filename.is_none() || self.stored {
            return;
        }

        warn!("Upload interrupted after the package file was received, storing it");
        if let Err(e) = self.settle().await {
            warn!(error = %e, "Failed to store interrupted upload");
            self.discard().await;
        }
    }

    /// The session failed. Nothing that was not installed is kept.
    pub async fn abort(mut self) {
        self.discard().await;
    }
}

#[async_trait]
impl FormHandler for UploadSession {
    type Field = UploadField;

    fn routes(&self) -> &'static [(&'static str, Route<UploadField>)] {
        UPLOAD_ROUTES
    }

    async fn begin(&mut self, _field: UploadField, header: &PartHeader, data: Bytes) -> AppResult<()> {
        if self.filename.is_some() {
            return Err(AppError::BadRequest(
                "Only one content field is accepted".to_string(),
            ));
        }
        let filename = header
            .filename
            .clone()
            .ok_or_else(|| AppError::BadRequest("Missing filename in upload".to_string()))?;
        validate_filename(&filename)?;

        let dir = match self.package.clone() {
            Some(package) => {
                self.destination(&package, &filename)?;
                self.upload_root().join(package)
            }
            None => self.upload_root(),
        };
        fs::create_dir_all(&dir).await?;
        let partial = partial_path(&dir, &filename);

        info!(filename = %filename, path = %partial.display(), "Receiving package file");
        self.file = Some(fs::File::create(&partial).await?);
        self.partial = Some(partial);
        self.hasher = Some(Md5::new());
        self.filename = Some(filename);
        self.write_chunk(&data).await
    }

    async fn data(&mut self, _field: UploadField, data: Bytes) -> AppResult<()> {
        self.write_chunk(&data).await
    }

    async fn end(&mut self, _field: UploadField) -> AppResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let computed = self
            .hasher
            .take()
            .map(|hasher| format!("{:x}", hasher.finalize()))
            .unwrap_or_default();
        debug!(md5 = %computed, "Package file received");
        self.computed = Some(computed);

        if self.declared.is_some() {
            self.verify().await
        } else {
            Ok(())
        }
    }

    async fn value(&mut self, field: UploadField, _header: &PartHeader, value: Bytes) -> AppResult<()> {
        let text = std::str::from_utf8(&value)?.trim().to_string();
        match field {
            UploadField::Md5Digest => {
                self.declared = Some(text.to_ascii_lowercase());
                if self.awaiting_checksum() {
                    self.verify().await?;
                }
            }
            UploadField::Name => {
                let package = normalize_name(&text);
                match &self.package {
                    Some(existing) if *existing != package => {
                        warn!(first = %existing, second = %package, "Ignoring repeated name field");
                    }
                    Some(_) => {}
                    None => self.set_package(package).await?,
                }
            }
            UploadField::Content => {}
        }
        Ok(())
    }
}

/// Derive a package name from a distribution filename: the `-`-separated
/// segments before the first one starting with a digit.
fn package_from_filename(filename: &str) -> String {
    let segments: Vec<&str> = filename
        .split('-')
        .take_while(|segment| !segment.starts_with(|c: char| c.is_ascii_digit()))
        .collect();
    let name = if segments.is_empty() {
        filename
    } else {
        &filename[..segments.iter().map(|s| s.len()).sum::<usize>() + segments.len() - 1]
    };
    normalize_name(name.split('.').next().unwrap_or(name))
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Upload a package file.
///
/// # Route
/// `POST /pypi/`
///
/// # Returns
/// JSON success response, or 400 for a malformed body, 403 when the package
/// is locked against updates and 417 on a checksum conflict.
pub async fn upload_package(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Json<SuccessResponse>> {
    info!("Processing package upload");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let parser = MultipartParser::from_content_type(content_type)?;
    let mut reader = FormDataReader::new(parser, UploadSession::new(state.config.clone()));

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Upload body interrupted");
                reader.into_handler().interrupted().await;
                return Err(AppError::BadRequest(format!("Upload interrupted: {e}")));
            }
        };
        if let Err(e) = reader.feed(&chunk).await {
            reader.into_handler().abort().await;
            return Err(e);
        }
    }

    if !reader.is_complete() {
        warn!("Upload body ended before the closing boundary");
        reader.into_handler().interrupted().await;
        return Err(AppError::BadRequest(
            "Truncated multipart/form-data body".to_string(),
        ));
    }

    let stored = reader.into_handler().finish().await?;
    info!(package = %stored.package, filename = %stored.filename, md5 = %stored.md5, "Package uploaded successfully");
    Ok(Json(SuccessResponse {
        message: format!("Uploaded {}/{}", stored.package, stored.filename),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{md5_hex, LedgerEntry};
    use crate::test_utils::{create_test_state, partial_files};
    use crate::StaticFetcher;
    use axum::http::StatusCode;
    use axum_test::{
        multipart::{MultipartForm, Part},
        TestServer,
    };

    fn server(state: Arc<AppState>) -> TestServer {
        let app = axum::Router::new()
            .route("/pypi/", axum::routing::post(upload_package))
            .with_state(state);
        TestServer::new(app).expect("should create test server")
    }

    fn content(filename: &str, data: &[u8]) -> Part {
        Part::bytes(data.to_vec())
            .file_name(filename)
            .mime_type("application/octet-stream")
    }

    async fn ledger(state: &AppState, package: &str) -> Vec<LedgerEntry> {
        Ledger::new(state.upload_path(package))
            .entries()
            .await
            .expect("should read ledger")
    }

    #[tokio::test]
    async fn test_upload_with_name_first() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"foo source distribution";

        let form = MultipartForm::new()
            .add_text("name", "Foo")
            .add_text("md5_digest", md5_hex(data))
            .add_part("content", content("foo-1.0.tar.gz", data));
        let response = server.post("/pypi/").multipart(form).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let saved = std::fs::read(state.upload_path("foo").join("foo-1.0.tar.gz"))
            .expect("should read saved file");
        assert_eq!(saved, data);
        assert_eq!(
            ledger(&state, "foo").await,
            vec![LedgerEntry::new(md5_hex(data), "foo-1.0.tar.gz")]
        );
    }

    #[tokio::test]
    async fn test_upload_with_content_first_is_moved() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"wheel bytes";

        let form = MultipartForm::new()
            .add_part("content", content("bar_baz-2.0-py3-none-any.whl", data))
            .add_text("md5_digest", md5_hex(data))
            .add_text("name", "bar-baz");
        let response = server.post("/pypi/").multipart(form).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(state
            .upload_path("bar_baz")
            .join("bar_baz-2.0-py3-none-any.whl")
            .exists());
        assert!(!state.upload_root().join("bar_baz-2.0-py3-none-any.whl").exists());
        assert!(partial_files(state.upload_root()).is_empty());
        assert_eq!(
            ledger(&state, "bar_baz").await,
            vec![LedgerEntry::new(md5_hex(data), "bar_baz-2.0-py3-none-any.whl")]
        );
    }

    #[tokio::test]
    async fn test_checksum_conflict() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());

        let form = MultipartForm::new()
            .add_text("name", "foo")
            .add_part("content", content("foo-1.0.tar.gz", b"payload"))
            .add_text("md5_digest", "00000000000000000000000000000000");
        let response = server.post("/pypi/").multipart(form).await;

        assert_eq!(response.status_code(), StatusCode::EXPECTATION_FAILED);
        assert!(ledger(&state, "foo").await.is_empty());
        assert!(!state.upload_path("foo").join("foo-1.0.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_missing_digest_records_computed_checksum() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"no digest sent";

        let form = MultipartForm::new()
            .add_text("name", "foo")
            .add_part("content", content("foo-1.1.zip", data));
        let response = server.post("/pypi/").multipart(form).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(
            ledger(&state, "foo").await,
            vec![LedgerEntry::new(md5_hex(data), "foo-1.1.zip")]
        );
    }

    #[tokio::test]
    async fn test_missing_name_uses_filename() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"anonymous";

        let form = MultipartForm::new()
            .add_part("content", content("My-Tool-0.3.tar.gz", data))
            .add_text("md5_digest", md5_hex(data));
        let response = server.post("/pypi/").multipart(form).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(state.upload_path("my_tool").join("My-Tool-0.3.tar.gz").exists());
        assert_eq!(
            ledger(&state, "my_tool").await,
            vec![LedgerEntry::new(md5_hex(data), "My-Tool-0.3.tar.gz")]
        );
    }

    #[tokio::test]
    async fn test_reupload_is_idempotent() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"same bytes";

        for _ in 0..2 {
            let form = MultipartForm::new()
                .add_text("name", "foo")
                .add_text("md5_digest", md5_hex(data))
                .add_part("content", content("foo-1.0.tar.gz", data));
            let response = server.post("/pypi/").multipart(form).await;
            assert_eq!(response.status_code(), StatusCode::OK);
        }

        assert_eq!(
            ledger(&state, "foo").await,
            vec![LedgerEntry::new(md5_hex(data), "foo-1.0.tar.gz")]
        );
    }

    #[tokio::test]
    async fn test_update_forbidden() {
        let (base, fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let mut config = (*base.config).clone();
        config.package.packages.insert(
            "locked".to_string(),
            crate::config::PackageSettings { update: false },
        );
        let state = Arc::new(AppState::new(config, fetcher));
        let server = server(state.clone());

        let first = MultipartForm::new()
            .add_text("name", "locked")
            .add_part("content", content("locked-1.0.tar.gz", b"original"));
        assert_eq!(
            server.post("/pypi/").multipart(first).await.status_code(),
            StatusCode::OK
        );

        let second = MultipartForm::new()
            .add_part("content", content("locked-1.0.tar.gz", b"replacement"))
            .add_text("name", "locked");
        let response = server.post("/pypi/").multipart(second).await;

        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
        let kept = std::fs::read(state.upload_path("locked").join("locked-1.0.tar.gz"))
            .expect("original file should remain");
        assert_eq!(kept, b"original");
        assert!(!state.upload_root().join("locked-1.0.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_not_multipart_is_bad_request() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state);

        let response = server
            .post("/pypi/")
            .content_type("application/json")
            .bytes(Bytes::from_static(b"{}"))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_content_field() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state);

        let form = MultipartForm::new().add_text("name", "foo");
        let response = server.post("/pypi/").multipart(form).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_truncated_body_removes_partial_file() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());

        let body = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"name\"\r\n\r\n",
            "foo\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"content\"; filename=\"foo-1.0.tar.gz\"\r\n\r\n",
            "only the first half of the archive"
        );
        let response = server
            .post("/pypi/")
            .content_type("multipart/form-data; boundary=XyZ")
            .bytes(Bytes::from_static(body.as_bytes()))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert!(!state.upload_path("foo").join("foo-1.0.tar.gz").exists());
        assert!(partial_files(&state.upload_path("foo")).is_empty());
        assert!(ledger(&state, "foo").await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_after_content_without_name_stores_file() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());

        let body = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"content\"; filename=\"foo-1.0.tar.gz\"\r\n\r\n",
            "complete archive\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"md5_digest\"\r\n\r\n",
            "0123"
        );
        let response = server
            .post("/pypi/")
            .content_type("multipart/form-data; boundary=XyZ")
            .bytes(Bytes::from_static(body.as_bytes()))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let stored = std::fs::read(state.upload_path("foo").join("foo-1.0.tar.gz"))
            .expect("received file should be stored");
        assert_eq!(stored, b"complete archive");
        assert_eq!(
            ledger(&state, "foo").await,
            vec![LedgerEntry::new(md5_hex(b"complete archive"), "foo-1.0.tar.gz")]
        );
        assert!(!state.upload_root().join("foo-1.0.tar.gz").exists());
        assert!(partial_files(state.upload_root()).is_empty());
    }

    #[tokio::test]
    async fn test_checksum_conflict_keeps_previous_upload() {
        let (state, _fetcher, _temp_dir) = create_test_state(StaticFetcher::new());
        let server = server(state.clone());
        let data = b"first release";

        let good = MultipartForm::new()
            .add_text("name", "foo")
            .add_text("md5_digest", md5_hex(data))
            .add_part("content", content("foo-1.0.tar.gz", data));
        assert_eq!(
            server.post("/pypi/").multipart(good).await.status_code(),
            StatusCode::OK
        );

        let corrupt = MultipartForm::new()
            .add_text("name", "foo")
            .add_part("content", content("foo-1.0.tar.gz", b"corrupted in transit"))
            .add_text("md5_digest", md5_hex(b"something else"));
        let response = server.post("/pypi/").multipart(corrupt).await;

        assert_eq!(response.status_code(), StatusCode::EXPECTATION_FAILED);
        let kept = std::fs::read(state.upload_path("foo").join("foo-1.0.tar.gz"))
            .expect("previous upload should remain");
        assert_eq!(kept, data);
        assert_eq!(
            ledger(&state, "foo").await,
            vec![LedgerEntry::new(md5_hex(data), "foo-1.0.tar.gz")]
        );
        assert!(partial_files(&state.upload_path("foo")).is_empty());
    }

    #[test]
    fn test_package_from_filename() {
        assert_eq!(package_from_filename("foo-1.0.tar.gz"), "foo");
        assert_eq!(package_from_filename("Foo-Bar-2.0.zip"), "foo_bar");
        assert_eq!(package_from_filename("foo_bar-1.0-py3-none-any.whl"), "foo_bar");
        assert_eq!(package_from_filename("nodash.tar.gz"), "nodash");
    }
}
