//! Network access to the upstream index.
//!
//! The crawler and the transload proxy only talk to the network through the
//! [`Fetcher`] trait held in [`AppState`](crate::state::AppState).
//! [`UpstreamClient`] is the reqwest-backed implementation used by the server.
//! `StaticFetcher`, built for tests and with the `test-utils` feature, serves
//! canned responses from memory and records every request.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const USER_AGENT: &str = concat!("pypi-proxy/", env!("CARGO_PKG_VERSION"));

/// Body chunks of a remote response.
pub type ByteStream = BoxStream<'static, AppResult<Bytes>>;

/// An upstream response whose headers have arrived and whose body has not
/// been read yet.
pub struct RemoteDownload {
    pub status: StatusCode,
    /// URL after redirects
    pub url: Url,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RemoteDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDownload")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl RemoteDownload {
    /// Read the whole body into memory.
    pub async fn collect(self) -> AppResult<Bytes> {
        let mut buffer = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Send a GET request and return once the response headers are in.
    ///
    /// Non-success statuses are returned, not raised; connection failures and
    /// timeouts are [`AppError::Upstream`].
    async fn open(&self, url: &Url, timeout: Duration) -> AppResult<RemoteDownload>;
}

/// HTTP client for the upstream index and the files it links to.
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new() -> AppResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for UpstreamClient {
    async fn open(&self, url: &Url, timeout: Duration) -> AppResult<RemoteDownload> {
        debug!(url = %url, "Fetching upstream");

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Upstream request failed");
                AppError::Upstream(format!("{url}: {e}"))
            })?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(RemoteDownload {
            status: response.status(),
            url: response.url().clone(),
            content_type,
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map_err(|e| AppError::Upstream(format!("Upstream body interrupted: {e}")))
                .boxed(),
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use canned::StaticFetcher;

/// Canned upstream, built with `cfg(test)` or the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
mod canned {
    use super::{Fetcher, RemoteDownload};
    use crate::error::{AppError, AppResult};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use bytes::Bytes;
    use futures_util::stream::{self, StreamExt};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    #[derive(Debug, Clone)]
    struct CannedResponse {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
        /// Number of chunks delivered before the body fails
        break_after: Option<usize>,
    }

    /// In-memory [`Fetcher`] answering from a fixed URL table.
    ///
    /// URLs are matched without their fragment. Unknown URLs fail like a refused
    /// connection.
    #[derive(Debug, Default)]
    pub struct StaticFetcher {
        responses: HashMap<String, CannedResponse>,
        requests: Mutex<Vec<String>>,
        chunk_size: Option<usize>,
    }

    impl StaticFetcher {
        const DEFAULT_CHUNK_SIZE: usize = 1024;

        pub fn new() -> Self {
            Self::default()
        }

        /// Serve `html` as a `text/html` page.
        pub fn page(self, url: &str, html: &str) -> Self {
            self.respond(url, StatusCode::OK, Some("text/html; charset=utf-8"), html.as_bytes().to_vec(), None)
        }

        /// Serve `data` with the given content type.
        pub fn file(self, url: &str, content_type: &str, data: impl Into<Bytes>) -> Self {
            self.respond(url, StatusCode::OK, Some(content_type), data, None)
        }

        /// Answer with `status` and an empty body.
        pub fn status(self, url: &str, status: StatusCode) -> Self {
            self.respond(url, status, None, Bytes::new(), None)
        }

        /// Serve `data` but fail the body after `chunks` chunks.
        pub fn broken_file(self, url: &str, data: impl Into<Bytes>, chunks: usize) -> Self {
            self.respond(url, StatusCode::OK, Some("application/octet-stream"), data, Some(chunks))
        }

        /// Split bodies into chunks of `size` bytes.
        pub fn chunk_size(mut self, size: usize) -> Self {
            self.chunk_size = Some(size.max(1));
            self
        }

        fn respond(
            mut self,
            url: &str,
            status: StatusCode,
            content_type: Option<&str>,
            body: impl Into<Bytes>,
            break_after: Option<usize>,
        ) -> Self {
            self.responses.insert(
                strip_fragment(url),
                CannedResponse {
                    status,
                    content_type: content_type.map(str::to_string),
                    body: body.into(),
                    break_after,
                },
            );
            self
        }

        /// Every URL requested so far, in order.
        pub fn requests(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    fn strip_fragment(url: &str) -> String {
        url.split('#').next().unwrap_or(url).to_string()
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn open(&self, url: &Url, _timeout: Duration) -> AppResult<RemoteDownload> {
            let key = strip_fragment(url.as_str());
            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(key.clone());

            let canned = self
                .responses
                .get(&key)
                .cloned()
                .ok_or_else(|| AppError::Upstream(format!("{key}: connection refused")))?;

            let size = self.chunk_size.unwrap_or(Self::DEFAULT_CHUNK_SIZE);
            let mut chunks: Vec<AppResult<Bytes>> = canned
                .body
                .chunks(size)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            if let Some(good) = canned.break_after {
                chunks.truncate(good);
                chunks.push(Err(AppError::Upstream(
                    "Upstream body interrupted: connection reset".to_string(),
                )));
            }

            Ok(RemoteDownload {
                status: canned.status,
                url: url.clone(),
                content_type: canned.content_type,
                content_length: Some(canned.body.len() as u64),
                body: stream::iter(chunks).boxed(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("valid url")
    }

    #[tokio::test]
    async fn test_static_fetcher_serves_and_records() {
        let fetcher = StaticFetcher::new()
            .chunk_size(3)
            .file("http://up.test/f.tar.gz", "application/x-gzip", b"0123456789".to_vec());

        let download = fetcher
            .open(&url("http://up.test/f.tar.gz#md5=abc"), Duration::from_secs(1))
            .await
            .expect("canned response");
        assert_eq!(download.status, StatusCode::OK);
        assert_eq!(download.content_length, Some(10));
        assert_eq!(download.collect().await.expect("body"), Bytes::from_static(b"0123456789"));
        assert_eq!(fetcher.requests(), vec!["http://up.test/f.tar.gz".to_string()]);
    }

    #[tokio::test]
    async fn test_static_fetcher_unknown_url_is_upstream_error() {
        let fetcher = StaticFetcher::new();
        let result = fetcher
            .open(&url("http://up.test/missing/"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_broken_body_fails_after_chunks() {
        let fetcher = StaticFetcher::new()
            .chunk_size(2)
            .broken_file("http://up.test/f.zip", b"abcdef".to_vec(), 1);
        let download = fetcher
            .open(&url("http://up.test/f.zip"), Duration::from_secs(1))
            .await
            .expect("headers");
        let chunks: Vec<_> = download.body.collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }
}
