//! # Package listing resolution
//!
//! `GET /simple/<name>/` answers with every file known for a package:
//!
//! 1. local files, read from the ledgers of the cache directory and then the
//!    upload directory, written immediately in "Uploaded" and "Cached"
//!    sections sorted newest first;
//! 2. upstream files, taken from a fresh crawl cache entry or discovered by
//!    crawling the upstream index and streamed to the client one by one.
//!
//! The crawl starts at `<index base>/<name>/` and walks anchors breadth first,
//! one page at a time, following only links that stay below the page they
//! were found on and only up to the configured depth. A failing root page
//! aborts the crawl; other failing pages are skipped. A client that
//! disconnects cancels the crawl before its next page fetch. Only a complete
//! crawl is written to `<cache_dir>/<name>/.cache`.
//!
//! `POST` runs the same crawl without streaming, ignoring any cached result,
//! and redirects back to the listing.

use crate::checksum::{Ledger, CACHE_FILENAME};
use crate::error::{AppError, AppResult};
use crate::locks::lock_path;
use crate::state::AppState;
use crate::upstream::Fetcher;
use crate::versioning::sort_newest_first;
use crate::{normalize_name, validate_filename};
use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::header,
    response::{Redirect, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use indexmap::IndexMap;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

const SOURCE_EXTENSIONS: &[&str] = &[".tar.gz", ".tar.bz2", ".tar", ".zip", ".tgz", ".tbz", ".tbz2"];
const BINARY_EXTENSIONS: &[&str] = &[".egg", ".exe", ".msi", ".whl"];
const OTHER_EXTENSIONS: &[&str] = &[".pybundle"];

/// Response types treated as a direct file download rather than a page.
const DOWNLOAD_CONTENT_TYPES: &[&str] = &[
    "application/x-gzip",
    "application/gzip",
    "application/x-tar",
    "application/x-bzip2",
    "application/zip",
    "application/octet-stream",
];

/// Where a listed file comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Origin {
    /// Offered upstream but already present locally
    LocalOverridesUpstream,
    Upstream,
    CachedLocal,
    UploadedLocal,
}

impl From<Origin> for i8 {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::LocalOverridesUpstream => -1,
            Origin::Upstream => 0,
            Origin::CachedLocal => 1,
            Origin::UploadedLocal => 2,
        }
    }
}

impl TryFrom<i8> for Origin {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Origin::LocalOverridesUpstream),
            0 => Ok(Origin::Upstream),
            1 => Ok(Origin::CachedLocal),
            2 => Ok(Origin::UploadedLocal),
            other => Err(format!("unknown package origin {other}")),
        }
    }
}

/// One file of a package listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Archive filename
    pub name: String,
    pub checksum: Option<String>,
    /// Upstream URL the file can be fetched from
    pub link: Option<String>,
    pub origin: Origin,
}

impl PackageRecord {
    fn local(name: String, checksum: String, origin: Origin) -> Self {
        Self {
            name,
            checksum: Some(checksum),
            link: None,
            origin,
        }
    }

    fn upstream(name: String, checksum: Option<String>, link: String) -> Self {
        Self {
            name,
            checksum,
            link: Some(link),
            origin: Origin::Upstream,
        }
    }

    /// Re-tag an upstream record whose name is already available locally.
    pub fn against_local(mut self, local: &HashSet<String>) -> Self {
        if self.origin == Origin::Upstream && local.contains(&self.name) {
            self.origin = Origin::LocalOverridesUpstream;
        }
        self
    }
}

/// Persisted result of a complete crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlCacheEntry {
    pub created_at: DateTime<Utc>,
    pub versions: Vec<PackageRecord>,
}

impl CrawlCacheEntry {
    pub fn is_fresh(&self, lifetime: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at <= lifetime
    }
}

/// Local files of `package`, cache first so uploads replace cached entries
/// of the same name.
pub async fn load_local(state: &AppState, package: &str) -> AppResult<Vec<PackageRecord>> {
    let mut files: IndexMap<String, PackageRecord> = IndexMap::new();

    for (origin, dir) in [
        (Origin::CachedLocal, state.cache_path(package)),
        (Origin::UploadedLocal, state.upload_path(package)),
    ] {
        if !fs::try_exists(&dir).await? {
            continue;
        }
        info!(package = %package, path = %dir.display(), "Loading local package files");
        for entry in Ledger::new(&dir).entries().await? {
            files.insert(
                entry.filename.clone(),
                PackageRecord::local(entry.filename, entry.hash, origin),
            );
        }
    }

    Ok(files.into_values().collect())
}

/// Read the crawl cache in `dir` if it is still fresh.
pub async fn load_cache(dir: &Path, lifetime: chrono::Duration) -> Option<CrawlCacheEntry> {
    let path = dir.join(CACHE_FILENAME);
    let content = fs::read(&path).await.ok()?;
    let entry: CrawlCacheEntry = match serde_json::from_slice(&content) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable crawl cache");
            return None;
        }
    };

    if entry.is_fresh(lifetime, Utc::now()) {
        debug!(path = %path.display(), created_at = %entry.created_at, "Using cached crawl result");
        Some(entry)
    } else {
        debug!(path = %path.display(), created_at = %entry.created_at, "Crawl cache expired");
        None
    }
}

/// Persist upstream records as a new crawl cache entry in `dir`.
pub async fn save_cache(dir: &Path, records: &[PackageRecord]) -> AppResult<()> {
    let entry = CrawlCacheEntry {
        created_at: Utc::now(),
        versions: records
            .iter()
            .filter(|record| record.origin == Origin::Upstream)
            .cloned()
            .collect(),
    };
    let content = serde_json::to_vec_pretty(&entry)?;

    let path = dir.join(CACHE_FILENAME);
    let _guard = lock_path(&path).await;
    fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!("{CACHE_FILENAME}.tmp"));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, &path).await?;

    info!(path = %path.display(), count = entry.versions.len(), "Crawl cache written");
    Ok(())
}

/// Scheme, host, port and path of `url`; query and fragment are dropped.
pub fn normalize_url(url: &Url) -> String {
    let port = url
        .port_or_known_default()
        .map(|port| format!(":{port}"))
        .unwrap_or_default();
    format!(
        "{}://{}{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        port,
        url.path()
    )
}

fn same_subtree(page: &Url, link: &Url) -> bool {
    link.scheme() == page.scheme()
        && link.host_str() == page.host_str()
        && link.port_or_known_default() == page.port_or_known_default()
        && link.path().starts_with(page.path())
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
}

pub fn is_archive(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    SOURCE_EXTENSIONS
        .iter()
        .chain(BINARY_EXTENSIONS)
        .chain(OTHER_EXTENSIONS)
        .any(|ext| lower.ends_with(ext))
}

/// Whether `filename` names a file of `package`: its normalized form starts
/// with the normalized package name followed by a separator.
pub fn matches_package(filename: &str, package: &str) -> bool {
    normalize_name(filename).starts_with(&format!("{}_", normalize_name(package)))
}

fn is_download_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    DOWNLOAD_CONTENT_TYPES.contains(&media_type.as_str())
}

fn md5_fragment(url: &Url) -> Option<String> {
    url::form_urlencoded::parse(url.fragment()?.as_bytes())
        .find(|(key, _)| key == "md5")
        .map(|(_, value)| value.into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Anchor {
    href: String,
    rel: Option<String>,
}

impl Anchor {
    fn is_homepage(&self) -> bool {
        self.rel
            .as_deref()
            .is_some_and(|rel| rel.split_whitespace().next() == Some("homepage"))
    }
}

fn extract_anchors(html: &str) -> Vec<Anchor> {
    static ANCHOR_SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = ANCHOR_SELECTOR.get_or_init(|| {
        Selector::parse("a[href]")
            .unwrap_or_else(|e| panic!("Failed to compile anchor selector: {:?}", e))
    });

    let document = Html::parse_document(html);
    document
        .select(selector)
        .filter_map(|element| {
            let href = element.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with('#') {
                return None;
            }
            Some(Anchor {
                href: href.to_string(),
                rel: element.value().attr("rel").map(str::to_string),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Complete(Vec<PackageRecord>),
    /// The consumer stopped accepting records
    Cancelled,
}

/// Receives upstream records as a crawl discovers them.
pub trait RecordSink: Send {
    /// Accept one record. `false` cancels the crawl.
    fn emit(&mut self, record: &PackageRecord) -> bool;

    /// Whether the consumer has gone away. Checked before every page fetch.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> RecordSink for F
where
    F: FnMut(&PackageRecord) -> bool + Send,
{
    fn emit(&mut self, record: &PackageRecord) -> bool {
        self(record)
    }
}

enum Page {
    Html(Url, String),
    /// The URL answered with a file instead of a page
    Download(Url),
}

/// Depth-bounded breadth-first crawl of one package on the upstream index.
pub struct Crawler<'a> {
    fetcher: &'a dyn Fetcher,
    package: String,
    root: Url,
    max_depth: usize,
    timeout: Duration,
    strict_prefix: bool,
}

impl<'a> Crawler<'a> {
    /// Build a crawler for `package`, or `None` when no index base is set.
    pub fn new(state: &'a AppState, package: &str) -> AppResult<Option<Self>> {
        let index = &state.config.index;
        if !index.enabled() {
            return Ok(None);
        }

        let base = format!("{}/", index.base.trim().trim_end_matches('/'));
        let root = Url::parse(&base)
            .and_then(|base| base.join(&format!("{package}/")))
            .map_err(|e| AppError::InternalError(format!("Invalid index base {}: {e}", index.base)))?;

        Ok(Some(Self {
            fetcher: state.fetcher.as_ref(),
            package: package.to_string(),
            root,
            max_depth: index.depth,
            timeout: index.timeout(),
            strict_prefix: index.strict_prefix,
        }))
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Crawl until the queue drains, handing every new record to `sink`.
    ///
    /// The crawl is cancelled when the sink refuses a record or reports
    /// itself closed before the next page is fetched.
    ///
    /// # Errors
    ///
    /// Fails when the root page cannot be fetched or answers with a
    /// non-success status.
    pub async fn run<S: RecordSink>(&self, mut sink: S) -> AppResult<CrawlOutcome> {
        let mut queue = VecDeque::from([(self.root.clone(), 0usize)]);
        let mut visited = HashSet::from([normalize_url(&self.root)]);
        let mut found: IndexMap<String, PackageRecord> = IndexMap::new();

        info!(package = %self.package, url = %self.root, depth = self.max_depth, "Crawling upstream index");

        while let Some((url, depth)) = queue.pop_front() {
            if sink.is_closed() {
                debug!(package = %self.package, pending = queue.len() + 1, "Crawl consumer closed");
                return Ok(CrawlOutcome::Cancelled);
            }
            let page = match self.fetch(&url).await {
                Ok(page) => page,
                Err(e) if depth == 0 => {
                    warn!(url = %url, error = %e, "Upstream index page unavailable");
                    return Err(e);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping upstream page");
                    continue;
                }
            };

            let (base, html) = match page {
                Page::Download(file_url) => {
                    if let Some(name) = last_segment(&file_url) {
                        let record =
                            PackageRecord::upstream(name.to_string(), None, file_url.to_string());
                        if !add_record(&mut found, record, &mut sink) {
                            return Ok(CrawlOutcome::Cancelled);
                        }
                    }
                    continue;
                }
                Page::Html(base, html) => (base, html),
            };

            for anchor in extract_anchors(&html) {
                if anchor.is_homepage() {
                    continue;
                }
                let Ok(mut link) = base.join(&anchor.href) else {
                    continue;
                };
                if link.scheme() != "http" && link.scheme() != "https" {
                    continue;
                }

                if let Some(name) = last_segment(&link).filter(|name| is_archive(name)) {
                    if self.strict_prefix && !matches_package(name, &self.package) {
                        debug!(href = %anchor.href, "Ignoring archive of another package");
                        continue;
                    }
                    let name = name.to_string();
                    let checksum = md5_fragment(&link);
                    link.set_fragment(None);
                    let record = PackageRecord::upstream(name, checksum, link.to_string());
                    if !add_record(&mut found, record, &mut sink) {
                        return Ok(CrawlOutcome::Cancelled);
                    }
                    continue;
                }

                if depth >= self.max_depth || !same_subtree(&base, &link) {
                    continue;
                }
                link.set_fragment(None);
                if visited.insert(normalize_url(&link)) {
                    debug!(url = %link, depth = depth + 1, "Queued upstream page");
                    queue.push_back((link, depth + 1));
                }
            }
        }

        info!(package = %self.package, count = found.len(), "Upstream crawl complete");
        Ok(CrawlOutcome::Complete(found.into_values().collect()))
    }

    async fn fetch(&self, url: &Url) -> AppResult<Page> {
        debug!(url = %url, "Fetching upstream page");
        let download = self.fetcher.open(url, self.timeout).await?;
        if !download.status.is_success() {
            return Err(AppError::Upstream(format!(
                "{url} answered {}",
                download.status
            )));
        }
        if is_download_type(download.content_type.as_deref()) {
            return Ok(Page::Download(download.url));
        }

        let base = download.url.clone();
        let body = download.collect().await?;
        Ok(Page::Html(base, String::from_utf8_lossy(&body).into_owned()))
    }
}

/// First occurrence of a name wins.
fn add_record<S: RecordSink>(
    found: &mut IndexMap<String, PackageRecord>,
    record: PackageRecord,
    sink: &mut S,
) -> bool {
    if found.contains_key(&record.name) {
        return true;
    }
    debug!(name = %record.name, link = ?record.link, "Found upstream file");
    let keep_going = sink.emit(&record);
    found.insert(record.name.clone(), record);
    keep_going
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Records came from a fresh crawl cache entry
    Cached(Vec<PackageRecord>),
    /// Records came from a completed crawl, now persisted
    Crawled(Vec<PackageRecord>),
    Cancelled,
}

/// Upstream records of `package`, from cache when fresh (unless `reload`),
/// otherwise from a crawl whose complete result is persisted.
pub async fn resolve_upstream<S: RecordSink>(
    state: &AppState,
    package: &str,
    reload: bool,
    mut sink: S,
) -> AppResult<Resolution> {
    let Some(crawler) = Crawler::new(state, package)? else {
        debug!(package = %package, "No upstream index configured");
        return Ok(Resolution::Crawled(Vec::new()));
    };

    let cache_dir = state.cache_path(package);
    if !reload {
        if let Some(entry) = load_cache(&cache_dir, state.config.index.lifetime()).await {
            for record in &entry.versions {
                if !sink.emit(record) {
                    return Ok(Resolution::Cancelled);
                }
            }
            return Ok(Resolution::Cached(entry.versions));
        }
    }

    match crawler.run(sink).await? {
        CrawlOutcome::Complete(records) => {
            save_cache(&cache_dir, &records).await?;
            Ok(Resolution::Crawled(records))
        }
        CrawlOutcome::Cancelled => {
            info!(package = %package, "Client went away, crawl result discarded");
            Ok(Resolution::Cancelled)
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Page head, local sections and the opening of the upstream section.
pub fn render_local(package: &str, local: &[PackageRecord]) -> String {
    let package_html = escape_html(package);
    let mut html = format!(
        "<html>\n<head>\n    <title>Links for {package_html}</title>\n</head>\n<body>"
    );

    for (origin, title) in [(Origin::UploadedLocal, "Uploaded"), (Origin::CachedLocal, "Cached")] {
        html.push_str(&format!("\n<h2>{title}</h2>\n<ul>"));
        for record in local.iter().filter(|record| record.origin == origin) {
            let name = escape_html(&record.name);
            html.push_str(&format!(
                "\n    <li>\n        <a href=\"/package/cache/{package_html}/{name}#md5={}\">{name}</a>\n    </li>",
                escape_html(record.checksum.as_deref().unwrap_or_default())
            ));
        }
        html.push_str("\n</ul>");
    }

    html.push_str(concat!(
        "\n<h2>\n    Upstream\n",
        "    <form method=\"post\" style=\"display: inline\">\n",
        "        <input type=\"hidden\" name=\"reload\" value=\"1\"><input type=\"submit\" value=\"reload\">\n",
        "    </form>\n</h2>\n<ul>"
    ));
    html
}

/// One upstream list item. Records shadowed by a local file get no link.
pub fn render_upstream(package: &str, record: &PackageRecord) -> String {
    let name = escape_html(&record.name);
    match (&record.origin, &record.link) {
        (Origin::Upstream, Some(link)) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("link", link)
                .finish();
            format!(
                "\n    <li>\n        <a href=\"/package/remote/{}/{name}?{}\">{name}</a>\n    </li>",
                escape_html(package),
                escape_html(&query)
            )
        }
        _ => format!("\n    <li>\n        {name}\n    </li>"),
    }
}

pub const LISTING_FOOTER: &str = "\n</ul>\n</body>\n</html>";

/// Streams upstream entries of a listing to the client.
struct ListingSink<'a> {
    tx: &'a mpsc::UnboundedSender<String>,
    package: &'a str,
    local_names: &'a HashSet<String>,
}

impl RecordSink for ListingSink<'_> {
    fn emit(&mut self, record: &PackageRecord) -> bool {
        let record = record.clone().against_local(self.local_names);
        self.tx.send(render_upstream(self.package, &record)).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn package_name(raw: &str) -> AppResult<String> {
    let package = normalize_name(raw);
    validate_filename(&package)?;
    Ok(package)
}

/// Resolved file listing of one package.
///
/// # Route
/// `GET /simple/{name}/`
///
/// Local sections are sent at once; upstream entries follow as they are
/// discovered.
pub async fn package_listing(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> AppResult<Response> {
    let package = package_name(&name)?;
    info!(package = %package, "Generating package listing");

    let mut local = load_local(&state, &package).await?;
    sort_newest_first(&mut local, |record| record.name.as_str());
    let local_names: HashSet<String> = local.iter().map(|record| record.name.clone()).collect();

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    // The receiver is still held below, so this send cannot fail
    let _ = tx.send(render_local(&package, &local));

    tokio::spawn(async move {
        let sink = ListingSink {
            tx: &tx,
            package: &package,
            local_names: &local_names,
        };
        match resolve_upstream(&state, &package, false, sink).await {
            Ok(Resolution::Cancelled) => return,
            Ok(_) => {}
            Err(e) => warn!(package = %package, error = %e, "Upstream listing unavailable"),
        }
        let _ = tx.send(LISTING_FOOTER.to_string());
    });

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(Bytes::from(chunk)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from_stream(body))
        .map_err(|e| AppError::InternalError(format!("Failed to build listing response: {e}")))
}

/// Re-crawl the upstream index for a package.
///
/// # Route
/// `POST /simple/{name}/` and `POST /simple/{name}`
pub async fn reload_listing(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> AppResult<Redirect> {
    let package = package_name(&name)?;
    info!(package = %package, "Reloading upstream listing");

    if let Err(e) = resolve_upstream(&state, &package, true, |_: &PackageRecord| true).await {
        warn!(package = %package, error = %e, "Upstream reload failed");
    }
    Ok(Redirect::to(&format!("/simple/{package}/")))
}

/// # Route
/// `GET /simple/{name}`
pub async fn listing_redirect(AxumPath(name): AxumPath<String>) -> AppResult<Redirect> {
    let package = package_name(&name)?;
    Ok(Redirect::permanent(&format!("/simple/{package}/")))
}
