//! # Checksum Ledger
//!
//! Each package directory carries a `.md5` file listing the MD5 digest of
//! every file stored there, one `"<hash> *<filename>"` line per file. Lines
//! starting with `;` and blank lines are comments.
//!
//! The ledger is a cache, not a transactional index: entries survive file
//! deletion, and [`Ledger::update`] rewrites the whole file while keeping
//! untouched entries in their original order. [`Ledger::rescan`] plus
//! [`Ledger::write`] rebuild it from the directory contents.

use crate::error::{AppError, AppResult};
use crate::locks::lock_path;
use indexmap::IndexMap;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Per-directory ledger file name.
pub const LEDGER_FILENAME: &str = ".md5";
/// Per-package crawl cache file name, written by the resolver.
pub const CACHE_FILENAME: &str = ".cache";
/// Root-level ledger written by [`rebuild_tree`].
pub const ROOT_LEDGER_FILENAME: &str = "checksums.md5";

const SEPARATOR: &str = " *";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub hash: String,
    pub filename: String,
}

impl LedgerEntry {
    pub fn new(hash: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            filename: filename.into(),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return None;
        }
        let (hash, filename) = line.split_once(SEPARATOR)?;
        Some(Self::new(hash.trim(), filename))
    }

    fn format(&self) -> String {
        format!("{}{}{}", self.hash, SEPARATOR, self.filename)
    }
}

/// Calculate the MD5 of in-memory data as lowercase hex.
///
/// ```
/// # use pypi_proxy::checksum::md5_hex;
/// assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
/// ```
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Calculate the MD5 of a file, reading it in fixed-size chunks.
pub async fn digest_file(path: &Path) -> AppResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `name` is bookkeeping written next to package files.
pub fn is_sidecar(name: &str) -> bool {
    name == LEDGER_FILENAME
        || name == CACHE_FILENAME
        || name == ROOT_LEDGER_FILENAME
        || (name.starts_with('.') && name.ends_with(".tmp"))
}

/// Hidden file in `dir` that receives `filename` until it is complete.
/// Every call names a distinct file, so concurrent writers never share one.
pub fn partial_path(dir: &Path, filename: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{filename}.{}-{seq}.tmp", std::process::id()))
}

/// The ledger of one directory.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
    file: PathBuf,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let file = dir.join(LEDGER_FILENAME);
        Self { dir, file }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// All entries in file order. A missing ledger has no entries.
    pub async fn entries(&self) -> AppResult<Vec<LedgerEntry>> {
        let content = match fs::read_to_string(&self.file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content.lines().filter_map(LedgerEntry::parse).collect())
    }

    pub async fn get(&self, filename: &str) -> AppResult<Option<String>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.filename == filename)
            .map(|entry| entry.hash))
    }

    /// Record the digest of `filename`, computing it from disk when `hash` is
    /// `None`. Returns the recorded digest.
    pub async fn update(&self, filename: &str, hash: Option<&str>) -> AppResult<String> {
        let _guard = lock_path(&self.file).await;

        let hash = match hash {
            Some(hash) => hash.to_string(),
            None => digest_file(&self.dir.join(filename)).await?,
        };

        let mut entries: IndexMap<String, String> = self
            .entries()
            .await?
            .into_iter()
            .map(|entry| (entry.filename, entry.hash))
            .collect();
        entries.insert(filename.to_string(), hash.clone());

        let entries: Vec<LedgerEntry> = entries
            .into_iter()
            .map(|(filename, hash)| LedgerEntry::new(hash, filename))
            .collect();
        self.write_unlocked(&entries).await?;

        debug!(ledger = %self.file.display(), filename = %filename, hash = %hash, "Ledger updated");
        Ok(hash)
    }

    /// Make sure `filename` has an entry, hashing the file only when absent.
    pub async fn ensure(&self, filename: &str) -> AppResult<String> {
        if let Some(hash) = self.get(filename).await? {
            return Ok(hash);
        }
        info!(ledger = %self.file.display(), filename = %filename, "Computing missing checksum");
        self.update(filename, None).await
    }

    /// Hash every regular file in the directory, skipping sidecar files.
    pub async fn rescan(&self) -> AppResult<Vec<LedgerEntry>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping non UTF-8 filename");
                continue;
            };
            if is_sidecar(&name) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let hash = digest_file(&self.dir.join(&name)).await?;
            entries.push(LedgerEntry::new(hash, name));
        }
        Ok(entries)
    }

    /// Replace the ledger with `entries`.
    pub async fn write(&self, entries: &[LedgerEntry]) -> AppResult<()> {
        let _guard = lock_path(&self.file).await;
        self.write_unlocked(entries).await
    }

    async fn write_unlocked(&self, entries: &[LedgerEntry]) -> AppResult<()> {
        write_entries(&self.file, entries).await
    }
}

async fn write_entries(file: &Path, entries: &[LedgerEntry]) -> AppResult<()> {
    let content = entries
        .iter()
        .map(LedgerEntry::format)
        .collect::<Vec<_>>()
        .join("\n");

    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::InternalError(format!("Invalid ledger path {}", file.display())))?;
    let tmp = file.with_file_name(format!(".{}.tmp", name.trim_start_matches('.')));

    fs::write(&tmp, content).await?;
    fs::rename(&tmp, file).await?;
    Ok(())
}

/// Rebuild every package ledger below `root` and a root-level
/// `checksums.md5` naming files relative to `root`.
///
/// Returns the number of files hashed.
pub async fn rebuild_tree(root: &Path) -> AppResult<usize> {
    let mut packages = Vec::new();
    let mut dir = fs::read_dir(root).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            packages.push(entry.path());
        }
    }
    packages.sort();

    let mut all = Vec::new();
    for package_dir in packages {
        info!(path = %package_dir.display(), "Scanning package directory");
        let ledger = Ledger::new(&package_dir);
        let entries = ledger.rescan().await?;
        ledger.write(&entries).await?;

        let package = package_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        all.extend(
            entries
                .into_iter()
                .map(|entry| LedgerEntry::new(entry.hash, format!("{package}/{}", entry.filename))),
        );
    }

    let root_file = root.join(ROOT_LEDGER_FILENAME);
    let _guard = lock_path(&root_file).await;
    write_entries(&root_file, &all).await?;
    Ok(all.len())
}
