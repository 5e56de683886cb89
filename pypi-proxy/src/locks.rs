//! In-process advisory locks keyed by filesystem path.
//!
//! Ledger and crawl-cache files are rewritten with read-modify-write cycles.
//! Holding the lock for a path serializes those cycles between concurrent
//! requests of this process. Other processes are not coordinated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static PATH_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>> = OnceLock::new();

/// Acquire the lock guarding `path`, waiting for any current holder.
pub async fn lock_path(path: &Path) -> OwnedMutexGuard<()> {
    let lock = {
        let map = PATH_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    };
    lock.lock_owned().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_path_is_exclusive() {
        let path = Path::new("/locks-test/same");
        let guard = lock_path(path).await;

        let waiter = tokio::spawn(async move {
            let _guard = lock_path(Path::new("/locks-test/same")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.expect("waiter should acquire after release");
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_block() {
        let _a = lock_path(Path::new("/locks-test/a")).await;
        let _b = tokio::time::timeout(
            Duration::from_secs(1),
            lock_path(Path::new("/locks-test/b")),
        )
        .await
        .expect("distinct path should lock immediately");
    }
}
