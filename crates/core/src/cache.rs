//! Disk-backed, string-keyed cache of small values.
//!
//! Entries live at `{root}/{key}-{suffix}`. The cache is advisory: a missing
//! or undecodable entry is a miss and gets recomputed and overwritten.

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Error, Result};

mod sealed {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for Vec<u8> {}
}

/// Values the cache knows how to persist. Only `i64` and `Vec<u8>` qualify.
pub trait CacheValue: sealed::Sealed + Sized + Send {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: Vec<u8>) -> Option<Self>;
}

impl CacheValue for i64 {
    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn decode(bytes: Vec<u8>) -> Option<Self> {
        std::str::from_utf8(&bytes).ok()?.trim().parse().ok()
    }
}

impl CacheValue for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: Vec<u8>) -> Option<Self> {
        Some(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct FileCache<T> {
    root: PathBuf,
    suffix: String,
    _value: PhantomData<fn() -> T>,
}

impl<T: CacheValue> FileCache<T> {
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
            _value: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}-{}", self.suffix))
    }

    pub async fn get(&self, key: &str) -> Result<T> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CacheMiss {
                    key: key.to_string(),
                });
            }
            Err(e) => {
                debug!(
                    event = "cache.read_failed",
                    path = %path.display(),
                    error = %e,
                    "cache.read_failed"
                );
                return Err(Error::CacheMiss {
                    key: key.to_string(),
                });
            }
        };

        T::decode(bytes).ok_or_else(|| Error::CacheMiss {
            key: key.to_string(),
        })
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key);
        write_file(&path, &value.encode()).await?;
        Ok(())
    }

    /// Returns the cached value, or computes, stores and returns it.
    ///
    /// Racing callers may both compute; the last write wins. A failed store
    /// is logged and otherwise ignored.
    pub async fn get_or_set<F, Fut>(&self, key: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.get(key).await {
            Ok(value) => return Ok(value),
            Err(Error::CacheMiss { .. }) => {}
            Err(e) => return Err(e),
        }

        let value = compute().await?;
        if let Err(e) = self.set(key, &value).await {
            warn!(
                event = "cache.write_failed",
                key,
                suffix = %self.suffix,
                error = %e,
                "cache.write_failed"
            );
        }
        Ok(value)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn int_roundtrip_uses_decimal_text() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<i64>::new(temp.path(), "accHash");

        cache.set("42-7", &-9_123_456_789).await.unwrap();
        assert_eq!(cache.get("42-7").await.unwrap(), -9_123_456_789);

        let raw = std::fs::read_to_string(temp.path().join("42-7-accHash")).unwrap();
        assert_eq!(raw, "-9123456789");
    }

    #[tokio::test]
    async fn bytes_are_stored_verbatim() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<Vec<u8>>::new(temp.path(), "doc");

        cache.set("1-2", &vec![0, 159, 146, 150]).await.unwrap();
        assert_eq!(cache.get("1-2").await.unwrap(), vec![0, 159, 146, 150]);
        assert_eq!(
            std::fs::read(temp.path().join("1-2-doc")).unwrap(),
            vec![0, 159, 146, 150]
        );
    }

    #[tokio::test]
    async fn missing_root_is_a_miss_and_set_fails_with_io() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<i64>::new(temp.path().join("absent"), "accHash");

        assert!(matches!(
            cache.get("k").await,
            Err(Error::CacheMiss { .. })
        ));
        assert!(matches!(cache.set("k", &1).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn get_or_set_computes_once_then_hits() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<Vec<u8>>::new(temp.path(), "doc");
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_set("k", || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(b"descriptor".to_vec())
            })
            .await
            .unwrap();
        let second = cache
            .get_or_set("k", || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(b"other".to_vec())
            })
            .await
            .unwrap();

        assert_eq!(first, b"descriptor");
        assert_eq!(second, b"descriptor");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn corrupt_int_entry_self_heals() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("k-accHash"), "not a number").unwrap();
        let cache = FileCache::<i64>::new(temp.path(), "accHash");

        let value = cache.get_or_set("k", || async { Ok(77) }).await.unwrap();
        assert_eq!(value, 77);
        assert_eq!(cache.get("k").await.unwrap(), 77);
    }

    #[tokio::test]
    async fn get_or_set_ignores_store_failure() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<i64>::new(temp.path().join("absent"), "accHash");

        let value = cache.get_or_set("k", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn compute_error_is_propagated() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileCache::<i64>::new(temp.path(), "accHash");

        let err = cache
            .get_or_set("k", || async { Err(Error::not_found("message 3")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!temp.path().join("k-accHash").exists());
    }
}
