//! Read-only filesystem view of the media repository.
//!
//! [`MediaFs`] holds the async side (directory snapshot, open handles and
//! ranged reads); [`adapter`] bridges it to the kernel through `fuser`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::media::{MediaRecord, MediaRepository};
use crate::pool::WorkerPool;
use crate::reader::ChunkedReader;
use crate::{Error, Result};

mod adapter;

pub use adapter::{MountOptions, MountedFs, mount};

pub const ROOT_INO: u64 = 1;
pub const DIR_CACHE_TTL: Duration = Duration::from_secs(30);
const WRITE_FLAGS: i32 = libc::O_TRUNC | libc::O_APPEND | libc::O_CREAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("read-only filesystem")]
    AccessDenied,
    #[error("bad file handle")]
    BadHandle,
    #[error("interrupted")]
    Interrupted,
    #[error("i/o error")]
    Io,
}

impl FsError {
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AccessDenied => libc::EACCES,
            Self::BadHandle => libc::EBADF,
            Self::Interrupted => libc::EINTR,
            Self::Io => libc::EIO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsEntry {
    pub ino: u64,
    pub name: String,
    pub record: MediaRecord,
}

impl FsEntry {
    pub fn size(&self) -> u64 {
        u64::try_from(self.record.meta.file_size).unwrap_or(0)
    }
}

#[derive(Debug)]
struct DirSnapshot {
    loaded_at: Instant,
    entries: Arc<Vec<FsEntry>>,
}

#[derive(Debug)]
struct OpenHandle {
    ino: u64,
    message_id: i32,
    file_size: i64,
    cancel: CancellationToken,
}

pub struct MediaFs {
    repo: Arc<dyn MediaRepository>,
    pool: Arc<WorkerPool>,
    ttl: Duration,
    dir: RwLock<Option<DirSnapshot>>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
    shutdown: CancellationToken,
}

impl MediaFs {
    pub fn new(repo: Arc<dyn MediaRepository>, pool: Arc<WorkerPool>) -> Self {
        Self::with_ttl(repo, pool, DIR_CACHE_TTL)
    }

    pub fn with_ttl(repo: Arc<dyn MediaRepository>, pool: Arc<WorkerPool>, ttl: Duration) -> Self {
        Self {
            repo,
            pool,
            ttl,
            dir: RwLock::new(None),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Directory listing, reloaded from the repository once it is older than
    /// the TTL.
    pub async fn entries(&self) -> Result<Arc<Vec<FsEntry>>> {
        {
            let dir = self.dir.read().await;
            if let Some(snapshot) = dir.as_ref()
                && snapshot.loaded_at.elapsed() < self.ttl
            {
                return Ok(Arc::clone(&snapshot.entries));
            }
        }

        let mut dir = self.dir.write().await;
        if let Some(snapshot) = dir.as_ref()
            && snapshot.loaded_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&snapshot.entries));
        }
        let records = self.repo.list_all().await?;
        let entries = Arc::new(build_entries(records));
        debug!(
            event = "fuse.dir_reloaded",
            entries = entries.len(),
            "fuse.dir_reloaded"
        );
        *dir = Some(DirSnapshot {
            loaded_at: Instant::now(),
            entries: Arc::clone(&entries),
        });
        Ok(entries)
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<FsEntry>> {
        Ok(self.entries().await?.iter().find(|e| e.name == name).cloned())
    }

    pub async fn entry(&self, ino: u64) -> Result<Option<FsEntry>> {
        Ok(self.entries().await?.iter().find(|e| e.ino == ino).cloned())
    }

    /// Opens a file read-only and returns its handle.
    pub async fn open(&self, ino: u64, flags: i32) -> std::result::Result<u64, FsError> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & WRITE_FLAGS != 0 {
            return Err(FsError::AccessDenied);
        }
        let entry = match self.entry(ino).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(FsError::NotFound),
            Err(e) => {
                warn!(event = "fuse.open_failed", ino, error = %e, "fuse.open_failed");
                return Err(FsError::Io);
            }
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = OpenHandle {
            ino,
            message_id: entry.record.message_id,
            file_size: entry.record.meta.file_size,
            cancel: self.shutdown.child_token(),
        };
        self.lock_handles().insert(fh, handle);
        debug!(event = "fuse.open", ino, fh, name = %entry.name, "fuse.open");
        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`. Short only at EOF or on
    /// cancellation; empty at or past EOF. `request` aborts this read alone,
    /// releasing the handle aborts every read on it. A cancelled read returns
    /// what it already has, or EIO when that is nothing.
    pub async fn read(
        &self,
        request: &CancellationToken,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> std::result::Result<Vec<u8>, FsError> {
        let (ino, message_id, file_size, scope) = {
            let handles = self.lock_handles();
            let handle = handles.get(&fh).ok_or(FsError::BadHandle)?;
            (
                handle.ino,
                handle.message_id,
                handle.file_size,
                handle.cancel.child_token(),
            )
        };
        if offset < 0 || offset >= file_size || size == 0 {
            return Ok(Vec::new());
        }
        let wanted = (file_size - offset).min(i64::from(size)) as usize;

        let worker = self.pool.next_worker();
        let reader = ChunkedReader::new(message_id, offset, file_size);
        let _guard = scope.clone().drop_guard();
        let mut buf = Vec::with_capacity(wanted);
        while buf.len() < wanted {
            let next = tokio::select! {
                _ = request.cancelled() => return cancelled_read(fh, buf),
                next = worker.stream(&scope, &reader) => next,
            };
            match next {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) if scope.is_cancelled() => return cancelled_read(fh, buf),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        event = "fuse.read_failed",
                        ino,
                        fh,
                        offset,
                        size,
                        error = %e,
                        "fuse.read_failed"
                    );
                    return Err(FsError::Io);
                }
            }
        }
        buf.truncate(wanted);
        Ok(buf)
    }

    pub fn release(&self, fh: u64) {
        if let Some(handle) = self.lock_handles().remove(&fh) {
            handle.cancel.cancel();
            debug!(event = "fuse.release", fh, ino = handle.ino, "fuse.release");
        }
    }

    pub fn open_handles(&self) -> usize {
        self.lock_handles().len()
    }

    /// Cancels every outstanding read. Handles stay valid until released.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!(event = "fuse.shutdown", "fuse.shutdown");
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<u64, OpenHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cancelled_read(fh: u64, buf: Vec<u8>) -> std::result::Result<Vec<u8>, FsError> {
    debug!(
        event = "fuse.read_cancelled",
        fh,
        filled = buf.len(),
        "fuse.read_cancelled"
    );
    if buf.is_empty() {
        Err(FsError::Io)
    } else {
        Ok(buf)
    }
}

/// One entry per record, newest first. Clashing display names get the media
/// id prefixed so every name stays unique.
fn build_entries(records: Vec<MediaRecord>) -> Vec<FsEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let mut name = record.display_name();
        if !seen.insert(name.clone()) {
            name = format!("{}-{}", record.id, name);
            seen.insert(name.clone());
        }
        entries.push(FsEntry {
            ino: record.id.inode(),
            name,
            record,
        });
    }
    entries
}

impl From<Error> for FsError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { .. } => Self::NotFound,
            Error::Cancelled => Self::Interrupted,
            _ => Self::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{InMemoryMediaRepository, sample_record};
    use crate::remote::InMemoryRemote;
    use crate::worker::Worker;

    async fn fs_with(
        records: Vec<MediaRecord>,
    ) -> (MediaFs, Arc<InMemoryMediaRepository>, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new(1, 100));
        let worker = Arc::new(Worker::new(remote, 100, temp.path()));
        let pool = Arc::new(WorkerPool::from_workers(vec![worker]).unwrap());
        let repo = Arc::new(InMemoryMediaRepository::new());
        for record in &records {
            repo.insert(record).await.unwrap();
        }
        (MediaFs::new(repo.clone(), pool), repo, temp)
    }

    #[tokio::test]
    async fn duplicate_names_are_disambiguated() {
        let a = sample_record(1, "clip.mp4", "video/mp4", 10);
        let b = sample_record(2, "clip.mp4", "video/mp4", 20);
        let (fs, _repo, _temp) = fs_with(vec![a.clone(), b.clone()]).await;

        let entries = fs.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "clip.mp4");
        assert_eq!(entries[1].name, format!("{}-clip.mp4", a.id));
        assert_eq!(fs.lookup("clip.mp4").await.unwrap().unwrap().record.id, b.id);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_is_cached_until_the_ttl_passes() {
        let (fs, repo, _temp) = fs_with(vec![sample_record(1, "a.mp4", "video/mp4", 1)]).await;
        assert_eq!(fs.entries().await.unwrap().len(), 1);

        repo.insert(&sample_record(2, "b.mp4", "video/mp4", 1)).await.unwrap();
        assert_eq!(fs.entries().await.unwrap().len(), 1);

        tokio::time::advance(DIR_CACHE_TTL + Duration::from_secs(1)).await;
        assert_eq!(fs.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn writes_are_refused_and_unknown_inodes_missing() {
        let record = sample_record(1, "a.mp4", "video/mp4", 1);
        let ino = record.id.inode();
        let (fs, _repo, _temp) = fs_with(vec![record]).await;

        assert_eq!(fs.open(ino, libc::O_WRONLY).await, Err(FsError::AccessDenied));
        assert_eq!(fs.open(ino, libc::O_RDWR).await, Err(FsError::AccessDenied));
        for flag in [libc::O_TRUNC, libc::O_APPEND, libc::O_CREAT] {
            assert_eq!(
                fs.open(ino, libc::O_RDONLY | flag).await,
                Err(FsError::AccessDenied),
                "{flag:#o}"
            );
        }
        assert_eq!(fs.open(ino + 1, libc::O_RDONLY).await, Err(FsError::NotFound));
        assert!(fs.open(ino, libc::O_RDONLY).await.is_ok());
    }

    #[tokio::test]
    async fn stale_handles_are_rejected() {
        let (fs, _repo, _temp) = fs_with(Vec::new()).await;
        let token = CancellationToken::new();
        assert_eq!(fs.read(&token, 42, 0, 10).await, Err(FsError::BadHandle));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::AccessDenied.errno(), libc::EACCES);
        assert_eq!(FsError::from(Error::remote("x")), FsError::Io);
    }
}
