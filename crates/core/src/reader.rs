//! Turns a logical `[start, file_size)` range into a sequence of remote
//! reads that satisfy the block-geometry rule.
//!
//! The remote only serves reads whose size is a power of two between 4 KiB
//! and 512 KiB, aligned to that size, and contained in one 1 MiB window.
//! Readers therefore fetch from a window aligned below `start` and trim the
//! head of the first block, so the first [`Block::offset`] is `start`.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::remote::{FileLocation, RemoteApi, UploadFile};
use crate::remote::throttle::FLOOD_WAIT_CEILING;
use crate::{Error, Result};

pub const MIN_PART_SIZE: i64 = 4 * 1024;
pub const MAX_PART_SIZE: i64 = 512 * 1024;
pub const WINDOW_SIZE: i64 = 1024 * 1024;

/// Largest power-of-two part in `[MIN_PART_SIZE, MAX_PART_SIZE]` that stays
/// inside the current 1 MiB window and the file. Falls back to
/// `MIN_PART_SIZE` when nothing fits, and returns 0 at or past EOF.
pub fn adjust_limit(offset: i64, file_size: i64) -> i64 {
    let max_by_file = file_size - offset;
    if max_by_file <= 0 {
        return 0;
    }
    let max_by_window = (offset / WINDOW_SIZE + 1) * WINDOW_SIZE - offset;
    let cap = max_by_file.min(max_by_window);

    let mut limit = MAX_PART_SIZE;
    while limit >= MIN_PART_SIZE {
        if limit <= cap {
            return limit;
        }
        limit /= 2;
    }
    MIN_PART_SIZE
}

pub fn is_valid_request(offset: i64, limit: i64) -> bool {
    offset >= 0
        && (MIN_PART_SIZE..=MAX_PART_SIZE).contains(&limit)
        && limit.count_ones() == 1
        && offset % limit == 0
        && offset / WINDOW_SIZE == (offset + limit - 1) / WINDOW_SIZE
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// File offset of `data[0]`.
    pub offset: i64,
    /// Size of the remote read the block came from.
    pub part_size: i64,
    pub data: Bytes,
}

#[derive(Debug)]
struct Cursor {
    next: i64,
    delivered: bool,
}

#[derive(Debug)]
pub struct ChunkedReader {
    message_id: i32,
    file_size: i64,
    start: i64,
    cursor: Mutex<Cursor>,
    location: Mutex<Option<FileLocation>>,
    flood_ceiling: Duration,
}

impl ChunkedReader {
    pub fn new(message_id: i32, start: i64, file_size: i64) -> Self {
        Self {
            message_id,
            file_size,
            start,
            cursor: Mutex::new(Cursor {
                next: first_window(start, file_size),
                delivered: false,
            }),
            location: Mutex::new(None),
            flood_ceiling: FLOOD_WAIT_CEILING,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    /// Location resolved by the first caller, reused for every later block.
    pub fn location(&self) -> Option<FileLocation> {
        self.location
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_location(&self, location: FileLocation) {
        *self.location.lock().unwrap_or_else(|e| e.into_inner()) = Some(location);
    }

    /// Moves the cursor back to the first window. Only possible while no
    /// block has been delivered.
    pub fn rewind(&self) -> bool {
        let mut cursor = self.lock_cursor();
        if cursor.delivered {
            return false;
        }
        cursor.next = first_window(self.start, self.file_size);
        true
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetches the next block. `None` means EOF or cancellation.
    pub async fn next(
        &self,
        cancel: &CancellationToken,
        remote: &dyn RemoteApi,
        location: &FileLocation,
    ) -> Result<Option<Block>> {
        let (offset, limit) = {
            let mut cursor = self.lock_cursor();
            let offset = cursor.next;
            let limit = adjust_limit(offset, self.file_size);
            cursor.next += limit;
            (offset, limit)
        };

        if cancel.is_cancelled() || limit == 0 {
            return Ok(None);
        }

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                r = remote.fetch_file_chunk(location, offset, limit as i32) => r,
            };

            match result {
                Ok(UploadFile::File { data, .. }) => {
                    self.lock_cursor().delivered = true;
                    return Ok(Some(self.trim(offset, limit, data)));
                }
                Ok(UploadFile::CdnRedirect { dc_id }) => return Err(Error::CdnRedirect { dc_id }),
                Err(Error::FloodWait { wait }) => {
                    if wait > self.flood_ceiling {
                        return Err(Error::FloodWaitTooLong {
                            requested: wait,
                            ceiling: self.flood_ceiling,
                        });
                    }
                    debug!(
                        event = "reader.flood_wait",
                        message_id = self.message_id,
                        offset,
                        wait_ms = wait.as_millis() as u64,
                        "reader.flood_wait"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(Error::Timeout) => {
                    debug!(
                        event = "reader.timeout_retry",
                        message_id = self.message_id,
                        offset,
                        limit,
                        "reader.timeout_retry"
                    );
                }
                Err(e @ (Error::FloodWaitTooLong { .. } | Error::CdnRedirect { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    return Err(Error::remote(format!(
                        "upload.getFile message={} offset={offset} limit={limit}: {e}",
                        self.message_id
                    )));
                }
            }
        }
    }

    fn trim(&self, offset: i64, limit: i64, mut data: Bytes) -> Block {
        let skip = (self.start - offset).max(0) as usize;
        let data = if skip > 0 {
            data.split_off(skip.min(data.len()))
        } else {
            data
        };
        Block {
            offset: offset.max(self.start),
            part_size: limit,
            data,
        }
    }
}

/// Window-aligned offset of the read that contains `start`.
fn first_window(start: i64, file_size: i64) -> i64 {
    if start <= 0 {
        return 0;
    }
    if start >= file_size {
        return start;
    }
    let mut cursor = start - start % MAX_PART_SIZE;
    loop {
        let limit = adjust_limit(cursor, file_size);
        if limit == 0 || cursor + limit > start {
            return cursor;
        }
        cursor += limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, ScriptedFailure};

    const MIB: i64 = 1024 * 1024;

    #[test]
    fn adjust_limit_examples() {
        assert_eq!(adjust_limit(0, 10 * MIB), 524_288);
        assert_eq!(adjust_limit(0, 100), 4096);
        assert_eq!(adjust_limit(0, 5000), 4096);
        assert_eq!(adjust_limit(0, 9000), 8192);
        assert_eq!(adjust_limit(MIB - 4096, 10 * MIB), 4096);
        assert_eq!(adjust_limit(3 * MIB, 4 * MIB), 524_288);
        assert_eq!(adjust_limit(10, 10), 0);
        assert_eq!(adjust_limit(11, 10), 0);
    }

    #[test]
    fn adjust_limit_invariants() {
        for file_size in [1, 4095, 4096, 70_000, 1_300_000, 3 * MIB + 17] {
            let mut offset = 0;
            while offset < file_size {
                let limit = adjust_limit(offset, file_size);
                assert!(limit.count_ones() == 1, "{offset}/{file_size}");
                assert!((MIN_PART_SIZE..=MAX_PART_SIZE).contains(&limit));
                assert!(
                    limit == MIN_PART_SIZE
                        || (offset + limit <= (offset / WINDOW_SIZE + 1) * WINDOW_SIZE
                            && offset + limit <= file_size)
                );
                assert!(is_valid_request(offset, limit), "{offset}/{limit}");
                offset += limit;
            }
        }
    }

    #[test]
    fn first_window_contains_start() {
        let size = 600 * 1024;
        for start in [0, 1, 4096, 524_287, 524_288, 590 * 1024, size - 1] {
            let window = first_window(start, size);
            let limit = adjust_limit(window, size);
            assert!(window <= start && start < window + limit, "{start}");
            assert!(is_valid_request(window, limit));
        }
        assert_eq!(first_window(size, size), size);
    }

    async fn drain(reader: &ChunkedReader, remote: &InMemoryRemote, loc: &FileLocation) -> Vec<Block> {
        let cancel = CancellationToken::new();
        let mut blocks = Vec::new();
        while let Some(block) = reader.next(&cancel, remote, loc).await.unwrap() {
            blocks.push(block);
        }
        blocks
    }

    #[tokio::test]
    async fn reads_whole_file_in_geometry_compliant_blocks() {
        let bytes: Vec<u8> = (0..(2 * MIB + 12_345)).map(|i| (i % 251) as u8).collect();
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", bytes.clone());

        let reader = ChunkedReader::new(4, 0, bytes.len() as i64);
        let blocks = drain(&reader, &remote, &doc.location()).await;

        let joined: Vec<u8> = blocks.iter().flat_map(|b| b.data.to_vec()).collect();
        assert_eq!(joined, bytes);
        assert!(blocks.windows(2).all(|w| w[0].offset < w[1].offset));
        for (offset, limit) in remote.file_requests() {
            assert!(is_valid_request(offset, i64::from(limit)));
        }
    }

    #[tokio::test]
    async fn unaligned_start_is_trimmed_to_the_requested_byte() {
        let bytes: Vec<u8> = (0..(MIB + 500)).map(|i| (i % 199) as u8).collect();
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", bytes.clone());

        let start = 700_001;
        let reader = ChunkedReader::new(4, start, bytes.len() as i64);
        let blocks = drain(&reader, &remote, &doc.location()).await;

        assert_eq!(blocks[0].offset, start);
        let joined: Vec<u8> = blocks.iter().flat_map(|b| b.data.to_vec()).collect();
        assert_eq!(joined, bytes[start as usize..]);
        assert_eq!(remote.file_requests()[0], (524_288, 524_288));
    }

    #[tokio::test]
    async fn start_at_eof_reads_nothing() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", vec![1u8; 100]);
        let reader = ChunkedReader::new(4, 100, 100);
        assert!(drain(&reader, &remote, &doc.location()).await.is_empty());
        assert_eq!(remote.file_chunk_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_and_short_flood_waits_are_retried() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", vec![3u8; 5000]);
        remote.push_failure(ScriptedFailure::Timeout);
        remote.push_failure(ScriptedFailure::FloodWait(Duration::from_secs(2)));
        remote.push_failure(ScriptedFailure::Timeout);

        let reader = ChunkedReader::new(4, 0, 5000);
        let blocks = drain(&reader, &remote, &doc.location()).await;
        assert_eq!(blocks.iter().map(|b| b.data.len()).sum::<usize>(), 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn long_flood_wait_is_not_retried() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", vec![3u8; 5000]);
        remote.push_failure(ScriptedFailure::FloodWait(Duration::from_secs(6)));

        let reader = ChunkedReader::new(4, 0, 5000);
        let err = reader
            .next(&CancellationToken::new(), &remote, &doc.location())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FloodWaitTooLong { .. }));
        assert_eq!(remote.file_chunk_calls(), 1);
    }

    #[tokio::test]
    async fn other_errors_are_wrapped_with_context() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", vec![3u8; 5000]);
        remote.push_failure(ScriptedFailure::Remote("FILE_REFERENCE_EXPIRED".into()));

        let reader = ChunkedReader::new(4, 0, 5000);
        let err = reader
            .next(&CancellationToken::new(), &remote, &doc.location())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("FILE_REFERENCE_EXPIRED"), "{message}");
        assert!(message.contains("offset=0"), "{message}");
    }

    #[tokio::test]
    async fn rewind_replays_the_first_window_until_a_block_arrives() {
        let bytes: Vec<u8> = (0..(MIB + 10)).map(|i| (i % 13) as u8).collect();
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", bytes.clone());
        remote.push_failure(ScriptedFailure::Remote("FILE_REFERENCE_EXPIRED".into()));

        let start = 600_000;
        let reader = ChunkedReader::new(4, start, bytes.len() as i64);
        let cancel = CancellationToken::new();
        assert!(reader.next(&cancel, &remote, &doc.location()).await.is_err());
        assert!(reader.rewind());

        let block = reader.next(&cancel, &remote, &doc.location()).await.unwrap().unwrap();
        assert_eq!(block.offset, start);
        assert_eq!(remote.file_requests()[..2], [(524_288, 524_288), (524_288, 524_288)]);
        assert!(!reader.rewind());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_fetch() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(4, "f", "x/y", vec![3u8; 5000]);
        remote.set_stalled(true);

        let cancel = CancellationToken::new();
        let reader = ChunkedReader::new(4, 0, 5000);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let got = reader.next(&cancel, &remote, &doc.location()).await.unwrap();
        assert!(got.is_none());
        assert_eq!(remote.in_flight(), 0);
    }
}
