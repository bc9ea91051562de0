use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::{
    ChannelHandle, DocumentDescriptor, FileLocation, RemoteApi, RemoteFuture, RemoteMedia,
    RemoteMessage, ThumbSize, UploadFile,
};
use crate::reader::is_valid_request;
use crate::{Error, Result};

const CHANNEL_ACCESS_HASH: i64 = 0x5eed;

/// Failure injected ahead of the next file-chunk call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    FloodWait(Duration),
    Timeout,
    Remote(String),
}

#[derive(Debug, Clone)]
enum StoredMessage {
    Document {
        descriptor: DocumentDescriptor,
        bytes: Bytes,
        thumb: Option<Bytes>,
    },
    Other {
        kind: String,
    },
    Text,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: BTreeMap<i32, StoredMessage>,
    failures: VecDeque<ScriptedFailure>,
    requests: Vec<(i64, i32)>,
    deleted: Vec<i32>,
    next_hash: i64,
    stalled: bool,
    stall_after: Option<usize>,
}

/// A scripted stand-in for a remote session.
///
/// Enforces the block-geometry rule and current access hashes the way the
/// real service does, so readers and workers can be exercised end to end.
#[derive(Debug)]
pub struct InMemoryRemote {
    account_id: i64,
    channel_id: i64,
    state: Mutex<MemoryState>,
    channel_calls: AtomicUsize,
    message_calls: AtomicUsize,
    chunk_calls: AtomicUsize,
    in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryRemote {
    pub fn new(account_id: i64, channel_id: i64) -> Self {
        Self {
            account_id,
            channel_id,
            state: Mutex::new(MemoryState {
                next_hash: 1_000,
                ..MemoryState::default()
            }),
            channel_calls: AtomicUsize::new(0),
            message_calls: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_document(
        &self,
        message_id: i32,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> DocumentDescriptor {
        self.insert_document(message_id, file_name, mime_type, bytes, None)
    }

    pub fn add_document_with_thumb(
        &self,
        message_id: i32,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        thumb: Vec<u8>,
    ) -> DocumentDescriptor {
        self.insert_document(message_id, file_name, mime_type, bytes, Some(thumb))
    }

    fn insert_document(
        &self,
        message_id: i32,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        thumb: Option<Vec<u8>>,
    ) -> DocumentDescriptor {
        let mut state = self.lock();
        state.next_hash += 1;
        let thumbs = thumb
            .as_ref()
            .map(|t| {
                vec![ThumbSize {
                    kind: "m".to_string(),
                    width: 320,
                    height: 180,
                    size: t.len() as i64,
                }]
            })
            .unwrap_or_default();
        let descriptor = DocumentDescriptor {
            id: 50_000 + i64::from(message_id),
            access_hash: state.next_hash,
            file_reference: message_id.to_be_bytes().to_vec(),
            dc_id: 2,
            size: bytes.len() as i64,
            mime_type: mime_type.to_string(),
            file_name: file_name.to_string(),
            duration: None,
            thumbs,
        };
        state.messages.insert(
            message_id,
            StoredMessage::Document {
                descriptor: descriptor.clone(),
                bytes: Bytes::from(bytes),
                thumb: thumb.map(Bytes::from),
            },
        );
        descriptor
    }

    /// A message whose media is not a document (a photo, a poll, ...).
    pub fn add_other_media(&self, message_id: i32, kind: &str) {
        self.lock().messages.insert(
            message_id,
            StoredMessage::Other {
                kind: kind.to_string(),
            },
        );
    }

    pub fn add_text_message(&self, message_id: i32) {
        self.lock().messages.insert(message_id, StoredMessage::Text);
    }

    /// Issues a new access hash; locations carrying the old one stop working.
    pub fn rotate_access_hash(&self, message_id: i32) -> Option<i64> {
        let mut state = self.lock();
        state.next_hash += 1;
        let next = state.next_hash;
        match state.messages.get_mut(&message_id) {
            Some(StoredMessage::Document { descriptor, .. }) => {
                descriptor.access_hash = next;
                Some(next)
            }
            _ => None,
        }
    }

    pub fn push_failure(&self, failure: ScriptedFailure) {
        self.lock().failures.push_back(failure);
    }

    /// While stalled, file-chunk calls never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Lets `calls` more file-chunk calls through, then stalls the rest.
    pub fn stall_after(&self, calls: usize) {
        let seen = self.chunk_calls.load(Ordering::SeqCst);
        self.lock().stall_after = Some(seen + calls);
    }

    pub fn channel_calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
    }

    pub fn message_calls(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn file_chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// `(offset, limit)` of every file-chunk request, in arrival order.
    pub fn file_requests(&self) -> Vec<(i64, i32)> {
        self.lock().requests.clone()
    }

    pub fn deleted_messages(&self) -> Vec<i32> {
        self.lock().deleted.clone()
    }

    fn check_channel(&self, channel: &ChannelHandle) -> Result<()> {
        if channel.id != self.channel_id || channel.access_hash != CHANNEL_ACCESS_HASH {
            return Err(Error::remote("CHANNEL_INVALID"));
        }
        Ok(())
    }

    fn read_chunk(&self, location: &FileLocation, offset: i64, limit: i32) -> Result<UploadFile> {
        let mut state = self.lock();
        state.requests.push((offset, limit));

        if let Some(failure) = state.failures.pop_front() {
            return Err(match failure {
                ScriptedFailure::FloodWait(wait) => Error::FloodWait { wait },
                ScriptedFailure::Timeout => Error::Timeout,
                ScriptedFailure::Remote(message) => Error::remote(message),
            });
        }

        if !is_valid_request(offset, i64::from(limit)) {
            return Err(Error::remote(format!(
                "LIMIT_INVALID offset={offset} limit={limit}"
            )));
        }

        let stored = state.messages.values().find_map(|m| match m {
            StoredMessage::Document {
                descriptor,
                bytes,
                thumb,
            } if descriptor.id == location.id => Some((descriptor, bytes, thumb)),
            _ => None,
        });
        let Some((descriptor, bytes, thumb)) = stored else {
            return Err(Error::remote("FILE_ID_INVALID"));
        };
        if descriptor.access_hash != location.access_hash {
            return Err(Error::remote("FILE_REFERENCE_EXPIRED"));
        }

        let source = if location.thumb_size.is_empty() {
            bytes
        } else {
            thumb
                .as_ref()
                .ok_or_else(|| Error::remote("THUMB_SIZE_INVALID"))?
        };
        let len = source.len() as i64;
        let start = offset.clamp(0, len) as usize;
        let end = (offset + i64::from(limit)).clamp(0, len) as usize;
        Ok(UploadFile::File {
            data: source.slice(start..end),
            storage_type: "storage.filePartial".to_string(),
        })
    }
}

impl RemoteApi for InMemoryRemote {
    fn account_id(&self) -> i64 {
        self.account_id
    }

    fn fetch_channel<'a>(&'a self, channel_id: i64) -> RemoteFuture<'a, ChannelHandle> {
        Box::pin(async move {
            self.channel_calls.fetch_add(1, Ordering::SeqCst);
            if channel_id != self.channel_id {
                return Err(Error::not_found(format!("channel {channel_id}")));
            }
            Ok(ChannelHandle {
                id: channel_id,
                access_hash: CHANNEL_ACCESS_HASH,
            })
        })
    }

    fn fetch_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, Vec<RemoteMessage>> {
        Box::pin(async move {
            self.message_calls.fetch_add(1, Ordering::SeqCst);
            self.check_channel(channel)?;
            let state = self.lock();
            Ok(ids
                .iter()
                .map(|&id| match state.messages.get(&id) {
                    Some(StoredMessage::Document { descriptor, .. }) => RemoteMessage::Message {
                        id,
                        media: Some(RemoteMedia::Document(descriptor.clone())),
                    },
                    Some(StoredMessage::Other { kind }) => RemoteMessage::Message {
                        id,
                        media: Some(RemoteMedia::Other { kind: kind.clone() }),
                    },
                    Some(StoredMessage::Text) => RemoteMessage::Message { id, media: None },
                    None => RemoteMessage::Empty { id },
                })
                .collect())
        })
    }

    fn fetch_file_chunk<'a>(
        &'a self,
        location: &'a FileLocation,
        offset: i64,
        limit: i32,
    ) -> RemoteFuture<'a, UploadFile> {
        Box::pin(async move {
            let call = self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            let stalled = {
                let state = self.lock();
                state.stalled || state.stall_after.is_some_and(|after| call >= after)
            };
            if stalled {
                let _guard = InFlight::enter(&self.in_flight);
                std::future::pending::<()>().await;
            }
            self.read_chunk(location, offset, limit)
        })
    }

    fn delete_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.check_channel(channel)?;
            let mut state = self.lock();
            for id in ids {
                state.messages.remove(id);
                state.deleted.push(*id);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_requests_that_break_block_geometry() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(3, "a", "x/y", vec![0u8; 2 << 20]);

        for (offset, limit) in [(100, 4096), (0, 5000), (1_048_576 - 4096, 8192)] {
            let err = remote
                .fetch_file_chunk(&doc.location(), offset, limit)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Remote { .. }), "{offset}/{limit}");
        }
        assert!(remote.fetch_file_chunk(&doc.location(), 524_288, 524_288).await.is_ok());
    }

    #[tokio::test]
    async fn rotated_hash_invalidates_old_locations() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(3, "a", "x/y", vec![7u8; 10]);
        remote.rotate_access_hash(3).unwrap();

        let err = remote
            .fetch_file_chunk(&doc.location(), 0, 4096)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FILE_REFERENCE_EXPIRED"));
    }

    #[tokio::test]
    async fn messages_come_back_in_request_order() {
        let remote = InMemoryRemote::new(1, 100);
        remote.add_document(5, "a", "x/y", vec![1]);
        remote.add_text_message(6);
        let channel = remote.fetch_channel(100).await.unwrap();

        let got = remote.fetch_messages(&channel, &[6, 9, 5]).await.unwrap();
        assert!(matches!(got[0], RemoteMessage::Message { id: 6, media: None }));
        assert!(matches!(got[1], RemoteMessage::Empty { id: 9 }));
        assert!(matches!(
            got[2],
            RemoteMessage::Message { id: 5, media: Some(RemoteMedia::Document(_)) }
        ));
    }
}
