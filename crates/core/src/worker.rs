use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::FileCache;
use crate::reader::{ChunkedReader, MAX_PART_SIZE};
use crate::remote::{ChannelHandle, DocumentDescriptor, RemoteApi, RemoteMedia, RemoteMessage, UploadFile};
use crate::{Error, Result};

pub const DOC_CACHE_SUFFIX: &str = "doc";
pub const ACCESS_HASH_CACHE_SUFFIX: &str = "accHash";

/// One bot identity: a remote session plus its descriptor caches.
pub struct Worker {
    remote: Arc<dyn RemoteApi>,
    channel_id: i64,
    channel: Mutex<Option<ChannelHandle>>,
    doc_cache: FileCache<Vec<u8>>,
    hash_cache: FileCache<i64>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("account_id", &self.remote.account_id())
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(remote: Arc<dyn RemoteApi>, channel_id: i64, cache_root: &Path) -> Self {
        Self {
            remote,
            channel_id,
            channel: Mutex::new(None),
            doc_cache: FileCache::new(cache_root, DOC_CACHE_SUFFIX),
            hash_cache: FileCache::new(cache_root, ACCESS_HASH_CACHE_SUFFIX),
        }
    }

    pub fn account_id(&self) -> i64 {
        self.remote.account_id()
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub fn remote(&self) -> &dyn RemoteApi {
        self.remote.as_ref()
    }

    /// Resolved once; concurrent first callers wait on the same fetch.
    pub async fn channel(&self) -> Result<ChannelHandle> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = *slot {
            return Ok(channel);
        }
        let channel = self.remote.fetch_channel(self.channel_id).await?;
        *slot = Some(channel);
        Ok(channel)
    }

    fn cache_key(&self, message_id: i32) -> String {
        format!("{}-{}", self.account_id(), message_id)
    }

    async fn fetch_doc(&self, message_id: i32) -> Result<DocumentDescriptor> {
        let channel = self.channel().await?;
        let messages = self.remote.fetch_messages(&channel, &[message_id]).await?;
        let message = messages
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("message {message_id}")))?;

        match message {
            RemoteMessage::Empty { .. } => Err(Error::not_found(format!("message {message_id}"))),
            RemoteMessage::Message { media: None, .. } => Err(Error::UnexpectedType {
                expected: "MessageMediaDocument".to_string(),
                got: "no media".to_string(),
            }),
            RemoteMessage::Message {
                media: Some(RemoteMedia::Other { kind }),
                ..
            } => Err(Error::UnexpectedType {
                expected: "MessageMediaDocument".to_string(),
                got: kind,
            }),
            RemoteMessage::Message {
                media: Some(RemoteMedia::Document(doc)),
                ..
            } => Ok(doc),
        }
    }

    /// The document descriptor behind `message_id`, served from the disk
    /// cache when possible.
    pub async fn get_doc(&self, message_id: i32) -> Result<DocumentDescriptor> {
        let key = self.cache_key(message_id);
        let cached = self
            .doc_cache
            .get_or_set(&key, || async {
                self.fetch_doc(message_id).await?.encode()
            })
            .await?;

        if let Some(doc) = DocumentDescriptor::decode(&cached) {
            return Ok(doc);
        }

        debug!(
            event = "worker.doc_cache_corrupt",
            account_id = self.account_id(),
            message_id,
            "worker.doc_cache_corrupt"
        );
        self.refresh_doc(message_id).await
    }

    /// Re-fetches the descriptor and overwrites both cache entries.
    pub async fn refresh_doc(&self, message_id: i32) -> Result<DocumentDescriptor> {
        let key = self.cache_key(message_id);
        let doc = self.fetch_doc(message_id).await?;
        if let Err(e) = self.doc_cache.set(&key, &doc.encode()?).await {
            warn!(
                event = "worker.doc_cache_write_failed",
                key,
                error = %e,
                "worker.doc_cache_write_failed"
            );
        }
        if let Err(e) = self.hash_cache.set(&key, &doc.access_hash).await {
            warn!(
                event = "worker.hash_cache_write_failed",
                key,
                error = %e,
                "worker.hash_cache_write_failed"
            );
        }
        Ok(doc)
    }

    /// Bytes of the document's first thumbnail.
    pub async fn get_thumbnail(&self, message_id: i32) -> Result<Bytes> {
        let doc = self.get_doc(message_id).await?;
        let thumb = doc.thumbs.first().ok_or(Error::NoThumbnail)?;

        let access_hash = self
            .hash_cache
            .get_or_set(&self.cache_key(message_id), || async {
                Ok(self.fetch_doc(message_id).await?.access_hash)
            })
            .await?;

        let location = doc.thumb_location(thumb, access_hash);
        match self
            .remote
            .fetch_file_chunk(&location, 0, MAX_PART_SIZE as i32)
            .await?
        {
            UploadFile::File { data, .. } => Ok(data),
            UploadFile::CdnRedirect { dc_id } => Err(Error::CdnRedirect { dc_id }),
        }
    }

    /// Next chunk of the reader's range; `None` at EOF or on cancellation.
    ///
    /// The location is looked up once per reader. A stale reference on the
    /// first block refreshes the descriptor and retries that block once.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        reader: &ChunkedReader,
    ) -> Result<Option<Bytes>> {
        let message_id = reader.message_id();
        let location = match reader.location() {
            Some(location) => location,
            None => {
                let doc = tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    doc = self.get_doc(message_id) => doc?,
                };
                reader.set_location(doc.location());
                doc.location()
            }
        };

        let block = match reader.next(cancel, self.remote.as_ref(), &location).await {
            Err(e) if e.is_stale_reference() && reader.rewind() => {
                debug!(
                    event = "worker.doc_refresh",
                    account_id = self.account_id(),
                    message_id,
                    error = %e,
                    "worker.doc_refresh"
                );
                let doc = tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    doc = self.refresh_doc(message_id) => doc?,
                };
                reader.set_location(doc.location());
                reader
                    .next(cancel, self.remote.as_ref(), &doc.location())
                    .await?
            }
            other => other?,
        };
        Ok(block.map(|block| block.data))
    }

    pub async fn delete_messages(&self, message_ids: &[i32]) -> Result<()> {
        let channel = self.channel().await?;
        self.remote.delete_messages(&channel, message_ids).await
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.remote.disconnect().await {
            warn!(
                event = "worker.shutdown_failed",
                account_id = self.account_id(),
                error = %e,
                "worker.shutdown_failed"
            );
        }
    }
}
