//! Local metadata for archived media, and the repository the web and FUSE
//! frontends read it from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::remote::DocumentDescriptor;
use crate::{BoxFuture, Error, Result};

const FUSE_ROOT_INO: u64 = 1;

/// 12-byte identifier: 4 bytes of big-endian unix seconds, then 8 random
/// bytes. Rendered as 24 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaId([u8; 12]);

impl MediaId {
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&(at.timestamp().max(0) as u32).to_be_bytes());
        bytes[4..].copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Stable inode number, never colliding with the mount root.
    pub fn inode(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        let ino = u64::from_be_bytes(head);
        if ino <= FUSE_ROOT_INO {
            ino + FUSE_ROOT_INO + 1
        } else {
            ino
        }
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for MediaId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| Error::not_found(format!("media {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for MediaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MediaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    pub file_size: i64,
    pub file_name: String,
    pub mime_type: String,
    pub duration: Option<f64>,
    /// Channel the message lives in.
    pub location: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub message_id: i32,
    pub meta: MediaMeta,
    pub thumbnail_key: Option<String>,
    pub sprite_key: Option<String>,
    pub vtt_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn from_document(message_id: i32, channel_id: i64, doc: &DocumentDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: MediaId::generate_at(now),
            message_id,
            meta: MediaMeta {
                file_size: doc.size,
                file_name: doc.file_name.clone(),
                mime_type: doc.mime_type.clone(),
                duration: doc.duration,
                location: channel_id,
            },
            thumbnail_key: None,
            sprite_key: None,
            vtt_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// File name shown to clients: the stored name, or the hex id plus an
    /// extension guessed from the MIME type.
    pub fn display_name(&self) -> String {
        let name = self.meta.file_name.trim();
        if !name.is_empty() {
            return name.replace(['/', '\0'], "_");
        }
        format!("{}{}", self.id, ext_from_mime(&self.meta.mime_type))
    }
}

/// Extension (with leading dot) for the MIME types the archive commonly
/// holds; anything else is `.bin`.
pub fn ext_from_mime(mime: &str) -> &'static str {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/x-matroska" => ".mkv",
        "video/quicktime" => ".mov",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".ogg",
        "audio/webm" => ".weba",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        _ => ".bin",
    }
}

pub trait MediaRepository: Send + Sync {
    fn get<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, Option<MediaRecord>>;

    fn find_by_message<'a>(
        &'a self,
        location: i64,
        message_id: i32,
    ) -> BoxFuture<'a, Option<MediaRecord>>;

    /// Newest first; `page` is 1-based.
    fn list_page<'a>(&'a self, page: u32, per_page: u32) -> BoxFuture<'a, Vec<MediaRecord>>;

    fn list_all<'a>(&'a self) -> BoxFuture<'a, Vec<MediaRecord>>;

    fn count<'a>(&'a self) -> BoxFuture<'a, u64>;

    fn insert<'a>(&'a self, record: &'a MediaRecord) -> BoxFuture<'a, ()>;

    /// Whether a record was removed.
    fn delete<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, bool>;
}

fn newest_first(records: &mut [MediaRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[derive(Debug, Default)]
pub struct InMemoryMediaRepository {
    records: RwLock<BTreeMap<MediaId, MediaRecord>>,
}

impl InMemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<MediaRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<MediaRecord> = records.values().cloned().collect();
        newest_first(&mut all);
        all
    }
}

impl MediaRepository for InMemoryMediaRepository {
    fn get<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, Option<MediaRecord>> {
        Box::pin(async move {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            Ok(records.get(id).cloned())
        })
    }

    fn find_by_message<'a>(
        &'a self,
        location: i64,
        message_id: i32,
    ) -> BoxFuture<'a, Option<MediaRecord>> {
        Box::pin(async move {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            Ok(records
                .values()
                .find(|r| r.message_id == message_id && r.meta.location == location)
                .cloned())
        })
    }

    fn list_page<'a>(&'a self, page: u32, per_page: u32) -> BoxFuture<'a, Vec<MediaRecord>> {
        Box::pin(async move {
            let skip = page.saturating_sub(1) as usize * per_page as usize;
            Ok(self
                .snapshot()
                .into_iter()
                .skip(skip)
                .take(per_page as usize)
                .collect())
        })
    }

    fn list_all<'a>(&'a self) -> BoxFuture<'a, Vec<MediaRecord>> {
        Box::pin(async move { Ok(self.snapshot()) })
    }

    fn count<'a>(&'a self) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            Ok(records.len() as u64)
        })
    }

    fn insert<'a>(&'a self, record: &'a MediaRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records.insert(record.id, record.clone());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            Ok(records.remove(id).is_some())
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_record(message_id: i32, file_name: &str, mime: &str, size: i64) -> MediaRecord {
    let created = DateTime::from_timestamp(1_700_000_000 + i64::from(message_id), 0).unwrap_or_default();
    MediaRecord {
        id: MediaId::generate_at(created),
        message_id,
        meta: MediaMeta {
            file_size: size,
            file_name: file_name.to_string(),
            mime_type: mime.to_string(),
            duration: None,
            location: 100,
        },
        thumbnail_key: None,
        sprite_key: None,
        vtt_key: None,
        created_at: created,
        updated_at: created,
    }
}
