use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::lookup;
use super::{ApiError, AppState};
use crate::media::MediaRecord;
use crate::reader::{ChunkedReader, MAX_PART_SIZE};
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Inclusive byte range, already clamped to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses the first range of a `Range: bytes=...` header against a file of
/// `size` bytes. Returns `None` when the header is malformed or the range
/// cannot be satisfied.
pub fn parse_range(header: &str, size: u64) -> Option<ByteRange> {
    let ranges = header.trim().strip_prefix("bytes=")?;
    let first = ranges.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || size == 0 {
            return None;
        }
        return Some(ByteRange {
            start: size - suffix.min(size),
            end: size - 1,
        });
    }

    let start: u64 = start.parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end.is_empty() {
        size - 1
    } else {
        end.parse::<u64>().ok()?.min(size - 1)
    };
    (end >= start).then_some(ByteRange { start, end })
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub d: Option<String>,
}

impl StreamQuery {
    fn download(&self) -> bool {
        matches!(self.d.as_deref(), Some("true" | "1"))
    }
}

fn content_disposition(name: &str, download: bool) -> HeaderValue {
    let kind = if download { "attachment" } else { "inline" };
    let ascii: String = name
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    let mut value = format!("{kind}; filename=\"{ascii}\"");
    if ascii != name {
        value.push_str("; filename*=UTF-8''");
        for byte in name.bytes() {
            if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
                value.push(byte as char);
            } else {
                value.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("inline"))
}

/// Strips the player-compat `.m3u8` suffix; any other extension is unknown.
fn media_id_from_path(raw: &str) -> Option<&str> {
    let id = raw.strip_suffix(".m3u8").unwrap_or(raw);
    (!id.contains('.')).then_some(id)
}

pub async fn stream_media(
    State(state): State<AppState>,
    method: Method,
    Path(media_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let raw_id = media_id_from_path(&media_id).ok_or(ApiError::NotFound)?;
    let record = lookup(&state, raw_id).await?;
    let size = u64::try_from(record.meta.file_size).unwrap_or(0);

    let range = match headers.get(RANGE) {
        Some(value) => {
            let raw = value.to_str().unwrap_or_default();
            Some(parse_range(raw, size).ok_or(ApiError::RangeNotSatisfiable { size })?)
        }
        None => None,
    };
    let (status, start, length) = match range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.byte_count()),
        None => (StatusCode::OK, 0, size),
    };

    let mut out = HeaderMap::new();
    let mime = record.meta.mime_type.trim();
    out.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(if mime.is_empty() { DEFAULT_CONTENT_TYPE } else { mime })
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    out.insert(CONTENT_LENGTH, HeaderValue::from(length));
    out.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(
        CONTENT_DISPOSITION,
        content_disposition(&record.display_name(), query.download()),
    );
    if let Some(r) = range
        && let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{size}", r.start, r.end))
    {
        out.insert(CONTENT_RANGE, value);
    }

    debug!(
        event = "http.stream",
        media_id = %record.id,
        method = %method,
        start,
        length,
        "http.stream"
    );

    if method == Method::HEAD || length == 0 {
        return Ok((status, out, Body::empty()).into_response());
    }

    let body = open_body(&state, &record, start, length).await?;
    Ok((status, out, body).into_response())
}

/// Starts the producer and waits for its first chunk, so failures before any
/// byte is sent still surface as a proper error response.
async fn open_body(
    state: &AppState,
    record: &MediaRecord,
    start: u64,
    length: u64,
) -> std::result::Result<Body, ApiError> {
    let worker = state.pool.next_worker();
    let reader = ChunkedReader::new(record.message_id, start as i64, record.meta.file_size);
    let capacity = (state.settings.stream_buffer_size / MAX_PART_SIZE as usize).max(1);
    let (tx, mut rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();
    tokio::spawn(produce(worker, reader, cancel.clone(), tx, length));

    let guard = cancel.drop_guard();
    let first = match rx.recv().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return Err(e.into()),
        None => Bytes::new(),
    };

    let rest = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|item| (item, (rx, guard)))
    });
    let stream = futures::stream::once(async move { Ok::<Bytes, Error>(first) }).chain(rest);
    Ok(Body::from_stream(stream))
}

async fn produce(
    worker: Arc<Worker>,
    reader: ChunkedReader,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Bytes>>,
    mut remaining: u64,
) {
    while remaining > 0 {
        let next = tokio::select! {
            _ = tx.closed() => break,
            next = worker.stream(&cancel, &reader) => next,
        };
        match next {
            Ok(Some(mut chunk)) => {
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                remaining -= chunk.len() as u64;
                if !chunk.is_empty() && tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    event = "http.stream_failed",
                    message_id = reader.message_id(),
                    account_id = worker.account_id(),
                    error = %e,
                    "http.stream_failed"
                );
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_closed_ranges() {
        assert_eq!(parse_range("bytes=0-", 100), Some(ByteRange { start: 0, end: 99 }));
        assert_eq!(parse_range("bytes=10-19", 100), Some(ByteRange { start: 10, end: 19 }));
        assert_eq!(parse_range("bytes=50-50", 100), Some(ByteRange { start: 50, end: 50 }));
        assert_eq!(parse_range("bytes=90-500", 100), Some(ByteRange { start: 90, end: 99 }));
    }

    #[test]
    fn suffix_ranges_and_multi_range_headers() {
        assert_eq!(parse_range("bytes=-10", 100), Some(ByteRange { start: 90, end: 99 }));
        assert_eq!(parse_range("bytes=-500", 100), Some(ByteRange { start: 0, end: 99 }));
        assert_eq!(
            parse_range("bytes=0-4, 10-14", 100),
            Some(ByteRange { start: 0, end: 4 })
        );
    }

    #[test]
    fn unsatisfiable_or_malformed_ranges() {
        for header in ["bytes=100-", "bytes=20-10", "bytes=-0", "items=0-1", "bytes=x-1", "bytes=5"] {
            assert_eq!(parse_range(header, 100), None, "{header}");
        }
        assert_eq!(parse_range("bytes=0-", 0), None);
    }

    #[test]
    fn media_id_suffixes() {
        assert_eq!(media_id_from_path("abc"), Some("abc"));
        assert_eq!(media_id_from_path("abc.m3u8"), Some("abc"));
        assert_eq!(media_id_from_path("abc.mp4"), None);
    }

    #[test]
    fn disposition_escapes_non_ascii_names() {
        assert_eq!(
            content_disposition("clip.mp4", false),
            "inline; filename=\"clip.mp4\""
        );
        assert_eq!(
            content_disposition("café \"x\".mp4", true),
            "attachment; filename=\"caf_ _x_.mp4\"; filename*=UTF-8''caf%C3%A9%20%22x%22.mp4"
        );
    }

    #[test]
    fn download_flag() {
        assert!(StreamQuery { d: Some("true".into()) }.download());
        assert!(!StreamQuery { d: None }.download());
    }
}
