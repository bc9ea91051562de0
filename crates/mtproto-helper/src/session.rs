use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grammers_client::grammers_tl_types as tl;
use grammers_client::session::storages::TlSession;
use grammers_client::{Client, ClientConfiguration, InvocationError};
use grammers_mtsender::{ConnectionParams, SenderPool, SenderPoolHandle};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

const REMOTE_CALL_TIMEOUT_SECS: u64 = 60;
const IS_AUTHORIZED_TIMEOUT_SECS: u64 = 120;
const BOT_SIGN_IN_TIMEOUT_SECS: u64 = 120;
const RUNNER_STOP_TIMEOUT_SECS: u64 = 5;
const FLOOD_WAIT_CODE: i32 = 420;

/// Error reported back to the core, tagged with a kind it maps onto its own
/// error type.
#[derive(Debug)]
pub struct Failure {
    pub kind: &'static str,
    pub message: String,
    pub wait_secs: Option<u32>,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Failure {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            wait_secs: None,
            data: BTreeMap::new(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new("protocol", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("invalid_state", message)
    }

    fn auth(message: impl Into<String>) -> Self {
        Self::new("auth", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    fn unexpected(expected: &str, got: String) -> Self {
        let mut failure = Self::new("unexpected_type", format!("expected {expected}, got {got}"));
        failure
            .data
            .insert("expected".to_string(), expected.to_string().into());
        failure.data.insert("got".to_string(), got.into());
        failure
    }
}

/// An authorization step that never completes is an auth failure, not a
/// transient timeout the core would retry.
fn sign_in_timeout(step: &str, secs: u64) -> Failure {
    Failure::auth(format!(
        "{step} timed out after {secs}s (check network / MTProto reachability)"
    ))
}

fn map_invocation_error(what: &str, err: InvocationError) -> Failure {
    match err {
        InvocationError::Rpc(rpc) if rpc.code == FLOOD_WAIT_CODE => Failure {
            wait_secs: Some(rpc.value.unwrap_or(0)),
            ..Failure::new("flood_wait", format!("{what}: {rpc}"))
        },
        other => Failure::new("remote", format!("{what}: {other}")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub session_path: PathBuf,
    pub socks_proxy: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: i64,
    pub access_hash: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub thumb_size: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumb {
    kind: String,
    width: i32,
    height: i32,
    size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    id: i64,
    access_hash: i64,
    file_reference: Vec<u8>,
    dc_id: i32,
    size: i64,
    mime_type: String,
    file_name: String,
    duration: Option<f64>,
    thumbs: Vec<Thumb>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Media {
    Document { document: Document },
    Other { kind: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Message { id: i32, media: Option<Media> },
    Empty { id: i32 },
}

pub enum FileChunk {
    Data { bytes: Vec<u8>, storage_type: String },
    CdnRedirect { dc_id: i32 },
}

/// Flood waits come back to the core untouched; the core decides whether to
/// sleep through them.
fn client_configuration() -> ClientConfiguration {
    ClientConfiguration {
        flood_sleep_threshold: 0,
    }
}

pub struct Session {
    client: Client,
    handle: SenderPoolHandle,
    session: Arc<TlSession>,
    session_path: PathBuf,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub async fn connect(req: InitRequest) -> Result<Self, Failure> {
        if let Some(parent) = req.session_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::new("io", format!("session dir create failed: {e}")))?;
        }
        let session = match tokio::fs::read(&req.session_path).await {
            Ok(bytes) => TlSession::load(&bytes).unwrap_or_else(|e| {
                eprintln!(
                    "mtproto-helper: session load failed, starting fresh (path={} error={e})",
                    req.session_path.display()
                );
                TlSession::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TlSession::new(),
            Err(e) => return Err(Failure::new("io", format!("session read failed: {e}"))),
        };
        let session = Arc::new(session);

        let pool = match req.socks_proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(proxy) => SenderPool::with_configuration(
                Arc::clone(&session),
                req.api_id,
                ConnectionParams {
                    proxy_url: Some(proxy.trim().to_string()),
                    ..Default::default()
                },
            ),
            None => SenderPool::new(Arc::clone(&session), req.api_id),
        };
        let client = Client::with_configuration(&pool, client_configuration());
        let SenderPool { runner, handle, .. } = pool;
        let runner = tokio::spawn(runner.run());

        let connected = Self {
            client,
            handle,
            session,
            session_path: req.session_path,
            runner: Mutex::new(Some(runner)),
        };
        if let Err(e) = connected.authorize(&req.bot_token, &req.api_hash).await {
            connected.stop_runner().await;
            return Err(e);
        }
        connected.persist().await?;
        Ok(connected)
    }

    async fn authorize(&self, bot_token: &str, api_hash: &str) -> Result<(), Failure> {
        let authorized = timeout(IS_AUTHORIZED_TIMEOUT_SECS, self.client.is_authorized())
            .await
            .map_err(|_| sign_in_timeout("is_authorized", IS_AUTHORIZED_TIMEOUT_SECS))?
            .map_err(|e| Failure::auth(format!("is_authorized failed: {e}")))?;
        if !authorized {
            timeout(
                BOT_SIGN_IN_TIMEOUT_SECS,
                self.client.bot_sign_in(bot_token, api_hash),
            )
            .await
            .map_err(|_| sign_in_timeout("bot_sign_in", BOT_SIGN_IN_TIMEOUT_SECS))?
            .map_err(|e| Failure::auth(format!("bot_sign_in failed: {e}")))?;
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), Failure> {
        write_session(&self.session_path, &self.session)
            .await
            .map_err(|e| Failure::new("io", format!("session write failed: {e}")))
    }

    async fn stop_runner(&self) {
        let _ = self.handle.quit();
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runner) = runner
            && timeout(RUNNER_STOP_TIMEOUT_SECS, runner).await.is_err()
        {
            eprintln!("mtproto-helper: sender pool did not stop in time");
        }
    }

    /// Stops the connection and rewrites the session file.
    pub async fn disconnect(&self) {
        if let Err(e) = self.persist().await {
            eprintln!("mtproto-helper: {}", e.message);
        }
        self.stop_runner().await;
    }

    async fn invoke<R>(&self, what: &str, request: &R) -> Result<R::Return, Failure>
    where
        R: tl::RemoteCall,
    {
        match timeout(REMOTE_CALL_TIMEOUT_SECS, self.client.invoke(request)).await {
            Err(_) => Err(Failure::new(
                "timeout",
                format!("{what} timed out after {REMOTE_CALL_TIMEOUT_SECS}s"),
            )),
            Ok(result) => result.map_err(|e| map_invocation_error(what, e)),
        }
    }

    pub async fn get_channel(&self, channel_id: i64) -> Result<Channel, Failure> {
        let request = tl::functions::channels::GetChannels {
            id: vec![
                tl::types::InputChannel {
                    channel_id,
                    access_hash: 0,
                }
                .into(),
            ],
        };
        let chats = match self.invoke("channels.getChannels", &request).await? {
            tl::enums::messages::Chats::Chats(c) => c.chats,
            tl::enums::messages::Chats::Slice(c) => c.chats,
        };

        let mut found: Vec<Channel> = chats
            .into_iter()
            .filter_map(|chat| match chat {
                tl::enums::Chat::Channel(c) if c.id == channel_id => Some(Channel {
                    id: c.id,
                    access_hash: c.access_hash.unwrap_or(0),
                }),
                _ => None,
            })
            .collect();
        match found.len() {
            0 => Err(Failure::not_found(format!("channel {channel_id}"))),
            1 => Ok(found.remove(0)),
            n => Err(Failure::new(
                "ambiguous",
                format!("{n} channels match id {channel_id}"),
            )),
        }
    }

    pub async fn get_messages(&self, channel: Channel, ids: &[i32]) -> Result<Vec<Message>, Failure> {
        let request = tl::functions::channels::GetMessages {
            channel: input_channel(channel),
            id: ids
                .iter()
                .map(|&id| tl::types::InputMessageId { id }.into())
                .collect(),
        };
        let messages = match self.invoke("channels.getMessages", &request).await? {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            other => {
                return Err(Failure::unexpected(
                    "messages.ChannelMessages",
                    variant_name(format!("{other:?}")),
                ));
            }
        };

        let mut messages = messages.into_iter();
        ids.iter()
            .map(|&id| convert_message(id, messages.next()))
            .collect()
    }

    /// Always addressed to the home DC.
    pub async fn get_file(
        &self,
        location: &Location,
        offset: i64,
        limit: i32,
    ) -> Result<FileChunk, Failure> {
        let request = tl::functions::upload::GetFile {
            precise: false,
            cdn_supported: false,
            location: tl::types::InputDocumentFileLocation {
                id: location.id,
                access_hash: location.access_hash,
                file_reference: location.file_reference.clone(),
                thumb_size: location.thumb_size.clone(),
            }
            .into(),
            offset,
            limit,
        };
        match self.invoke("upload.getFile", &request).await? {
            tl::enums::upload::File::File(f) => Ok(FileChunk::Data {
                bytes: f.bytes,
                storage_type: variant_name(format!("{:?}", f.r#type)),
            }),
            tl::enums::upload::File::CdnRedirect(r) => Ok(FileChunk::CdnRedirect { dc_id: r.dc_id }),
        }
    }

    pub async fn delete_messages(&self, channel: Channel, ids: Vec<i32>) -> Result<(), Failure> {
        let request = tl::functions::channels::DeleteMessages {
            channel: input_channel(channel),
            id: ids,
        };
        self.invoke("channels.deleteMessages", &request).await?;
        Ok(())
    }
}

async fn timeout<F: std::future::Future>(
    secs: u64,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(secs), fut).await
}

async fn write_session(path: &Path, session: &TlSession) -> std::io::Result<()> {
    tokio::fs::write(path, session.save()).await
}

fn input_channel(channel: Channel) -> tl::enums::InputChannel {
    tl::types::InputChannel {
        channel_id: channel.id,
        access_hash: channel.access_hash,
    }
    .into()
}

fn variant_name(debug: String) -> String {
    debug
        .split(['(', ' ', '{'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn convert_document(doc: tl::types::Document) -> Document {
    let mut file_name = String::new();
    let mut duration = None;
    for attr in doc.attributes {
        match attr {
            tl::enums::DocumentAttribute::Filename(f) => file_name = f.file_name,
            tl::enums::DocumentAttribute::Video(v) => duration = Some(v.duration),
            tl::enums::DocumentAttribute::Audio(a) => {
                duration = duration.or(Some(f64::from(a.duration)))
            }
            _ => {}
        }
    }

    let thumbs = doc
        .thumbs
        .unwrap_or_default()
        .into_iter()
        .filter_map(|thumb| match thumb {
            tl::enums::PhotoSize::Size(s) => Some(Thumb {
                kind: s.r#type,
                width: s.w,
                height: s.h,
                size: i64::from(s.size),
            }),
            tl::enums::PhotoSize::Progressive(p) => Some(Thumb {
                kind: p.r#type,
                width: p.w,
                height: p.h,
                size: p.sizes.last().copied().map(i64::from).unwrap_or(0),
            }),
            _ => None,
        })
        .collect();

    Document {
        id: doc.id,
        access_hash: doc.access_hash,
        file_reference: doc.file_reference,
        dc_id: doc.dc_id,
        size: doc.size,
        mime_type: doc.mime_type,
        file_name,
        duration,
        thumbs,
    }
}

fn convert_message(id: i32, message: Option<tl::enums::Message>) -> Result<Message, Failure> {
    let Some(message) = message else {
        return Ok(Message::Empty { id });
    };
    match message {
        tl::enums::Message::Empty(m) => Ok(Message::Empty { id: m.id }),
        tl::enums::Message::Message(m) => {
            let media = m.media.map(|media| match media {
                tl::enums::MessageMedia::Document(d) => match d.document {
                    Some(tl::enums::Document::Document(doc)) => Media::Document {
                        document: convert_document(doc),
                    },
                    Some(other) => Media::Other {
                        kind: variant_name(format!("{other:?}")),
                    },
                    None => Media::Other {
                        kind: "DocumentMissing".to_string(),
                    },
                },
                other => Media::Other {
                    kind: variant_name(format!("{other:?}")),
                },
            });
            Ok(Message::Message { id: m.id, media })
        }
        other => Err(Failure::unexpected(
            "Message",
            variant_name(format!("{other:?}")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grammers_mtsender::RpcError;

    #[test]
    fn client_never_sleeps_on_flood_waits() {
        assert_eq!(client_configuration().flood_sleep_threshold, 0);
    }

    #[test]
    fn sign_in_timeouts_are_auth_failures() {
        let failure = sign_in_timeout("bot_sign_in", BOT_SIGN_IN_TIMEOUT_SECS);
        assert_eq!(failure.kind, "auth");
        assert!(failure.message.contains("bot_sign_in timed out after 120s"), "{}", failure.message);
    }

    #[test]
    fn flood_wait_keeps_the_requested_seconds() {
        let err = InvocationError::Rpc(RpcError {
            code: 420,
            name: "FLOOD_WAIT".to_string(),
            value: Some(10),
            caused_by: None,
        });
        let failure = map_invocation_error("upload.getFile", err);
        assert_eq!(failure.kind, "flood_wait");
        assert_eq!(failure.wait_secs, Some(10));
    }

    #[test]
    fn other_rpc_errors_are_remote() {
        let err = InvocationError::Rpc(RpcError {
            code: 400,
            name: "FILE_REFERENCE_EXPIRED".to_string(),
            value: None,
            caused_by: None,
        });
        let failure = map_invocation_error("upload.getFile", err);
        assert_eq!(failure.kind, "remote");
        assert!(failure.message.contains("FILE_REFERENCE_EXPIRED"), "{}", failure.message);
    }

    #[test]
    fn variant_name_strips_payload() {
        assert_eq!(variant_name("Photo(MessageMediaPhoto { x: 1 })".into()), "Photo");
        assert_eq!(variant_name("Mp4".into()), "Mp4");
    }

    #[test]
    fn missing_message_is_empty() {
        assert!(matches!(convert_message(7, None), Ok(Message::Empty { id: 7 })));
    }

    #[test]
    fn wire_shapes() {
        let message = Message::Message {
            id: 3,
            media: Some(Media::Other {
                kind: "Photo".to_string(),
            }),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "message", "id": 3, "media": {"type": "other", "kind": "Photo"}})
        );
    }
}
