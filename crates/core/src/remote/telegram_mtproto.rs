//! Bot sessions backed by the out-of-process MTProto helper.
//!
//! The helper (`crates/mtproto-helper`) owns the MTProto connection and its
//! session storage; this side speaks JSON lines to it over stdin/stdout. Each
//! request carries an `id` the helper echoes back, so calls from different
//! tasks can be in flight at once. A `get_file` reply announces `size` and is
//! followed by exactly that many raw bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChannelHandle, DocumentDescriptor, FileLocation, RemoteApi, RemoteFuture, RemoteMedia,
    RemoteMessage, UploadFile, parse_socks_proxy,
};
use crate::{Error, Result};

pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// The helper enforces [`REMOTE_CALL_TIMEOUT`] itself; this only catches a
/// helper that stopped answering.
const HELPER_REPLY_MARGIN: Duration = Duration::from_secs(15);
/// Covers both the authorization check and bot sign-in inside the helper.
const INIT_TIMEOUT: Duration = Duration::from_secs(300);
const QUIT_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Larger than any part `upload.getFile` may return.
const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

pub const HELPER_BINARY: &str = "teledrive-mtproto-helper";

#[derive(Debug, Clone)]
pub struct TelegramSessionConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub session_dir: PathBuf,
    pub socks_proxy: Option<String>,
    pub helper_path: PathBuf,
}

/// `{session_dir}/worker-{prefix}.session`, keyed by the part of the bot
/// token before the first `:`.
pub fn session_path(session_dir: &Path, bot_token: &str) -> PathBuf {
    let prefix = bot_token.split(':').next().unwrap_or(bot_token);
    session_dir.join(format!("worker-{prefix}.session"))
}

/// The numeric prefix of a bot token is the bot's own account id.
pub fn bot_account_id(bot_token: &str) -> Result<i64> {
    bot_token
        .split(':')
        .next()
        .and_then(|p| p.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| Error::InvalidConfig {
            message: "bot token must start with `<numeric id>:`".to_string(),
        })
}

/// Sibling of the running executable first, then the helper crate's own
/// target dir when running from a cargo layout, then `PATH`.
pub fn default_helper_path() -> PathBuf {
    let Ok(exe) = std::env::current_exe() else {
        return PathBuf::from(HELPER_BINARY);
    };
    let sibling = exe.with_file_name(HELPER_BINARY);
    if sibling.exists() {
        return sibling;
    }
    dev_helper_path(&exe)
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(HELPER_BINARY))
}

/// `{root}/target/{profile}/exe` maps to
/// `{root}/crates/mtproto-helper/target/{profile}/teledrive-mtproto-helper`;
/// the helper is an excluded crate with its own target dir.
fn dev_helper_path(exe: &Path) -> Option<PathBuf> {
    let profile_dir = exe.parent()?;
    let profile = profile_dir.file_name()?.to_str()?;
    if profile != "debug" && profile != "release" {
        return None;
    }
    let target_dir = profile_dir.parent()?;
    if target_dir.file_name()?.to_str()? != "target" {
        return None;
    }
    Some(
        target_dir
            .parent()?
            .join("crates")
            .join("mtproto-helper")
            .join("target")
            .join(profile)
            .join(HELPER_BINARY),
    )
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: HelperRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum HelperRequest<'a> {
    Init(InitArgs<'a>),
    GetChannel(ChannelArgs),
    GetMessages(MessagesArgs<'a>),
    GetFile(FileArgs<'a>),
    DeleteMessages(MessagesArgs<'a>),
    Quit,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitArgs<'a> {
    api_id: i32,
    api_hash: &'a str,
    bot_token: &'a str,
    session_path: &'a Path,
    socks_proxy: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelArgs {
    channel_id: i64,
}

#[derive(Debug, Serialize)]
struct MessagesArgs<'a> {
    channel: &'a ChannelHandle,
    ids: &'a [i32],
}

#[derive(Debug, Serialize)]
struct FileArgs<'a> {
    location: &'a FileLocation,
    offset: i64,
    limit: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyHeader {
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    wait_secs: Option<u64>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    got: Option<String>,
    #[serde(default)]
    size: Option<usize>,
    #[serde(default)]
    storage_type: Option<String>,
    #[serde(default)]
    cdn_redirect: Option<i32>,
    #[serde(default)]
    channel: Option<ChannelHandle>,
    #[serde(default)]
    messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireMessage {
    Message { id: i32, media: Option<WireMedia> },
    Empty { id: i32 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMedia {
    Document { document: DocumentDescriptor },
    Other { kind: String },
}

impl From<WireMessage> for RemoteMessage {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Empty { id } => RemoteMessage::Empty { id },
            WireMessage::Message { id, media } => RemoteMessage::Message {
                id,
                media: media.map(|media| match media {
                    WireMedia::Document { document } => RemoteMedia::Document(document),
                    WireMedia::Other { kind } => RemoteMedia::Other { kind },
                }),
            },
        }
    }
}

#[derive(Debug)]
struct Reply {
    header: ReplyHeader,
    payload: Bytes,
}

impl Reply {
    fn into_result(self) -> Result<Self> {
        if self.header.ok {
            return Ok(self);
        }
        let header = self.header;
        let message = header.error.unwrap_or_default();
        Err(match header.kind.as_deref() {
            Some("flood_wait") => Error::FloodWait {
                wait: Duration::from_secs(header.wait_secs.unwrap_or(0)),
            },
            Some("auth") => Error::Auth { message },
            Some("timeout") => Error::Timeout,
            Some("not_found") => Error::NotFound { message },
            Some("ambiguous") => Error::Ambiguous { message },
            Some("unexpected_type") => Error::UnexpectedType {
                expected: header.expected.unwrap_or_default(),
                got: header.got.unwrap_or_default(),
            },
            Some("invalid_state") => Error::InvalidState { message },
            Some("io") => Error::Io(std::io::Error::other(message)),
            _ => Error::remote(message),
        })
    }

    fn missing(field: &str) -> Error {
        Error::remote(format!("mtproto helper reply is missing `{field}`"))
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock_pending(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drops the routing entry of a call that returned or was cancelled.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

fn helper_gone() -> Error {
    Error::remote("mtproto helper exited")
}

/// A running helper process plus the two tasks that own its pipes.
struct HelperProcess {
    child: Mutex<Child>,
    requests: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl HelperProcess {
    fn spawn(path: &Path) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::InvalidConfig {
                message: format!(
                    "failed to start mtproto helper: {e} (path={})",
                    path.display()
                ),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| Error::InvalidConfig {
            message: "mtproto helper missing stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::InvalidConfig {
            message: "mtproto helper missing stdout".to_string(),
        })?;

        let pending = Pending::default();
        let closed = CancellationToken::new();
        let (requests, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(stdin, rx, closed.clone()));
        tokio::spawn(read_loop(stdout, Arc::clone(&pending), closed.clone()));

        Ok(Self {
            child: Mutex::new(child),
            requests,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn call(&self, request: HelperRequest<'_>, timeout: Duration) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&Envelope { id, request }).map_err(|e| {
            Error::Encode {
                message: format!("mtproto helper request: {e}"),
            }
        })?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // The reader clears the table after `closed` fires, so an entry
        // inserted before this check is always dropped on exit.
        if self.closed.is_cancelled() || self.requests.send(line).is_err() {
            return Err(helper_gone());
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| helper_gone())?.into_result(),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
        }
    }

    async fn init(&self, config: &TelegramSessionConfig, bot_token: &str, session_path: &Path) -> Result<()> {
        let request = HelperRequest::Init(InitArgs {
            api_id: config.api_id,
            api_hash: &config.api_hash,
            bot_token,
            session_path,
            socks_proxy: config.socks_proxy.as_deref(),
        });
        self.call(request, INIT_TIMEOUT).await.map(|_| ())
    }

    /// Asks the helper to save its session and exit, then reaps it.
    async fn shutdown(&self) {
        if self.is_alive()
            && let Err(e) = self.call(HelperRequest::Quit, QUIT_TIMEOUT).await
        {
            debug!(event = "session.helper_quit_failed", error = %e, "session.helper_quit_failed");
        }
        let mut child = self.child.lock().await;
        if tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }

    async fn kill(&self) {
        let _ = self.child.lock().await.kill().await;
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(event = "session.helper_write_failed", error = %e, "session.helper_write_failed");
            break;
        }
    }
    closed.cancel();
}

async fn read_loop(stdout: ChildStdout, pending: Pending, closed: CancellationToken) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(event = "session.helper_read_failed", error = %e, "session.helper_read_failed");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        // Past a bad line the stream position is unknown; give up on this helper.
        let header: ReplyHeader = match serde_json::from_str(line.trim_end()) {
            Ok(header) => header,
            Err(e) => {
                warn!(event = "session.helper_bad_reply", error = %e, "session.helper_bad_reply");
                break;
            }
        };
        let payload = match header.size {
            Some(size) if size > MAX_PAYLOAD => {
                warn!(event = "session.helper_bad_reply", size, "session.helper_bad_reply");
                break;
            }
            Some(size) => {
                let mut buf = vec![0u8; size];
                if let Err(e) = reader.read_exact(&mut buf).await {
                    warn!(event = "session.helper_read_failed", error = %e, "session.helper_read_failed");
                    break;
                }
                Bytes::from(buf)
            }
            None => Bytes::new(),
        };

        let waiter = lock_pending(&pending).remove(&header.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Reply { header, payload });
            }
            None => debug!(event = "session.helper_orphan_reply", id = header.id, "session.helper_orphan_reply"),
        }
    }
    closed.cancel();
    lock_pending(&pending).clear();
}

enum SessionState {
    Unconnected,
    Connecting,
    Connected(Arc<HelperProcess>),
    Disconnected,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected(_) => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

/// One authenticated bot identity.
///
/// Lifecycle: unconnected, connecting, connected, disconnected. A
/// disconnected session is terminal; build a new one to reconnect. A helper
/// that dies while connected is respawned on the next call.
pub struct TelegramSession {
    config: TelegramSessionConfig,
    bot_token: String,
    account_id: i64,
    session_path: PathBuf,
    state: Mutex<SessionState>,
}

impl TelegramSession {
    pub fn new(config: TelegramSessionConfig, bot_token: impl Into<String>) -> Result<Self> {
        let bot_token = bot_token.into();
        let account_id = bot_account_id(&bot_token)?;
        let session_path = session_path(&config.session_dir, &bot_token);
        Ok(Self {
            config,
            bot_token,
            account_id,
            session_path,
            state: Mutex::new(SessionState::Unconnected),
        })
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub async fn state_name(&self) -> &'static str {
        self.state.lock().await.name()
    }

    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match &*state {
                SessionState::Unconnected => *state = SessionState::Connecting,
                SessionState::Connected(_) => {
                    warn!(
                        event = "session.connect_noop",
                        account_id = self.account_id,
                        "session.connect_noop"
                    );
                    return Ok(());
                }
                other => {
                    return Err(Error::InvalidState {
                        message: format!("cannot connect a {} session", other.name()),
                    });
                }
            }
        }

        match self.establish().await {
            Ok(helper) => {
                *self.state.lock().await = SessionState::Connected(Arc::new(helper));
                info!(
                    event = "session.connected",
                    account_id = self.account_id,
                    session = %self.session_path.display(),
                    "session.connected"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = SessionState::Unconnected;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<HelperProcess> {
        if let Some(raw) = self.config.socks_proxy.as_deref() {
            parse_socks_proxy(raw)?;
        }
        tokio::fs::create_dir_all(&self.config.session_dir).await?;

        let helper = HelperProcess::spawn(&self.config.helper_path)?;
        if let Err(e) = helper
            .init(&self.config, &self.bot_token, &self.session_path)
            .await
        {
            helper.kill().await;
            return Err(e);
        }
        Ok(helper)
    }

    /// Stops the helper, which rewrites the session file. Terminal.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, SessionState::Disconnected);
        let SessionState::Connected(helper) = previous else {
            return Ok(());
        };
        helper.shutdown().await;
        info!(
            event = "session.disconnected",
            account_id = self.account_id,
            "session.disconnected"
        );
        Ok(())
    }

    async fn helper(&self) -> Result<Arc<HelperProcess>> {
        let mut state = self.state.lock().await;
        let helper = match &*state {
            SessionState::Connected(helper) => Arc::clone(helper),
            other => {
                return Err(Error::InvalidState {
                    message: format!("session is {}", other.name()),
                });
            }
        };
        if helper.is_alive() {
            return Ok(helper);
        }

        warn!(
            event = "session.helper_respawn",
            account_id = self.account_id,
            "session.helper_respawn"
        );
        helper.kill().await;
        let fresh = Arc::new(self.establish().await?);
        *state = SessionState::Connected(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn call(&self, request: HelperRequest<'_>) -> Result<Reply> {
        let helper = self.helper().await?;
        helper
            .call(request, REMOTE_CALL_TIMEOUT + HELPER_REPLY_MARGIN)
            .await
    }
}

impl RemoteApi for TelegramSession {
    fn account_id(&self) -> i64 {
        self.account_id
    }

    fn fetch_channel<'a>(&'a self, channel_id: i64) -> RemoteFuture<'a, ChannelHandle> {
        Box::pin(async move {
            let reply = self
                .call(HelperRequest::GetChannel(ChannelArgs { channel_id }))
                .await?;
            reply.header.channel.ok_or_else(|| Reply::missing("channel"))
        })
    }

    fn fetch_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, Vec<RemoteMessage>> {
        Box::pin(async move {
            let reply = self
                .call(HelperRequest::GetMessages(MessagesArgs { channel, ids }))
                .await?;
            let messages = reply
                .header
                .messages
                .ok_or_else(|| Reply::missing("messages"))?;
            if messages.len() != ids.len() {
                return Err(Error::remote(format!(
                    "mtproto helper returned {} messages for {} ids",
                    messages.len(),
                    ids.len()
                )));
            }
            Ok(messages.into_iter().map(RemoteMessage::from).collect())
        })
    }

    fn fetch_file_chunk<'a>(
        &'a self,
        location: &'a FileLocation,
        offset: i64,
        limit: i32,
    ) -> RemoteFuture<'a, UploadFile> {
        Box::pin(async move {
            let reply = self
                .call(HelperRequest::GetFile(FileArgs {
                    location,
                    offset,
                    limit,
                }))
                .await?;
            if let Some(dc_id) = reply.header.cdn_redirect {
                return Ok(UploadFile::CdnRedirect { dc_id });
            }
            let storage_type = reply
                .header
                .storage_type
                .ok_or_else(|| Reply::missing("storageType"))?;
            Ok(UploadFile::File {
                data: reply.payload,
                storage_type,
            })
        })
    }

    fn delete_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.call(HelperRequest::DeleteMessages(MessagesArgs { channel, ids }))
                .await?;
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self) -> RemoteFuture<'a, ()> {
        Box::pin(TelegramSession::disconnect(self))
    }
}
