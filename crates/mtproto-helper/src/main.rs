use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

mod session;

use session::{Channel, Failure, FileChunk, InitRequest, Location, Session};

#[derive(Debug, Deserialize)]
struct Envelope {
    id: u64,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Init(InitRequest),
    GetChannel(GetChannelRequest),
    GetMessages(MessagesRequest),
    GetFile(GetFileRequest),
    DeleteMessages(MessagesRequest),
    Quit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetChannelRequest {
    channel_id: i64,
}

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    channel: Channel,
    ids: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct GetFileRequest {
    location: Location,
    offset: i64,
    limit: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    id: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_secs: Option<u32>,
    #[serde(flatten)]
    data: BTreeMap<String, serde_json::Value>,
}

impl Response {
    fn ok(id: u64, data: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            id,
            ok: true,
            error: None,
            kind: None,
            wait_secs: None,
            data,
        }
    }

    fn failed(id: u64, failure: Failure) -> Self {
        Self {
            id,
            ok: false,
            error: Some(failure.message),
            kind: Some(failure.kind),
            wait_secs: failure.wait_secs,
            data: failure.data,
        }
    }
}

/// One response line, optionally followed by raw payload bytes whose length
/// the line announces as `size`.
struct Outgoing {
    line: String,
    payload: Vec<u8>,
}

fn outgoing(response: Response, payload: Vec<u8>) -> Outgoing {
    let line = serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(
            r#"{{"id":{},"ok":false,"kind":"protocol","error":"response encode failed: {e}"}}"#,
            response.id
        )
    });
    Outgoing { line, payload }
}

fn field(name: &str, value: impl Serialize) -> BTreeMap<String, serde_json::Value> {
    let mut data = BTreeMap::new();
    data.insert(
        name.to_string(),
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
    );
    data
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut out = tokio::io::stdout();
    while let Some(msg) = rx.recv().await {
        let written = async {
            out.write_all(msg.line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.write_all(&msg.payload).await?;
            out.flush().await
        }
        .await;
        if let Err(e) = written {
            // The reader may be mid-payload; closing stdout is the only safe signal.
            eprintln!("mtproto-helper: stdout write failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn handle(session: Arc<Session>, id: u64, request: Request) -> Outgoing {
    let result = match request {
        Request::GetChannel(req) => session
            .get_channel(req.channel_id)
            .await
            .map(|channel| (field("channel", channel), Vec::new())),
        Request::GetMessages(req) => session
            .get_messages(req.channel, &req.ids)
            .await
            .map(|messages| (field("messages", messages), Vec::new())),
        Request::DeleteMessages(req) => session
            .delete_messages(req.channel, req.ids)
            .await
            .map(|()| (BTreeMap::new(), Vec::new())),
        Request::GetFile(req) => session
            .get_file(&req.location, req.offset, req.limit)
            .await
            .map(|chunk| match chunk {
                FileChunk::Data {
                    bytes,
                    storage_type,
                } => {
                    let mut data = field("size", bytes.len());
                    data.extend(field("storageType", storage_type));
                    (data, bytes)
                }
                FileChunk::CdnRedirect { dc_id } => (field("cdnRedirect", dc_id), Vec::new()),
            }),
        Request::Init(_) | Request::Quit => Err(Failure::protocol("not a session call")),
    };
    match result {
        Ok((data, payload)) => outgoing(Response::ok(id, data), payload),
        Err(failure) => outgoing(Response::failed(id, failure), Vec::new()),
    }
}

#[tokio::main]
async fn main() {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session: Option<Arc<Session>> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("mtproto-helper: stdin read failed: {e}");
                break;
            }
        };
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        let Envelope { id, request } = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                eprintln!("mtproto-helper: invalid request json: {e}");
                continue;
            }
        };

        match request {
            Request::Init(req) => {
                let response = if session.is_some() {
                    Response::failed(id, Failure::invalid_state("already initialized"))
                } else {
                    match Session::connect(req).await {
                        Ok(s) => {
                            session = Some(Arc::new(s));
                            Response::ok(id, BTreeMap::new())
                        }
                        Err(failure) => Response::failed(id, failure),
                    }
                };
                let _ = tx.send(outgoing(response, Vec::new()));
            }
            Request::Quit => {
                if let Some(s) = session.take() {
                    s.disconnect().await;
                }
                let _ = tx.send(outgoing(Response::ok(id, BTreeMap::new()), Vec::new()));
                break;
            }
            request => match &session {
                Some(s) => {
                    let s = Arc::clone(s);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(handle(s, id, request).await);
                    });
                }
                None => {
                    let response = Response::failed(id, Failure::invalid_state("not initialized"));
                    let _ = tx.send(outgoing(response, Vec::new()));
                }
            },
        }
    }

    if let Some(s) = session.take() {
        s.disconnect().await;
    }
    drop(tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), writer).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_carry_id_and_camel_case_fields() {
        let raw = r#"{"id":4,"cmd":"get_file","location":{"id":1,"accessHash":-2,"fileReference":[9],"thumbSize":"","dcId":2},"offset":524288,"limit":524288}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, 4);
        let Request::GetFile(req) = envelope.request else {
            panic!("expected get_file");
        };
        assert_eq!(req.location.access_hash, -2);
        assert_eq!(req.offset, 524_288);
    }

    #[test]
    fn failures_serialize_kind_and_wait() {
        let failure = Failure {
            kind: "flood_wait",
            message: "upload.getFile: FLOOD_WAIT".to_string(),
            wait_secs: Some(10),
            data: BTreeMap::new(),
        };
        let msg = outgoing(Response::failed(7, failure), Vec::new());
        let json: serde_json::Value = serde_json::from_str(&msg.line).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["ok"], false);
        assert_eq!(json["kind"], "flood_wait");
        assert_eq!(json["waitSecs"], 10);
    }
}
