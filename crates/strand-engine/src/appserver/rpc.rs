//! Line-delimited JSON-RPC over a pair of byte streams.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// One inbound message, classified by shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// `id` without `method`.
    Response { id: Value, result: Option<Value>, error: Option<Value> },
    /// `id` and `method`; a reply is mandatory.
    Request { id: Value, method: String, params: Value },
    /// `method` without `id`.
    Notification { method: String, params: Value },
}

impl Incoming {
    /// `None` for shapes the protocol does not define.
    pub fn classify(mut msg: Value) -> Option<Self> {
        let obj = msg.as_object_mut()?;
        let id = obj.remove("id").filter(|id| !id.is_null());
        let method = obj.get("method").and_then(Value::as_str).map(str::to_string);
        let params = obj.remove("params").unwrap_or(Value::Null);
        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request { id, method, params }),
            (None, Some(method)) => Some(Self::Notification { method, params }),
            (Some(id), None) => Some(Self::Response {
                id,
                result: obj.remove("result"),
                error: obj.remove("error").filter(|e| !e.is_null()),
            }),
            (None, None) => None,
        }
    }

    /// Whether this is the response to request `expected`.
    pub fn answers(&self, expected: u64) -> bool {
        matches!(self, Self::Response { id, .. } if id.as_u64() == Some(expected))
    }
}

#[derive(Serialize)]
struct Outgoing<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
}

/// Client side of the connection. Request ids count up from zero.
pub struct RpcConnection<R, W> {
    reader: R,
    writer: W,
    next_id: u64,
    max_line_bytes: usize,
}

impl<R, W> RpcConnection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_line_bytes: usize) -> Self {
        Self { reader, writer, next_id: 0, max_line_bytes }
    }

    /// Send a request and return the id its response will carry.
    pub async fn request(&mut self, method: &str, params: Option<&Value>) -> io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let id_value = Value::from(id);
        self.write(&Outgoing { id: Some(&id_value), method: Some(method), params, result: None }).await?;
        Ok(id)
    }

    pub async fn notify(&mut self, method: &str, params: Option<&Value>) -> io::Result<()> {
        self.write(&Outgoing { id: None, method: Some(method), params, result: None }).await
    }

    pub async fn reply(&mut self, id: &Value, result: &Value) -> io::Result<()> {
        self.write(&Outgoing { id: Some(id), method: None, params: None, result: Some(result) }).await
    }

    async fn write(&mut self, msg: &Outgoing<'_>) -> io::Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }

    /// Next well-formed message; `None` at end of output. Unparseable,
    /// unclassifiable and oversized lines are skipped.
    pub async fn next_message(&mut self) -> io::Result<Option<Incoming>> {
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Value>(&line) {
                Ok(value) => match Incoming::classify(value) {
                    Some(msg) => {
                        trace!(?msg, "rpc in");
                        return Ok(Some(msg));
                    }
                    None => debug!("skipping message with neither id nor method"),
                },
                Err(e) => debug!(error = %e, "skipping malformed line"),
            }
        }
    }

    /// Read one line without buffering more than `max_line_bytes` of it.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut oversized = false;
        loop {
            let (consumed, complete) = {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    return Ok((!line.is_empty() && !oversized).then_some(line));
                }
                let (chunk, complete) = match buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => (&buf[..pos], true),
                    None => (buf, false),
                };
                if !oversized {
                    if line.len() + chunk.len() > self.max_line_bytes {
                        oversized = true;
                        line.clear();
                    } else {
                        line.extend_from_slice(chunk);
                    }
                }
                (chunk.len() + usize::from(complete), complete)
            };
            self.reader.consume(consumed);
            if complete {
                if oversized {
                    warn!(limit = self.max_line_bytes, "skipping oversized protocol line");
                    oversized = false;
                    continue;
                }
                return Ok(Some(line));
            }
        }
    }
}
